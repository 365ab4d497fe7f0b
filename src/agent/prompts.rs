//! Prompt text sent to the agent.

use crate::diagnostics::{Fix, StructuralAction, StructuralFix};
use crate::util::tail_chars;

/// Diagnostics handed to the error-analysis prompt are cut to their tail;
/// build logs put the failures last.
const MAX_ANALYSIS_INPUT_CHARS: usize = 20_000;

/// Agent instructions used when the configuration does not supply any.
pub fn default_instructions(editable_file: &str) -> String {
    format!(
        "You are an expert Azure SDK developer and TypeSpec author. Your primary goal is to \
resolve all AZC analyzer and TypeSpec compilation errors in the TypeSpec files and produce a \
valid, compilable result that strictly follows Azure SDK and TypeSpec guidelines.

### SYSTEM INSTRUCTIONS
- All files (e.g., main.tsp, {editable}) are available via FileSearchTool. Retrieve any file \
content by filename as needed.
- Never modify main.tsp; only {editable} may be changed.
- Prefer client customizations (@@clientName, @@access, @@usage) over structural changes.
- Keep every existing import and using statement unless a fix requires otherwise.",
        editable = editable_file
    )
}

/// Turn a structural fix into the instruction the agent should follow.
fn structural_instruction(fix: &StructuralFix, editable_file: &str) -> String {
    let target = fix.target.as_deref().unwrap_or("the affected type");
    match fix.action {
        StructuralAction::RenameType => format!(
            "Give '{}' a more specific client name by adding an @@clientName augment decorator \
             in {}. The new name must describe what the type represents.",
            target, editable_file
        ),
        StructuralAction::AddImport => format!(
            "Resolve the reference to '{}' in {}: add the missing import or using statement, or \
             qualify the name with its namespace.",
            target, editable_file
        ),
        StructuralAction::RemoveDuplicate => format!(
            "Remove the duplicated declaration or augment decorator in {} so that each name is \
             declared once.",
            editable_file
        ),
    }
}

/// Render one fix as a user message.
pub fn render_fix(fix: &Fix, instructions: &str, editable_file: &str) -> String {
    let (instruction, context) = match fix {
        Fix::Prompt(p) => (p.instruction().to_string(), p.context().map(str::to_string)),
        Fix::Structural(s) => (
            structural_instruction(s, editable_file),
            Some(format!("Analyzer error {}: {}", s.error_kind, s.message)),
        ),
    };
    let context = context
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "No additional context provided".to_string());

    format!(
        "{instructions}

### SPECIFIC FIX TO APPLY
{instruction}

### CONTEXT
{context}

### RESPONSE FORMAT
You MUST respond with ONLY the complete updated {editable} inside a single ```typespec code \
block. Do not include other files, explanations or partial snippets.

Now apply this fix following the system instructions above.",
        editable = editable_file,
    )
}

/// Prompt asking the agent to pull structured errors out of raw output.
pub fn error_analysis_prompt(raw_output: &str) -> String {
    let output = tail_chars(raw_output.trim(), MAX_ANALYSIS_INPUT_CHARS);
    format!(
        "### ERROR ANALYSIS
The following compiler or build output could not be parsed automatically. Identify every \
distinct error it reports.

You MUST respond with ONLY a JSON object of this exact shape:
{{\"errors\": [{{\"type\": \"<error code or category>\", \"message\": \"<error message>\"}}]}}
Use an empty array when the output contains no errors.

### OUTPUT
```
{output}
```"
    )
}
