//! Fixes and the catalog that derives them from structured errors.

use super::StructuredError;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static QUOTED_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([^']+)'").unwrap());

/// An actionable remediation for one or more structured errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fix {
    /// Free-form instruction handed to the agent as is.
    Prompt(PromptFix),
    /// A known remediation the renderer turns into an instruction.
    Structural(StructuralFix),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptFix {
    instruction: String,
    context: Option<String>,
}

impl PromptFix {
    /// Fails on a blank instruction. A blank context is dropped.
    pub fn new(instruction: impl Into<String>, context: Option<String>) -> Result<Self> {
        let instruction = instruction.into();
        if instruction.trim().is_empty() {
            return Err(Error::InvalidInput(
                "fix instruction cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            instruction,
            context: context.filter(|c| !c.trim().is_empty()),
        })
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralAction {
    /// Give a type a more specific client name with `@@clientName`.
    RenameType,
    /// Add a missing `import` or `using` for an unresolved reference.
    AddImport,
    /// Remove a duplicated declaration or augment decorator.
    RemoveDuplicate,
}

impl fmt::Display for StructuralAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StructuralAction::RenameType => "rename-type",
            StructuralAction::AddImport => "add-import",
            StructuralAction::RemoveDuplicate => "remove-duplicate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuralFix {
    pub error_kind: String,
    pub target: Option<String>,
    pub action: StructuralAction,
    pub message: String,
}

impl fmt::Display for Fix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fix::Prompt(p) => write!(f, "prompt: {}", p.instruction),
            Fix::Structural(s) => match &s.target {
                Some(target) => write!(f, "{} {} ({})", s.action, target, s.error_kind),
                None => write!(f, "{} ({})", s.action, s.error_kind),
            },
        }
    }
}

/// Source of fixes. Built once at startup and shared.
pub trait FixCatalog: Send + Sync {
    fn fixes_for(&self, errors: &[StructuredError]) -> anyhow::Result<Vec<Fix>>;
}

/// Built-in rules for the analyzer and compiler codes seen most often.
/// Anything unrecognised becomes a generic prompt quoting the error.
#[derive(Debug, Default, Clone)]
pub struct RuleCatalog;

impl RuleCatalog {
    pub fn new() -> Self {
        Self
    }

    fn fix_for(&self, error: &StructuredError) -> anyhow::Result<Fix> {
        let kind = error.kind.to_ascii_uppercase();
        let target = QUOTED_NAME
            .captures(&error.message)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let structural = |action| {
            Fix::Structural(StructuralFix {
                error_kind: error.kind.clone(),
                target: target.clone(),
                action,
                message: error.message.clone(),
            })
        };

        let fix = match kind.as_str() {
            // Generic type name, reserved suffix, or a name colliding with another namespace
            "AZC0012" | "AZC0030" | "AZC0034" if target.is_some() => {
                structural(StructuralAction::RenameType)
            }
            "INVALID-REF" | "CS0246" if target.is_some() => structural(StructuralAction::AddImport),
            "DUPLICATE-SYMBOL" | "DUPLICATE-TYPE-NAME" => {
                structural(StructuralAction::RemoveDuplicate)
            }
            "DECORATOR-WRONG-TARGET" => Fix::Prompt(PromptFix::new(
                format!("Move or remove the misapplied decorator: {}", error.message),
                Some(format!("TypeSpec compiler error {}", error.kind)),
            )?),
            k if k.starts_with("CS") => Fix::Prompt(PromptFix::new(
                format!("Fix C# build error {}: {}", error.kind, error.message),
                Some(
                    "The error is in generated code. Change client customizations so the \
                     generator emits compilable code; do not edit generated files."
                        .to_string(),
                ),
            )?),
            _ => Fix::Prompt(PromptFix::new(
                format!("Fix error {}: {}", error.kind, error.message),
                None,
            )?),
        };
        Ok(fix)
    }
}

impl FixCatalog for RuleCatalog {
    fn fixes_for(&self, errors: &[StructuredError]) -> anyhow::Result<Vec<Fix>> {
        errors.iter().map(|e| self.fix_for(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: &str, message: &str) -> StructuredError {
        StructuredError::new(kind, message)
    }

    #[test]
    fn test_prompt_fix_rejects_empty_instruction() {
        assert!(PromptFix::new("  ", Some("ctx".to_string())).is_err());
        let fix = PromptFix::new("Do it", Some(String::new())).unwrap();
        assert_eq!(fix.context(), None);
    }

    #[test]
    fn test_generic_type_name_becomes_rename() {
        let fixes = RuleCatalog::new()
            .fixes_for(&[err("AZC0012", "Type name 'Client' is too generic")])
            .unwrap();
        match &fixes[0] {
            Fix::Structural(s) => {
                assert_eq!(s.action, StructuralAction::RenameType);
                assert_eq!(s.target.as_deref(), Some("Client"));
            }
            other => panic!("unexpected fix {:?}", other),
        }
        assert_eq!(fixes[0].to_string(), "rename-type Client (AZC0012)");
    }

    #[test]
    fn test_unknown_error_gets_generic_prompt() {
        let fixes = RuleCatalog::new()
            .fixes_for(&[err("some-rule", "Something odd")])
            .unwrap();
        match &fixes[0] {
            Fix::Prompt(p) => assert_eq!(p.instruction(), "Fix error some-rule: Something odd"),
            other => panic!("unexpected fix {:?}", other),
        }
    }

    #[test]
    fn test_build_error_prompt_has_context() {
        let fixes = RuleCatalog::new()
            .fixes_for(&[err("CS0103", "The name 'variable' does not exist")])
            .unwrap();
        let Fix::Prompt(p) = &fixes[0] else {
            panic!("expected prompt fix");
        };
        assert!(p.instruction().contains("CS0103"));
        assert!(p.context().is_some());
    }

    #[test]
    fn test_one_fix_per_error() {
        let errors = vec![
            err("AZC0012", "Type name 'Client' is too generic"),
            err("invalid-ref", "Unknown identifier 'Widget'"),
            err("duplicate-symbol", "Duplicate name: \"Foo\""),
        ];
        let fixes = RuleCatalog::new().fixes_for(&errors).unwrap();
        assert_eq!(fixes.len(), 3);
    }
}
