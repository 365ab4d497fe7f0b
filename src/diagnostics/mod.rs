//! Error extraction from compiler and build output
//!
//! A line-oriented pattern pass pulls out `error <KIND>: <MESSAGE>`
//! diagnostics. Whatever it cannot match is handed to an AI extractor, if
//! one is supplied. Fixes come from an injected [`FixCatalog`].

pub mod fixes;

pub use fixes::{Fix, FixCatalog, PromptFix, RuleCatalog, StructuralAction, StructuralFix};

use crate::cancel::CancelSignal;
use crate::error::{Error, Result};
use crate::parse::parse_lenient_object;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

static ERROR_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\berror\s+([A-Za-z0-9@_./\-]+)\s*:\s*(\S.*)").unwrap());

pub const UNSPECIFIED_ERROR_KIND: &str = "UnspecifiedError";
pub const EMPTY_MESSAGE: &str = "No message provided";

/// A `(kind, message)` pair parsed from diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuredError {
    pub kind: String,
    pub message: String,
}

impl StructuredError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StructuredError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub errors: Vec<StructuredError>,
    /// Non-matching lines, verbatim, joined with `\n`.
    pub unmatched_text: String,
}

impl Extraction {
    pub fn needs_fallback(&self) -> bool {
        !self.unmatched_text.trim().is_empty()
    }
}

/// Pattern pass over `raw`. Duplicate `(kind, message)` pairs keep their
/// first position.
pub fn extract(raw: &str) -> Extraction {
    let mut seen = HashSet::new();
    let mut errors = Vec::new();
    let mut unmatched = Vec::new();

    for line in raw.lines() {
        match ERROR_LINE.captures(line) {
            Some(caps) => {
                let kind = caps[1].trim().to_string();
                let message = caps[2].trim().to_string();
                let error = StructuredError::new(kind, message);
                if seen.insert(error.clone()) {
                    errors.push(error);
                }
            }
            None => unmatched.push(line),
        }
    }

    Extraction {
        errors,
        unmatched_text: unmatched.join("\n"),
    }
}

/// Parse an AI extractor response of the form
/// `{"errors": [{"type": "...", "message": "..."}]}`.
pub fn parse_ai_errors(response: &str) -> Result<Vec<StructuredError>> {
    let not_json = || Error::Other("Agent response is not in the expected JSON format".to_string());
    if response.trim().is_empty() {
        return Err(not_json());
    }
    let value = parse_lenient_object(response).ok_or_else(not_json)?;

    let items: &[Value] = match value.get("errors") {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Null) | None => &[],
        Some(_) => return Err(not_json()),
    };

    Ok(items
        .iter()
        .filter(|item| item.is_object())
        .map(|item| {
            let kind = text_field(item, "type");
            let message = text_field(item, "message");
            StructuredError::new(
                if kind.is_empty() { UNSPECIFIED_ERROR_KIND.to_string() } else { kind },
                if message.is_empty() { EMPTY_MESSAGE.to_string() } else { message },
            )
        })
        .collect())
}

fn text_field(item: &Value, key: &str) -> String {
    match item.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// AI-assisted extraction for text the pattern pass could not read.
pub trait AiErrorExtractor {
    fn extract_errors(
        &self,
        text: &str,
        cancel: &CancelSignal,
    ) -> impl Future<Output = Result<Vec<StructuredError>>>;
}

/// Extraction plus fix generation through the injected catalog.
#[derive(Clone)]
pub struct ErrorAnalyzer {
    catalog: Arc<dyn FixCatalog>,
}

impl ErrorAnalyzer {
    pub fn new(catalog: Arc<dyn FixCatalog>) -> Self {
        Self { catalog }
    }

    /// Pattern pass, then the AI fallback over the unmatched remainder.
    /// A failing fallback keeps the pattern results; cancellation does not.
    pub async fn analyze<A>(
        &self,
        raw: &str,
        ai: Option<&A>,
        cancel: &CancelSignal,
    ) -> Result<Vec<StructuredError>>
    where
        A: AiErrorExtractor,
    {
        let extraction = extract(raw);
        debug!(matched = extraction.errors.len(), "Pattern extraction done");

        let Some(ai) = ai else {
            return Ok(extraction.errors);
        };
        if !extraction.needs_fallback() {
            return Ok(extraction.errors);
        }
        let Extraction {
            mut errors,
            unmatched_text,
        } = extraction;

        match ai.extract_errors(&unmatched_text, cancel).await {
            Ok(extra) => {
                let mut seen: HashSet<StructuredError> = errors.iter().cloned().collect();
                let before = errors.len();
                errors.extend(extra.into_iter().filter(|e| seen.insert(e.clone())));
                info!(added = errors.len() - before, "AI extraction added errors");
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => warn!("AI error extraction failed, keeping pattern results: {}", e),
        }
        Ok(errors)
    }

    /// Never fails: a catalog error is logged and yields no fixes.
    pub fn fixes_for(&self, errors: &[StructuredError]) -> Vec<Fix> {
        if errors.is_empty() {
            return Vec::new();
        }
        match self.catalog.fixes_for(errors) {
            Ok(fixes) => fixes,
            Err(e) => {
                warn!("Fix generation failed: {:#}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAi {
        reply: std::result::Result<Vec<StructuredError>, String>,
        calls: AtomicUsize,
    }

    impl ScriptedAi {
        fn ok(errors: Vec<StructuredError>) -> Self {
            Self { reply: Ok(errors), calls: AtomicUsize::new(0) }
        }

        fn failing() -> Self {
            Self { reply: Err("boom".to_string()), calls: AtomicUsize::new(0) }
        }
    }

    impl AiErrorExtractor for ScriptedAi {
        async fn extract_errors(
            &self,
            _text: &str,
            _cancel: &CancelSignal,
        ) -> Result<Vec<StructuredError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map_err(Error::Other)
        }
    }

    struct BrokenCatalog;

    impl FixCatalog for BrokenCatalog {
        fn fixes_for(&self, _errors: &[StructuredError]) -> anyhow::Result<Vec<Fix>> {
            anyhow::bail!("catalog unavailable")
        }
    }

    fn analyzer() -> ErrorAnalyzer {
        ErrorAnalyzer::new(Arc::new(RuleCatalog::new()))
    }

    #[test]
    fn test_extracts_distinct_errors() {
        let raw = "error AZC0001: Type name 'Client' is too generic\n\
                   error CS0103: The name 'variable' does not exist\n\
                   error AZC0002: Another error";
        let extraction = extract(raw);
        assert_eq!(extraction.errors.len(), 3);
        assert_eq!(
            extraction.errors[1],
            StructuredError::new("CS0103", "The name 'variable' does not exist")
        );
        assert!(extraction.unmatched_text.is_empty());
        assert!(!extraction.needs_fallback());
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let raw = "error B: two\nerror A: one\nerror B: two";
        let extraction = extract(raw);
        assert_eq!(
            extraction.errors,
            vec![StructuredError::new("B", "two"), StructuredError::new("A", "one")]
        );
    }

    #[test]
    fn test_flexible_whitespace_and_case() {
        let extraction = extract("  ERROR   AZC0012  :   Model name 'Data' is too generic   ");
        assert_eq!(
            extraction.errors,
            vec![StructuredError::new("AZC0012", "Model name 'Data' is too generic")]
        );
    }

    #[test]
    fn test_compiler_diagnostic_with_location() {
        let raw = "main.tsp:3:5 - error invalid-ref: Unknown identifier 'Widget'\n\
                   /src/Foo.cs(10,5): error CS0246: The type 'Bar' could not be found [/src/Foo.csproj]";
        let extraction = extract(raw);
        assert_eq!(extraction.errors[0].kind, "invalid-ref");
        assert_eq!(extraction.errors[1].kind, "CS0246");
    }

    #[test]
    fn test_malformed_lines_are_unmatched() {
        let raw = "error : missing kind\nerror AZC0001: \nBuild FAILED.";
        let extraction = extract(raw);
        assert!(extraction.errors.is_empty());
        assert_eq!(extraction.unmatched_text, raw);
    }

    #[test]
    fn test_unmatched_lines_preserved_in_order() {
        let raw = "Compiling...\nerror AZC0001: bad\n  at line 4\n";
        let extraction = extract(raw);
        assert_eq!(extraction.errors.len(), 1);
        assert_eq!(extraction.unmatched_text, "Compiling...\n  at line 4");
    }

    #[test]
    fn test_parse_ai_errors_defaults_and_casing() {
        let response = r#"```json
        {"Errors": [{"Type": "", "Message": "Bad thing"}, {"TYPE": "X1", "message": ""},]}
        ```"#;
        let errors = parse_ai_errors(response).unwrap();
        assert_eq!(
            errors,
            vec![
                StructuredError::new(UNSPECIFIED_ERROR_KIND, "Bad thing"),
                StructuredError::new("X1", EMPTY_MESSAGE),
            ]
        );
    }

    #[test]
    fn test_parse_ai_errors_missing_or_null_array() {
        assert!(parse_ai_errors(r#"{"errors": null}"#).unwrap().is_empty());
        assert!(parse_ai_errors(r#"{"other": 1}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_ai_errors_rejects_blank_and_prose() {
        for response in ["", "   ", "I could not find any errors."] {
            let err = parse_ai_errors(response).unwrap_err();
            assert!(err.to_string().contains("not in the expected JSON format"));
        }
    }

    #[tokio::test]
    async fn test_fallback_only_when_unmatched_text_remains() {
        let ai = ScriptedAi::ok(vec![StructuredError::new("X", "y")]);
        let errors = analyzer()
            .analyze("error A: one", Some(&ai), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);

        let errors = analyzer()
            .analyze("error A: one\nsomething weird happened", Some(&ai), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(errors, vec![StructuredError::new("A", "one"), StructuredError::new("X", "y")]);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_results_are_deduplicated() {
        let ai = ScriptedAi::ok(vec![
            StructuredError::new("A", "one"),
            StructuredError::new("B", "two"),
        ]);
        let errors = analyzer()
            .analyze("error A: one\nnoise", Some(&ai), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_fallback_keeps_pattern_results() {
        let ai = ScriptedAi::failing();
        let errors = analyzer()
            .analyze("error A: one\nnoise", Some(&ai), &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(errors, vec![StructuredError::new("A", "one")]);
    }

    #[test]
    fn test_catalog_failure_yields_no_fixes() {
        let broken = ErrorAnalyzer::new(Arc::new(BrokenCatalog));
        assert!(broken.fixes_for(&[StructuredError::new("A", "one")]).is_empty());
        assert_eq!(analyzer().fixes_for(&[StructuredError::new("A", "one")]).len(), 1);
    }
}
