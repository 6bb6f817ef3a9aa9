//! The JSON envelope printed by the executor on stdout.

use serde::Deserialize;
use serde_json::Value;

/// Executor response envelope: `{is_error, result?, structured_output?, subtype?}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured_output: Option<Value>,
    #[serde(default)]
    pub subtype: Option<String>,
}

impl Envelope {
    /// Parse executor stdout.
    ///
    /// The whole output is tried first; if the executor printed progress
    /// before the envelope, the last line that parses as a JSON object wins.
    pub fn parse(stdout: &str) -> Option<Envelope> {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(envelope) = serde_json::from_str::<Envelope>(trimmed) {
            return Some(envelope);
        }
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str::<Envelope>(line).ok())
    }

    /// `structured_output.status`, when the executor reported one.
    pub fn structured_status(&self) -> Option<&str> {
        self.structured_output
            .as_ref()
            .and_then(|value| value.get("status"))
            .and_then(Value::as_str)
    }

    /// Free text to scan for rate-limit hints: result text, subtype and any
    /// structured summary/error strings.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(result) = &self.result {
            parts.push(result);
        }
        if let Some(subtype) = &self.subtype {
            parts.push(subtype);
        }
        if let Some(structured) = &self.structured_output {
            for key in ["summary", "error", "message"] {
                if let Some(text) = structured.get(key).and_then(Value::as_str) {
                    parts.push(text);
                }
            }
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_document() {
        let envelope = Envelope::parse(
            r#"{"is_error":false,"result":"done","structured_output":{"status":"success"}}"#,
        )
        .expect("parse");
        assert!(!envelope.is_error);
        assert_eq!(envelope.result.as_deref(), Some("done"));
        assert_eq!(envelope.structured_status(), Some("success"));
    }

    #[test]
    fn falls_back_to_last_json_line() {
        let stdout = "warming up\n{\"is_error\":true,\"result\":\"first\"}\nnoise\n{\"is_error\":false,\"result\":\"second\"}\n";
        let envelope = Envelope::parse(stdout).expect("parse");
        assert_eq!(envelope.result.as_deref(), Some("second"));
    }

    #[test]
    fn empty_or_garbage_output_has_no_envelope() {
        assert_eq!(Envelope::parse("   "), None);
        assert_eq!(Envelope::parse("segfault"), None);
    }

    #[test]
    fn search_text_collects_summary_and_result() {
        let envelope = Envelope {
            is_error: true,
            result: Some("oops".to_string()),
            structured_output: Some(json!({"summary": "usage limit reached"})),
            subtype: Some("error_during_execution".to_string()),
        };
        let text = envelope.search_text();
        assert!(text.contains("oops"));
        assert!(text.contains("usage limit reached"));
        assert!(text.contains("error_during_execution"));
    }
}
