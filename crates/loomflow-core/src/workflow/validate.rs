//! Structural validation of step outputs before commit.
//!
//! Only a fixed whitelist of deterministic repairs is ever applied, and each
//! one is logged and recorded on the attempt:
//! - `trim_whitespace`: a string payload with surrounding whitespace
//! - `strip_code_fence`: a string payload wrapped in a Markdown code fence;
//!   the inner text replaces the payload, parsed as JSON when it is valid JSON
//! - `summary_from_payload`: an empty summary derived from the payload
//!
//! Anything else that is wrong is a `VALIDATION_FAIL`.

use loomflow_types::pipeline::{OutputFormat, PlannedStep};
use loomflow_types::run::{ValidationIssue, ValidationReport};

use super::work::WorkOutput;

/// Upper bound on a serialized step output.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

const SUMMARY_CHARS: usize = 120;

pub const REPAIR_TRIM_WHITESPACE: &str = "trim_whitespace";
pub const REPAIR_STRIP_CODE_FENCE: &str = "strip_code_fence";
pub const REPAIR_SUMMARY_FROM_PAYLOAD: &str = "summary_from_payload";

/// A work output after repairs, with its validation report.
#[derive(Debug, Clone)]
pub struct ValidatedOutput {
    pub payload: serde_json::Value,
    pub summary: String,
    pub quality_score: Option<f64>,
    pub issues: Vec<String>,
    pub repairs: Vec<String>,
    pub report: ValidationReport,
}

impl ValidatedOutput {
    pub fn is_valid(&self) -> bool {
        self.report.valid
    }

    /// Error messages joined for a `VALIDATION_FAIL` step error.
    pub fn error_message(&self) -> String {
        self.report
            .errors
            .iter()
            .map(|issue| issue.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Stateless output validator.
pub struct OutputValidator;

impl OutputValidator {
    /// Repair and validate `output` against the step's expectations.
    pub fn validate(step: &PlannedStep, output: WorkOutput) -> ValidatedOutput {
        let WorkOutput {
            mut payload,
            mut summary,
            quality_score,
            issues,
        } = output;
        let mut repairs = Vec::new();

        if let serde_json::Value::String(text) = &payload {
            let trimmed = text.trim();
            if trimmed.len() != text.len() {
                repairs.push(REPAIR_TRIM_WHITESPACE.to_string());
            }
            if let Some(inner) = strip_code_fence(trimmed) {
                repairs.push(REPAIR_STRIP_CODE_FENCE.to_string());
                payload = serde_json::from_str(inner)
                    .unwrap_or_else(|_| serde_json::Value::String(inner.to_string()));
            } else if trimmed.len() != text.len() {
                payload = serde_json::Value::String(trimmed.to_string());
            }
        }

        if summary.trim().is_empty() && !is_empty_payload(&payload) {
            summary = summarize(&payload);
            repairs.push(REPAIR_SUMMARY_FROM_PAYLOAD.to_string());
        }

        for repair in &repairs {
            tracing::warn!(step = step.name.as_str(), repair = repair.as_str(), "applied output repair");
        }

        let mut errors = Vec::new();
        if is_empty_payload(&payload) {
            errors.push(ValidationIssue::new("empty_output", "step produced an empty output"));
        } else if !matches_format(&payload, step.expect) {
            errors.push(ValidationIssue::new(
                "format_mismatch",
                format!("output does not match expected format '{}'", step.expect.as_str()),
            ));
        }

        let size = serde_json::to_vec(&payload).map(|b| b.len()).unwrap_or(usize::MAX);
        if size > MAX_OUTPUT_BYTES {
            errors.push(ValidationIssue::new(
                "output_too_large",
                format!("output is {size} bytes, limit is {MAX_OUTPUT_BYTES}"),
            ));
        }

        if step.quality.is_some() {
            match quality_score {
                None => errors.push(ValidationIssue::new(
                    "missing_quality_score",
                    "quality-gated step returned no quality score",
                )),
                Some(score) if !(0.0..=1.0).contains(&score) => {
                    errors.push(ValidationIssue::new(
                        "quality_score_out_of_range",
                        format!("quality score {score} is outside [0, 1]"),
                    ))
                }
                Some(_) => {}
            }
        }

        let warnings = issues
            .iter()
            .map(|issue| ValidationIssue::new("reported_issue", issue.clone()))
            .collect();

        ValidatedOutput {
            payload,
            summary,
            quality_score,
            issues,
            repairs,
            report: ValidationReport {
                valid: errors.is_empty(),
                format: step.expect.as_str().to_string(),
                errors,
                warnings,
            },
        }
    }
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let body = rest.strip_suffix("```")?;
    // Drop the info string (e.g. "json") on the opening line.
    let body = match body.find('\n') {
        Some(idx) => &body[idx + 1..],
        None => body,
    };
    Some(body.trim())
}

fn is_empty_payload(payload: &serde_json::Value) -> bool {
    match payload {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn matches_format(payload: &serde_json::Value, format: OutputFormat) -> bool {
    match format {
        OutputFormat::Any => true,
        OutputFormat::Json => payload.is_object() || payload.is_array(),
        OutputFormat::Text => payload.is_string(),
    }
}

fn summarize(payload: &serde_json::Value) -> String {
    let text = match payload {
        serde_json::Value::String(s) => s.lines().next().unwrap_or_default().to_string(),
        other => other.to_string(),
    };
    let mut summary: String = text.chars().take(SUMMARY_CHARS).collect();
    if text.chars().count() > SUMMARY_CHARS {
        summary.push_str("...");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomflow_types::pipeline::{QualityGate, RetryPolicy};
    use serde_json::json;

    fn step(expect: OutputFormat, gated: bool) -> PlannedStep {
        PlannedStep {
            name: "draft".to_string(),
            display_name: "Draft".to_string(),
            target: "draft".to_string(),
            config: json!({}),
            timeout_secs: 30,
            retry: RetryPolicy::default(),
            quality: gated.then(|| QualityGate {
                threshold: 0.9,
                max_attempts: 2,
                accept_on_final: false,
            }),
            expect,
        }
    }

    fn output(payload: serde_json::Value) -> WorkOutput {
        WorkOutput {
            payload,
            summary: "summary".to_string(),
            quality_score: None,
            issues: vec![],
        }
    }

    #[test]
    fn clean_output_needs_no_repairs() {
        let result = OutputValidator::validate(&step(OutputFormat::Json, false), output(json!({"a": 1})));
        assert!(result.is_valid());
        assert!(result.repairs.is_empty());
        assert_eq!(result.report.format, "json");
    }

    #[test]
    fn fenced_json_is_unwrapped_and_parsed() {
        let fenced = json!("  ```json\n{\"title\": \"Intro\"}\n```  ");
        let result = OutputValidator::validate(&step(OutputFormat::Json, false), output(fenced));
        assert!(result.is_valid(), "{:?}", result.report.errors);
        assert_eq!(result.payload, json!({"title": "Intro"}));
        assert_eq!(result.repairs, vec![REPAIR_TRIM_WHITESPACE, REPAIR_STRIP_CODE_FENCE]);
    }

    #[test]
    fn whitespace_is_trimmed_from_text() {
        let result = OutputValidator::validate(&step(OutputFormat::Text, false), output(json!("  hello \n")));
        assert_eq!(result.payload, json!("hello"));
        assert_eq!(result.repairs, vec![REPAIR_TRIM_WHITESPACE]);
    }

    #[test]
    fn empty_summary_is_derived() {
        let mut out = output(json!("First line\nsecond line"));
        out.summary = String::new();
        let result = OutputValidator::validate(&step(OutputFormat::Any, false), out);
        assert_eq!(result.summary, "First line");
        assert!(result.repairs.contains(&REPAIR_SUMMARY_FROM_PAYLOAD.to_string()));
    }

    #[test]
    fn empty_output_fails() {
        let result = OutputValidator::validate(&step(OutputFormat::Any, false), output(json!("   ")));
        assert!(!result.is_valid());
        assert_eq!(result.report.errors[0].code, "empty_output");
    }

    #[test]
    fn format_mismatch_fails() {
        let result = OutputValidator::validate(&step(OutputFormat::Json, false), output(json!("plain prose")));
        assert!(!result.is_valid());
        assert_eq!(result.report.errors[0].code, "format_mismatch");
    }

    #[test]
    fn oversized_output_fails() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 1);
        let result = OutputValidator::validate(&step(OutputFormat::Text, false), output(json!(big)));
        assert!(result.report.errors.iter().any(|e| e.code == "output_too_large"));
    }

    #[test]
    fn gated_step_requires_valid_score() {
        let gated = step(OutputFormat::Any, true);
        let missing = OutputValidator::validate(&gated, output(json!("text")));
        assert_eq!(missing.report.errors[0].code, "missing_quality_score");

        let mut out = output(json!("text"));
        out.quality_score = Some(1.7);
        let out_of_range = OutputValidator::validate(&gated, out);
        assert_eq!(out_of_range.report.errors[0].code, "quality_score_out_of_range");

        let mut out = output(json!("text"));
        out.quality_score = Some(0.5);
        out.issues = vec!["too short".to_string()];
        let ok = OutputValidator::validate(&gated, out);
        assert!(ok.is_valid());
        assert_eq!(ok.report.warnings.len(), 1);
    }
}
