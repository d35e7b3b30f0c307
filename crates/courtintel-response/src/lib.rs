#![forbid(unsafe_code)]

//! Strict parsing of model output.
//!
//! Coercion rules:
//! - required text fields accept a JSON string, number or boolean and are
//!   trimmed; null, missing, blank, `false` or zero yields
//!   [`UpstreamFailure::Incomplete`]; arrays and objects yield
//!   [`UpstreamFailure::InvalidField`].
//! - list fields default to empty when missing or null; any other non-array
//!   value is rejected. Elements become strings (JSON strings verbatim,
//!   everything else in its JSON text form).
//! - `bias_score` accepts a number or a numeric string.

use courtintel_domain::{BiasCheckFields, UpstreamFailure};
use serde_json::{Map, Value};

/// A ruling accepted from the model, plus the parsed object it came from.
///
/// `raw` is what the bias audit is shown.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRuling {
    pub verdict: String,
    pub rationale: String,
    pub citations: Vec<String>,
    pub risk_flags: Vec<String>,
    pub raw: Value,
}

/// Parse and validate the ruling stage's response text.
///
/// # Errors
/// Returns [`UpstreamFailure::Unparseable`] when the text is not a JSON object,
/// [`UpstreamFailure::Incomplete`] when `verdict` or `rationale` is missing or
/// blank, and [`UpstreamFailure::InvalidField`] when a field has an unusable type.
pub fn parse_ruling(text: &str) -> Result<ValidatedRuling, UpstreamFailure> {
    let fields = parse_object(text)?;

    let verdict = required_text(&fields, "verdict")?;
    let rationale = required_text(&fields, "rationale")?;
    let citations = string_list(&fields, "citations")?;
    let risk_flags = string_list(&fields, "risk_flags")?;

    Ok(ValidatedRuling {
        verdict,
        rationale,
        citations,
        risk_flags,
        raw: Value::Object(fields),
    })
}

/// Parse and validate the bias audit's response text.
///
/// # Errors
/// Returns [`UpstreamFailure::Unparseable`] when the text is not a JSON object,
/// [`UpstreamFailure::Incomplete`] when `bias_score` is missing or null, and
/// [`UpstreamFailure::InvalidField`] when a field has an unusable type.
pub fn parse_bias_check(text: &str) -> Result<BiasCheckFields, UpstreamFailure> {
    let fields = parse_object(text)?;

    let bias_score = match fields.get("bias_score") {
        None | Some(Value::Null) => return Err(UpstreamFailure::Incomplete("bias_score")),
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| invalid("bias_score", "is not representable as a float"))?,
        Some(Value::String(text)) => text
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|score| score.is_finite())
            .ok_or_else(|| invalid("bias_score", "is not numeric"))?,
        Some(_) => return Err(invalid("bias_score", "must be a number")),
    };
    let notes = string_list(&fields, "notes")?;

    Ok(BiasCheckFields { bias_score, notes })
}

fn parse_object(text: &str) -> Result<Map<String, Value>, UpstreamFailure> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(UpstreamFailure::Unparseable(
            "expected a JSON object".to_string(),
        )),
        Err(err) => Err(UpstreamFailure::Unparseable(err.to_string())),
    }
}

fn required_text(
    fields: &Map<String, Value>,
    field: &'static str,
) -> Result<String, UpstreamFailure> {
    let text = match fields.get(field) {
        None | Some(Value::Null) => return Err(UpstreamFailure::Incomplete(field)),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Bool(false)) => return Err(UpstreamFailure::Incomplete(field)),
        Some(Value::Number(number)) if number.as_f64().is_some_and(|value| value == 0.0) => {
            return Err(UpstreamFailure::Incomplete(field));
        }
        Some(scalar @ (Value::Number(_) | Value::Bool(true))) => scalar.to_string(),
        Some(_) => return Err(invalid(field, "must be text")),
    };
    if text.is_empty() {
        return Err(UpstreamFailure::Incomplete(field));
    }
    Ok(text)
}

fn string_list(
    fields: &Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, UpstreamFailure> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect()),
        Some(_) => Err(invalid(field, "must be an array")),
    }
}

fn invalid(field: &'static str, reason: &str) -> UpstreamFailure {
    UpstreamFailure::InvalidField {
        field,
        reason: reason.to_string(),
    }
}
