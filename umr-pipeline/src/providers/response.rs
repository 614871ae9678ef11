//! Schema validation of raw provider output
//!
//! Models do not always answer with clean JSON, so parsing is tolerant about
//! the envelope and strict about the content:
//! - markdown code fences and surrounding prose are stripped
//! - numbers given as strings are accepted
//! - `black_digit` is accepted as an alias for `sub_unit_reading`
//! - an omitted `total_reading` is derived from the components
//!
//! Everything else (missing digits, unknown confidence, a total that does not
//! match the components) makes the response malformed.

use serde_json::{Map, Value};

use super::ProviderError;
use crate::types::{ApiUsage, Confidence, Reading, MAX_DIGITAL};

/// Parse and validate a provider's raw text into a Reading
pub fn parse_reading(
    text: &str,
    provider_id: &str,
    provider_model: &str,
    usage: Option<ApiUsage>,
) -> Result<Reading, ProviderError> {
    let object = extract_json_object(text)?;

    let digital = required_number(&object, "digital_reading")?;
    if digital < 0.0 || digital.fract() != 0.0 {
        return Err(malformed(format!(
            "digital_reading must be a non-negative integer (got {})",
            digital
        )));
    }
    // Checked before the cast, which would saturate
    if digital > MAX_DIGITAL as f64 {
        return Err(malformed(format!(
            "digital_reading {} exceeds {}",
            digital, MAX_DIGITAL
        )));
    }

    let sub_unit = match optional_number(&object, "sub_unit_reading")? {
        Some(v) => Some(v),
        None => optional_number(&object, "black_digit")?,
    };
    let sub_unit = match sub_unit {
        Some(v) if v.fract() != 0.0 || !(0.0..=9.0).contains(&v) => {
            return Err(malformed(format!(
                "sub_unit_reading must be a digit 0-9 (got {})",
                v
            )))
        }
        Some(v) => Some(v as u8),
        None => None,
    };

    let dial = optional_number(&object, "dial_reading")?;
    let total = optional_number(&object, "total_reading")?;

    let confidence = match object.get("confidence") {
        Some(Value::String(s)) => s
            .parse::<Confidence>()
            .map_err(|e| malformed(e.to_string()))?,
        Some(other) => return Err(malformed(format!("confidence must be a string (got {})", other))),
        None => return Err(malformed("missing required field: confidence")),
    };

    let notes = match object.get("notes") {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };

    let reading = Reading::checked(digital as u64, sub_unit, dial, total, confidence)
        .map_err(|e| malformed(e.to_string()))?;

    Ok(reading
        .with_notes(notes)
        .with_provider(provider_id, provider_model)
        .with_usage(usage))
}

/// Locate the JSON object inside a model answer
fn extract_json_object(text: &str) -> Result<Map<String, Value>, ProviderError> {
    let mut body = text.trim();

    // Remove markdown code blocks if present
    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        body = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }

    let start = body.find('{');
    let end = body.rfind('}');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if s < e => &body[s..=e],
        _ => return Err(malformed("no JSON object in response")),
    };

    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(malformed("response is not a JSON object")),
        Err(e) => Err(malformed(format!("invalid JSON: {}", e))),
    }
}

fn required_number(object: &Map<String, Value>, field: &str) -> Result<f64, ProviderError> {
    optional_number(object, field)?
        .ok_or_else(|| malformed(format!("missing required field: {}", field)))
}

fn optional_number(object: &Map<String, Value>, field: &str) -> Result<Option<f64>, ProviderError> {
    let value = match object.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };

    match value {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(malformed(format!("{} is not a number", field))),
    }
}

fn malformed(msg: impl Into<String>) -> ProviderError {
    ProviderError::Malformed(msg.into())
}
