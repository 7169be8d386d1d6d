//! Conversions from evaluated JSON values into metric values and labels.

use promqtt_exporter::format_value;
use serde_json::Value;

use super::eval::{EvalError, parse_number, type_name};

/// Truthiness: null, false, zero and empty containers are false.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Human readable rendering used by `str()`, `format()` and templates.
pub(crate) fn display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => i.to_string(),
            (_, Some(u)) => u.to_string(),
            _ => format_value(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce an expression result into a metric value.
///
/// `Ok(None)` means the instance should be removed.
pub fn to_metric_value(value: &Value) -> Result<Option<f64>, EvalError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .map(Some)
            .ok_or(EvalError::NonFinite),
        Value::String(s) => parse_number(s).map(Some),
        other => Err(EvalError::TypeMismatch(format!(
            "metric value must be a number, got {}",
            type_name(other)
        ))),
    }
}

/// Coerce an expression result into a label value.
pub fn to_label_value(value: &Value) -> Result<String, EvalError> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => Ok(display(value)),
        other => Err(EvalError::TypeMismatch(format!(
            "label value must be a string, number or bool, got {}",
            type_name(other)
        ))),
    }
}
