// Module: Extract
// Dot-path navigation over decoded JSON values. Used to read captured
// action outputs and to descend into external key-value payloads.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("path '{path}': field '{segment}' not found")]
    NotFound { path: String, segment: String },

    #[error("path '{path}': index {index} out of bounds (list has {len} elements)")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("path '{path}': cannot descend into {found} at segment '{segment}'")]
    NotNavigable {
        path: String,
        segment: String,
        found: &'static str,
    },

    #[error("path '{path}': value at '{segment}' is not decodable JSON: {reason}")]
    DecodeFailed {
        path: String,
        segment: String,
        reason: String,
    },
}

/// Resolves a dot-separated path against a JSON value.
///
/// A numeric segment indexes into a list; any other segment descends into an
/// object field. A string value met mid-path is decoded as JSON first, so
/// JSON-encoded payloads stored as strings stay navigable.
///
/// An empty path returns the value itself.
pub fn extract(value: &Value, path: &str) -> Result<Value, ExtractError> {
    if path.is_empty() {
        return Ok(value.clone());
    }

    let mut current = value.clone();
    for segment in path.split('.') {
        current = descend(current, segment, path)?;
    }
    Ok(current)
}

fn descend(current: Value, segment: &str, full_path: &str) -> Result<Value, ExtractError> {
    // JSON-encoded string payloads are decoded before descending.
    let current = match current {
        Value::String(raw) => serde_json::from_str(&raw).map_err(|e| ExtractError::DecodeFailed {
            path: full_path.to_string(),
            segment: segment.to_string(),
            reason: e.to_string(),
        })?,
        other => other,
    };

    if let Ok(index) = segment.parse::<usize>() {
        return match current {
            Value::Array(items) => {
                let len = items.len();
                items
                    .into_iter()
                    .nth(index)
                    .ok_or(ExtractError::IndexOutOfBounds {
                        path: full_path.to_string(),
                        index,
                        len,
                    })
            }
            other => Err(ExtractError::NotNavigable {
                path: full_path.to_string(),
                segment: segment.to_string(),
                found: kind_name(&other),
            }),
        };
    }

    match current {
        Value::Object(mut map) => map.remove(segment).ok_or_else(|| ExtractError::NotFound {
            path: full_path.to_string(),
            segment: segment.to_string(),
        }),
        other => Err(ExtractError::NotNavigable {
            path: full_path.to_string(),
            segment: segment.to_string(),
            found: kind_name(&other),
        }),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Renders an extracted value the way it is injected into request fields:
/// strings stay bare, everything else is its JSON representation.
pub fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
