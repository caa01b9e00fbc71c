// Module: Assertions
// Pure evaluation of expectation rules against a decoded response body.
// Dispatch is on the declared type; a type mismatch or unknown type is an
// error, not a failed expectation.

use serde_json::Value;
use thiserror::Error;

use crate::errors::ErrorCode;
use crate::extract::{extract, render_scalar, ExtractError};
use crate::protocol::ExpectationRule;

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("expectation on '{field_path}' failed: wanted {operator} {desired}, got {actual}")]
    Failed {
        field_path: String,
        operator: String,
        desired: String,
        actual: String,
    },

    #[error("expectation path '{field_path}' not found in response: {source}")]
    PathNotFound {
        field_path: String,
        #[source]
        source: ExtractError,
    },

    #[error("expectation on '{field_path}': declared type '{declared}' but captured value is {found}")]
    TypeMismatch {
        field_path: String,
        declared: String,
        found: &'static str,
    },

    #[error("expectation on '{field_path}': unknown declared type '{declared}'")]
    UnknownType { field_path: String, declared: String },

    #[error("expectation on '{field_path}': operator '{operator}' not valid for type '{declared}'")]
    UnknownOperator {
        field_path: String,
        declared: String,
        operator: String,
    },
}

impl AssertionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Failed { .. } => ErrorCode::EXPECTATION_FAILED,
            Self::PathNotFound { .. } => ErrorCode::EXPECTATION_PATH_NOT_FOUND,
            Self::TypeMismatch { .. } => ErrorCode::EXPECTATION_TYPE_MISMATCH,
            Self::UnknownType { .. } => ErrorCode::EXPECTATION_UNKNOWN_TYPE,
            Self::UnknownOperator { .. } => ErrorCode::EXPECTATION_UNKNOWN_OPERATOR,
        }
    }
}

/// Evaluates every rule in declared order; the first failure aborts.
pub fn evaluate_all(rules: &[ExpectationRule], body: &Value) -> Result<(), AssertionError> {
    for rule in rules {
        evaluate(rule, body)?;
    }
    Ok(())
}

/// Evaluates one rule against the body.
pub fn evaluate(rule: &ExpectationRule, body: &Value) -> Result<(), AssertionError> {
    let captured = extract(body, &rule.field_path).map_err(|source| AssertionError::PathNotFound {
        field_path: rule.field_path.clone(),
        source,
    })?;

    match rule.declared_type.as_str() {
        "string" => assert_string(rule, &captured),
        "bool" => assert_bool(rule, &captured),
        "array_len" => assert_array_len(rule, &captured),
        "integer" => assert_integer(rule, &captured),
        other => Err(AssertionError::UnknownType {
            field_path: rule.field_path.clone(),
            declared: other.to_string(),
        }),
    }
}

fn assert_string(rule: &ExpectationRule, captured: &Value) -> Result<(), AssertionError> {
    let actual = captured.as_str().ok_or_else(|| mismatch(rule, captured))?;
    let desired = rule.desired.as_str().ok_or_else(|| mismatch(rule, &rule.desired))?;

    // Qualquer operador não reconhecido cai na igualdade.
    let passed = match rule.operator.as_str() {
        "lt" => actual < desired,
        "gt" => actual > desired,
        "lte" => actual <= desired,
        "gte" => actual >= desired,
        _ => actual == desired,
    };
    verdict(rule, passed, desired.to_string(), actual.to_string())
}

fn assert_bool(rule: &ExpectationRule, captured: &Value) -> Result<(), AssertionError> {
    let actual = captured.as_bool().ok_or_else(|| mismatch(rule, captured))?;
    let desired = rule
        .desired
        .as_bool()
        .ok_or_else(|| mismatch(rule, &rule.desired))?;

    if rule.operator != "eq" {
        return Err(AssertionError::UnknownOperator {
            field_path: rule.field_path.clone(),
            declared: rule.declared_type.clone(),
            operator: rule.operator.clone(),
        });
    }
    verdict(rule, actual == desired, desired.to_string(), actual.to_string())
}

fn assert_array_len(rule: &ExpectationRule, captured: &Value) -> Result<(), AssertionError> {
    let items = captured.as_array().ok_or_else(|| mismatch(rule, captured))?;
    let desired = desired_len(rule)?;
    let actual = items.len() as i64;

    let passed = compare_ordered(rule, actual, desired)?;
    verdict(rule, passed, desired.to_string(), actual.to_string())
}

/// Coerces both operands to their string representation and compares them
/// as strings under the given operator. Ordering is therefore
/// lexicographic, not numeric ("9" sorts after "10"); callers that already
/// depend on this are the reason it stays.
fn assert_integer(rule: &ExpectationRule, captured: &Value) -> Result<(), AssertionError> {
    let actual = render_scalar(captured);
    let desired = render_scalar(&rule.desired);

    let passed = match rule.operator.as_str() {
        "eq" => actual == desired,
        "lt" => actual < desired,
        "gt" => actual > desired,
        "lte" => actual <= desired,
        "gte" => actual >= desired,
        _ => {
            return Err(AssertionError::UnknownOperator {
                field_path: rule.field_path.clone(),
                declared: rule.declared_type.clone(),
                operator: rule.operator.clone(),
            })
        }
    };
    verdict(rule, passed, desired, actual)
}

fn desired_len(rule: &ExpectationRule) -> Result<i64, AssertionError> {
    if let Some(n) = rule.desired.as_i64() {
        return Ok(n);
    }
    if let Some(s) = rule.desired.as_str() {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(n);
        }
    }
    Err(mismatch(rule, &rule.desired))
}

fn compare_ordered(rule: &ExpectationRule, actual: i64, desired: i64) -> Result<bool, AssertionError> {
    Ok(match rule.operator.as_str() {
        "eq" => actual == desired,
        "lt" => actual < desired,
        "gt" => actual > desired,
        "lte" => actual <= desired,
        "gte" => actual >= desired,
        _ => {
            return Err(AssertionError::UnknownOperator {
                field_path: rule.field_path.clone(),
                declared: rule.declared_type.clone(),
                operator: rule.operator.clone(),
            })
        }
    })
}

fn mismatch(rule: &ExpectationRule, value: &Value) -> AssertionError {
    AssertionError::TypeMismatch {
        field_path: rule.field_path.clone(),
        declared: rule.declared_type.clone(),
        found: kind(value),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn verdict(
    rule: &ExpectationRule,
    passed: bool,
    desired: String,
    actual: String,
) -> Result<(), AssertionError> {
    if passed {
        Ok(())
    } else {
        Err(AssertionError::Failed {
            field_path: rule.field_path.clone(),
            operator: rule.operator.clone(),
            desired,
            actual,
        })
    }
}
