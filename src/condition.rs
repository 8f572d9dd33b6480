//! Condition evaluation: a structured `{variable, operator, value}` predicate
//! evaluated against the execution context with typed coercion.

use crate::context::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structured condition, as carried by a `ConditionStep`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionData {
    pub variable: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

impl ConditionData {
    pub fn is_usable(&self) -> bool {
        !self.variable.is_empty() && !self.operator.is_empty()
    }

    /// The right-hand literal, stringified the way the operator table
    /// expects (`R` is always compared as a string unless coerced).
    fn value_str(&self) -> String {
        match &self.value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }
}

fn is_finite_number(v: &Value) -> bool {
    matches!(v, Value::Number(n) if n.as_f64().map(|f| f.is_finite()).unwrap_or(false))
}

/// Attempts to coerce `value_str` to the same shape as `left`: numeric if
/// `left` is a (non-bool) number, boolean if `left` is a bool. Returns
/// `None` when coercion is not applicable or fails.
fn coerce_to(left: &Value, value_str: &str) -> Option<Value> {
    match left {
        Value::Number(_) => {
            if let Ok(i) = value_str.parse::<i64>() {
                Some(Value::Number(i.into()))
            } else {
                value_str
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
            }
        }
        Value::Bool(_) => match value_str.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn same_variant(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn is_null_like(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower == "null" || lower == "none" || s.is_empty()
}

/// Evaluates a structured condition. Any internal error is caught and
/// produces `false`, per the spec's error-handling rule for this component.
pub fn evaluate(data: &ConditionData, ctx: &Context) -> bool {
    let left = ctx.get(&data.variable).cloned().unwrap_or(Value::Null);
    let value_str = data.value_str();

    match data.operator.as_str() {
        "exists" => !left.is_null(),
        "not_exists" => left.is_null(),
        "is_number" => is_finite_number(&left),
        "is_text" => left.is_string(),
        "is_boolean" => left.is_boolean(),
        "is_array" => left.is_array(),
        "is_true" => left == Value::Bool(true),
        "is_false" => left == Value::Bool(false),

        "equals" | "not_equals" => {
            let coerced = coerce_to(&left, &value_str);
            let eq = if let Some(ref c) = coerced {
                if same_variant(&left, c) {
                    left == *c
                } else {
                    scalar_eq_fallback(&left, &value_str)
                }
            } else if let Some(ls) = scalar_string(&left) {
                if left.is_null() {
                    is_null_like(&value_str)
                } else {
                    ls == value_str
                }
            } else {
                false
            };
            if data.operator == "equals" {
                eq
            } else {
                !eq
            }
        }

        "greater_than" | "less_than" | "greater_equals" | "less_equals" => {
            match (left.as_f64(), value_str.parse::<f64>().ok()) {
                (Some(l), Some(r)) if left.is_number() => match data.operator.as_str() {
                    "greater_than" => l > r,
                    "less_than" => l < r,
                    "greater_equals" => l >= r,
                    _ => l <= r,
                },
                _ => false,
            }
        }

        "contains" => match &left {
            Value::String(s) => s.contains(&value_str),
            Value::Array(items) => items.iter().any(|item| {
                scalar_string(item).map(|s| s == value_str).unwrap_or(false)
                    || coerce_to(item, &value_str)
                        .map(|c| *item == c)
                        .unwrap_or(false)
            }),
            Value::Object(map) => map.contains_key(&value_str),
            _ => false,
        },

        "starts_with" => matches!(&left, Value::String(s) if s.starts_with(&value_str)),
        "ends_with" => matches!(&left, Value::String(s) if s.ends_with(&value_str)),

        "matches_regex" => match &left {
            Value::String(s) if !value_str.is_empty() => match Regex::new(&value_str) {
                Ok(re) => re.is_match(s),
                Err(e) => {
                    tracing::error!(pattern = %value_str, error = %e, "invalid regex in condition");
                    false
                }
            },
            _ => false,
        },

        other => {
            tracing::warn!(operator = other, "unknown condition operator, defaulting to false");
            false
        }
    }
}

fn scalar_eq_fallback(left: &Value, value_str: &str) -> bool {
    match scalar_string(left) {
        Some(ls) if !left.is_null() => ls == value_str,
        _ if left.is_null() => is_null_like(value_str),
        _ => false,
    }
}

fn legacy_expr_re() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^\s*(.*?)\s*(?:(===|==|!==|!=|>=|<=|>|<)\s*(.*?))?\s*$")
            .expect("valid regex")
    })
}

/// A loosely-typed scalar used only by the legacy condition string parser.
#[derive(Debug, Clone, PartialEq)]
enum LegacyScalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

fn interpret_legacy_operand(raw: &str) -> LegacyScalar {
    let s = raw.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return LegacyScalar::Text(s[1..s.len() - 1].to_string());
    }
    match s.to_ascii_lowercase().as_str() {
        "true" => return LegacyScalar::Bool(true),
        "false" => return LegacyScalar::Bool(false),
        "null" | "none" | "undefined" => return LegacyScalar::Null,
        _ => {}
    }
    if let Ok(n) = s.parse::<f64>() {
        return LegacyScalar::Number(n);
    }
    LegacyScalar::Text(s.to_string())
}

fn legacy_truthy(raw: &str) -> bool {
    let s = raw.trim().to_ascii_lowercase();
    if matches!(s.as_str(), "false" | "null" | "none" | "" | "undefined" | "0") {
        return false;
    }
    match s.parse::<f64>() {
        Ok(n) => n != 0.0,
        Err(_) => true,
    }
}

/// Evaluates the deprecated string-form condition: interpolates `{{path}}`
/// references, then parses `left OP right` (or bare truthiness when no
/// operator is present). Kept only for documents still using the legacy
/// shape; structured `conditionData` is preferred and takes priority
/// wherever both are present.
pub fn evaluate_legacy(condition_str: &str, ctx: &Context) -> bool {
    let substituted = crate::interpolate::interpolate(&Value::String(condition_str.to_string()), ctx);
    let substituted = match substituted {
        Value::String(s) => s,
        _ => {
            tracing::error!(condition = condition_str, "legacy condition substitution produced a non-string value");
            return false;
        }
    };

    let caps = match legacy_expr_re().captures(&substituted) {
        Some(c) => c,
        None => {
            tracing::error!(condition = %substituted, "could not parse legacy condition structure");
            return false;
        }
    };

    let left_str = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let op = caps.get(2).map(|m| m.as_str());
    let right_str = caps.get(3).map(|m| m.as_str());

    let op = match op {
        Some(op) => op,
        None => return legacy_truthy(left_str),
    };
    let right_str = right_str.unwrap_or("");

    let left = interpret_legacy_operand(left_str);
    let right = interpret_legacy_operand(right_str);

    match op {
        "===" => std::mem::discriminant(&left) == std::mem::discriminant(&right) && left == right,
        "==" => legacy_loose_eq(&left, &right),
        "!==" => !(std::mem::discriminant(&left) == std::mem::discriminant(&right) && left == right),
        "!=" => !legacy_loose_eq(&left, &right),
        ">" | "<" | ">=" | "<=" => match (&left, &right) {
            (LegacyScalar::Number(l), LegacyScalar::Number(r)) => match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                _ => l <= r,
            },
            (LegacyScalar::Text(l), LegacyScalar::Text(r)) => match op {
                ">" => l > r,
                "<" => l < r,
                ">=" => l >= r,
                _ => l <= r,
            },
            _ => {
                tracing::warn!(op, "incompatible types for legacy comparison, defaulting to false");
                false
            }
        },
        other => {
            tracing::warn!(operator = other, "unknown legacy condition operator, defaulting to false");
            false
        }
    }
}

fn legacy_loose_eq(left: &LegacyScalar, right: &LegacyScalar) -> bool {
    match (left, right) {
        (LegacyScalar::Number(l), LegacyScalar::Number(r)) => l == r,
        (LegacyScalar::Text(l), LegacyScalar::Text(r)) => l == r,
        (LegacyScalar::Bool(l), LegacyScalar::Bool(r)) => l == r,
        (LegacyScalar::Null, LegacyScalar::Null) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(var: &str, op: &str, value: Value) -> ConditionData {
        ConditionData {
            variable: var.to_string(),
            operator: op.to_string(),
            value,
        }
    }

    fn ctx_with(path: &str, value: Value) -> Context {
        let mut ctx = Context::new();
        ctx.set(path, value);
        ctx
    }

    #[test]
    fn exists_and_not_exists() {
        let ctx = ctx_with("x", json!(1));
        assert!(evaluate(&cond("x", "exists", Value::Null), &ctx));
        assert!(!evaluate(&cond("missing", "exists", Value::Null), &ctx));
        assert!(evaluate(&cond("missing", "not_exists", Value::Null), &ctx));
    }

    #[test]
    fn is_number_excludes_bool_and_nonfinite() {
        let ctx = ctx_with("n", json!(3.5));
        assert!(evaluate(&cond("n", "is_number", Value::Null), &ctx));
        let ctx_bool = ctx_with("b", json!(true));
        assert!(!evaluate(&cond("b", "is_number", Value::Null), &ctx_bool));
    }

    #[test]
    fn equals_numeric_coercion() {
        let ctx = ctx_with("status", json!(200));
        assert!(evaluate(&cond("status", "equals", json!("200")), &ctx));
        assert!(!evaluate(&cond("status", "equals", json!("201")), &ctx));
    }

    #[test]
    fn equals_null_matches_common_representations() {
        let ctx = ctx_with("x", Value::Null);
        assert!(evaluate(&cond("x", "equals", json!("null")), &ctx));
        assert!(evaluate(&cond("x", "equals", json!("")), &ctx));
        assert!(evaluate(&cond("x", "equals", json!("NONE")), &ctx));
    }

    #[test]
    fn numeric_comparisons_require_coercion() {
        let ctx = ctx_with("n", json!(5));
        assert!(evaluate(&cond("n", "greater_than", json!("3")), &ctx));
        assert!(!evaluate(&cond("n", "greater_than", json!("abc")), &ctx));
    }

    #[test]
    fn contains_on_array_and_map() {
        let ctx = ctx_with("items", json!(["a", "b"]));
        assert!(evaluate(&cond("items", "contains", json!("b")), &ctx));

        let ctx_map = ctx_with("obj", json!({"k": 1}));
        assert!(evaluate(&cond("obj", "contains", json!("k")), &ctx_map));
    }

    #[test]
    fn matches_regex_invalid_pattern_is_false() {
        let ctx = ctx_with("s", json!("abc"));
        assert!(!evaluate(&cond("s", "matches_regex", json!("(")), &ctx));
    }

    #[test]
    fn unknown_operator_is_false() {
        let ctx = ctx_with("s", json!("abc"));
        assert!(!evaluate(&cond("s", "frobnicate", json!("x")), &ctx));
    }

    #[test]
    fn legacy_truthiness_and_comparison() {
        let ctx = ctx_with("n", json!(5));
        assert!(evaluate_legacy("{{n}} > 3", &ctx));
        assert!(!evaluate_legacy("{{n}} < 3", &ctx));
        assert!(evaluate_legacy("nonempty", &ctx));
        assert!(!evaluate_legacy("false", &ctx));
        assert!(!evaluate_legacy("0", &ctx));
    }

    #[test]
    fn legacy_string_equality() {
        let ctx = ctx_with("name", json!("alice"));
        assert!(evaluate_legacy("\"{{name}}\" == \"alice\"", &ctx));
        assert!(!evaluate_legacy("\"{{name}}\" == \"bob\"", &ctx));
    }
}
