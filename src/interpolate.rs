//! Variable interpolation: substitutes `{{path}}` and
//! `##VAR:string|unquoted:path##` tokens in strings, maps, and arrays.

use crate::context::Context;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn whole_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^##VAR:([A-Za-z]+):(.*)##$").expect("valid regex"))
}

fn brace_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").expect("valid regex"))
}

/// Renders a resolved value as its string form, per the interpolator's
/// stringification rule: missing/null become the empty string.
pub fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Interpolates a single string, returning a `Value` because a whole-string
/// `##VAR:unquoted:…##` token can resolve to any JSON type.
fn interpolate_string(s: &str, ctx: &Context) -> Value {
    if let Some(caps) = whole_token_re().captures(s) {
        let kind = &caps[1];
        let path = &caps[2];
        let resolved = ctx.get(path);
        return match kind {
            "string" => Value::String(stringify(resolved)),
            "unquoted" => resolved.cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }

    if brace_token_re().is_match(s) {
        let replaced = brace_token_re().replace_all(s, |caps: &regex::Captures<'_>| {
            stringify(ctx.get(caps[1].trim()))
        });
        return Value::String(replaced.into_owned());
    }

    Value::String(s.to_string())
}

/// Recursively interpolates strings, array elements, and map keys/values.
/// Non-string scalars (numbers, bools, null) pass through unchanged.
pub fn interpolate(value: &Value, ctx: &Context) -> Value {
    match value {
        Value::String(s) => interpolate_string(s, ctx),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate(v, ctx)).collect()),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let new_key = match interpolate_string(k, ctx) {
                    Value::String(s) => s,
                    _ => k.clone(),
                };
                out.insert(new_key, interpolate(v, ctx));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx_with(pairs: &[(&str, Value)]) -> Context {
        let mut ctx = Context::new();
        for (k, v) in pairs {
            ctx.set(k, v.clone());
        }
        ctx
    }

    #[test]
    fn brace_token_missing_yields_empty_string_never_literal() {
        let ctx = Context::new();
        assert_eq!(
            interpolate(&json!("hello {{nope}} world"), &ctx),
            json!("hello  world")
        );
    }

    #[test]
    fn brace_token_multiple_occurrences() {
        let ctx = ctx_with(&[("a", json!(1)), ("b", json!("x"))]);
        assert_eq!(
            interpolate(&json!("{{a}}-{{b}}-{{a}}"), &ctx),
            json!("1-x-1")
        );
    }

    #[test]
    fn var_string_whole_token() {
        let ctx = ctx_with(&[("token", json!(42))]);
        assert_eq!(
            interpolate(&json!("##VAR:string:token##"), &ctx),
            json!("42")
        );
        let ctx_missing = Context::new();
        assert_eq!(
            interpolate(&json!("##VAR:string:nope##"), &ctx_missing),
            json!("")
        );
    }

    #[test]
    fn var_unquoted_preserves_type_and_roundtrips_json() {
        let ctx = ctx_with(&[("n", json!(7)), ("flag", json!(true)), ("obj", json!({"a":1}))]);
        assert_eq!(interpolate(&json!("##VAR:unquoted:n##"), &ctx), json!(7));
        assert_eq!(
            interpolate(&json!("##VAR:unquoted:flag##"), &ctx),
            json!(true)
        );
        assert_eq!(
            interpolate(&json!("##VAR:unquoted:obj##"), &ctx),
            json!({"a":1})
        );
        let missing = Context::new();
        assert_eq!(
            interpolate(&json!("##VAR:unquoted:nope##"), &missing),
            Value::Null
        );
    }

    #[test]
    fn malformed_token_returns_original_literal() {
        let ctx = Context::new();
        assert_eq!(
            interpolate(&json!("##VAR:string:no-closing"), &ctx),
            json!("##VAR:string:no-closing")
        );
    }

    #[test]
    fn unknown_type_keyword_with_path_returns_null() {
        let ctx = ctx_with(&[("x", json!(1))]);
        assert_eq!(interpolate(&json!("##VAR:weird:x##"), &ctx), Value::Null);
    }

    #[test]
    fn map_keys_are_interpolated() {
        let ctx = ctx_with(&[("suffix", json!("id"))]);
        let input = json!({ "user_{{suffix}}": 1 });
        let out = interpolate(&input, &ctx);
        assert_eq!(out, json!({ "user_id": 1 }));
    }

    #[test]
    fn non_string_key_interpolation_falls_back_to_original_key() {
        let ctx = ctx_with(&[("n", json!(5))]);
        let input = json!({ "##VAR:unquoted:n##": 1 });
        let out = interpolate(&input, &ctx);
        assert_eq!(out, json!({ "##VAR:unquoted:n##": 1 }));
    }
}
