//! The flow data model: a tagged tree of request/condition/loop steps, and
//! its validator.

use crate::condition::ConditionData;
use crate::error::{Error, Result};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A step id. The flow document accepts either a numeric or string id; both
/// are normalized to their string form internally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct StepId(pub String);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for StepId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;
        impl<'de> Visitor<'de> for IdVisitor {
            type Value = StepId;
            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or number step id")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<StepId, E> {
                Ok(StepId(v.to_string()))
            }
            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<StepId, E> {
                Ok(StepId(v))
            }
            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<StepId, E> {
                Ok(StepId(v.to_string()))
            }
            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<StepId, E> {
                Ok(StepId(v.to_string()))
            }
            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<StepId, E> {
                Ok(StepId(v.to_string()))
            }
        }
        deserializer.deserialize_any(IdVisitor)
    }
}

/// Allowed HTTP methods, normalized to upper case at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "HEAD" => Ok(Method::Head),
            "PATCH" => Ok(Method::Patch),
            "OPTIONS" => Ok(Method::Options),
            other => Err(de::Error::custom(format!("unknown HTTP method: {other}"))),
        }
    }
}

/// Per-request failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    Stop,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    pub method: Method,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub extract: HashMap<String, String>,
    #[serde(rename = "onFailure")]
    pub on_failure: OnFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, rename = "conditionData")]
    pub condition_data: Option<ConditionData>,
    #[serde(default)]
    pub then: Vec<Step>,
    #[serde(default, alias = "otherwise")]
    pub r#else: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub id: StepId,
    #[serde(default)]
    pub name: Option<String>,
    pub source: String,
    #[serde(rename = "loopVariable")]
    pub loop_variable: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Step {
    Request(RequestStep),
    Condition(ConditionStep),
    Loop(LoopStep),
}

impl Step {
    pub fn id(&self) -> &StepId {
        match self {
            Step::Request(s) => &s.id,
            Step::Condition(s) => &s.id,
            Step::Loop(s) => &s.id,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Step::Request(s) => s.name.as_deref(),
            Step::Condition(s) => s.name.as_deref(),
            Step::Loop(s) => s.loop_variable.as_str().into(),
        }
    }

    /// A short label for log messages: `'name' (id)` or `(id)`.
    pub fn label(&self) -> String {
        let id = self.id();
        match self {
            Step::Request(s) => match &s.name {
                Some(n) => format!("'{n}' ({id})"),
                None => format!("({id})"),
            },
            Step::Condition(s) => match &s.name {
                Some(n) => format!("'{n}' ({id})"),
                None => format!("({id})"),
            },
            Step::Loop(s) => match &s.name {
                Some(n) => format!("'{n}' ({id})"),
                None => format!("({id})"),
            },
        }
    }
}

/// `FlowMap`: the flow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMap {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub steps: Vec<Step>,
    #[serde(default, rename = "staticVars")]
    pub static_vars: serde_json::Map<String, Value>,
}

/// Walks the whole tree and checks every invariant validation cares about:
/// unique ids, valid condition data shape, non-empty method (enforced at
/// parse time already). Malformed *raw* branches arriving at runtime (e.g.
/// from a dynamically-constructed loop body) go through the same checks via
/// [`validate_steps`] before execution, mirroring the spec's lazy
/// re-validation of inner branches.
pub fn validate_flow(flow: &FlowMap) -> Result<()> {
    if flow.name.is_empty() {
        return Err(Error::Validation("flow name must not be empty".into()));
    }
    let mut seen = HashSet::new();
    validate_steps(&flow.steps, &mut seen)
}

pub fn validate_steps(steps: &[Step], seen: &mut HashSet<StepId>) -> Result<()> {
    for step in steps {
        if !seen.insert(step.id().clone()) {
            return Err(Error::Validation(format!(
                "duplicate step id: {}",
                step.id()
            )));
        }
        match step {
            Step::Request(_) => {}
            Step::Condition(c) => {
                let has_structured = c
                    .condition_data
                    .as_ref()
                    .map(ConditionData::is_usable)
                    .unwrap_or(false);
                let has_legacy = c.condition.as_deref().is_some_and(|s| !s.is_empty());
                if !has_structured && !has_legacy {
                    return Err(Error::Validation(format!(
                        "condition step {} has neither usable conditionData nor a legacy condition string",
                        c.id
                    )));
                }
                validate_steps(&c.then, seen)?;
                validate_steps(&c.r#else, seen)?;
            }
            Step::Loop(l) => {
                if l.source.is_empty() {
                    return Err(Error::Validation(format!(
                        "loop step {} has an empty source path",
                        l.id
                    )));
                }
                validate_steps(&l.steps, seen)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_request_step() {
        let json = serde_json::json!({
            "name": "smoke",
            "steps": [{
                "type": "request",
                "id": 1,
                "method": "get",
                "url": "/ping",
                "onFailure": "continue"
            }]
        });
        let flow: FlowMap = serde_json::from_value(json).unwrap();
        assert!(validate_flow(&flow).is_ok());
        match &flow.steps[0] {
            Step::Request(r) => {
                assert_eq!(r.method.as_str(), "GET");
                assert_eq!(r.id.0, "1");
            }
            _ => panic!("expected request step"),
        }
    }

    #[test]
    fn missing_on_failure_fails_to_parse() {
        let json = serde_json::json!({
            "name": "bad",
            "steps": [{
                "type": "request",
                "id": "a",
                "method": "GET",
                "url": "/ping"
            }]
        });
        assert!(serde_json::from_value::<FlowMap>(json).is_err());
    }

    #[test]
    fn duplicate_ids_tree_wide_rejected() {
        let json = serde_json::json!({
            "name": "dup",
            "steps": [
                {"type": "request", "id": "a", "method": "GET", "url": "/x", "onFailure": "continue"},
                {"type": "condition", "id": "b", "then": [
                    {"type": "request", "id": "a", "method": "GET", "url": "/y", "onFailure": "continue"}
                ], "conditionData": {"variable": "x", "operator": "exists"}}
            ]
        });
        let flow: FlowMap = serde_json::from_value(json).unwrap();
        assert!(validate_flow(&flow).is_err());
    }

    #[test]
    fn condition_step_requires_structured_or_legacy() {
        let json = serde_json::json!({
            "name": "cond",
            "steps": [
                {"type": "condition", "id": "c1"}
            ]
        });
        let flow: FlowMap = serde_json::from_value(json).unwrap();
        assert!(validate_flow(&flow).is_err());
    }

    #[test]
    fn else_alias_accepted() {
        let json = serde_json::json!({
            "name": "cond",
            "steps": [
                {"type": "condition", "id": "c1", "conditionData": {"variable": "x", "operator": "exists"},
                 "else": [{"type": "request", "id": "r1", "method": "GET", "url": "/e", "onFailure": "continue"}]}
            ]
        });
        let flow: FlowMap = serde_json::from_value(json).unwrap();
        assert!(validate_flow(&flow).is_ok());
    }
}
