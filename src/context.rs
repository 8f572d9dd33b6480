//! Execution context: a heterogeneous per-iteration key/value store, and the
//! dotted/bracketed path grammar used to read and write it.

use serde_json::{Map, Value};
use std::collections::HashMap;

/// A path segment: either a map key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parses a path expression into segments per the grammar: a leading bare
/// word, followed by any number of `.word` or `[digits]` segments. Returns
/// `None` for an empty or malformed path.
fn parse_path(path: &str) -> Option<Vec<Segment>> {
    if path.is_empty() {
        return None;
    }

    let chars: Vec<char> = path.chars().collect();
    let n = chars.len();
    let mut i = 0;
    let mut segments = Vec::new();
    let mut first = true;

    while i < n {
        match chars[i] {
            '.' => {
                i += 1;
                let start = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return None;
                }
                segments.push(Segment::Key(chars[start..i].iter().collect()));
            }
            '[' => {
                i += 1;
                let start = i;
                while i < n && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i == start || i >= n || chars[i] != ']' {
                    return None;
                }
                let idx: usize = chars[start..i].iter().collect::<String>().parse().ok()?;
                segments.push(Segment::Index(idx));
                i += 1;
            }
            _ if first => {
                let start = i;
                while i < n && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                if i == start {
                    return None;
                }
                segments.push(Segment::Key(chars[start..i].iter().collect()));
            }
            _ => return None,
        }
        first = false;
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// Reads `path` from `root`. Returns `None` (MISSING) when the path is
/// malformed, traverses through a non-container, or names an absent
/// key/index. Distinguish this from `Some(&Value::Null)`.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    let mut current = root;
    for segment in &segments {
        current = match segment {
            Segment::Key(k) => current.as_object()?.get(k)?,
            Segment::Index(i) => current.as_array()?.get(*i)?,
        };
    }
    Some(current)
}

/// Writes `value` at `path` in `root`. Creates intermediate maps on demand;
/// never creates or extends arrays. Failures (malformed path, traversal
/// through a non-container, out-of-bounds array index) are logged and
/// silently ignored, matching the spec's "fails silently with a log" rule.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let segments = match parse_path(path) {
        Some(s) => s,
        None => {
            tracing::warn!(path, "set_path: malformed or empty path");
            return;
        }
    };
    if !set_segments(root, &segments, value) {
        tracing::warn!(path, "set_path: failed to write value");
    }
}

fn set_segments(current: &mut Value, segments: &[Segment], value: Value) -> bool {
    if segments.len() == 1 {
        return match &segments[0] {
            Segment::Key(k) => match current {
                Value::Object(map) => {
                    map.insert(k.clone(), value);
                    true
                }
                _ => false,
            },
            Segment::Index(i) => match current {
                Value::Array(arr) => match arr.get_mut(*i) {
                    Some(slot) => {
                        *slot = value;
                        true
                    }
                    None => false,
                },
                _ => false,
            },
        };
    }

    match &segments[0] {
        Segment::Key(k) => {
            let map = match current {
                Value::Object(map) => map,
                _ => return false,
            };
            if !map.contains_key(k) {
                match &segments[1] {
                    Segment::Key(_) => {
                        map.insert(k.clone(), Value::Object(Map::new()));
                    }
                    Segment::Index(_) => return false,
                }
            }
            let entry = map.get_mut(k).expect("just inserted or present");
            match entry {
                Value::Object(_) | Value::Array(_) => set_segments(entry, &segments[1..], value),
                _ => false,
            }
        }
        Segment::Index(i) => {
            let arr = match current {
                Value::Array(arr) => arr,
                _ => return false,
            };
            match arr.get_mut(*i) {
                Some(entry @ Value::Object(_)) | Some(entry @ Value::Array(_)) => {
                    set_segments(entry, &segments[1..], value)
                }
                Some(_) => false,
                None => false,
            }
        }
    }
}

/// Reserved context keys written by the engine itself.
pub mod reserved {
    pub const USER_ID: &str = "userId";
    pub const USER_FAKE_IP: &str = "userFakeIp";
    pub const FLOW_INSTANCE: &str = "flowInstance";
    pub const FLOW_START_TIME_EPOCH: &str = "flowStartTimeEpoch";
    pub const FLOW_ERROR: &str = "flow_error";
}

/// The per-iteration execution context. Always backed by a JSON object, plus
/// the session-scoped HTTP headers (user-agent, accept-language, fake source
/// IP) stamped once per flow iteration — kept out of the JSON store since
/// they are never a variable-interpolation target.
#[derive(Debug, Clone)]
pub struct Context {
    data: Value,
    session_headers: HashMap<String, String>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// An empty context.
    pub fn new() -> Self {
        Context {
            data: Value::Object(Map::new()),
            session_headers: HashMap::new(),
        }
    }

    /// `get(ctx, path)` — `None` means MISSING.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.data, path)
    }

    /// `set(ctx, path, value)`.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        set_path(&mut self.data, path, value.into());
    }

    fn map_mut(&mut self) -> &mut Map<String, Value> {
        match &mut self.data {
            Value::Object(m) => m,
            _ => unreachable!("Context root is always an object"),
        }
    }

    /// Replaces the session-scoped base headers (spec §4.5 step 4, layer 1
    /// of 3: user-session base, overridden by the flow's global headers, in
    /// turn overridden by the step's own headers).
    pub fn set_session_headers(&mut self, headers: HashMap<String, String>) {
        self.session_headers = headers;
    }

    /// The current session-scoped base headers.
    pub fn session_headers(&self) -> &HashMap<String, String> {
        &self.session_headers
    }

    /// Inserts a reserved top-level key directly, bypassing path parsing.
    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.map_mut().insert(key.to_string(), value.into());
    }

    /// Merges `other` into the top-level context (used to seed `staticVars`).
    pub fn extend_top_level(&mut self, other: Map<String, Value>) {
        self.map_mut().extend(other);
    }

    /// `flow_error` in the context, if any and non-null.
    pub fn flow_error(&self) -> Option<&Value> {
        match self.get(reserved::FLOW_ERROR) {
            Some(Value::Null) | None => None,
            some => some,
        }
    }

    /// Sets `flow_error` only if it is currently unset, mirroring the
    /// original's "don't clobber an existing flow_error" behavior.
    pub fn set_flow_error_if_absent(&mut self, message: impl Into<String>) {
        if self.flow_error().is_none() {
            self.set(reserved::FLOW_ERROR, Value::String(message.into()));
        }
    }

    /// A deep copy, used to isolate loop iteration contexts from siblings.
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    /// Access the underlying JSON value (e.g. for logging).
    pub fn as_value(&self) -> &Value {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn get_missing_is_none_and_does_not_mutate() {
        let ctx = Context::new();
        assert!(ctx.get("nope").is_none());
        assert!(ctx.get("a.b[0]").is_none());
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut ctx = Context::new();
        ctx.set("user.name", json!("alice"));
        assert_eq!(ctx.get("user.name"), Some(&json!("alice")));
    }

    #[test]
    fn set_creates_intermediate_maps_but_not_arrays() {
        let mut ctx = Context::new();
        ctx.set("a.b.c", json!(1));
        assert_eq!(ctx.get("a.b.c"), Some(&json!(1)));

        ctx.set("items[0].name", json!("x"));
        // items does not exist as an array yet, so this must fail silently
        assert!(ctx.get("items[0].name").is_none());
    }

    #[test]
    fn set_existing_array_index_works() {
        let mut ctx = Context::new();
        ctx.set("items", json!(["a", "b"]));
        ctx.set("items[1]", json!("z"));
        assert_eq!(ctx.get("items[1]"), Some(&json!("z")));
        // out of bounds is a silent no-op
        ctx.set("items[5]", json!("nope"));
        assert_eq!(ctx.get("items[5]"), None);
    }

    #[test]
    fn null_is_distinct_from_missing() {
        let mut ctx = Context::new();
        ctx.set("x", Value::Null);
        assert_eq!(ctx.get("x"), Some(&Value::Null));
        assert_eq!(ctx.get("y"), None);
    }

    #[test]
    fn traversal_through_non_map_is_missing() {
        let mut ctx = Context::new();
        ctx.set("n", json!(5));
        assert!(ctx.get("n.child").is_none());
    }

    proptest::proptest! {
        #[test]
        fn prop_set_get_roundtrip(key in "[a-zA-Z_][a-zA-Z0-9_]{0,10}", n in 0i64..1000) {
            let mut ctx = Context::new();
            ctx.set(&key, json!(n));
            prop_assert_eq!(ctx.get(&key), Some(&json!(n)));
        }
    }
}
