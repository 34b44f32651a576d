use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use refinery_core::error::{RefineryError, Result};

/// Cleared when a step gives up (retry budget spent, node failure).
pub const SHOULD_CONTINUE: &str = "should_continue";
/// Name of the step that last gave up.
pub const FAILED_STEP: &str = "failed_step";

/// How a field combines an incoming value with the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The incoming value replaces the current one.
    Overwrite,
    /// Map union; on a shared key the incoming entry wins.
    DictUnion,
    /// Incoming elements are appended in order.
    ListAppend,
}

impl MergePolicy {
    /// Merge `incoming` into `current`. Total for any pair of JSON values.
    pub fn merge(self, field: &str, current: Option<Value>, incoming: Value) -> Value {
        match self {
            MergePolicy::Overwrite => incoming,
            MergePolicy::DictUnion => {
                let Value::Object(entries) = incoming else {
                    warn!(field, "Dropping non-object write to a dict-union field");
                    return current.unwrap_or_else(|| Value::Object(Default::default()));
                };
                let mut map = match current {
                    Some(Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                map.extend(entries);
                Value::Object(map)
            }
            MergePolicy::ListAppend => {
                let mut list = match current {
                    Some(Value::Array(list)) => list,
                    _ => Vec::new(),
                };
                match incoming {
                    Value::Array(items) => list.extend(items),
                    single => list.push(single),
                }
                Value::Array(list)
            }
        }
    }

    /// Combine two pending writes so that applying the result once equals
    /// applying `earlier` then `later`.
    fn compose(self, earlier: Value, later: Value) -> Value {
        match self {
            MergePolicy::Overwrite => later,
            MergePolicy::DictUnion => match (earlier, later) {
                (Value::Object(mut a), Value::Object(b)) => {
                    a.extend(b);
                    Value::Object(a)
                }
                // A non-object write is dropped on apply, so it contributes nothing.
                (_, Value::Object(b)) => Value::Object(b),
                (a, _) => a,
            },
            MergePolicy::ListAppend => {
                let mut list = match earlier {
                    Value::Array(items) => items,
                    single => vec![single],
                };
                match later {
                    Value::Array(items) => list.extend(items),
                    single => list.push(single),
                }
                Value::Array(list)
            }
        }
    }
}

/// One declared state field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub policy: MergePolicy,
    #[serde(default)]
    pub description: String,
}

/// The declared fields of a workflow state. Fixed once a graph is compiled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSchema {
    fields: Vec<FieldSpec>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        policy: MergePolicy,
        description: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            policy,
            description: description.into(),
        });
        self
    }

    /// Declare `should_continue` and `failed_step`.
    pub fn with_halt_fields(self) -> Self {
        self.field(
            SHOULD_CONTINUE,
            MergePolicy::Overwrite,
            "False once a step has exhausted its budget.",
        )
        .field(
            FAILED_STEP,
            MergePolicy::Overwrite,
            "Name of the step that gave up.",
        )
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn policy(&self, name: &str) -> Option<MergePolicy> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.policy)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policy(name).is_some()
    }

    /// Reject duplicate declarations.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for f in &self.fields {
            if !seen.insert(f.name.as_str()) {
                return Err(RefineryError::Graph(format!(
                    "state field '{}' declared twice",
                    f.name
                )));
            }
        }
        Ok(())
    }
}

/// A node's update: field name to incoming value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partial(BTreeMap<String, Value>);

impl Partial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// `{key: value}` for a dict-union field.
    pub fn entry(
        self,
        field: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        let mut map = serde_json::Map::new();
        map.insert(key.into(), value.into());
        self.set(field, Value::Object(map))
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Mark the run as stopped at `step`, for whichever halt fields `schema` declares.
    pub fn halt(mut self, schema: &StateSchema, step: &str) -> Self {
        if schema.contains(SHOULD_CONTINUE) {
            self.insert(SHOULD_CONTINUE, false);
        }
        if schema.contains(FAILED_STEP) {
            self.insert(FAILED_STEP, step);
        }
        self
    }

    /// Failure update for `step`: an error description on `field`, shaped for
    /// its merge policy, plus the halt fields.
    pub fn failure(schema: &StateSchema, step: &str, field: &str, message: &str) -> Self {
        let partial = match schema.policy(field) {
            Some(MergePolicy::DictUnion) => Partial::new().entry(field, step, message),
            Some(MergePolicy::ListAppend) => Partial::new().set(field, vec![message]),
            _ => Partial::new().set(field, message),
        };
        partial.halt(schema, step)
    }

    /// Fold a later update into this one.
    ///
    /// Afterwards, applying `self` once has the same effect as applying the
    /// old `self` and then `later`. Fields unknown to `schema` are taken as
    /// overwrites.
    pub fn absorb(&mut self, schema: &StateSchema, later: Partial) {
        for (field, incoming) in later.0 {
            let policy = schema.policy(&field).unwrap_or(MergePolicy::Overwrite);
            let combined = match self.0.remove(&field) {
                Some(earlier) => policy.compose(earlier, incoming),
                None => incoming,
            };
            self.0.insert(field, combined);
        }
    }
}

impl IntoIterator for Partial {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Lifecycle of a state within one graph run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    /// The run reached END; invoking again is a no-op.
    Done,
}

#[derive(Deserialize)]
struct Snapshot {
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    status: RunStatus,
}

/// Shared state threaded through a graph run.
///
/// Only the executor mutates it, by applying node updates one at a time.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    #[serde(skip)]
    schema: Arc<StateSchema>,
    values: BTreeMap<String, Value>,
    status: RunStatus,
}

impl PartialEq for WorkflowState {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.status == other.status
    }
}

impl WorkflowState {
    pub fn new(schema: Arc<StateSchema>) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
            status: RunStatus::Pending,
        }
    }

    /// Start from caller-supplied input fields.
    pub fn with_input(schema: Arc<StateSchema>, input: Partial) -> Self {
        let mut state = Self::new(schema);
        state.apply(input);
        state
    }

    /// Rebuild a state from its serialized form.
    pub fn restore(schema: Arc<StateSchema>, snapshot: Value) -> Result<Self> {
        let snap: Snapshot = serde_json::from_value(snapshot)?;
        let mut values = snap.values;
        values.retain(|k, _| schema.contains(k));
        Ok(Self {
            schema,
            values,
            status: snap.status,
        })
    }

    pub fn schema(&self) -> &Arc<StateSchema> {
        &self.schema
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }

    pub(crate) fn mark_done(&mut self) {
        self.status = RunStatus::Done;
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    /// Entry `key` of a map-valued field.
    pub fn entry(&self, field: &str, key: &str) -> Option<&Value> {
        self.get(field).and_then(|v| v.get(key))
    }

    pub fn entry_str(&self, field: &str, key: &str) -> Option<&str> {
        self.entry(field, key).and_then(Value::as_str)
    }

    /// Deserialize a field into `T`; `None` when absent or mis-shaped.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Option<T> {
        self.get(field)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn entry_as<T: DeserializeOwned>(&self, field: &str, key: &str) -> Option<T> {
        self.entry(field, key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Merge `partial` field by field according to each field's policy.
    pub fn apply(&mut self, partial: Partial) {
        for (field, incoming) in partial {
            let Some(policy) = self.schema.policy(&field) else {
                warn!(field = %field, "Dropping write to undeclared state field");
                continue;
            };
            let current = self.values.remove(&field);
            let merged = policy.merge(&field, current, incoming);
            self.values.insert(field, merged);
        }
    }

    /// Copy of the fields `schema` declares, as a fresh pending state.
    pub fn project(&self, schema: Arc<StateSchema>) -> Self {
        let values = self
            .values
            .iter()
            .filter(|(k, _)| schema.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            schema,
            values,
            status: RunStatus::Pending,
        }
    }

    /// Serialized form: `{"values": {...}, "status": "pending" | "done"}`.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Arc<StateSchema> {
        Arc::new(
            StateSchema::new()
                .field("title", MergePolicy::Overwrite, "")
                .field("analyses", MergePolicy::DictUnion, "")
                .field("log", MergePolicy::ListAppend, "")
                .with_halt_fields(),
        )
    }

    #[test]
    fn test_overwrite_replaces() {
        let mut s = WorkflowState::new(schema());
        s.apply(Partial::new().set("title", "a"));
        s.apply(Partial::new().set("title", "b"));
        assert_eq!(s.get_str("title"), Some("b"));
    }

    #[test]
    fn test_dict_union_disjoint_keys_commute() {
        let x = Partial::new().entry("analyses", "x", "vx");
        let y = Partial::new().entry("analyses", "y", "vy");

        let mut xy = WorkflowState::new(schema());
        xy.apply(x.clone());
        xy.apply(y.clone());
        let mut yx = WorkflowState::new(schema());
        yx.apply(y);
        yx.apply(x);

        assert_eq!(xy, yx);
        assert_eq!(xy.get("analyses"), Some(&json!({"x": "vx", "y": "vy"})));
    }

    #[test]
    fn test_dict_union_last_write_wins() {
        let mut s = WorkflowState::new(schema());
        s.apply(Partial::new().set("analyses", json!({"k": 1, "a": 0})));
        s.apply(Partial::new().set("analyses", json!({"k": 2})));
        assert_eq!(s.get("analyses"), Some(&json!({"k": 2, "a": 0})));
    }

    #[test]
    fn test_list_append_preserves_order() {
        let mut s = WorkflowState::new(schema());
        s.apply(Partial::new().set("log", json!(["a", "b"])));
        s.apply(Partial::new().set("log", "c"));
        assert_eq!(s.get("log"), Some(&json!(["a", "b", "c"])));
    }

    #[test]
    fn test_merge_is_total_for_off_shape_values() {
        let mut s = WorkflowState::new(schema());
        s.apply(Partial::new().set("analyses", "not a map"));
        assert_eq!(s.get("analyses"), Some(&json!({})));

        s.apply(Partial::new().entry("analyses", "k", 1));
        s.apply(Partial::new().set("analyses", 7));
        assert_eq!(s.get("analyses"), Some(&json!({"k": 1})));

        s.apply(Partial::new().set("log", json!({"odd": true})));
        assert_eq!(s.get("log"), Some(&json!([{"odd": true}])));
    }

    #[test]
    fn test_undeclared_field_is_dropped() {
        let mut s = WorkflowState::new(schema());
        s.apply(Partial::new().set("mystery", 1).set("title", "t"));
        assert!(s.get("mystery").is_none());
        assert_eq!(s.get_str("title"), Some("t"));
    }

    #[test]
    fn test_absorb_matches_sequential_apply() {
        let schema = schema();
        let base = WorkflowState::with_input(
            schema.clone(),
            Partial::new()
                .set("title", "t0")
                .set("analyses", json!({"a": 0}))
                .set("log", json!(["start"])),
        );
        let first = Partial::new()
            .set("title", "t1")
            .entry("analyses", "a", 1)
            .set("log", "one");
        let second = Partial::new()
            .set("log", json!(["two", "three"]))
            .set("analyses", 5);

        let mut sequential = base.clone();
        sequential.apply(first.clone());
        sequential.apply(second.clone());

        let mut composed = first;
        composed.absorb(&schema, second);
        let mut once = base;
        once.apply(composed);

        assert_eq!(sequential, once);
    }

    #[test]
    fn test_failure_partial_shapes_by_policy() {
        let schema = schema();
        let p = Partial::failure(&schema, "expert", "analyses", "Error: boom");
        assert_eq!(p.get("analyses"), Some(&json!({"expert": "Error: boom"})));
        assert_eq!(p.get(SHOULD_CONTINUE), Some(&json!(false)));
        assert_eq!(p.get(FAILED_STEP), Some(&json!("expert")));

        let p = Partial::failure(&schema, "writer", "title", "Error");
        assert_eq!(p.get("title"), Some(&json!("Error")));
    }

    #[test]
    fn test_state_serializes_and_restores() {
        let schema = schema();
        let mut s = WorkflowState::with_input(schema.clone(), Partial::new().set("title", "x"));
        s.mark_done();
        let json = s.to_json();
        assert_eq!(json["status"], json!("done"));
        assert_eq!(json["values"]["title"], json!("x"));

        let back = WorkflowState::restore(schema, json).unwrap();
        assert_eq!(back, s);
        assert!(back.is_done());
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let schema = StateSchema::new()
            .field("a", MergePolicy::Overwrite, "")
            .field("a", MergePolicy::ListAppend, "");
        assert!(schema.validate().is_err());
    }
}
