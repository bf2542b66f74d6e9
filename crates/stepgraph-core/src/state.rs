use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StepGraphError};
use crate::types::ChatMessage;

/// How a field absorbs a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldPolicy {
    /// A later write fully overwrites the field.
    Replace,
    /// Ordered sequence of objects keyed by their `id`; a write with a known
    /// id replaces that entry in place, anything else is appended.
    AppendById,
    /// Unordered collection; every write is appended.
    Accumulate,
}

/// Declared fields of a run state and their merge policies.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldPolicy>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field.
    pub fn field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.insert(name.into(), policy);
        self
    }

    pub fn replace(self, name: impl Into<String>) -> Self {
        self.field(name, FieldPolicy::Replace)
    }

    pub fn append_by_id(self, name: impl Into<String>) -> Self {
        self.field(name, FieldPolicy::AppendById)
    }

    pub fn accumulate(self, name: impl Into<String>) -> Self {
        self.field(name, FieldPolicy::Accumulate)
    }

    pub fn policy(&self, name: &str) -> Option<FieldPolicy> {
        self.fields.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, FieldPolicy)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A partial state update produced by a node.
///
/// Writes are applied in order through each field's merge policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    writes: Vec<(String, Value)>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a raw JSON value to a field.
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.writes.push((field.into(), value));
        self
    }

    /// Write any serializable value to a field.
    pub fn set_serialized<T: Serialize>(self, field: impl Into<String>, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(self.set(field, value))
    }

    /// Write chat messages to an append-by-id field.
    pub fn messages(self, field: impl Into<String>, messages: &[ChatMessage]) -> Result<Self> {
        self.set_serialized(field, &messages)
    }

    /// Build an update from a JSON object, one write per key.
    pub fn from_object(input: Value) -> Result<Self> {
        match input {
            Value::Object(map) => Ok(Self {
                writes: map.into_iter().collect(),
            }),
            Value::Null => Ok(Self::new()),
            other => Err(StepGraphError::FieldType {
                field: "<input>".into(),
                message: format!("expected an object, got {}", kind_of(&other)),
            }),
        }
    }

    /// Append all writes of another update after this one's.
    pub fn extend(&mut self, other: StateUpdate) {
        self.writes.extend(other.writes);
    }

    /// Names of the fields this update touches (with repeats).
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.writes.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// The mutable state of one run: a record of named JSON fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    data: BTreeMap<String, Value>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value by field name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }

    /// Entries of a sequence field. Missing fields read as empty.
    pub fn items(&self, field: &str) -> &[Value] {
        match self.data.get(field) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }

    /// Deserialize a field into a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        match self.data.get(field) {
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| StepGraphError::FieldType {
                    field: field.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Chat messages held by an append-by-id field.
    pub fn messages(&self, field: &str) -> Result<Vec<ChatMessage>> {
        Ok(self.get_as(field)?.unwrap_or_default())
    }

    /// The last message of an append-by-id field.
    pub fn last_message(&self, field: &str) -> Result<Option<ChatMessage>> {
        match self.items(field).last() {
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| StepGraphError::FieldType {
                    field: field.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Copy of this state restricted to the given fields.
    pub fn view<S: AsRef<str>>(&self, fields: &[S]) -> RunState {
        let data = fields
            .iter()
            .filter_map(|f| {
                let f = f.as_ref();
                self.data.get(f).map(|v| (f.to_string(), v.clone()))
            })
            .collect();
        RunState { data }
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    /// Apply an update using each touched field's merge policy.
    ///
    /// All or nothing: if any write is rejected the state is left as it was.
    pub fn apply(&mut self, schema: &StateSchema, update: StateUpdate) -> Result<()> {
        let mut staged = self.clone();
        staged.apply_writes(schema, update)?;
        *self = staged;
        Ok(())
    }

    fn apply_writes(&mut self, schema: &StateSchema, update: StateUpdate) -> Result<()> {
        for (field, value) in update.writes {
            let policy = schema
                .policy(&field)
                .ok_or_else(|| StepGraphError::UnknownField(field.clone()))?;
            match policy {
                FieldPolicy::Replace => {
                    self.data.insert(field, value);
                }
                FieldPolicy::Accumulate => {
                    let items = self.sequence_mut(&field)?;
                    match value {
                        Value::Array(values) => items.extend(values),
                        single => items.push(single),
                    }
                }
                FieldPolicy::AppendById => {
                    let values = match value {
                        Value::Array(values) => values,
                        single => vec![single],
                    };
                    let items = self.sequence_mut(&field)?;
                    for value in values {
                        upsert_by_id(&field, items, value)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn sequence_mut(&mut self, field: &str) -> Result<&mut Vec<Value>> {
        let slot = self
            .data
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match slot {
            Value::Array(items) => Ok(items),
            other => Err(StepGraphError::FieldType {
                field: field.to_string(),
                message: format!("expected an array, found {}", kind_of(other)),
            }),
        }
    }
}

fn upsert_by_id(field: &str, items: &mut Vec<Value>, mut value: Value) -> Result<()> {
    let obj = value.as_object_mut().ok_or_else(|| StepGraphError::FieldType {
        field: field.to_string(),
        message: "append-by-id entries must be objects".into(),
    })?;
    let id = match obj.get("id") {
        None | Some(Value::Null) => {
            let id = uuid::Uuid::new_v4().to_string();
            obj.insert("id".into(), Value::String(id.clone()));
            id
        }
        Some(raw) => entry_id(raw).ok_or_else(|| StepGraphError::FieldType {
            field: field.to_string(),
            message: format!("entry id must be a string or a number, found {}", kind_of(raw)),
        })?,
    };

    let existing = items
        .iter()
        .position(|item| item.get("id").and_then(entry_id).as_deref() == Some(id.as_str()));
    match existing {
        Some(pos) => items[pos] = value,
        None => items.push(value),
    }
    Ok(())
}

/// Ids compare as text, so `7` and `"7"` name the same entry.
fn entry_id(raw: &Value) -> Option<String> {
    match raw {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
            .append_by_id("messages")
            .replace("summary")
            .accumulate("task_results")
    }

    #[test]
    fn test_replace_overwrites() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(&s, StateUpdate::new().set("summary", json!("first")))
            .unwrap();
        state
            .apply(&s, StateUpdate::new().set("summary", json!("second")))
            .unwrap();
        assert_eq!(state.get_str("summary"), Some("second"));
    }

    #[test]
    fn test_append_by_id_upserts() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(
                &s,
                StateUpdate::new().set(
                    "messages",
                    json!([{"id": "a", "text": "one"}, {"id": "b", "text": "two"}]),
                ),
            )
            .unwrap();
        state
            .apply(
                &s,
                StateUpdate::new().set("messages", json!({"id": "a", "text": "edited"})),
            )
            .unwrap();

        let items = state.items("messages");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["text"], "edited");
        assert_eq!(items[1]["text"], "two");
    }

    #[test]
    fn test_same_id_twice_in_one_write_keeps_latest() {
        let mut state = RunState::new();
        state
            .apply(
                &schema(),
                StateUpdate::new().set(
                    "messages",
                    json!([{"id": "x", "v": 1}, {"id": "x", "v": 2}]),
                ),
            )
            .unwrap();
        let items = state.items("messages");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["v"], 2);
    }

    #[test]
    fn test_append_assigns_missing_ids() {
        let mut state = RunState::new();
        state
            .apply(&schema(), StateUpdate::new().set("messages", json!([{"v": 1}, {"v": 2}])))
            .unwrap();
        let items = state.items("messages");
        assert_eq!(items.len(), 2);
        assert_ne!(items[0]["id"], items[1]["id"]);
    }

    #[test]
    fn test_append_rejects_scalars() {
        let mut state = RunState::new();
        let err = state
            .apply(&schema(), StateUpdate::new().set("messages", json!(3)))
            .unwrap_err();
        assert!(matches!(err, StepGraphError::FieldType { .. }));
    }

    #[test]
    fn test_accumulate_appends_everything() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(&s, StateUpdate::new().set("task_results", json!({"id": 1})))
            .unwrap();
        state
            .apply(
                &s,
                StateUpdate::new().set("task_results", json!([{"id": 1}, {"id": 2}])),
            )
            .unwrap();
        assert_eq!(state.items("task_results").len(), 3);
    }

    #[test]
    fn test_numeric_ids_upsert() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(&s, StateUpdate::new().set("messages", json!({"id": 7, "text": "draft"})))
            .unwrap();
        state
            .apply(&s, StateUpdate::new().set("messages", json!({"id": 7, "text": "final"})))
            .unwrap();
        let items = state.items("messages");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], 7);
        assert_eq!(items[0]["text"], "final");

        let err = state
            .apply(&s, StateUpdate::new().set("messages", json!({"id": [1], "text": "x"})))
            .unwrap_err();
        assert!(matches!(err, StepGraphError::FieldType { .. }));
    }

    #[test]
    fn test_accumulate_is_order_independent() {
        let s = schema();
        let children = [
            json!({"task": 1, "result_code": 0}),
            json!({"task": 2, "result_code": 1}),
            json!([{"task": 3, "result_code": 0}, {"task": 3, "result_code": 0}]),
        ];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        let merged: Vec<Vec<String>> = orders
            .iter()
            .map(|order| {
                let mut state = RunState::new();
                for &i in order {
                    state
                        .apply(&s, StateUpdate::new().set("task_results", children[i].clone()))
                        .unwrap();
                }
                let mut entries: Vec<String> =
                    state.items("task_results").iter().map(|v| v.to_string()).collect();
                entries.sort();
                entries
            })
            .collect();

        assert_eq!(merged[0].len(), 4);
        assert!(merged.iter().all(|m| m == &merged[0]));
    }

    #[test]
    fn test_rejected_update_leaves_state_unchanged() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(&s, StateUpdate::new().set("summary", json!("before")))
            .unwrap();

        let err = state
            .apply(
                &s,
                StateUpdate::new()
                    .set("summary", json!("half"))
                    .set("task_results", json!({"task": 1}))
                    .set("nope", json!(1)),
            )
            .unwrap_err();
        assert!(matches!(err, StepGraphError::UnknownField(_)));
        assert_eq!(state.get_str("summary"), Some("before"));
        assert!(state.items("task_results").is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut state = RunState::new();
        let err = state
            .apply(&schema(), StateUpdate::new().set("nope", json!(1)))
            .unwrap_err();
        assert!(matches!(err, StepGraphError::UnknownField(f) if f == "nope"));
    }

    #[test]
    fn test_messages_typed_access() {
        let mut state = RunState::new();
        let msgs = vec![ChatMessage::user("hello"), ChatMessage::assistant_text("hi")];
        state
            .apply(&schema(), StateUpdate::new().messages("messages", &msgs).unwrap())
            .unwrap();
        let back = state.messages("messages").unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].text(), "hello");
        assert_eq!(state.last_message("messages").unwrap().unwrap().text(), "hi");
    }

    #[test]
    fn test_view_restricts_fields() {
        let mut state = RunState::new();
        let s = schema();
        state
            .apply(
                &s,
                StateUpdate::new()
                    .set("summary", json!("x"))
                    .set("task_results", json!([1])),
            )
            .unwrap();
        let view = state.view(&["summary", "missing"]);
        assert_eq!(view.get_str("summary"), Some("x"));
        assert!(view.get("task_results").is_none());
        assert_eq!(view.data().len(), 1);
    }

    #[test]
    fn test_from_object() {
        let update = StateUpdate::from_object(json!({"summary": "s"})).unwrap();
        assert_eq!(update.len(), 1);
        assert!(StateUpdate::from_object(json!(null)).unwrap().is_empty());
        assert!(StateUpdate::from_object(json!([1])).is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut state = RunState::new();
        state
            .apply(&schema(), StateUpdate::new().set("summary", json!("done")))
            .unwrap();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
