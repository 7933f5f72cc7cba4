use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// Structured monitoring snapshot: a flat map of keys to JSON values.
/// Nested states (e.g. one per consumer) are stored as JSON objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct State(BTreeMap<String, Value>);

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_or_assign(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl From<State> for Value {
    fn from(state: State) -> Self {
        Value::Object(state.0.into_iter().collect())
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
