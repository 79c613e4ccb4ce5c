//! Event records handed from producers to the delivery worker.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A host event that can enumerate its fields.
///
/// `range` calls the visitor once per `(key, value)` pair and stops early
/// when the visitor returns `false`. Keys are arbitrary values; only text
/// keys survive into an [`EventRecord`].
pub trait Event {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool);
}

impl Event for Map<String, Value> {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        for (key, value) in self {
            if !visit(&Value::String(key.clone()), value) {
                break;
            }
        }
    }
}

/// Objects enumerate their members; any other JSON value has no fields.
impl Event for Value {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        if let Value::Object(map) = self {
            Event::range(map, visit);
        }
    }
}

impl Event for HashMap<String, Value> {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        for (key, value) in self {
            if !visit(&Value::String(key.clone()), value) {
                break;
            }
        }
    }
}

impl Event for BTreeMap<String, Value> {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        for (key, value) in self {
            if !visit(&Value::String(key.clone()), value) {
                break;
            }
        }
    }
}

impl Event for Vec<(Value, Value)> {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        for (key, value) in self {
            if !visit(key, value) {
                break;
            }
        }
    }
}

impl Event for EventRecord {
    fn range(&self, visit: &mut dyn FnMut(&Value, &Value) -> bool) {
        Event::range(&self.fields, visit);
    }
}

/// Snapshot of an event's text-keyed fields.
///
/// Built once per `send` and owned by the queue entry until the worker
/// consumes it. There is no mutable access after construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRecord {
    fields: Map<String, Value>,
}

impl EventRecord {
    /// Copy every text-keyed field out of `event`.
    pub fn from_event<E: Event + ?Sized>(event: &E) -> Self {
        let mut fields = Map::new();
        event.range(&mut |key, value| {
            if let Value::String(name) = key {
                fields.insert(name.clone(), value.clone());
            }
            true
        });
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

impl From<Map<String, Value>> for EventRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for EventRecord {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
