use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Scratch space shared by every task execution of one workflow.
///
/// Cloning yields another handle to the same map. Each `get`/`set` is atomic
/// on its own; concurrent writers to one key resolve last-write-wins and no
/// multi-key transaction is offered. The orchestrator never writes here.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    data: Arc<RwLock<HashMap<String, serde_json::Value>>>,
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    // A writer that panicked cannot leave a half-written JSON value behind,
    // so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, serde_json::Value>> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, serde_json::Value>> {
        self.data.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of a value by key.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.read().get(key).cloned()
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.read()
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// Set a value, returning the previous one.
    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) -> Option<serde_json::Value> {
        self.write().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Point-in-time copy of the whole map.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.read().clone()
    }
}

impl Serialize for WorkflowContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WorkflowContext {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::deserialize(deserializer).map(Self::from_map)
    }
}
