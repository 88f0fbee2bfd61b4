//! crates/classroom_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete cache, remote store and collaborators.

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

use crate::domain::{AccessLogEntry, User};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    /// Network or permission failure talking to the remote document store.
    #[error("Remote store error: {0}")]
    Remote(String),
    /// The local cache could not persist a write.
    #[error("Local storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

/// Snapshots pushed by a remote subscription. `None` means nothing is stored
/// at the subscribed path.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Option<Value>> + Send>>;

//=========================================================================================
// Store Ports
//=========================================================================================

/// Durable, synchronous, process-local storage for entity collections.
pub trait LocalCacheStore: Send + Sync {
    /// Returns the stored list for `key`, or an empty list if absent.
    fn get_collection(&self, key: &str) -> Vec<Value>;

    /// Overwrites the entire list for `key` in one store operation.
    fn set_collection(&self, key: &str, records: Vec<Value>) -> PortResult<()>;

    fn get_singleton(&self, key: &str) -> Option<Value>;

    fn set_singleton(&self, key: &str, value: Value) -> PortResult<()>;
}

/// CRUD + subscribe primitives over a hierarchical remote key-value store
/// addressed by `collection` or `collection/id` paths.
#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Reads every child under a collection path, reconstructing each record's
    /// `id` from its key. An empty path yields an empty list.
    async fn get_all(&self, collection: &str) -> PortResult<Vec<Value>>;

    async fn get_one(&self, path: &str) -> PortResult<Option<Value>>;

    /// Full overwrite of the value at `path`.
    async fn set_data(&self, path: &str, value: Value) -> PortResult<()>;

    /// Shallow-merges `partial` into the value at `path`.
    async fn update_data(&self, path: &str, partial: Value) -> PortResult<()>;

    async fn remove_data(&self, path: &str) -> PortResult<()>;

    /// Yields the current value at `path` immediately, then again after every
    /// change. Dropping the stream unsubscribes.
    async fn subscribe(&self, path: &str) -> PortResult<SnapshotStream>;
}

//=========================================================================================
// Collaborator Ports
//=========================================================================================

/// Persists a freshly approved user and mirrors it remotely.
pub trait UserRegistrationService: Send + Sync {
    fn register_user(&self, user: User) -> PortResult<()>;
}

/// Append-only audit trail.
pub trait AccessLogService: Send + Sync {
    fn append(&self, entry: AccessLogEntry) -> PortResult<()>;
}

//=========================================================================================
// Path Helpers
//=========================================================================================

/// Joins a collection and record id into a store path.
pub fn record_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

/// Splits a store path into its collection and optional record id.
pub fn split_path(path: &str) -> (&str, Option<&str>) {
    let trimmed = path.trim_matches('/');
    match trimmed.split_once('/') {
        Some((collection, id)) if !id.is_empty() => (collection, Some(id)),
        Some((collection, _)) => (collection, None),
        None => (trimmed, None),
    }
}

/// Turns a collection node (a map from key to record) into a list of records,
/// reconstructing each record's `id` from its key.
pub fn records_from_children(node: &Value) -> Vec<Value> {
    let Some(children) = node.as_object() else {
        return Vec::new();
    };
    children
        .iter()
        .map(|(key, child)| {
            let mut record = child.clone();
            if let Value::Object(fields) = &mut record {
                fields.insert("id".to_string(), Value::String(key.clone()));
            }
            record
        })
        .collect()
}

/// Reads the `id` field of a stored record.
pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

/// Reads the write counter of a stored record; unversioned records count as 0.
pub fn record_version(record: &Value) -> u64 {
    record.get("version").and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("applications"), ("applications", None));
        assert_eq!(split_path("applications/abc"), ("applications", Some("abc")));
        assert_eq!(split_path("/users/CS2A-1/"), ("users", Some("CS2A-1")));
        assert_eq!(record_path("users", "x"), "users/x");
    }
}
