//! crates/classroom_core/src/memory.rs
//!
//! In-process implementations of the store ports. `InMemoryCache` backs
//! ephemeral runs and tests; `InMemoryRemote` stands in for the realtime
//! document store when no database is configured, and can be switched
//! offline to exercise the failure paths of the mirror.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;

use crate::ports::{
    records_from_children, split_path, LocalCacheStore, PortError, PortResult, RemoteDocumentStore,
    SnapshotStream,
};

//=========================================================================================
// Local Cache
//=========================================================================================

#[derive(Default)]
pub struct InMemoryCache {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    singletons: RwLock<HashMap<String, Value>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCacheStore for InMemoryCache {
    fn get_collection(&self, key: &str) -> Vec<Value> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(key).cloned().unwrap_or_default()
    }

    fn set_collection(&self, key: &str, records: Vec<Value>) -> PortResult<()> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections.insert(key.to_string(), records);
        Ok(())
    }

    fn get_singleton(&self, key: &str) -> Option<Value> {
        let singletons = self.singletons.read().unwrap_or_else(|e| e.into_inner());
        singletons.get(key).cloned()
    }

    fn set_singleton(&self, key: &str, value: Value) -> PortResult<()> {
        let mut singletons = self.singletons.write().unwrap_or_else(|e| e.into_inner());
        singletons.insert(key.to_string(), value);
        Ok(())
    }
}

//=========================================================================================
// Remote Document Store
//=========================================================================================

/// A JSON tree published through a `watch` channel so subscribers see every
/// committed change.
pub struct InMemoryRemote {
    tree: watch::Sender<Map<String, Value>>,
    offline: AtomicBool,
    writes: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        let (tree, _) = watch::channel(Map::new());
        Self {
            tree,
            offline: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails with `PortError::Remote`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful `set_data`/`update_data`/`remove_data` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> PortResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PortError::Remote("remote store unreachable".to_string()));
        }
        Ok(())
    }

    fn commit(&self, apply: impl FnOnce(&mut Map<String, Value>)) {
        self.tree.send_modify(apply);
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

fn read_path(tree: &Map<String, Value>, path: &str) -> Option<Value> {
    let (collection, id) = split_path(path);
    let node = tree.get(collection)?;
    match id {
        None => Some(node.clone()),
        Some(id) => node.get(id).cloned(),
    }
}

fn collection_node<'a>(tree: &'a mut Map<String, Value>, collection: &str) -> &'a mut Map<String, Value> {
    let node = tree
        .entry(collection.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(children) => children,
        _ => unreachable!("collection node was just normalized to an object"),
    }
}

fn shallow_merge(target: &mut Value, partial: Value) {
    match (target, partial) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[async_trait]
impl RemoteDocumentStore for InMemoryRemote {
    async fn get_all(&self, collection: &str) -> PortResult<Vec<Value>> {
        self.ensure_online()?;
        let tree = self.tree.borrow();
        Ok(tree.get(collection).map(records_from_children).unwrap_or_default())
    }

    async fn get_one(&self, path: &str) -> PortResult<Option<Value>> {
        self.ensure_online()?;
        Ok(read_path(&self.tree.borrow(), path))
    }

    async fn set_data(&self, path: &str, value: Value) -> PortResult<()> {
        self.ensure_online()?;
        let (collection, id) = split_path(path);
        self.commit(|tree| match id {
            None => {
                tree.insert(collection.to_string(), value);
            }
            Some(id) => {
                collection_node(tree, collection).insert(id.to_string(), value);
            }
        });
        Ok(())
    }

    async fn update_data(&self, path: &str, partial: Value) -> PortResult<()> {
        self.ensure_online()?;
        let (collection, id) = split_path(path);
        self.commit(|tree| {
            let slot = match id {
                None => tree.entry(collection.to_string()).or_insert(Value::Null),
                Some(id) => collection_node(tree, collection)
                    .entry(id.to_string())
                    .or_insert(Value::Null),
            };
            shallow_merge(slot, partial);
        });
        Ok(())
    }

    async fn remove_data(&self, path: &str) -> PortResult<()> {
        self.ensure_online()?;
        let (collection, id) = split_path(path);
        self.commit(|tree| match id {
            None => {
                tree.remove(collection);
            }
            Some(id) => {
                if let Some(Value::Object(children)) = tree.get_mut(collection) {
                    children.remove(id);
                }
            }
        });
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> PortResult<SnapshotStream> {
        self.ensure_online()?;
        let receiver = self.tree.subscribe();
        let path = path.to_string();

        // `last` is None until the initial snapshot has been yielded.
        let stream = futures::stream::unfold(
            (receiver, None::<Option<Value>>, path),
            |(mut receiver, last, path)| async move {
                loop {
                    if last.is_some() && receiver.changed().await.is_err() {
                        return None;
                    }
                    let current = read_path(&receiver.borrow_and_update(), &path);
                    if last.as_ref() != Some(&current) {
                        return Some((current.clone(), (receiver, Some(current), path)));
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_cache_absent_key_is_empty() {
        let cache = InMemoryCache::new();
        assert!(cache.get_collection("announcements").is_empty());
        assert!(cache.get_singleton("settings").is_none());
    }

    #[test]
    fn test_cache_overwrites_whole_collection() {
        let cache = InMemoryCache::new();
        cache.set_collection("users", vec![json!({"id": "a"}), json!({"id": "b"})]).unwrap();
        cache.set_collection("users", vec![json!({"id": "c"})]).unwrap();
        assert_eq!(cache.get_collection("users"), vec![json!({"id": "c"})]);
    }

    #[tokio::test]
    async fn test_get_all_reconstructs_ids() {
        let remote = InMemoryRemote::new();
        remote.set_data("users/u1", json!({"name": "Ana"})).await.unwrap();
        remote.set_data("users/u2", json!({"name": "Ben"})).await.unwrap();

        let mut users = remote.get_all("users").await.unwrap();
        users.sort_by_key(|u| u["id"].as_str().map(str::to_string));
        assert_eq!(users[0], json!({"id": "u1", "name": "Ana"}));
        assert_eq!(users[1]["id"], "u2");
        assert!(remote.get_all("campaigns").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_merges_shallowly() {
        let remote = InMemoryRemote::new();
        remote
            .set_data("applications/a", json!({"status": "pending", "attemptNumber": 1}))
            .await
            .unwrap();
        remote
            .update_data("applications/a", json!({"status": "verifying"}))
            .await
            .unwrap();
        let app = remote.get_one("applications/a").await.unwrap().unwrap();
        assert_eq!(app, json!({"status": "verifying", "attemptNumber": 1}));

        remote.remove_data("applications/a").await.unwrap();
        assert!(remote.get_one("applications/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_offline_operations_fail() {
        let remote = InMemoryRemote::new();
        remote.set_offline(true);
        assert!(matches!(
            remote.set_data("users/x", json!({})).await,
            Err(PortError::Remote(_))
        ));
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_fires_immediately_then_on_change() {
        let remote = InMemoryRemote::new();
        remote.set_data("schedule/s1", json!({"day": "Mon"})).await.unwrap();

        let mut stream = remote.subscribe("schedule").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first["s1"]["day"], "Mon");

        remote.set_data("schedule/s2", json!({"day": "Tue"})).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second["s2"]["day"], "Tue");
    }
}
