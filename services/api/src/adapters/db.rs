//! services/api/src/adapters/db.rs
//!
//! This module contains the remote document store adapter, the concrete
//! implementation of the `RemoteDocumentStore` port backed by PostgreSQL.
//!
//! Every document lives in one `mirror_documents` row keyed by collection and
//! record id; a document stored directly at a collection path uses the empty
//! id. Each committed write sends a `NOTIFY` on `mirror_changes` carrying the
//! collection name, which is what subscriptions listen for.

use async_trait::async_trait;
use classroom_core::ports::{
    records_from_children, split_path, PortError, PortResult, RemoteDocumentStore, SnapshotStream,
};
use serde_json::{Map, Value};
use sqlx::postgres::{PgListener, PgPool};
use sqlx::FromRow;
use tracing::{debug, warn};

/// The channel every write notifies on.
pub const CHANGE_CHANNEL: &str = "mirror_changes";

/// Id used for a document stored directly at a collection path.
const ROOT_ID: &str = "";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A document store adapter that implements the `RemoteDocumentStore` port.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    /// Creates a new `PgDocumentStore`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Reads the whole node stored under `collection`.
    async fn read_node(&self, collection: &str) -> PortResult<Option<Value>> {
        read_node(&self.pool, collection).await
    }
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct DocumentRecord {
    id: String,
    data: Value,
}

/// Folds a collection's rows into the node the in-memory tree would hold:
/// the root document if one exists, otherwise a map of id to child.
fn assemble_node(rows: Vec<DocumentRecord>) -> Option<Value> {
    if let Some(root) = rows.iter().find(|r| r.id == ROOT_ID) {
        return Some(root.data.clone());
    }
    if rows.is_empty() {
        return None;
    }
    let children: Map<String, Value> = rows.into_iter().map(|r| (r.id, r.data)).collect();
    Some(Value::Object(children))
}

async fn read_node(pool: &PgPool, collection: &str) -> PortResult<Option<Value>> {
    let rows = sqlx::query_as::<_, DocumentRecord>(
        "SELECT id, data FROM mirror_documents WHERE collection = $1 ORDER BY id",
    )
    .bind(collection)
    .fetch_all(pool)
    .await
    .map_err(remote_error)?;
    Ok(assemble_node(rows))
}

fn remote_error(e: sqlx::Error) -> PortError {
    PortError::Remote(e.to_string())
}

//=========================================================================================
// `RemoteDocumentStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl RemoteDocumentStore for PgDocumentStore {
    async fn get_all(&self, collection: &str) -> PortResult<Vec<Value>> {
        let node = self.read_node(collection).await?;
        Ok(node.as_ref().map(records_from_children).unwrap_or_default())
    }

    async fn get_one(&self, path: &str) -> PortResult<Option<Value>> {
        match split_path(path) {
            (collection, None) => self.read_node(collection).await,
            (collection, Some(id)) => {
                let record = sqlx::query_as::<_, DocumentRecord>(
                    "SELECT id, data FROM mirror_documents WHERE collection = $1 AND id = $2",
                )
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(remote_error)?;
                Ok(record.map(|r| r.data))
            }
        }
    }

    async fn set_data(&self, path: &str, value: Value) -> PortResult<()> {
        let (collection, id) = split_path(path);
        let mut tx = self.pool.begin().await.map_err(remote_error)?;

        // A write at the collection path replaces the whole node.
        if id.is_none() {
            sqlx::query("DELETE FROM mirror_documents WHERE collection = $1")
                .bind(collection)
                .execute(&mut *tx)
                .await
                .map_err(remote_error)?;
        }
        sqlx::query(
            "INSERT INTO mirror_documents (collection, id, data, updated_at) VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (collection, id) DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()",
        )
        .bind(collection)
        .bind(id.unwrap_or(ROOT_ID))
        .bind(&value)
        .execute(&mut *tx)
        .await
        .map_err(remote_error)?;

        notify(&mut tx, collection).await?;
        tx.commit().await.map_err(remote_error)?;
        debug!(path, "Remote document set");
        Ok(())
    }

    async fn update_data(&self, path: &str, partial: Value) -> PortResult<()> {
        let (collection, id) = split_path(path);
        let mut tx = self.pool.begin().await.map_err(remote_error)?;
        sqlx::query(
            "INSERT INTO mirror_documents (collection, id, data, updated_at) VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (collection, id) DO UPDATE SET \
             data = CASE \
                 WHEN jsonb_typeof(mirror_documents.data) = 'object' AND jsonb_typeof(EXCLUDED.data) = 'object' \
                 THEN mirror_documents.data || EXCLUDED.data \
                 ELSE EXCLUDED.data \
             END, \
             updated_at = NOW()",
        )
        .bind(collection)
        .bind(id.unwrap_or(ROOT_ID))
        .bind(&partial)
        .execute(&mut *tx)
        .await
        .map_err(remote_error)?;

        notify(&mut tx, collection).await?;
        tx.commit().await.map_err(remote_error)?;
        debug!(path, "Remote document updated");
        Ok(())
    }

    async fn remove_data(&self, path: &str) -> PortResult<()> {
        let (collection, id) = split_path(path);
        let mut tx = self.pool.begin().await.map_err(remote_error)?;
        match id {
            Some(id) => sqlx::query("DELETE FROM mirror_documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(remote_error)?,
            None => sqlx::query("DELETE FROM mirror_documents WHERE collection = $1")
                .bind(collection)
                .execute(&mut *tx)
                .await
                .map_err(remote_error)?,
        };

        notify(&mut tx, collection).await?;
        tx.commit().await.map_err(remote_error)?;
        debug!(path, "Remote document removed");
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> PortResult<SnapshotStream> {
        let (collection, _) = split_path(path);
        let collection = collection.to_string();

        let mut listener = PgListener::connect_with(&self.pool).await.map_err(remote_error)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(remote_error)?;
        let initial = self.read_node(&collection).await?;
        let pool = self.pool.clone();

        // The first item is the current node; later items follow notifications
        // for this collection and are skipped when nothing changed.
        let stream = futures::stream::unfold(
            (listener, pool, collection, None::<Option<Value>>, Some(initial)),
            |(mut listener, pool, collection, last, first)| async move {
                if let Some(initial) = first {
                    let state = (listener, pool, collection, Some(initial.clone()), None);
                    return Some((initial, state));
                }
                loop {
                    let notification = match listener.recv().await {
                        Ok(n) => n,
                        Err(e) => {
                            warn!(collection = %collection, error = %e, "Change listener failed");
                            return None;
                        }
                    };
                    if notification.payload() != collection {
                        continue;
                    }
                    let current = match read_node(&pool, &collection).await {
                        Ok(node) => node,
                        Err(e) => {
                            warn!(collection = %collection, error = %e, "Failed to read changed collection");
                            return None;
                        }
                    };
                    if last.as_ref() != Some(&current) {
                        let state = (listener, pool, collection, Some(current.clone()), None);
                        return Some((current, state));
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

async fn notify(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, collection: &str) -> PortResult<()> {
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(CHANGE_CHANNEL)
        .bind(collection)
        .execute(&mut **tx)
        .await
        .map_err(remote_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, data: Value) -> DocumentRecord {
        DocumentRecord {
            id: id.to_string(),
            data,
        }
    }

    #[test]
    fn test_children_become_a_map() {
        let node = assemble_node(vec![
            row("u1", json!({"username": "ana"})),
            row("u2", json!({"username": "ben"})),
        ])
        .unwrap();
        assert_eq!(node, json!({"u1": {"username": "ana"}, "u2": {"username": "ben"}}));

        let records = records_from_children(&node);
        assert_eq!(records[0]["id"], "u1");
    }

    #[test]
    fn test_root_document_wins() {
        let node = assemble_node(vec![row("", json!({"maxResubmissionAttempts": 3}))]);
        assert_eq!(node, Some(json!({"maxResubmissionAttempts": 3})));
    }

    #[test]
    fn test_empty_collection_is_absent() {
        assert!(assemble_node(Vec::new()).is_none());
    }
}
