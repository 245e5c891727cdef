use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};

use super::{
    merge_missing, DocPath, Document, DocumentStore, Fields, Revision, Snapshot, SnapshotResult,
    StoreError, Subscription, WriteOp,
};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // Every connection to `sqlite::memory:` opens its own empty database.
    let max_connections = if normalized.starts_with("sqlite::memory") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&normalized)
        .await?;
    if max_connections > 1 {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await?;
    }
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Create the file on first use.
    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

enum Listener {
    Collection {
        collection: String,
        tx: UnboundedSender<SnapshotResult<Vec<Document>>>,
    },
    Document {
        path: DocPath,
        tx: UnboundedSender<SnapshotResult<Option<Document>>>,
    },
}

impl Listener {
    fn is_closed(&self) -> bool {
        match self {
            Listener::Collection { tx, .. } => tx.is_closed(),
            Listener::Document { tx, .. } => tx.is_closed(),
        }
    }

    fn clone_handle(&self) -> Listener {
        match self {
            Listener::Collection { collection, tx } => Listener::Collection {
                collection: collection.clone(),
                tx: tx.clone(),
            },
            Listener::Document { path, tx } => Listener::Document {
                path: path.clone(),
                tx: tx.clone(),
            },
        }
    }
}

/// Document store persisted in SQLite. Writes are serialized so snapshots
/// reach every subscriber in revision order.
pub struct SqliteDocumentStore {
    pool: Pool,
    /// Held across a write and its notifications; guards the revision.
    revision: tokio::sync::Mutex<Revision>,
    listeners: Mutex<Vec<Listener>>,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore").finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    /// Open the database at `database_url` and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an already migrated pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self {
            pool,
            revision: tokio::sync::Mutex::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| !l.is_closed());
        listeners.len()
    }

    pub async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        fetch_document(&self.pool, path).await
    }

    fn register(&self, listener: Listener) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|l| !l.is_closed());
        listeners.push(listener);
    }

    /// Push a fresh snapshot to every live listener.
    async fn notify(&self, revision: Revision) {
        let handles: Vec<Listener> = {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners.retain(|l| !l.is_closed());
            listeners.iter().map(Listener::clone_handle).collect()
        };
        debug!(revision, listeners = handles.len(), "notifying listeners");
        for listener in handles {
            match listener {
                Listener::Collection { collection, tx } => {
                    let snapshot = fetch_collection(&self.pool, &collection)
                        .await
                        .map(|data| Snapshot { revision, data });
                    let _ = tx.send(snapshot);
                }
                Listener::Document { path, tx } => {
                    let snapshot = fetch_document(&self.pool, &path)
                        .await
                        .map(|data| Snapshot { revision, data });
                    let _ = tx.send(snapshot);
                }
            }
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    #[instrument(skip(self))]
    async fn listen_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<Vec<Document>>, StoreError> {
        let revision = self.revision.lock().await;
        let data = fetch_collection(&self.pool, collection).await?;
        let (tx, subscription) = Subscription::channel();
        let _ = tx.send(Ok(Snapshot {
            revision: *revision,
            data,
        }));
        self.register(Listener::Collection {
            collection: collection.to_string(),
            tx,
        });
        Ok(subscription)
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn listen_document(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<Option<Document>>, StoreError> {
        let revision = self.revision.lock().await;
        let data = fetch_document(&self.pool, path).await?;
        let (tx, subscription) = Subscription::channel();
        let _ = tx.send(Ok(Snapshot {
            revision: *revision,
            data,
        }));
        self.register(Listener::Document {
            path: path.clone(),
            tx,
        });
        Ok(subscription)
    }

    #[instrument(skip_all, fields(ops = ops.len()))]
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError> {
        let mut revision = self.revision.lock().await;
        let mut tx = self.pool.begin().await?;
        for op in ops {
            if let Err(err) = apply(&mut tx, op).await {
                warn!(%err, "write batch rejected; rolling back");
                // Dropping `tx` rolls the whole batch back.
                return Err(err);
            }
        }
        tx.commit().await?;
        *revision += 1;
        let committed = *revision;
        self.notify(committed).await;
        Ok(committed)
    }
}

async fn apply(tx: &mut Transaction<'_, Sqlite>, op: WriteOp) -> Result<(), StoreError> {
    match op {
        WriteOp::Set { path, data } => upsert(tx, &path, &data).await,
        WriteOp::Merge { path, data } => {
            let merged = match load_fields(tx, &path).await? {
                Some(mut existing) => {
                    merge_missing(&mut existing, data);
                    existing
                }
                None => data,
            };
            upsert(tx, &path, &merged).await
        }
        WriteOp::Update { path, fields } => {
            let mut existing = load_fields(tx, &path)
                .await?
                .ok_or_else(|| StoreError::NotFound(path.clone()))?;
            for (key, value) in fields {
                existing.insert(key, value);
            }
            upsert(tx, &path, &existing).await
        }
        WriteOp::Delete { path } => {
            sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
                .bind(&path.collection)
                .bind(&path.id)
                .execute(&mut **tx)
                .await?;
            Ok(())
        }
    }
}

async fn load_fields(
    tx: &mut Transaction<'_, Sqlite>,
    path: &DocPath,
) -> Result<Option<Fields>, StoreError> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT data FROM documents WHERE collection = ? AND id = ?")
            .bind(&path.collection)
            .bind(&path.id)
            .fetch_optional(&mut **tx)
            .await?;
    raw.map(|raw| serde_json::from_str::<Fields>(&raw))
        .transpose()
        .map_err(StoreError::from)
}

async fn upsert(
    tx: &mut Transaction<'_, Sqlite>,
    path: &DocPath,
    data: &Fields,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(data)?;
    sqlx::query(
        "INSERT INTO documents (collection, id, data) VALUES (?, ?, ?) \
         ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data, \
         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
    )
    .bind(&path.collection)
    .bind(&path.id)
    .bind(encoded)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn fetch_collection(pool: &Pool, collection: &str) -> Result<Vec<Document>, StoreError> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT id, data FROM documents WHERE collection = ? ORDER BY rowid")
            .bind(collection)
            .fetch_all(pool)
            .await?;
    rows.into_iter()
        .map(|(id, raw)| -> Result<Document, StoreError> {
            Ok(Document {
                id,
                data: serde_json::from_str(&raw)?,
            })
        })
        .collect()
}

async fn fetch_document(pool: &Pool, path: &DocPath) -> Result<Option<Document>, StoreError> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT data FROM documents WHERE collection = ? AND id = ?")
            .bind(&path.collection)
            .bind(&path.id)
            .fetch_optional(pool)
            .await?;
    raw.map(|raw| -> Result<Document, StoreError> {
        Ok(Document {
            id: path.id.clone(),
            data: serde_json::from_str(&raw)?,
        })
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_untouched() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_get_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let db = td.path().join("sub").join("leads.db");
        let url = format!("sqlite://{}", db.display());
        let prepared = prepare_sqlite_url(&url);
        assert_eq!(prepared, format!("sqlite://{}?mode=rwc", db.display()));
        assert!(db.parent().unwrap().exists());

        let with_mode = format!("sqlite://{}?mode=ro", db.display());
        assert_eq!(prepare_sqlite_url(&with_mode), with_mode);
    }
}
