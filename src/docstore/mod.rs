//! Document store: collections of JSON documents with live subscriptions.
//!
//! This module is split into two parts:
//! - the `DocumentStore` contract, write operations and subscription types;
//! - `sqlite`: an implementation on top of sqlx/SQLite.
//!
//! Subscriptions deliver full-state snapshots. The current state is pushed
//! on subscribe and again after every committed write. Dropping a
//! `Subscription` unsubscribes.

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Map, Value};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod sqlite;

pub use sqlite::SqliteDocumentStore;

/// Top-level fields of a document.
pub type Fields = Map<String, Value>;

/// Monotonic counter of committed writes.
pub type Revision = u64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("permission denied by the document store: {0}")]
    PermissionDenied(String),
    #[error("document {0} does not exist")]
    NotFound(DocPath),
    #[error("document store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("document data is not valid JSON: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    pub collection: String,
    pub id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Fields,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the document.
    Set { path: DocPath, data: Fields },
    /// Create the document or add the fields it does not have yet; fields
    /// already stored keep their value.
    Merge { path: DocPath, data: Fields },
    /// Overwrite the given fields of an existing document.
    Update { path: DocPath, fields: Fields },
    /// Delete the document; deleting a missing document succeeds.
    Delete { path: DocPath },
}

impl WriteOp {
    pub fn path(&self) -> &DocPath {
        match self {
            WriteOp::Set { path, .. }
            | WriteOp::Merge { path, .. }
            | WriteOp::Update { path, .. }
            | WriteOp::Delete { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
    pub revision: Revision,
    pub data: T,
}

pub type SnapshotResult<T> = Result<Snapshot<T>, StoreError>;

/// Live stream of snapshots. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<SnapshotResult<T>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<SnapshotResult<T>>) -> Self {
        Self { rx }
    }

    /// Sender/subscription pair for store implementations.
    pub fn channel() -> (mpsc::UnboundedSender<SnapshotResult<T>>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = SnapshotResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn listen_collection(
        &self,
        collection: &str,
    ) -> Result<Subscription<Vec<Document>>, StoreError>;

    async fn listen_document(
        &self,
        path: &DocPath,
    ) -> Result<Subscription<Option<Document>>, StoreError>;

    /// Apply all operations atomically: either every one is applied or none.
    async fn commit(&self, ops: Vec<WriteOp>) -> Result<Revision, StoreError>;

    async fn set(&self, path: &DocPath, data: Fields) -> Result<Revision, StoreError> {
        self.commit(vec![WriteOp::Set {
            path: path.clone(),
            data,
        }])
        .await
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> Result<Revision, StoreError> {
        self.commit(vec![WriteOp::Update {
            path: path.clone(),
            fields,
        }])
        .await
    }

    async fn delete(&self, path: &DocPath) -> Result<Revision, StoreError> {
        self.commit(vec![WriteOp::Delete { path: path.clone() }])
            .await
    }
}

/// Build a `Fields` map from `(key, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Fields
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Fields of `incoming` not yet present in `existing` are added; everything
/// already stored wins.
pub fn merge_missing(existing: &mut Fields, incoming: Fields) {
    for (key, value) in incoming {
        existing.entry(key).or_insert(value);
    }
}
