//! Reviewed businesses and their categories.
//!
//! `ReviewedStore` keeps a local projection of the `reviewed_leads`
//! collection and the `settings/app_config` document. Two listener tasks
//! replace the projection wholesale whenever the document store pushes a
//! snapshot; reads only ever look at the projection. Writes go straight to
//! the store and then wait until the pushed snapshot has caught up with the
//! write ("settle"), so the caller observes its own change on the next read.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::docstore::{
    fields, DocPath, Document, DocumentStore, Fields, Revision, SnapshotResult, StoreError,
    Subscription, WriteOp,
};
use crate::local::LocalStore;
use crate::model::{Business, LeadStatus, ReviewedEntry, DEFAULT_CATEGORY, INITIAL_CATEGORIES};
use crate::places::{ADDRESS_UNAVAILABLE, UNNAMED_BUSINESS};

pub mod migrate;

pub use migrate::{MigrationError, MigrationOutcome};

pub const LEADS_COLLECTION: &str = "reviewed_leads";
pub const SETTINGS_COLLECTION: &str = "settings";
pub const SETTINGS_DOC_ID: &str = "app_config";

#[derive(Debug, Error)]
pub enum ReviewedError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("business {0} is not in the reviewed list")]
    NotFound(String),
    #[error("category '{0}' does not exist")]
    UnknownCategory(String),
    #[error("reviewed businesses are unavailable: {0}")]
    Unavailable(String),
    #[error("could not encode reviewed entry: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Loading,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationState {
    /// Waiting for both subscriptions to become ready.
    Pending,
    Running,
    Finished(MigrationOutcome),
    /// Local data was left untouched; not retried in this session.
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    Added,
    Removed,
    /// The business had no usable id.
    Skipped,
}

pub fn lead_path(id: &str) -> DocPath {
    DocPath::new(LEADS_COLLECTION, id)
}

pub fn settings_path() -> DocPath {
    DocPath::new(SETTINGS_COLLECTION, SETTINGS_DOC_ID)
}

pub(crate) fn categories_fields(categories: &[String]) -> Fields {
    fields([("categories", json!(categories))])
}

/// Category names are unique ignoring case.
pub(crate) fn find_category<'a>(categories: &'a [String], name: &str) -> Option<&'a String> {
    categories.iter().find(|c| c.eq_ignore_ascii_case(name))
}

fn initial_categories() -> Vec<String> {
    INITIAL_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

struct Cache {
    entries: Vec<ReviewedEntry>,
    categories: Vec<String>,
    leads: SyncState,
    settings: SyncState,
    leads_revision: Revision,
    settings_revision: Revision,
    migration: MigrationState,
}

impl Cache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            categories: initial_categories(),
            leads: SyncState::Loading,
            settings: SyncState::Loading,
            leads_revision: 0,
            settings_revision: 0,
            migration: MigrationState::Pending,
        }
    }

    fn sync_state(&self) -> SyncState {
        match (&self.leads, &self.settings) {
            (SyncState::Failed(msg), _) | (_, SyncState::Failed(msg)) => {
                SyncState::Failed(msg.clone())
            }
            (SyncState::Ready, SyncState::Ready) => SyncState::Ready,
            _ => SyncState::Loading,
        }
    }

    /// Claim the migration if both subscriptions are ready and it has not run.
    fn claim_migration(&mut self) -> bool {
        if self.migration == MigrationState::Pending && self.sync_state() == SyncState::Ready {
            self.migration = MigrationState::Running;
            return true;
        }
        false
    }
}

struct Inner {
    docs: Arc<dyn DocumentStore>,
    local: LocalStore,
    cache: RwLock<Cache>,
    changes: watch::Sender<u64>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Cache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Cache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Returns true when this snapshot made the store ready for migration.
    fn apply_leads(&self, event: SnapshotResult<Vec<Document>>) -> bool {
        let claimed = {
            let mut cache = self.write();
            match event {
                Ok(snapshot) => {
                    cache.entries = decode_entries(snapshot.data);
                    cache.leads_revision = snapshot.revision;
                    cache.leads = SyncState::Ready;
                    cache.claim_migration()
                }
                Err(err) => {
                    error!(%err, "reviewed businesses subscription failed");
                    cache.leads = SyncState::Failed(err.to_string());
                    false
                }
            }
        };
        self.bump();
        claimed
    }

    fn apply_settings(&self, event: SnapshotResult<Option<Document>>) -> bool {
        let claimed = {
            let mut cache = self.write();
            match event {
                Ok(snapshot) => {
                    cache.categories = match snapshot.data {
                        Some(doc) => decode_categories(&doc),
                        None => initial_categories(),
                    };
                    cache.settings_revision = snapshot.revision;
                    cache.settings = SyncState::Ready;
                    cache.claim_migration()
                }
                Err(err) => {
                    error!(%err, "categories subscription failed");
                    cache.settings = SyncState::Failed(err.to_string());
                    false
                }
            }
        };
        self.bump();
        claimed
    }

    async fn migrate(&self) {
        let categories = self.read().categories.clone();
        let state =
            match migrate::migrate_legacy(self.docs.as_ref(), &self.local, &categories, Utc::now())
                .await
            {
                Ok(outcome) => MigrationState::Finished(outcome),
                Err(err) => {
                    error!(%err, "legacy migration failed; local data kept");
                    MigrationState::Failed(err.to_string())
                }
            };
        self.write().migration = state;
        self.bump();
    }
}

async fn run_leads(inner: Arc<Inner>, mut subscription: Subscription<Vec<Document>>) {
    while let Some(event) = subscription.next().await {
        if inner.apply_leads(event) {
            inner.migrate().await;
        }
    }
    warn!("reviewed businesses subscription closed");
}

async fn run_settings(inner: Arc<Inner>, mut subscription: Subscription<Option<Document>>) {
    while let Some(event) = subscription.next().await {
        if let Ok(snapshot) = &event {
            if snapshot.data.is_none() {
                // First run against this store: seed the default categories.
                if let Err(err) = inner
                    .docs
                    .set(&settings_path(), categories_fields(&initial_categories()))
                    .await
                {
                    warn!(%err, "failed to seed default categories");
                }
            }
        }
        if inner.apply_settings(event) {
            inner.migrate().await;
        }
    }
    warn!("categories subscription closed");
}

fn decode_entries(docs: Vec<Document>) -> Vec<ReviewedEntry> {
    docs.into_iter()
        .map(|doc| {
            let mut data = doc.data;
            // The document id is authoritative.
            data.insert("id".into(), Value::String(doc.id.clone()));
            match serde_json::from_value::<ReviewedEntry>(Value::Object(data.clone())) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(id = %doc.id, %err, "malformed reviewed entry; using defaults");
                    fallback_entry(doc.id, &data)
                }
            }
        })
        .collect()
}

/// Every stored document counts as reviewed, whatever its shape.
fn fallback_entry(id: String, data: &Fields) -> ReviewedEntry {
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let business = Business {
        id,
        name: text("name").unwrap_or_else(|| UNNAMED_BUSINESS.to_string()),
        address: text("address").unwrap_or_else(|| ADDRESS_UNAVAILABLE.to_string()),
        phone: text("phone"),
        rating: None,
        rating_count: 0,
        maps_url: None,
        photo_url: None,
    };
    let mut entry = ReviewedEntry::new(
        business,
        text("category").as_deref().unwrap_or(DEFAULT_CATEGORY),
        text("city").as_deref(),
        DateTime::<Utc>::default(),
    );
    entry.status = text("status")
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();
    entry
}

fn decode_categories(doc: &Document) -> Vec<String> {
    let Some(raw) = doc.data.get("categories").and_then(Value::as_array) else {
        return initial_categories();
    };
    let mut categories: Vec<String> = Vec::with_capacity(raw.len() + 1);
    for name in raw.iter().filter_map(Value::as_str).map(str::trim) {
        if !name.is_empty() && find_category(&categories, name).is_none() {
            categories.push(name.to_string());
        }
    }
    if find_category(&categories, DEFAULT_CATEGORY).is_none() {
        categories.insert(0, DEFAULT_CATEGORY.to_string());
    }
    categories
}

fn entry_fields(entry: &ReviewedEntry) -> Result<Fields, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(entry)?)
}

fn not_found_as(id: &str, err: StoreError) -> ReviewedError {
    match err {
        StoreError::NotFound(_) => ReviewedError::NotFound(id.to_string()),
        other => ReviewedError::Store(other),
    }
}

/// Session-scoped reviewed set. Dropping it stops the listener tasks, which
/// drops the subscriptions.
pub struct ReviewedStore {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ReviewedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReviewedStore")
            .field("sync", &self.sync_state())
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl Drop for ReviewedStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl ReviewedStore {
    /// Subscribe to the reviewed collection and the settings document. The
    /// legacy migration starts by itself once both have delivered data.
    #[instrument(skip_all)]
    pub async fn connect(
        docs: Arc<dyn DocumentStore>,
        local: LocalStore,
    ) -> Result<Self, ReviewedError> {
        let leads = docs.listen_collection(LEADS_COLLECTION).await?;
        let settings = docs.listen_document(&settings_path()).await?;
        let (changes, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            docs,
            local,
            cache: RwLock::new(Cache::new()),
            changes,
        });
        let tasks = vec![
            tokio::spawn(run_leads(inner.clone(), leads)),
            tokio::spawn(run_settings(inner.clone(), settings)),
        ];
        Ok(Self { inner, tasks })
    }

    /// Stop listening. Equivalent to dropping the store.
    pub fn shutdown(self) {
        info!("reviewed store shut down");
    }

    /// Wait for the first snapshots and for the migration to finish.
    pub async fn ready(&self) -> Result<(), ReviewedError> {
        let mut rx = self.inner.changes.subscribe();
        loop {
            let step = {
                let cache = self.inner.read();
                match (cache.sync_state(), &cache.migration) {
                    (SyncState::Failed(msg), _) => Err(msg),
                    (SyncState::Ready, MigrationState::Finished(outcome)) => {
                        Ok(Some(outcome.revision))
                    }
                    (SyncState::Ready, MigrationState::Failed(_)) => Ok(Some(None)),
                    _ => Ok(None),
                }
            };
            match step {
                Err(msg) => return Err(ReviewedError::Unavailable(msg)),
                Ok(Some(revision)) => {
                    if let Some(revision) = revision {
                        self.settle(revision).await;
                    }
                    return Ok(());
                }
                Ok(None) => {}
            }
            if rx.changed().await.is_err() {
                return Err(ReviewedError::Unavailable("store closed".into()));
            }
        }
    }

    /// Wait until both subscriptions delivered a snapshot at `revision` or later.
    async fn settle(&self, revision: Revision) {
        let mut rx = self.inner.changes.subscribe();
        loop {
            let done = {
                let cache = self.inner.read();
                (cache.leads_revision >= revision && cache.settings_revision >= revision)
                    || matches!(cache.sync_state(), SyncState::Failed(_))
            };
            if done || rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Bumped every time the projection changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.read().sync_state()
    }

    pub fn migration_state(&self) -> MigrationState {
        self.inner.read().migration.clone()
    }

    pub fn is_reviewed(&self, id: &str) -> bool {
        self.inner.read().entries.iter().any(|e| e.id() == id)
    }

    pub fn entry(&self, id: &str) -> Option<ReviewedEntry> {
        self.inner.read().entries.iter().find(|e| e.id() == id).cloned()
    }

    pub fn entries(&self) -> Vec<ReviewedEntry> {
        self.inner.read().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn categories(&self) -> Vec<String> {
        self.inner.read().categories.clone()
    }

    /// Spelling of `name` in the category list.
    fn resolve_category(&self, name: &str) -> Result<String, ReviewedError> {
        let name = name.trim();
        find_category(&self.inner.read().categories, name)
            .cloned()
            .ok_or_else(|| ReviewedError::UnknownCategory(name.to_string()))
    }

    pub async fn toggle(&self, business: &Business) -> Result<Toggled, ReviewedError> {
        self.toggle_with(business, DEFAULT_CATEGORY, None).await
    }

    /// Remove the business if reviewed, otherwise add it as `waiting` in
    /// `category`, remembering the `city` it was found in.
    #[instrument(skip_all, fields(id = %business.id))]
    pub async fn toggle_with(
        &self,
        business: &Business,
        category: &str,
        city: Option<&str>,
    ) -> Result<Toggled, ReviewedError> {
        let id = business.id.trim();
        if id.is_empty() {
            warn!(name = %business.name, "business without id; toggle ignored");
            return Ok(Toggled::Skipped);
        }
        if self.is_reviewed(id) {
            self.remove(id).await?;
            return Ok(Toggled::Removed);
        }

        let category = self.resolve_category(category)?;

        let mut business = business.clone();
        business.id = id.to_string();
        let entry = ReviewedEntry::new(business, &category, city, Utc::now());
        let revision = self
            .inner
            .docs
            .set(&lead_path(id), entry_fields(&entry)?)
            .await
            .inspect_err(|err| error!(%err, "failed to add reviewed business"))?;
        self.settle(revision).await;
        info!(%category, "business marked as reviewed");
        Ok(Toggled::Added)
    }

    /// Delete an entry. Returns whether it was in the reviewed list.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<bool, ReviewedError> {
        let was_reviewed = self.is_reviewed(id);
        let revision = self
            .inner
            .docs
            .delete(&lead_path(id))
            .await
            .inspect_err(|err| error!(%err, "failed to remove reviewed business"))?;
        self.settle(revision).await;
        info!(was_reviewed, "reviewed business removed");
        Ok(was_reviewed)
    }

    #[instrument(skip(self))]
    pub async fn update_category(&self, id: &str, category: &str) -> Result<(), ReviewedError> {
        if !self.is_reviewed(id) {
            return Err(ReviewedError::NotFound(id.to_string()));
        }
        let category = self.resolve_category(category)?;
        let revision = self
            .inner
            .docs
            .update(&lead_path(id), fields([("category", json!(category))]))
            .await
            .map_err(|err| not_found_as(id, err))
            .inspect_err(|err| error!(%err, "failed to update category"))?;
        self.settle(revision).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn update_status(&self, id: &str, status: LeadStatus) -> Result<(), ReviewedError> {
        if !self.is_reviewed(id) {
            return Err(ReviewedError::NotFound(id.to_string()));
        }
        let revision = self
            .inner
            .docs
            .update(&lead_path(id), fields([("status", json!(status.as_str()))]))
            .await
            .map_err(|err| not_found_as(id, err))
            .inspect_err(|err| error!(%err, "failed to update status"))?;
        self.settle(revision).await;
        Ok(())
    }

    /// Append a category. Returns false for blank names and existing ones.
    #[instrument(skip(self))]
    pub async fn add_category(&self, name: &str) -> Result<bool, ReviewedError> {
        let name = name.trim();
        let mut categories = self.categories();
        if name.is_empty() || find_category(&categories, name).is_some() {
            return Ok(false);
        }
        categories.push(name.to_string());
        let revision = self
            .inner
            .docs
            .set(&settings_path(), categories_fields(&categories))
            .await
            .inspect_err(|err| error!(%err, "failed to add category"))?;
        self.settle(revision).await;
        Ok(true)
    }

    /// Remove a category and move its entries to the default category in
    /// one batch. The default category itself is never removed.
    #[instrument(skip(self))]
    pub async fn remove_category(&self, name: &str) -> Result<bool, ReviewedError> {
        let name = name.trim();
        if name.eq_ignore_ascii_case(DEFAULT_CATEGORY) {
            info!("default category cannot be removed");
            return Ok(false);
        }

        let (remaining, affected) = {
            let cache = self.inner.read();
            let remaining: Vec<String> = cache
                .categories
                .iter()
                .filter(|c| !c.eq_ignore_ascii_case(name))
                .cloned()
                .collect();
            let affected: Vec<String> = cache
                .entries
                .iter()
                .filter(|e| e.category.eq_ignore_ascii_case(name))
                .map(|e| e.id().to_string())
                .collect();
            if remaining.len() == cache.categories.len() && affected.is_empty() {
                return Ok(false);
            }
            (remaining, affected)
        };

        let mut ops = Vec::with_capacity(affected.len() + 1);
        ops.push(WriteOp::Set {
            path: settings_path(),
            data: categories_fields(&remaining),
        });
        ops.extend(affected.iter().map(|id| WriteOp::Update {
            path: lead_path(id),
            fields: fields([("category", json!(DEFAULT_CATEGORY))]),
        }));

        let revision = self
            .inner
            .docs
            .commit(ops)
            .await
            .inspect_err(|err| error!(%err, "failed to remove category"))?;
        self.settle(revision).await;
        info!(moved = affected.len(), "category removed");
        Ok(true)
    }

    /// Delete every entry once `confirm` (given the entry count) agrees.
    /// Returns the number of deleted entries.
    #[instrument(skip_all)]
    pub async fn clear_all<F>(&self, confirm: F) -> Result<usize, ReviewedError>
    where
        F: FnOnce(usize) -> bool,
    {
        let ids: Vec<String> = self
            .inner
            .read()
            .entries
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        if !confirm(ids.len()) {
            info!("clearing reviewed businesses cancelled");
            return Ok(0);
        }
        let ops = ids
            .iter()
            .map(|id| WriteOp::Delete {
                path: lead_path(id),
            })
            .collect();
        let revision = self
            .inner
            .docs
            .commit(ops)
            .await
            .inspect_err(|err| error!(%err, "failed to clear reviewed businesses"))?;
        self.settle(revision).await;
        info!(count = ids.len(), "reviewed businesses cleared");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, data: Value) -> Document {
        let Value::Object(data) = data else { unreachable!() };
        Document {
            id: id.into(),
            data,
        }
    }

    #[test]
    fn categories_always_contain_default() {
        let d = doc("app_config", json!({ "categories": ["VIP", " ", "VIP", "Hot"] }));
        assert_eq!(decode_categories(&d), vec!["General", "VIP", "Hot"]);

        let d = doc("app_config", json!({}));
        assert_eq!(decode_categories(&d), initial_categories());
    }

    #[test]
    fn document_id_wins_and_every_document_is_kept() {
        let entries = decode_entries(vec![
            doc(
                "p1",
                json!({ "id": "other", "name": "A", "address": "x", "createdAt": "2026-01-01T00:00:00Z" }),
            ),
            doc("p2", json!({ "name": "B" })),
            doc("p3", json!({ "name": 5, "status": "completed", "category": "VIP" })),
        ]);
        let ids: Vec<&str> = entries.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["p1", "p2", "p3"]);

        assert_eq!(entries[1].business.name, "B");
        assert_eq!(entries[1].business.address, "");
        assert_eq!(entries[1].created_at, DateTime::<Utc>::default());

        assert_eq!(entries[2].business.name, UNNAMED_BUSINESS);
        assert_eq!(entries[2].status, LeadStatus::Completed);
        assert_eq!(entries[2].category, "VIP");
    }

    #[test]
    fn migration_is_claimed_once_both_halves_are_ready() {
        let mut cache = Cache::new();
        cache.leads = SyncState::Ready;
        assert!(!cache.claim_migration());
        cache.settings = SyncState::Ready;
        assert!(cache.claim_migration());
        assert!(!cache.claim_migration());
    }

    #[test]
    fn failed_subscription_blocks_migration() {
        let mut cache = Cache::new();
        cache.leads = SyncState::Failed("permission denied".into());
        cache.settings = SyncState::Ready;
        assert!(!cache.claim_migration());
        assert_eq!(cache.migration, MigrationState::Pending);
    }
}
