//! One-time transfer of reviewed data kept in local storage by older
//! versions into the document store.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::{categories_fields, find_category, lead_path, settings_path};
use crate::docstore::{DocumentStore, Fields, Revision, StoreError, WriteOp};
use crate::local::{LocalStore, LocalStoreError};
use crate::model::{id_from_value, LeadStatus, DEFAULT_CATEGORY};
use crate::places::{ADDRESS_UNAVAILABLE, UNNAMED_BUSINESS};

pub const LEGACY_LEADS_KEY: &str = "reviewed_businesses";
pub const LEGACY_CATEGORIES_KEY: &str = "custom_categories";
pub const UNKNOWN_CITY: &str = "Unknown";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("could not read legacy reviewed data: {0}")]
    Local(#[from] LocalStoreError),
    #[error("could not upload legacy reviewed data: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Legacy entries written to the store.
    pub leads: usize,
    /// Legacy entries dropped for lacking an id.
    pub skipped: usize,
    pub categories_added: usize,
    /// Revision of the batch, `None` when nothing had to be written.
    pub revision: Option<Revision>,
}

impl MigrationOutcome {
    pub fn migrated_anything(&self) -> bool {
        self.revision.is_some()
    }
}

/// Upload legacy local data in a single batch and erase it locally once the
/// batch is committed. Entries are merged, so values already in the store
/// win over legacy ones. `remote_categories` is the current category list.
#[instrument(skip_all)]
pub async fn migrate_legacy(
    docs: &dyn DocumentStore,
    local: &LocalStore,
    remote_categories: &[String],
    now: DateTime<Utc>,
) -> Result<MigrationOutcome, MigrationError> {
    let leads: Option<Vec<Value>> = local.get(LEGACY_LEADS_KEY)?;
    let legacy_categories: Option<Vec<String>> = local.get(LEGACY_CATEGORIES_KEY)?;
    if leads.is_none() && legacy_categories.is_none() {
        debug!("no legacy reviewed data");
        return Ok(MigrationOutcome::default());
    }
    info!("legacy reviewed data found; migrating to the document store");

    let mut outcome = MigrationOutcome::default();
    let mut categories: Vec<String> = remote_categories.to_vec();
    for name in legacy_categories.iter().flatten() {
        push_category(&mut categories, name);
    }

    let mut ops = Vec::new();
    for lead in leads.unwrap_or_default() {
        let Value::Object(lead) = lead else {
            warn!("skipping legacy entry that is not an object");
            outcome.skipped += 1;
            continue;
        };
        let Some(id) = lead.get("id").and_then(id_from_value) else {
            warn!("skipping legacy entry without id");
            outcome.skipped += 1;
            continue;
        };
        let mut data = with_defaults(lead, &id, now);
        if let Some(category) = data.get("category").and_then(Value::as_str) {
            let category = push_category(&mut categories, category);
            data.insert("category".into(), Value::String(category));
        }
        ops.push(WriteOp::Merge {
            path: lead_path(&id),
            data,
        });
        outcome.leads += 1;
    }

    outcome.categories_added = categories.len().saturating_sub(remote_categories.len());
    if outcome.categories_added > 0 {
        ops.push(WriteOp::Set {
            path: settings_path(),
            data: categories_fields(&categories),
        });
    }

    if !ops.is_empty() {
        outcome.revision = Some(docs.commit(ops).await?);
    }

    // Only reached once the batch is committed.
    local.remove(&[LEGACY_LEADS_KEY, LEGACY_CATEGORIES_KEY])?;
    info!(
        leads = outcome.leads,
        skipped = outcome.skipped,
        categories = outcome.categories_added,
        "legacy reviewed data migrated"
    );
    Ok(outcome)
}

/// Add `name` unless a category with the same name in any case exists.
/// Returns the spelling kept in the list.
fn push_category(categories: &mut Vec<String>, name: &str) -> String {
    let name = name.trim();
    if let Some(existing) = find_category(categories, name) {
        return existing.clone();
    }
    if !name.is_empty() {
        categories.push(name.to_string());
    }
    name.to_string()
}

/// Normalize a legacy entry: nulls dropped, missing fields defaulted.
fn with_defaults(lead: Map<String, Value>, id: &str, now: DateTime<Utc>) -> Fields {
    let mut data: Fields = lead.into_iter().filter(|(_, v)| !v.is_null()).collect();
    data.insert("id".into(), Value::String(id.to_string()));

    let status_ok = data
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s.parse::<LeadStatus>().is_ok())
        .unwrap_or(false);
    if !status_ok {
        data.insert("status".into(), json!(LeadStatus::Waiting.as_str()));
    }

    fill_if_blank(&mut data, "name", UNNAMED_BUSINESS);
    fill_if_blank(&mut data, "address", ADDRESS_UNAVAILABLE);
    fill_if_blank(&mut data, "category", DEFAULT_CATEGORY);
    fill_if_blank(&mut data, "city", UNKNOWN_CITY);
    fill_if_blank(&mut data, "createdAt", &now.to_rfc3339());
    data
}

fn fill_if_blank(data: &mut Fields, key: &str, default: &str) {
    let blank = match data.get(key) {
        None => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    };
    if blank {
        data.insert(key.to_string(), json!(default));
    }
}
