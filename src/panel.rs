//! Filters behind the reviewed panel and the management view.

use std::collections::BTreeMap;

use crate::model::ReviewedEntry;

/// Active filters; `None` or blank means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub category: Option<String>,
    pub city: Option<String>,
    /// Case-insensitive match against name or address.
    pub query: Option<String>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &ReviewedEntry) -> bool {
        if let Some(category) = non_blank(&self.category) {
            if entry.category != category {
                return false;
            }
        }
        if let Some(city) = non_blank(&self.city) {
            if entry.city.as_deref() != Some(city) {
                return false;
            }
        }
        if let Some(query) = non_blank(&self.query) {
            let query = query.to_lowercase();
            let in_name = entry.business.name.to_lowercase().contains(&query);
            let in_address = entry.business.address.to_lowercase().contains(&query);
            if !in_name && !in_address {
                return false;
            }
        }
        true
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn filter_entries<'a>(entries: &'a [ReviewedEntry], filter: &EntryFilter) -> Vec<&'a ReviewedEntry> {
    entries.iter().filter(|e| filter.matches(e)).collect()
}

/// Distinct non-blank cities in first-seen order.
pub fn cities(entries: &[ReviewedEntry]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for city in entries.iter().filter_map(|e| e.city.as_deref()) {
        if !city.trim().is_empty() && !out.iter().any(|c| c == city) {
            out.push(city.to_string());
        }
    }
    out
}

/// Categories whose name contains `needle`, ignoring case.
pub fn match_categories<'a>(categories: &'a [String], needle: &str) -> Vec<&'a String> {
    let needle = needle.trim().to_lowercase();
    categories
        .iter()
        .filter(|c| needle.is_empty() || c.to_lowercase().contains(&needle))
        .collect()
}

pub fn count_by_category(entries: &[ReviewedEntry]) -> BTreeMap<&str, usize> {
    let mut counts = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.category.as_str()).or_insert(0) += 1;
    }
    counts
}
