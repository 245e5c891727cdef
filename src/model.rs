use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category every entry falls back to. It can never be removed.
pub const DEFAULT_CATEGORY: &str = "General";

/// Category list written when the settings document does not exist yet.
pub const INITIAL_CATEGORIES: [&str; 3] = [DEFAULT_CATEGORY, "VIP", "Follow-up"];

/// A business as returned by the places search, normalized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Business {
    #[serde(default, deserialize_with = "coerce_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_count: u32,
    #[serde(default)]
    pub maps_url: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LeadStatus {
    #[default]
    Waiting,
    Stopped,
    Completed,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 3] = [LeadStatus::Waiting, LeadStatus::Stopped, LeadStatus::Completed];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Waiting => "waiting",
            LeadStatus::Stopped => "stopped",
            LeadStatus::Completed => "completed",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LeadStatus::Waiting => "Waiting for reply",
            LeadStatus::Stopped => "No further follow-up",
            LeadStatus::Completed => "Completed",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown status '{}' (expected waiting, stopped or completed)", s))
    }
}

/// A reviewed business as stored in the `reviewed_leads` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewedEntry {
    #[serde(flatten)]
    pub business: Business,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub status: LeadStatus,
    /// The Unix epoch when the document has no timestamp.
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
}

impl ReviewedEntry {
    pub fn new(
        business: Business,
        category: &str,
        city: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            business,
            category: category.to_string(),
            status: LeadStatus::Waiting,
            created_at,
            city: city
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        }
    }

    pub fn id(&self) -> &str {
        &self.business.id
    }
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Accept string or numeric identifiers and turn them into a stable string
/// key. `null` and missing values become the empty string.
pub fn coerce_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(s)) => s.trim().to_string(),
        Some(RawId::Int(n)) => n.to_string(),
        Some(RawId::Float(f)) => f.to_string(),
        None => String::new(),
    })
}

/// Same coercion applied to an untyped JSON value.
pub fn id_from_value(value: &serde_json::Value) -> Option<String> {
    let id = match value {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_ids_are_coerced_to_strings() {
        let b: Business = serde_json::from_value(json!({
            "id": 12345,
            "name": "Cafe",
            "address": "Main St"
        }))
        .unwrap();
        assert_eq!(b.id, "12345");
        assert_eq!(b.rating_count, 0);
        assert!(b.phone.is_none());

        let b: Business = serde_json::from_value(json!({
            "id": null,
            "name": "Cafe",
            "address": "Main St"
        }))
        .unwrap();
        assert_eq!(b.id, "");
    }

    #[test]
    fn entry_defaults_category_and_status() {
        let entry: ReviewedEntry = serde_json::from_value(json!({
            "id": "p1",
            "name": "Cafe",
            "address": "Main St",
            "createdAt": "2026-01-02T03:04:05.000Z"
        }))
        .unwrap();
        assert_eq!(entry.category, DEFAULT_CATEGORY);
        assert_eq!(entry.status, LeadStatus::Waiting);
        assert_eq!(entry.id(), "p1");
        assert!(entry.city.is_none());
    }

    #[test]
    fn entry_serializes_camel_case_flat() {
        let business = Business {
            id: "p1".into(),
            name: "Cafe".into(),
            address: "Main St".into(),
            phone: None,
            rating: Some(4.5),
            rating_count: 10,
            maps_url: None,
            photo_url: None,
        };
        let entry = ReviewedEntry::new(business, "VIP", Some(" Lima "), Utc::now());
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], "p1");
        assert_eq!(value["ratingCount"], 10);
        assert_eq!(value["category"], "VIP");
        assert_eq!(value["status"], "waiting");
        assert_eq!(value["city"], "Lima");
        assert!(value.get("createdAt").is_some());
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Completed".parse::<LeadStatus>(), Ok(LeadStatus::Completed));
        assert_eq!(" stopped ".parse::<LeadStatus>(), Ok(LeadStatus::Stopped));
        assert!("done".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn id_from_value_handles_numbers_and_blanks() {
        assert_eq!(id_from_value(&json!(7)), Some("7".to_string()));
        assert_eq!(id_from_value(&json!(" abc ")), Some("abc".to_string()));
        assert_eq!(id_from_value(&json!("")), None);
        assert_eq!(id_from_value(&json!(null)), None);
    }
}
