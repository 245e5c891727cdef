//! Monthly search counter with a cost estimate against the places API tiers.
//!
//! The month rolls over lazily: every access compares the stored month with
//! the clock and resets the count when they differ.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::local::{LocalStore, LocalStoreError};

pub const SEARCH_COUNT_KEY: &str = "search_count";

/// Thresholds of the cost display. Not enforced anywhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsageLimits {
    pub free_tier_limit: u64,
    pub credit_limit: u64,
    pub cost_per_search_usd: f64,
    pub credit_usd: f64,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            free_tier_limit: 5000,
            credit_limit: 6250,
            cost_per_search_usd: 0.032,
            credit_usd: 200.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Safe,
    Warning,
    Danger,
}

impl fmt::Display for UsageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UsageStatus::Safe => "safe",
            UsageStatus::Warning => "warning",
            UsageStatus::Danger => "danger",
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageStats {
    pub count: u64,
    pub free_tier_remaining: u64,
    pub percentage_of_free_tier: f64,
    pub percentage_of_credit: f64,
    pub status: UsageStatus,
    pub estimated_cost: f64,
    pub remaining_credit: f64,
    pub is_over_free_tier: bool,
    pub is_over_credit: bool,
}

impl UsageLimits {
    pub fn stats(&self, count: u64) -> UsageStats {
        let status = if count >= self.credit_limit {
            UsageStatus::Danger
        } else if count >= self.free_tier_limit {
            UsageStatus::Warning
        } else {
            UsageStatus::Safe
        };
        let billable = count.saturating_sub(self.free_tier_limit) as f64;
        let estimated_cost = (billable * self.cost_per_search_usd).max(0.0);

        UsageStats {
            count,
            free_tier_remaining: self.free_tier_limit.saturating_sub(count),
            percentage_of_free_tier: percentage(count, self.free_tier_limit),
            percentage_of_credit: percentage(count, self.credit_limit),
            status,
            estimated_cost,
            remaining_credit: (self.credit_usd - estimated_cost).max(0.0),
            is_over_free_tier: count > self.free_tier_limit,
            is_over_credit: count > self.credit_limit,
        }
    }
}

fn percentage(count: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    count as f64 / limit as f64 * 100.0
}

/// Source of the current calendar date.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct CounterRecord {
    month: String,
    count: u64,
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[derive(Clone)]
pub struct UsageCounter {
    store: LocalStore,
    limits: UsageLimits,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for UsageCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageCounter")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl UsageCounter {
    pub fn new(store: LocalStore, limits: UsageLimits) -> Self {
        Self::with_clock(store, limits, Arc::new(SystemClock))
    }

    pub fn with_clock(store: LocalStore, limits: UsageLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> &UsageLimits {
        &self.limits
    }

    /// Record for the current month, resetting it first if the month changed.
    fn current(&self) -> Result<CounterRecord, LocalStoreError> {
        let month = month_key(self.clock.today());
        let stored = match self.store.get::<CounterRecord>(SEARCH_COUNT_KEY) {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, "unreadable search counter; starting from zero");
                None
            }
        };
        match stored {
            Some(record) if record.month == month => Ok(record),
            previous => {
                if let Some(previous) = previous {
                    info!(from = %previous.month, to = %month, "search counter rolled over");
                }
                let record = CounterRecord { month, count: 0 };
                self.store.set(SEARCH_COUNT_KEY, &record)?;
                Ok(record)
            }
        }
    }

    pub fn count(&self) -> Result<u64, LocalStoreError> {
        Ok(self.current()?.count)
    }

    /// Add one search to the current month and return the new total.
    pub fn increment(&self) -> Result<u64, LocalStoreError> {
        let mut record = self.current()?;
        record.count += 1;
        self.store.set(SEARCH_COUNT_KEY, &record)?;
        Ok(record.count)
    }

    pub fn reset(&self) -> Result<(), LocalStoreError> {
        let record = CounterRecord {
            month: month_key(self.clock.today()),
            count: 0,
        };
        self.store.set(SEARCH_COUNT_KEY, &record)
    }

    pub fn stats(&self) -> Result<UsageStats, LocalStoreError> {
        Ok(self.limits.stats(self.count()?))
    }
}
