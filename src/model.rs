//! # Domain Model
//! Core records shared across the orchestration pipeline: queued interactions,
//! execution log entries, approval entries and per-variant outcome counters.
//!
//! These are plain serde types. All state transitions on them happen through
//! the stores (see `store`), which enforce atomic conditional updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a queued interaction.
///
/// `Done` is terminal; an item is never mutated after reaching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Processing,
    NeedsReview,
    Done,
}

/// A single externally-sourced interaction (comment, mention) waiting for the
/// rule engine. Created by the polling loop, keyed by the external item id so
/// repeated polls never enqueue duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// External item id (unique per source platform).
    pub id: String,
    /// Owning channel / connected source.
    pub scope_id: String,
    /// Id of the parent content (post, video) the interaction belongs to.
    pub parent_id: String,
    /// Normalized text of the interaction.
    pub text: String,
    /// Classifier label, if classification ran at ingest time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// Author standing on the platform (e.g. "subscriber", "new", "blocked").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_status: Option<String>,
    pub status: ItemStatus,
    /// Higher = more urgent. Ingested items start at 0.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// A tenant-owned source of interactions (one connected channel).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub id: String,
    pub polling_enabled: bool,
    pub poll_interval_minutes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl Scope {
    pub fn new(id: impl Into<String>, poll_interval_minutes: i64) -> Self {
        Self {
            id: id.into(),
            polling_enabled: true,
            poll_interval_minutes,
            last_polled_at: None,
        }
    }
}

/// Outcome bucket of one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The action went through (counts toward the per-run cap).
    Executed,
    /// Admission control denied the action for this minute window.
    RateLimited,
    /// A deliberate policy outcome (safety gate said no, or the item was
    /// already claimed by a racing worker). Not an error.
    Declined,
    /// Downstream dispatch failed; the error is in `detail`.
    Failed,
}

/// Append-only log entry, one per executor invocation regardless of outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub item_id: String,
    pub scope_id: String,
    /// Action kind as a stable string ("respond" | "delete" | "flag").
    pub action: String,
    /// Chosen variant as `testId::variantId`, respond actions only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub status: ExecutionStatus,
    /// Free-form context: rendered text, decline reason, dispatch error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
    pub ts: DateTime<Utc>,
}

/// Lifecycle of a pending human decision. Terminal states are one-way; an
/// entry transitions out of `Pending` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    AutoApproved,
    Rejected,
}

/// A proposed action awaiting human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub id: u64,
    pub scope_id: String,
    /// Link back to the response/action this entry gates (item id for us).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_ref: Option<String>,
    /// The proposed action as JSON (action kind, text, variant, ...).
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    /// When set, the sweep auto-approves the entry once this passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_approve_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Priority at or above the configured urgent threshold.
    pub urgent: bool,
}

/// Per-(rule, test, variant) aggregate counters read by the significance
/// engine. Accumulated incrementally; never decremented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutcomeMetric {
    pub impressions: u64,
    pub conversions: u64,
    /// Sampled continuous engagement values (likes, watch seconds, ...).
    pub engagement: Vec<f64>,
}

impl OutcomeMetric {
    /// Sample count used for eligibility checks: impressions when the variant
    /// collects click data, otherwise the number of engagement samples.
    pub fn samples(&self) -> u64 {
        if self.impressions > 0 {
            self.impressions
        } else {
            self.engagement.len() as u64
        }
    }

    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.conversions as f64 / self.impressions as f64
        }
    }

    pub fn mean_engagement(&self) -> f64 {
        if self.engagement.is_empty() {
            return 0.0;
        }
        self.engagement.iter().sum::<f64>() / self.engagement.len() as f64
    }

    /// Population variance of the engagement samples.
    pub fn engagement_variance(&self) -> f64 {
        let n = self.engagement.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean_engagement();
        self.engagement.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64
    }
}

/// Dated outcome signal kept alongside the aggregates so analytics can build
/// day-over-day series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub ts: DateTime<Utc>,
    pub rule_id: String,
    pub test_id: String,
    pub variant_id: String,
    pub kind: OutcomeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Impression,
    Conversion,
    Engagement(f64),
}
