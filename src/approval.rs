//! # Approval Queue
//! Durable priority queue for actions that need human sign-off.
//!
//! Entries go `pending -> {approved | auto_approved | rejected}` exactly once;
//! the store enforces the compare-and-swap. Urgent entries (priority at or
//! above the configured threshold) trigger a notification side effect on
//! enqueue. A periodic sweep auto-approves entries whose deadline passed,
//! independently of the automation cycle tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;

use crate::model::ApprovalEntry;
use crate::notify::NotificationSink;
use crate::store::{ApprovalStore, NewApproval};

pub struct ApprovalQueue {
    store: Arc<dyn ApprovalStore>,
    sink: Arc<dyn NotificationSink>,
    urgent_threshold: i32,
}

impl ApprovalQueue {
    pub fn new(
        store: Arc<dyn ApprovalStore>,
        sink: Arc<dyn NotificationSink>,
        urgent_threshold: i32,
    ) -> Self {
        Self {
            store,
            sink,
            urgent_threshold,
        }
    }

    /// Enqueue a proposed action. Urgency is derived from priority; urgent
    /// entries fire the notification sink (best-effort, fire-and-forget).
    pub async fn add_to_queue(
        &self,
        scope_id: &str,
        response_ref: Option<String>,
        payload: serde_json::Value,
        priority: i32,
        auto_approve_after: Option<DateTime<Utc>>,
    ) -> ApprovalEntry {
        let urgent = priority >= self.urgent_threshold;
        let entry = self.store.add(
            NewApproval {
                scope_id: scope_id.to_string(),
                response_ref,
                payload,
                priority,
                auto_approve_after,
                urgent,
            },
            Utc::now(),
        );
        counter!("approval_enqueued_total").increment(1);
        tracing::debug!(
            target: "approval",
            id = entry.id,
            scope = scope_id,
            priority,
            urgent,
            "approval queued"
        );
        if urgent {
            self.sink.notify_urgent(std::slice::from_ref(&entry)).await;
        }
        entry
    }

    /// Pending entries, priority desc then oldest first, optionally scoped.
    pub fn pending(&self, scope_id: Option<&str>, limit: usize) -> Vec<ApprovalEntry> {
        self.store.pending(scope_id, limit)
    }

    /// Approve every matching pending entry, recording the approver. Each
    /// approved entry emits one feedback/learning event; a failed feedback
    /// emit never fails the approval itself. Returns how many transitioned.
    pub async fn bulk_approve(
        &self,
        ids: &[u64],
        approved_by: &str,
        reason: Option<&str>,
    ) -> usize {
        let now = Utc::now();
        let mut approved = 0usize;
        for &id in ids {
            let Some(entry) = self.store.approve_pending(id, approved_by, reason, now) else {
                continue;
            };
            approved += 1;
            counter!("approval_approved_total").increment(1);
            self.emit_feedback(&entry);
        }
        approved
    }

    /// Reject one pending entry. Terminal, like approval.
    pub fn reject(&self, id: u64, rejected_by: &str, reason: Option<&str>) -> bool {
        let rejected = self
            .store
            .reject_pending(id, rejected_by, reason, Utc::now())
            .is_some();
        if rejected {
            counter!("approval_rejected_total").increment(1);
        }
        rejected
    }

    /// Transition every pending entry past its deadline to `auto_approved`.
    /// Idempotent; intended to run on its own periodic tick.
    pub fn auto_approve_expired(&self, now: DateTime<Utc>) -> usize {
        let entries = self.store.auto_approve_due(now);
        if !entries.is_empty() {
            counter!("approval_auto_approved_total").increment(entries.len() as u64);
            tracing::info!(
                target: "approval",
                count = entries.len(),
                "auto-approved expired entries"
            );
        }
        entries.len()
    }

    /// Learning signal consumed by the reweighting loop's upstream tooling.
    /// Log-only here; a real deployment can tee this into its event bus.
    fn emit_feedback(&self, entry: &ApprovalEntry) {
        counter!("approval_feedback_events_total").increment(1);
        tracing::debug!(
            target: "approval",
            id = entry.id,
            scope = %entry.scope_id,
            approved_by = entry.approved_by.as_deref().unwrap_or(""),
            "approval feedback event"
        );
    }
}
