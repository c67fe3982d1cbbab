//! # Stores
//! Persistence seams for the orchestration engine, as traits so the in-memory
//! implementations here can be swapped for database-backed ones without
//! touching the loops.
//!
//! Every status transition is an atomic conditional update: the store compares
//! the current status under its lock and only then writes. Two workers racing
//! on the same record cannot both win; the loser observes `false`/`None` and
//! moves on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::model::{
    ApprovalEntry, ApprovalStatus, ExecutionRecord, ItemStatus, OutcomeEvent, OutcomeKind,
    OutcomeMetric, QueuedItem, Scope,
};
use crate::rules::Rule;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ItemStore: Send + Sync {
    /// Idempotent insert keyed by the external item id. Returns `true` when
    /// the item was new.
    fn insert_if_absent(&self, item: QueuedItem) -> bool;

    fn get(&self, id: &str) -> Option<QueuedItem>;

    /// Pending items for one scope, ordered by (priority desc, created_at
    /// asc), capped at `limit`.
    fn pending_for_scope(&self, scope_id: &str, limit: usize) -> Vec<QueuedItem>;

    /// Compare-and-swap on status. Returns `true` iff the item existed with
    /// status `from` and was moved to `to`.
    fn transition(&self, item_id: &str, from: ItemStatus, to: ItemStatus) -> bool;
}

pub trait RuleStore: Send + Sync {
    /// Validates and stores the rule, replacing any previous version.
    fn upsert(&self, rule: Rule) -> Result<()>;

    fn get(&self, id: &str) -> Option<Rule>;

    /// Enabled rules for one scope, ordered by priority descending (the
    /// first-match tie-break order).
    fn enabled_for_scope(&self, scope_id: &str) -> Vec<Rule>;

    /// Distinct scope ids that have at least one enabled rule.
    fn scopes_with_enabled_rules(&self) -> Vec<String>;

    /// Overwrite the weights of one test's variants. Variants missing from
    /// `weights` keep their current value. Returns `false` when the rule or
    /// test does not exist.
    fn set_test_weights(&self, rule_id: &str, test_id: &str, weights: &[(String, f64)]) -> bool;
}

/// Fields of a new approval entry; id, status and timestamps are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub scope_id: String,
    pub response_ref: Option<String>,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub auto_approve_after: Option<DateTime<Utc>>,
    pub urgent: bool,
}

pub trait ApprovalStore: Send + Sync {
    fn add(&self, new: NewApproval, now: DateTime<Utc>) -> ApprovalEntry;

    fn get(&self, id: u64) -> Option<ApprovalEntry>;

    /// Pending entries ordered by priority desc, then age asc (oldest first
    /// within a tier), optionally filtered by scope.
    fn pending(&self, scope_id: Option<&str>, limit: usize) -> Vec<ApprovalEntry>;

    /// CAS `pending -> approved`. `None` when the entry is missing or already
    /// terminal.
    fn approve_pending(
        &self,
        id: u64,
        approved_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ApprovalEntry>;

    /// CAS `pending -> rejected`.
    fn reject_pending(
        &self,
        id: u64,
        rejected_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ApprovalEntry>;

    /// Transition every pending entry whose deadline has passed to
    /// `auto_approved` and return them. Safe to call repeatedly; entries that
    /// already transitioned are not selected again.
    fn auto_approve_due(&self, now: DateTime<Utc>) -> Vec<ApprovalEntry>;
}

pub trait ExecutionLog: Send + Sync {
    fn append(&self, record: ExecutionRecord);
    fn records_since(&self, since: DateTime<Utc>) -> Vec<ExecutionRecord>;
    fn all(&self) -> Vec<ExecutionRecord>;
}

pub trait MetricStore: Send + Sync {
    fn record_impression(&self, rule_id: &str, test_id: &str, variant_id: &str, ts: DateTime<Utc>);
    fn record_conversion(&self, rule_id: &str, test_id: &str, variant_id: &str, ts: DateTime<Utc>);
    fn record_engagement(
        &self,
        rule_id: &str,
        test_id: &str,
        variant_id: &str,
        value: f64,
        ts: DateTime<Utc>,
    );

    /// Test ids with any recorded outcome for the rule.
    fn test_ids(&self, rule_id: &str) -> Vec<String>;

    /// Aggregates per variant for one test, ordered by variant id.
    fn variant_totals(&self, rule_id: &str, test_id: &str) -> Vec<(String, OutcomeMetric)>;

    /// Dated raw events for day-over-day analytics.
    fn events_since(&self, since: DateTime<Utc>) -> Vec<OutcomeEvent>;
}

pub trait ScopeStore: Send + Sync {
    fn upsert(&self, scope: Scope);
    fn get(&self, id: &str) -> Option<Scope>;
    fn polling_enabled(&self) -> Vec<Scope>;
    fn set_last_polled(&self, id: &str, ts: DateTime<Utc>) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// Mutex-guarded item map for single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryItems {
    inner: Mutex<BTreeMap<String, QueuedItem>>,
}

impl InMemoryItems {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ItemStore for InMemoryItems {
    fn insert_if_absent(&self, item: QueuedItem) -> bool {
        let mut map = self.inner.lock().expect("item store mutex poisoned");
        if map.contains_key(&item.id) {
            return false;
        }
        map.insert(item.id.clone(), item);
        true
    }

    fn get(&self, id: &str) -> Option<QueuedItem> {
        self.inner
            .lock()
            .expect("item store mutex poisoned")
            .get(id)
            .cloned()
    }

    fn pending_for_scope(&self, scope_id: &str, limit: usize) -> Vec<QueuedItem> {
        let map = self.inner.lock().expect("item store mutex poisoned");
        let mut out: Vec<QueuedItem> = map
            .values()
            .filter(|i| i.scope_id == scope_id && i.status == ItemStatus::Pending)
            .cloned()
            .collect();
        // priority desc, created asc; id as a final deterministic tie-break
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        out.truncate(limit);
        out
    }

    fn transition(&self, item_id: &str, from: ItemStatus, to: ItemStatus) -> bool {
        let mut map = self.inner.lock().expect("item store mutex poisoned");
        match map.get_mut(item_id) {
            Some(item) if item.status == from => {
                item.status = to;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRules {
    inner: Mutex<BTreeMap<String, Rule>>,
}

impl InMemoryRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for seeding from a validated rule file.
    pub fn with_rules(rules: Vec<Rule>) -> Result<Self> {
        let store = Self::new();
        for rule in rules {
            store.upsert(rule)?;
        }
        Ok(store)
    }
}

impl RuleStore for InMemoryRules {
    fn upsert(&self, rule: Rule) -> Result<()> {
        rule.validate()?;
        self.inner
            .lock()
            .expect("rule store mutex poisoned")
            .insert(rule.id.clone(), rule);
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Rule> {
        self.inner
            .lock()
            .expect("rule store mutex poisoned")
            .get(id)
            .cloned()
    }

    fn enabled_for_scope(&self, scope_id: &str) -> Vec<Rule> {
        let map = self.inner.lock().expect("rule store mutex poisoned");
        let mut out: Vec<Rule> = map
            .values()
            .filter(|r| r.enabled && r.scope_id == scope_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        out
    }

    fn scopes_with_enabled_rules(&self) -> Vec<String> {
        let map = self.inner.lock().expect("rule store mutex poisoned");
        let mut scopes: Vec<String> = map
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.scope_id.clone())
            .collect();
        scopes.sort();
        scopes.dedup();
        scopes
    }

    fn set_test_weights(&self, rule_id: &str, test_id: &str, weights: &[(String, f64)]) -> bool {
        let mut map = self.inner.lock().expect("rule store mutex poisoned");
        let Some(rule) = map.get_mut(rule_id) else {
            return false;
        };
        let Some(test) = rule.ab_tests.get_mut(test_id) else {
            return false;
        };
        let lookup: HashMap<&str, f64> = weights.iter().map(|(id, w)| (id.as_str(), *w)).collect();
        for variant in &mut test.variants {
            if let Some(w) = lookup.get(variant.id.as_str()) {
                variant.weight = w.max(0.0);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct ApprovalsInner {
    next_id: u64,
    entries: BTreeMap<u64, ApprovalEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryApprovals {
    inner: Mutex<ApprovalsInner>,
}

impl InMemoryApprovals {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for InMemoryApprovals {
    fn add(&self, new: NewApproval, now: DateTime<Utc>) -> ApprovalEntry {
        let mut inner = self.inner.lock().expect("approval store mutex poisoned");
        inner.next_id += 1;
        let entry = ApprovalEntry {
            id: inner.next_id,
            scope_id: new.scope_id,
            response_ref: new.response_ref,
            payload: new.payload,
            priority: new.priority,
            status: ApprovalStatus::Pending,
            created_at: now,
            auto_approve_after: new.auto_approve_after,
            approved_by: None,
            approved_at: None,
            reason: None,
            urgent: new.urgent,
        };
        inner.entries.insert(entry.id, entry.clone());
        entry
    }

    fn get(&self, id: u64) -> Option<ApprovalEntry> {
        self.inner
            .lock()
            .expect("approval store mutex poisoned")
            .entries
            .get(&id)
            .cloned()
    }

    fn pending(&self, scope_id: Option<&str>, limit: usize) -> Vec<ApprovalEntry> {
        let inner = self.inner.lock().expect("approval store mutex poisoned");
        let mut out: Vec<ApprovalEntry> = inner
            .entries
            .values()
            .filter(|e| e.status == ApprovalStatus::Pending)
            .filter(|e| scope_id.is_none_or(|s| e.scope_id == s))
            .cloned()
            .collect();
        // Urgent items surface first; within a tier the oldest goes first so
        // low-priority entries cannot starve.
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        out.truncate(limit);
        out
    }

    fn approve_pending(
        &self,
        id: u64,
        approved_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ApprovalEntry> {
        let mut inner = self.inner.lock().expect("approval store mutex poisoned");
        let entry = inner.entries.get_mut(&id)?;
        if entry.status != ApprovalStatus::Pending {
            return None;
        }
        entry.status = ApprovalStatus::Approved;
        entry.approved_by = Some(approved_by.to_string());
        entry.approved_at = Some(now);
        entry.reason = reason.map(str::to_string);
        Some(entry.clone())
    }

    fn reject_pending(
        &self,
        id: u64,
        rejected_by: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ApprovalEntry> {
        let mut inner = self.inner.lock().expect("approval store mutex poisoned");
        let entry = inner.entries.get_mut(&id)?;
        if entry.status != ApprovalStatus::Pending {
            return None;
        }
        entry.status = ApprovalStatus::Rejected;
        entry.approved_by = Some(rejected_by.to_string());
        entry.approved_at = Some(now);
        entry.reason = reason.map(str::to_string);
        Some(entry.clone())
    }

    fn auto_approve_due(&self, now: DateTime<Utc>) -> Vec<ApprovalEntry> {
        let mut inner = self.inner.lock().expect("approval store mutex poisoned");
        let mut out = Vec::new();
        for entry in inner.entries.values_mut() {
            if entry.status != ApprovalStatus::Pending {
                continue;
            }
            let Some(deadline) = entry.auto_approve_after else {
                continue;
            };
            if deadline <= now {
                entry.status = ApprovalStatus::AutoApproved;
                entry.approved_at = Some(now);
                out.push(entry.clone());
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionLog {
    inner: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionLog for InMemoryExecutionLog {
    fn append(&self, record: ExecutionRecord) {
        self.inner
            .lock()
            .expect("execution log mutex poisoned")
            .push(record);
    }

    fn records_since(&self, since: DateTime<Utc>) -> Vec<ExecutionRecord> {
        self.inner
            .lock()
            .expect("execution log mutex poisoned")
            .iter()
            .filter(|r| r.ts >= since)
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<ExecutionRecord> {
        self.inner
            .lock()
            .expect("execution log mutex poisoned")
            .clone()
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// (rule, test, variant) -> running totals.
    totals: BTreeMap<(String, String, String), OutcomeMetric>,
    events: Vec<OutcomeEvent>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsInner>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &self,
        rule_id: &str,
        test_id: &str,
        variant_id: &str,
        kind: OutcomeKind,
        ts: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock().expect("metric store mutex poisoned");
        let key = (
            rule_id.to_string(),
            test_id.to_string(),
            variant_id.to_string(),
        );
        let metric = inner.totals.entry(key).or_default();
        match kind {
            OutcomeKind::Impression => metric.impressions += 1,
            OutcomeKind::Conversion => metric.conversions += 1,
            OutcomeKind::Engagement(v) => metric.engagement.push(v),
        }
        inner.events.push(OutcomeEvent {
            ts,
            rule_id: rule_id.to_string(),
            test_id: test_id.to_string(),
            variant_id: variant_id.to_string(),
            kind,
        });
    }
}

impl MetricStore for InMemoryMetrics {
    fn record_impression(&self, rule_id: &str, test_id: &str, variant_id: &str, ts: DateTime<Utc>) {
        self.record(rule_id, test_id, variant_id, OutcomeKind::Impression, ts);
    }

    fn record_conversion(&self, rule_id: &str, test_id: &str, variant_id: &str, ts: DateTime<Utc>) {
        self.record(rule_id, test_id, variant_id, OutcomeKind::Conversion, ts);
    }

    fn record_engagement(
        &self,
        rule_id: &str,
        test_id: &str,
        variant_id: &str,
        value: f64,
        ts: DateTime<Utc>,
    ) {
        self.record(
            rule_id,
            test_id,
            variant_id,
            OutcomeKind::Engagement(value),
            ts,
        );
    }

    fn test_ids(&self, rule_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("metric store mutex poisoned");
        let mut out: Vec<String> = inner
            .totals
            .keys()
            .filter(|(r, _, _)| r == rule_id)
            .map(|(_, t, _)| t.clone())
            .collect();
        out.dedup();
        out
    }

    fn variant_totals(&self, rule_id: &str, test_id: &str) -> Vec<(String, OutcomeMetric)> {
        let inner = self.inner.lock().expect("metric store mutex poisoned");
        inner
            .totals
            .iter()
            .filter(|((r, t, _), _)| r == rule_id && t == test_id)
            .map(|((_, _, v), m)| (v.clone(), m.clone()))
            .collect()
    }

    fn events_since(&self, since: DateTime<Utc>) -> Vec<OutcomeEvent> {
        let inner = self.inner.lock().expect("metric store mutex poisoned");
        inner
            .events
            .iter()
            .filter(|e| e.ts >= since)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryScopes {
    inner: Mutex<BTreeMap<String, Scope>>,
}

impl InMemoryScopes {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScopeStore for InMemoryScopes {
    fn upsert(&self, scope: Scope) {
        self.inner
            .lock()
            .expect("scope store mutex poisoned")
            .insert(scope.id.clone(), scope);
    }

    fn get(&self, id: &str) -> Option<Scope> {
        self.inner
            .lock()
            .expect("scope store mutex poisoned")
            .get(id)
            .cloned()
    }

    fn polling_enabled(&self) -> Vec<Scope> {
        self.inner
            .lock()
            .expect("scope store mutex poisoned")
            .values()
            .filter(|s| s.polling_enabled)
            .cloned()
            .collect()
    }

    fn set_last_polled(&self, id: &str, ts: DateTime<Utc>) -> bool {
        let mut map = self.inner.lock().expect("scope store mutex poisoned");
        match map.get_mut(id) {
            Some(scope) => {
                scope.last_polled_at = Some(ts);
                true
            }
            None => false,
        }
    }
}
