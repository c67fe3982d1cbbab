//! # Action Executor
//! Runs one matched (rule, item) pair through admission control, human-like
//! pacing, variant selection, rendering, safety gating and dispatch, and
//! always writes exactly one execution record for the attempt.
//!
//! Dispatch errors never escape: they come back as a `Failed` outcome so the
//! engine can move on to the next item.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{Duration, Utc};
use metrics::{counter, histogram};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::approval::ApprovalQueue;
use crate::config::{EngineConfig, PacingConfig, RateLimitConfig};
use crate::connector::{SafetyModeration, SourceConnector, TemplateRenderer};
use crate::model::{ExecutionRecord, ExecutionStatus, ItemStatus, QueuedItem};
use crate::ratelimit::RateLimiter;
use crate::rules::{ActionConfig, ActionKind, Rule};
use crate::selector::VariantSelector;
use crate::store::{ExecutionLog, ItemStore, MetricStore};

/// Executor outcome; only `Executed` counts toward the per-run cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Executed,
    RateLimited,
    Declined,
    Failed,
}

impl ExecOutcome {
    fn status(self) -> ExecutionStatus {
        match self {
            ExecOutcome::Executed => ExecutionStatus::Executed,
            ExecOutcome::RateLimited => ExecutionStatus::RateLimited,
            ExecOutcome::Declined => ExecutionStatus::Declined,
            ExecOutcome::Failed => ExecutionStatus::Failed,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ExecOutcome::Executed => "executed",
            ExecOutcome::RateLimited => "rate_limited",
            ExecOutcome::Declined => "declined",
            ExecOutcome::Failed => "failed",
        }
    }
}

/// Shared collaborators and stores the executor works against.
pub struct ExecutorParts {
    pub items: Arc<dyn ItemStore>,
    pub log: Arc<dyn ExecutionLog>,
    pub metrics: Arc<dyn MetricStore>,
    pub limiter: Arc<dyn RateLimiter>,
    pub selector: Arc<VariantSelector>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub safety: Arc<dyn SafetyModeration>,
    pub connector: Arc<dyn SourceConnector>,
    pub approvals: Arc<ApprovalQueue>,
}

pub struct ActionExecutor {
    parts: ExecutorParts,
    rate_limits: RateLimitConfig,
    pacing: PacingConfig,
    auto_approve_minutes: Option<i64>,
    pacing_rng: Mutex<StdRng>,
}

impl ActionExecutor {
    pub fn new(parts: ExecutorParts, cfg: &EngineConfig) -> Self {
        Self {
            parts,
            rate_limits: cfg.rate_limits,
            pacing: cfg.pacing,
            auto_approve_minutes: cfg.engine.auto_approve_minutes,
            pacing_rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic pacing jitter for tests.
    pub fn with_seeded_pacing(mut self, seed: u64) -> Self {
        self.pacing_rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Run the matched rule against the item. Exactly one execution record is
    /// written no matter which branch exits.
    pub async fn execute(&self, rule: &Rule, item: &QueuedItem) -> ExecOutcome {
        let started = Instant::now();
        let kind = rule.action.kind();

        // 1) Admission: per-scope, per-action minute window.
        let rate_key = format!("{}:{}", item.scope_id, kind.as_str());
        let ceiling = self.rate_limits.ceiling_for(kind);
        if !self.parts.limiter.allow(&rate_key, ceiling) {
            tracing::debug!(
                target: "executor",
                scope = %item.scope_id,
                action = kind.as_str(),
                ceiling,
                "admission denied for this minute window"
            );
            return self.finish(
                rule,
                item,
                kind,
                None,
                ExecOutcome::RateLimited,
                Some("admission denied".into()),
                started,
            );
        }

        // 2) Human-like pacing. The draw happens under the lock, the sleep
        // does not, so other scopes keep executing while we wait.
        if let Some((lo, hi)) = self.pacing.range_for(kind) {
            let secs = {
                let mut rng = self.pacing_rng.lock().expect("pacing rng mutex poisoned");
                rng.random_range(lo..=hi)
            };
            tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
        }

        match &rule.action {
            ActionConfig::Respond(cfg) => self.execute_respond(rule, item, cfg, started).await,
            ActionConfig::Delete(cfg) => self.execute_delete(rule, item, cfg, started).await,
            ActionConfig::Flag(_) => self.execute_flag(rule, item, started),
        }
    }

    async fn execute_respond(
        &self,
        rule: &Rule,
        item: &QueuedItem,
        cfg: &crate::rules::RespondConfig,
        started: Instant,
    ) -> ExecOutcome {
        // 3) Variant selection.
        let selection = self.parts.selector.select(rule, None);
        let (test_id, variant_id) = selection
            .split_once("::")
            .unwrap_or(("default", "A"));

        // 4) Template: the variant's own ref wins, then the action default.
        let variant_template = rule
            .ab_tests
            .get(test_id)
            .and_then(|t| t.variants.iter().find(|v| v.id == variant_id))
            .and_then(|v| v.template.clone());
        let template_ref = variant_template
            .or_else(|| cfg.template.clone())
            .unwrap_or_else(|| "default".to_string());

        let text = match self.parts.renderer.render(&template_ref, item).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(
                    target: "executor",
                    item = %item.id,
                    template = %template_ref,
                    error = ?e,
                    "template render failed"
                );
                return self.finish(
                    rule,
                    item,
                    ActionKind::Respond,
                    Some(selection),
                    ExecOutcome::Failed,
                    Some(format!("render: {e:#}")),
                    started,
                );
            }
        };

        // 6) Dispatch: generation is decoupled from publication. The text
        // goes to the approval path when the rule demands sign-off;
        // otherwise the downstream poster picks it up off the item marked
        // `processing` by the engine.
        if rule.require_approval {
            let deadline = self
                .auto_approve_minutes
                .map(|m| Utc::now() + Duration::minutes(m));
            let payload = serde_json::json!({
                "action": "respond",
                "rule_id": rule.id,
                "item_id": item.id,
                "scope_id": item.scope_id,
                "variant": selection.clone(),
                "text": text.clone(),
            });
            self.parts
                .approvals
                .add_to_queue(
                    &item.scope_id,
                    Some(item.id.clone()),
                    payload,
                    item.priority,
                    deadline,
                )
                .await;
        }

        // 8) Impression against the chosen variant.
        self.parts
            .metrics
            .record_impression(&rule.id, test_id, variant_id, Utc::now());

        self.finish(
            rule,
            item,
            ActionKind::Respond,
            Some(selection),
            ExecOutcome::Executed,
            Some(text),
            started,
        )
    }

    async fn execute_delete(
        &self,
        rule: &Rule,
        item: &QueuedItem,
        cfg: &crate::rules::DeleteConfig,
        started: Instant,
    ) -> ExecOutcome {
        // 5) Safety gate. A negative recommendation is a valid, logged
        // outcome, not an error.
        let evaluation = match self.parts.safety.evaluate_delete_criteria(item, cfg).await {
            Ok(e) => e,
            Err(e) => {
                return self.finish(
                    rule,
                    item,
                    ActionKind::Delete,
                    None,
                    ExecOutcome::Failed,
                    Some(format!("safety evaluation: {e:#}")),
                    started,
                );
            }
        };
        if !evaluation.recommended_delete {
            tracing::info!(
                target: "executor",
                item = %item.id,
                confidence = evaluation.confidence,
                threshold = evaluation.threshold,
                legitimate = evaluation.legitimate,
                reason = %evaluation.reason,
                "delete declined by safety gate"
            );
            return self.finish(
                rule,
                item,
                ActionKind::Delete,
                None,
                ExecOutcome::Declined,
                Some(format!("safety declined: {}", evaluation.reason)),
                started,
            );
        }

        match self
            .parts
            .connector
            .delete_item(&item.scope_id, &item.id)
            .await
        {
            Ok(()) => {
                // Item is finished either way once the platform delete lands.
                self.parts
                    .items
                    .transition(&item.id, ItemStatus::Pending, ItemStatus::Done);
                self.finish(
                    rule,
                    item,
                    ActionKind::Delete,
                    None,
                    ExecOutcome::Executed,
                    Some(format!("deleted: {}", evaluation.reason)),
                    started,
                )
            }
            Err(e) => {
                tracing::warn!(
                    target: "executor",
                    item = %item.id,
                    error = ?e,
                    "platform delete failed"
                );
                self.finish(
                    rule,
                    item,
                    ActionKind::Delete,
                    None,
                    ExecOutcome::Failed,
                    Some(format!("delete: {e:#}")),
                    started,
                )
            }
        }
    }

    fn execute_flag(&self, rule: &Rule, item: &QueuedItem, started: Instant) -> ExecOutcome {
        // A racing worker may have claimed the item already; losing the CAS
        // is a decline, not an error.
        let claimed = self
            .parts
            .items
            .transition(&item.id, ItemStatus::Pending, ItemStatus::NeedsReview);
        if claimed {
            self.finish(
                rule,
                item,
                ActionKind::Flag,
                None,
                ExecOutcome::Executed,
                None,
                started,
            )
        } else {
            self.finish(
                rule,
                item,
                ActionKind::Flag,
                None,
                ExecOutcome::Declined,
                Some("item no longer pending".into()),
                started,
            )
        }
    }

    /// 7) Logging: one record per invocation, every branch.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        rule: &Rule,
        item: &QueuedItem,
        kind: ActionKind,
        variant: Option<String>,
        outcome: ExecOutcome,
        detail: Option<String>,
        started: Instant,
    ) -> ExecOutcome {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.parts.log.append(ExecutionRecord {
            rule_id: Some(rule.id.clone()),
            item_id: item.id.clone(),
            scope_id: item.scope_id.clone(),
            action: kind.as_str().to_string(),
            variant,
            status: outcome.status(),
            detail,
            elapsed_ms,
            ts: Utc::now(),
        });
        counter!(
            "executor_actions_total",
            "action" => kind.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        histogram!("executor_elapsed_ms").record(elapsed_ms as f64);
        outcome
    }
}
