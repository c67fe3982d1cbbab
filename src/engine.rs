//! # Rule Engine
//! Per-tick evaluation of every scope with enabled rules: items in strict
//! (priority desc, created asc) order, rules in strict priority order, first
//! match executes, and a per-run cap bounds how much one scope can do.
//!
//! Scope workers run as independent tasks; a failure (or panic) in one scope
//! never stops the others in the same tick.

use std::sync::Arc;

use chrono::Utc;
use metrics::{counter, gauge};

use crate::executor::{ActionExecutor, ExecOutcome};
use crate::model::ItemStatus;
use crate::rules::{ActionKind, Rule};
use crate::store::{ItemStore, RuleStore};

/// Plan for one scope's run, computed once per tick and passed down instead
/// of being re-derived ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPlan {
    /// Minimum non-zero `response_limit_per_run` across the scope's enabled
    /// rules, or the configured default.
    pub max_responses: u32,
    /// True when any enabled rule may act without human approval.
    pub auto_post_allowed: bool,
}

/// Derive the run plan from the scope's enabled rules.
pub fn plan_for(rules: &[Rule], default_limit: u32) -> RunPlan {
    let max_responses = rules
        .iter()
        .filter_map(|r| r.response_limit_per_run)
        .filter(|l| *l > 0)
        .min()
        .unwrap_or(default_limit);
    let auto_post_allowed = rules.iter().any(|r| !r.require_approval);
    RunPlan {
        max_responses,
        auto_post_allowed,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeRunSummary {
    pub scope_id: String,
    pub fetched: usize,
    pub executed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CycleSummary {
    pub scopes: usize,
    pub executed: u32,
    /// Scope workers that died (panicked or were cancelled) this tick.
    pub failed_scopes: usize,
}

pub struct RuleEngine {
    rules: Arc<dyn RuleStore>,
    items: Arc<dyn ItemStore>,
    executor: Arc<ActionExecutor>,
    default_response_limit: u32,
    max_items_per_run: usize,
}

impl RuleEngine {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        items: Arc<dyn ItemStore>,
        executor: Arc<ActionExecutor>,
        default_response_limit: u32,
        max_items_per_run: usize,
    ) -> Self {
        Self {
            rules,
            items,
            executor,
            default_response_limit,
            max_items_per_run,
        }
    }

    /// One engine run for one scope.
    pub async fn run_scope(&self, scope_id: &str) -> ScopeRunSummary {
        run_scope_inner(
            self.rules.clone(),
            self.items.clone(),
            self.executor.clone(),
            self.default_response_limit,
            self.max_items_per_run,
            scope_id.to_string(),
        )
        .await
    }

    /// One automation tick: every scope with enabled rules, each in its own
    /// task so scopes neither block nor break each other.
    pub async fn run_cycle(&self) -> CycleSummary {
        let scopes = self.rules.scopes_with_enabled_rules();
        let mut summary = CycleSummary {
            scopes: scopes.len(),
            ..Default::default()
        };

        let mut handles = Vec::with_capacity(summary.scopes);
        for scope_id in scopes {
            handles.push(tokio::spawn(run_scope_inner(
                self.rules.clone(),
                self.items.clone(),
                self.executor.clone(),
                self.default_response_limit,
                self.max_items_per_run,
                scope_id,
            )));
        }

        for handle in handles {
            match handle.await {
                Ok(scope_summary) => {
                    summary.executed += scope_summary.executed;
                }
                Err(e) => {
                    summary.failed_scopes += 1;
                    tracing::warn!(target: "engine", error = ?e, "scope worker died");
                }
            }
        }

        counter!("engine_cycles_total").increment(1);
        counter!("engine_executions_total").increment(summary.executed as u64);
        gauge!("engine_last_cycle_ts").set(Utc::now().timestamp() as f64);
        summary
    }
}

async fn run_scope_inner(
    rules: Arc<dyn RuleStore>,
    items: Arc<dyn ItemStore>,
    executor: Arc<ActionExecutor>,
    default_limit: u32,
    max_items: usize,
    scope_id: String,
) -> ScopeRunSummary {
    let scope_rules = rules.enabled_for_scope(&scope_id);
    if scope_rules.is_empty() {
        return ScopeRunSummary {
            scope_id,
            fetched: 0,
            executed: 0,
        };
    }

    let plan = plan_for(&scope_rules, default_limit);
    let pending = items.pending_for_scope(&scope_id, max_items);
    let fetched = pending.len();
    let mut executed = 0u32;

    for item in &pending {
        if executed >= plan.max_responses {
            break;
        }
        // First matching rule wins; no other rule is tried for this item,
        // whatever the outcome.
        for rule in &scope_rules {
            if !rule.condition.matches(item) {
                continue;
            }
            let outcome = executor.execute(rule, item).await;
            if outcome == ExecOutcome::Executed {
                executed += 1;
                if plan.auto_post_allowed && rule.action.kind() == ActionKind::Respond {
                    // Hand-off point: the downstream poster owns the item
                    // from `processing` on.
                    items.transition(&item.id, ItemStatus::Pending, ItemStatus::Processing);
                }
            }
            break;
        }
    }

    tracing::debug!(
        target: "engine",
        scope = %scope_id,
        fetched,
        executed,
        max = plan.max_responses,
        "scope run finished"
    );

    ScopeRunSummary {
        scope_id,
        fetched,
        executed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{ActionConfig, FlagConfig, RespondConfig, RuleCondition};
    use std::collections::BTreeMap;

    fn rule(id: &str, priority: i32, limit: Option<u32>, require_approval: bool) -> Rule {
        Rule {
            id: id.into(),
            name: id.into(),
            scope_id: "s1".into(),
            enabled: true,
            priority,
            condition: RuleCondition::default(),
            action: ActionConfig::Respond(RespondConfig::default()),
            response_limit_per_run: limit,
            require_approval,
            ab_tests: BTreeMap::new(),
        }
    }

    #[test]
    fn plan_uses_minimum_nonzero_limit() {
        let rules = vec![
            rule("a", 10, Some(5), true),
            rule("b", 5, None, true),
            rule("c", 1, Some(3), true),
        ];
        let plan = plan_for(&rules, 20);
        assert_eq!(plan.max_responses, 3);
        assert!(!plan.auto_post_allowed);
    }

    #[test]
    fn plan_defaults_when_no_rule_sets_a_limit() {
        let rules = vec![rule("a", 10, None, false)];
        let plan = plan_for(&rules, 20);
        assert_eq!(plan.max_responses, 20);
        assert!(plan.auto_post_allowed);
    }

    #[test]
    fn any_non_approval_rule_enables_autopost() {
        let mut flag_only = rule("a", 1, None, true);
        flag_only.action = ActionConfig::Flag(FlagConfig::default());
        assert!(!plan_for(&[flag_only.clone()], 20).auto_post_allowed);

        let open = rule("b", 2, None, false);
        assert!(plan_for(&[flag_only, open], 20).auto_post_allowed);
    }
}
