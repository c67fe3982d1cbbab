//! # Variant Selector
//! Weighted-random (roulette-wheel) choice of a response variant for a rule's
//! A/B test, plus the reweighting side of the feedback loop.
//!
//! The RNG is injected (seedable) so selection is reproducible in tests.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::rules::Rule;
use crate::stats::{Suggestion, TestOutcome, SIGNIFICANCE_LEVEL};
use crate::store::RuleStore;

/// Returned when a rule carries no A/B tests.
pub const DEFAULT_SELECTION: &str = "default::A";

/// Share of weight moved to a significant winner by auto-optimization; the
/// remainder is split equally among the other variants.
pub const WINNER_SHARE: f64 = 0.7;

pub struct VariantSelector {
    rng: Mutex<StdRng>,
}

impl Default for VariantSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantSelector {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic selector for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Pick a variant for the rule as `"testId::variantId"`.
    ///
    /// Test choice: the explicit `test_id` when the rule has it, else the
    /// first declared test, else the static default. Within a test the draw
    /// is roulette-wheel over the variant weights; a zero (or invalid) total
    /// weight falls back to a uniform choice so no variant starves.
    pub fn select(&self, rule: &Rule, test_id: Option<&str>) -> String {
        let picked = test_id
            .and_then(|t| rule.ab_tests.get_key_value(t))
            .or_else(|| rule.ab_tests.iter().next());
        let Some((test_id, test)) = picked else {
            return DEFAULT_SELECTION.to_string();
        };
        if test.variants.is_empty() {
            return DEFAULT_SELECTION.to_string();
        }

        let mut rng = self.rng.lock().expect("selector rng mutex poisoned");
        let total: f64 = test.variants.iter().map(|v| v.weight.max(0.0)).sum();

        let chosen = if total <= 0.0 || !total.is_finite() {
            let idx = rng.random_range(0..test.variants.len());
            &test.variants[idx]
        } else {
            let r: f64 = rng.random_range(0.0..total);
            let mut cumulative = 0.0;
            let mut chosen = test.variants.last().expect("variants checked non-empty");
            for v in &test.variants {
                cumulative += v.weight.max(0.0);
                if cumulative > r {
                    chosen = v;
                    break;
                }
            }
            chosen
        };

        format!("{}::{}", test_id, chosen.id)
    }
}

/// Apply winner reweighting for every test with a significant result:
/// the winner gets [`WINNER_SHARE`], the rest split the remainder equally.
/// Returns how many tests were reweighted.
pub fn auto_optimize(
    rules: &dyn RuleStore,
    rule_id: &str,
    outcomes: &std::collections::BTreeMap<String, TestOutcome>,
) -> usize {
    let Some(rule) = rules.get(rule_id) else {
        return 0;
    };
    let mut applied = 0;
    for (test_id, outcome) in outcomes {
        let (Some(winner), Some(p)) = (&outcome.winner, outcome.p_value) else {
            continue;
        };
        if p > SIGNIFICANCE_LEVEL {
            continue;
        }
        let Some(test) = rule.ab_tests.get(test_id) else {
            continue;
        };
        let others = test.variants.len().saturating_sub(1);
        let loser_share = if others > 0 {
            (1.0 - WINNER_SHARE) / others as f64
        } else {
            0.0
        };
        let weights: Vec<(String, f64)> = test
            .variants
            .iter()
            .map(|v| {
                let w = if &v.id == winner {
                    WINNER_SHARE
                } else {
                    loser_share
                };
                (v.id.clone(), w)
            })
            .collect();
        if rules.set_test_weights(rule_id, test_id, &weights) {
            tracing::info!(
                target: "selector",
                rule = rule_id,
                test = %test_id,
                winner = %winner,
                p_value = p,
                "auto-optimized test weights"
            );
            applied += 1;
        }
    }
    applied
}

/// Apply one suggestion from the analyzer. Pauses zero the variant's weight
/// (the variant stays in place for auditability); follow-up suggestions are
/// informational and never auto-applied.
pub fn apply_suggestion(rules: &dyn RuleStore, suggestion: &Suggestion) -> bool {
    match suggestion {
        Suggestion::PauseVariant {
            rule_id,
            test_id,
            variant,
            ..
        } => rules.set_test_weights(rule_id, test_id, &[(variant.clone(), 0.0)]),
        Suggestion::ReweightWinner { .. } | Suggestion::FollowUpTest { .. } => false,
    }
}
