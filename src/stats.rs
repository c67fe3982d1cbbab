//! # Significance Engine
//! Winner/runner-up analysis over per-variant outcome aggregates.
//!
//! Click-style metrics use a two-proportion two-tailed z-test with a pooled
//! proportion. Continuous engagement metrics use a Welch-style statistic over
//! sample means and population standard deviations, with the p-value taken
//! from the same normal tail. The normal-tail shortcut for the t statistic is
//! intentionally conservative and kept for parity with historical results;
//! see DESIGN.md before swapping in an exact Student-t CDF.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::OutcomeMetric;
use crate::store::MetricStore;

/// Which metric drove a test's ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Ctr,
    Engagement,
}

/// Per-variant aggregates as used for ranking.
#[derive(Debug, Clone, Serialize)]
pub struct VariantStats {
    pub variant: String,
    /// Sample count for eligibility (impressions, or engagement samples).
    pub n: u64,
    pub impressions: u64,
    pub conversions: u64,
    pub ctr: f64,
    pub mean_engagement: f64,
    pub engagement_variance: f64,
    /// Ranking value under the chosen metric.
    pub value: f64,
}

/// Result of significance analysis for one named test.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub metric: MetricKind,
    pub winner: Option<String>,
    pub runner_up: Option<String>,
    /// Winner vs runner-up; `None` without a winner.
    pub p_value: Option<f64>,
    /// Worst eligible vs best eligible, for the pause heuristic.
    pub worst_vs_best_p: Option<f64>,
    pub worst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub variants: Vec<VariantStats>,
}

/// Operator-facing follow-ups derived from test outcomes. Only reweighting
/// and pausing are ever auto-applied; follow-up tests are informational.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    /// Clear winner at p <= 0.05: shift weight toward it.
    ReweightWinner {
        rule_id: String,
        test_id: String,
        winner: String,
        p_value: f64,
    },
    /// Worst variant significantly under the best: zero its weight (never
    /// remove it, so the decision stays auditable and revertible).
    PauseVariant {
        rule_id: String,
        test_id: String,
        variant: String,
        p_value: f64,
    },
    /// Near-significant, inconclusive result worth a dedicated follow-up.
    FollowUpTest {
        rule_id: String,
        test_id: String,
        leader: String,
        p_value: f64,
    },
}

pub const SIGNIFICANCE_LEVEL: f64 = 0.05;
pub const FOLLOW_UP_CEILING: f64 = 0.2;

/// Compute winner/runner-up and significance for every test that has recorded
/// outcomes under `rule_id`. Variants with fewer than `min_samples_per_variant`
/// samples are excluded from winner consideration; with fewer than two
/// eligible variants the outcome reports `insufficient_data`.
pub fn calculate_winner(
    metrics: &dyn MetricStore,
    rule_id: &str,
    min_samples_per_variant: u64,
) -> BTreeMap<String, TestOutcome> {
    let mut out = BTreeMap::new();
    for test_id in metrics.test_ids(rule_id) {
        let totals = metrics.variant_totals(rule_id, &test_id);
        let outcome = analyze_test(&test_id, &totals, min_samples_per_variant);
        out.insert(test_id, outcome);
    }
    out
}

/// Pure core of `calculate_winner`, one test at a time.
pub fn analyze_test(
    test_id: &str,
    totals: &[(String, OutcomeMetric)],
    min_samples_per_variant: u64,
) -> TestOutcome {
    // CTR ranks the test as soon as any variant recorded impressions;
    // engagement is the fallback for tests without click data.
    let any_impressions = totals.iter().any(|(_, m)| m.impressions > 0);
    let metric = if any_impressions {
        MetricKind::Ctr
    } else {
        MetricKind::Engagement
    };

    let variants: Vec<VariantStats> = totals
        .iter()
        .map(|(variant, m)| {
            let value = match metric {
                MetricKind::Ctr => m.ctr(),
                MetricKind::Engagement => m.mean_engagement(),
            };
            VariantStats {
                variant: variant.clone(),
                n: m.samples(),
                impressions: m.impressions,
                conversions: m.conversions,
                ctr: m.ctr(),
                mean_engagement: m.mean_engagement(),
                engagement_variance: m.engagement_variance(),
                value,
            }
        })
        .collect();

    let mut eligible: Vec<&VariantStats> = variants
        .iter()
        .filter(|v| v.n >= min_samples_per_variant)
        .collect();

    if eligible.len() < 2 {
        return TestOutcome {
            test_id: test_id.to_string(),
            metric,
            winner: None,
            runner_up: None,
            p_value: None,
            worst_vs_best_p: None,
            worst: None,
            reason: Some("insufficient_data"),
            variants,
        };
    }

    // value desc; variant id keeps the order deterministic on exact ties
    eligible.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.variant.cmp(&b.variant))
    });

    let best = eligible[0];
    let runner_up = eligible[1];
    let worst = eligible[eligible.len() - 1];

    let p_value = pairwise_p(metric, best, runner_up);
    let worst_vs_best_p = if worst.variant != best.variant {
        Some(pairwise_p(metric, best, worst))
    } else {
        None
    };

    TestOutcome {
        test_id: test_id.to_string(),
        metric,
        winner: Some(best.variant.clone()),
        runner_up: Some(runner_up.variant.clone()),
        p_value: Some(p_value),
        worst_vs_best_p,
        worst: Some(worst.variant.clone()),
        reason: None,
        variants,
    }
}

fn pairwise_p(metric: MetricKind, a: &VariantStats, b: &VariantStats) -> f64 {
    match metric {
        MetricKind::Ctr => {
            two_proportion_p_value(a.conversions, a.impressions, b.conversions, b.impressions)
        }
        MetricKind::Engagement => welch_p_value(
            a.mean_engagement,
            a.engagement_variance,
            a.n,
            b.mean_engagement,
            b.engagement_variance,
            b.n,
        ),
    }
}

/// Suggestions derived from one rule's test outcomes.
pub fn suggestions_for(rule_id: &str, outcomes: &BTreeMap<String, TestOutcome>) -> Vec<Suggestion> {
    let mut out = Vec::new();
    for (test_id, outcome) in outcomes {
        let (Some(winner), Some(p)) = (&outcome.winner, outcome.p_value) else {
            continue;
        };
        if p <= SIGNIFICANCE_LEVEL {
            out.push(Suggestion::ReweightWinner {
                rule_id: rule_id.to_string(),
                test_id: test_id.clone(),
                winner: winner.clone(),
                p_value: p,
            });
        } else if p <= FOLLOW_UP_CEILING {
            out.push(Suggestion::FollowUpTest {
                rule_id: rule_id.to_string(),
                test_id: test_id.clone(),
                leader: winner.clone(),
                p_value: p,
            });
        }
        if let (Some(worst), Some(wp)) = (&outcome.worst, outcome.worst_vs_best_p) {
            if wp <= SIGNIFICANCE_LEVEL {
                out.push(Suggestion::PauseVariant {
                    rule_id: rule_id.to_string(),
                    test_id: test_id.clone(),
                    variant: worst.clone(),
                    p_value: wp,
                });
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Significance tests
// ---------------------------------------------------------------------------

/// Two-proportion two-tailed z-test. `x` = conversions, `n` = impressions.
/// Degenerate inputs (`n == 0`) yield p = 1.0.
pub fn two_proportion_p_value(x1: u64, n1: u64, x2: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }
    let (x1f, n1f) = (x1 as f64, n1 as f64);
    let (x2f, n2f) = (x2 as f64, n2 as f64);
    let p1 = x1f / n1f;
    let p2 = x2f / n2f;
    let pooled = (x1f + x2f) / (n1f + n2f);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1f + 1.0 / n2f)).sqrt();
    if se == 0.0 {
        // all-convert or none-convert on both sides; there is no evidence of
        // a difference
        return 1.0;
    }
    let z = (p1 - p2).abs() / se;
    normal_two_tailed_p(z)
}

/// Welch-style mean-difference test over population variances, with the
/// normal-tail approximation applied to the t statistic.
pub fn welch_p_value(m1: f64, var1: f64, n1: u64, m2: f64, var2: f64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 1.0;
    }
    let se = (var1 / n1 as f64 + var2 / n2 as f64).sqrt();
    if se == 0.0 {
        return 1.0;
    }
    let t = (m1 - m2).abs() / se;
    normal_two_tailed_p(t)
}

/// Two-tailed tail area of the standard normal: `2 * (1 - Phi(z))`.
pub fn normal_two_tailed_p(z: f64) -> f64 {
    (1.0 - erf(z / std::f64::consts::SQRT_2)).clamp(0.0, 1.0)
}

/// Error function, Abramowitz & Stegun 7.1.26 (max abs error ~1.5e-7).
fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();
    sign * y
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(impressions: u64, conversions: u64) -> OutcomeMetric {
        OutcomeMetric {
            impressions,
            conversions,
            engagement: vec![],
        }
    }

    #[test]
    fn clear_ctr_gap_is_significant() {
        let p = two_proportion_p_value(500, 1000, 400, 1000);
        assert!(p < 0.05, "expected significance, got p = {p}");
    }

    #[test]
    fn tiny_ctr_gap_is_not_significant() {
        let p = two_proportion_p_value(505, 1000, 495, 1000);
        assert!(p > 0.05, "expected no significance, got p = {p}");
    }

    #[test]
    fn degenerate_samples_give_p_one() {
        assert_eq!(two_proportion_p_value(0, 0, 10, 100), 1.0);
        assert_eq!(two_proportion_p_value(0, 100, 0, 100), 1.0);
        assert_eq!(welch_p_value(1.0, 0.0, 10, 1.0, 0.0, 10), 1.0);
    }

    #[test]
    fn erf_matches_known_values() {
        // erf(1) ~ 0.8427007929
        assert!((erf(1.0) - 0.842_700_79).abs() < 1e-6);
        assert!((erf(-1.0) + 0.842_700_79).abs() < 1e-6);
        // z = 1.96 should sit right at the ~0.05 two-tailed boundary
        let p = normal_two_tailed_p(1.96);
        assert!((p - 0.05).abs() < 1e-3);
    }

    #[test]
    fn welch_detects_mean_gap() {
        let p = welch_p_value(5.0, 1.0, 200, 4.0, 1.0, 200);
        assert!(p < 0.05);
        let p2 = welch_p_value(5.0, 4.0, 30, 4.9, 4.0, 30);
        assert!(p2 > 0.05);
    }

    #[test]
    fn insufficient_data_without_two_eligible_variants() {
        let totals = vec![
            ("A".to_string(), metric(500, 100)),
            ("B".to_string(), metric(10, 2)),
        ];
        let outcome = analyze_test("greeting", &totals, 30);
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.reason, Some("insufficient_data"));
        assert_eq!(outcome.variants.len(), 2);
    }

    #[test]
    fn winner_and_runner_up_by_ctr() {
        let totals = vec![
            ("A".to_string(), metric(1000, 500)),
            ("B".to_string(), metric(1000, 400)),
            ("C".to_string(), metric(1000, 100)),
        ];
        let outcome = analyze_test("greeting", &totals, 30);
        assert_eq!(outcome.metric, MetricKind::Ctr);
        assert_eq!(outcome.winner.as_deref(), Some("A"));
        assert_eq!(outcome.runner_up.as_deref(), Some("B"));
        assert_eq!(outcome.worst.as_deref(), Some("C"));
        assert!(outcome.p_value.unwrap() < 0.05);
        assert!(outcome.worst_vs_best_p.unwrap() < 0.05);
    }

    #[test]
    fn engagement_fallback_when_no_impressions() {
        let totals = vec![
            (
                "A".to_string(),
                OutcomeMetric {
                    impressions: 0,
                    conversions: 0,
                    engagement: vec![5.0; 100],
                },
            ),
            (
                "B".to_string(),
                OutcomeMetric {
                    impressions: 0,
                    conversions: 0,
                    engagement: vec![4.0; 100],
                },
            ),
        ];
        let outcome = analyze_test("tone", &totals, 30);
        assert_eq!(outcome.metric, MetricKind::Engagement);
        assert_eq!(outcome.winner.as_deref(), Some("A"));
    }

    #[test]
    fn suggestions_cover_reweight_pause_and_follow_up() {
        use std::collections::BTreeMap;

        // significant winner + significantly poor worst
        let totals = vec![
            ("A".to_string(), metric(1000, 500)),
            ("B".to_string(), metric(1000, 400)),
            ("C".to_string(), metric(1000, 100)),
        ];
        let mut outcomes = BTreeMap::new();
        outcomes.insert("greeting".to_string(), analyze_test("greeting", &totals, 30));
        let s = suggestions_for("r1", &outcomes);
        assert!(s
            .iter()
            .any(|x| matches!(x, Suggestion::ReweightWinner { winner, .. } if winner == "A")));
        assert!(s
            .iter()
            .any(|x| matches!(x, Suggestion::PauseVariant { variant, .. } if variant == "C")));

        // near-significant leader -> follow-up only
        let close = vec![
            ("A".to_string(), metric(1000, 330)),
            ("B".to_string(), metric(1000, 300)),
        ];
        let mut near = BTreeMap::new();
        near.insert("tone".to_string(), analyze_test("tone", &close, 30));
        let p = near["tone"].p_value.unwrap();
        assert!(p > 0.05 && p <= 0.2, "fixture drifted: p = {p}");
        let s2 = suggestions_for("r1", &near);
        assert!(s2
            .iter()
            .any(|x| matches!(x, Suggestion::FollowUpTest { leader, .. } if leader == "A")));
        assert!(!s2
            .iter()
            .any(|x| matches!(x, Suggestion::ReweightWinner { .. })));
    }
}
