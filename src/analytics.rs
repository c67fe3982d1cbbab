//! # Performance / Anomaly Analyzer
//! Read-only analytics over the execution log and outcome events: daily
//! per-rule aggregates, best/worst rule ranking, day-over-day CTR anomaly
//! detection against a trailing mean, ROI, and the reweighting suggestions
//! that close the feedback loop into the variant selector.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;

use crate::config::{AnalyticsConfig, StatsConfig};
use crate::model::{ExecutionStatus, OutcomeKind};
use crate::stats::{calculate_winner, suggestions_for, Suggestion};
use crate::store::{ExecutionLog, MetricStore};

/// One rule's aggregates for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyRuleStats {
    pub date: NaiveDate,
    pub rule_id: String,
    /// Successfully executed respond actions.
    pub responses: u64,
    pub impressions: u64,
    pub conversions: u64,
    pub ctr: f64,
    pub engagement_mean: f64,
}

/// A rule's standing over a whole window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RulePerformance {
    pub rule_id: String,
    pub responses: u64,
    pub impressions: u64,
    pub conversions: u64,
    pub ctr: f64,
    pub engagement_mean: f64,
}

/// An abrupt CTR move versus the trailing mean.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub rule_id: String,
    pub date: NaiveDate,
    pub ctr: f64,
    pub trailing_mean: f64,
    /// Fractional deviation from the trailing mean.
    pub deviation: f64,
}

pub struct Analyzer {
    log: Arc<dyn ExecutionLog>,
    metrics: Arc<dyn MetricStore>,
    cfg: AnalyticsConfig,
    stats_cfg: StatsConfig,
}

impl Analyzer {
    pub fn new(
        log: Arc<dyn ExecutionLog>,
        metrics: Arc<dyn MetricStore>,
        cfg: AnalyticsConfig,
        stats_cfg: StatsConfig,
    ) -> Self {
        Self {
            log,
            metrics,
            cfg,
            stats_cfg,
        }
    }

    /// Per-day, per-rule aggregates for the trailing `days` window.
    pub fn daily_stats(&self, now: DateTime<Utc>, days: i64) -> Vec<DailyRuleStats> {
        let since = now - Duration::days(days);

        #[derive(Default)]
        struct Acc {
            responses: u64,
            impressions: u64,
            conversions: u64,
            engagement_sum: f64,
            engagement_n: u64,
        }
        let mut acc: BTreeMap<(NaiveDate, String), Acc> = BTreeMap::new();

        for record in self.log.records_since(since) {
            if record.action == "respond" && record.status == ExecutionStatus::Executed {
                if let Some(rule_id) = record.rule_id {
                    acc.entry((record.ts.date_naive(), rule_id))
                        .or_default()
                        .responses += 1;
                }
            }
        }
        for event in self.metrics.events_since(since) {
            let slot = acc
                .entry((event.ts.date_naive(), event.rule_id))
                .or_default();
            match event.kind {
                OutcomeKind::Impression => slot.impressions += 1,
                OutcomeKind::Conversion => slot.conversions += 1,
                OutcomeKind::Engagement(v) => {
                    slot.engagement_sum += v;
                    slot.engagement_n += 1;
                }
            }
        }

        acc.into_iter()
            .map(|((date, rule_id), a)| DailyRuleStats {
                date,
                rule_id,
                responses: a.responses,
                impressions: a.impressions,
                conversions: a.conversions,
                ctr: if a.impressions > 0 {
                    a.conversions as f64 / a.impressions as f64
                } else {
                    0.0
                },
                engagement_mean: if a.engagement_n > 0 {
                    a.engagement_sum / a.engagement_n as f64
                } else {
                    0.0
                },
            })
            .collect()
    }

    /// Best and worst rule over the window, ranked by CTR with engagement as
    /// the fallback for rules without click data. `None` with fewer than two
    /// rules observed.
    pub fn best_and_worst(
        &self,
        now: DateTime<Utc>,
        days: i64,
    ) -> Option<(RulePerformance, RulePerformance)> {
        let mut totals: BTreeMap<String, RulePerformance> = BTreeMap::new();
        for day in self.daily_stats(now, days) {
            let slot = totals
                .entry(day.rule_id.clone())
                .or_insert_with(|| RulePerformance {
                    rule_id: day.rule_id.clone(),
                    responses: 0,
                    impressions: 0,
                    conversions: 0,
                    ctr: 0.0,
                    engagement_mean: 0.0,
                });
            slot.responses += day.responses;
            slot.impressions += day.impressions;
            slot.conversions += day.conversions;
            // engagement mean over days is close enough for ranking
            slot.engagement_mean = (slot.engagement_mean + day.engagement_mean) / 2.0;
        }
        for perf in totals.values_mut() {
            perf.ctr = if perf.impressions > 0 {
                perf.conversions as f64 / perf.impressions as f64
            } else {
                0.0
            };
        }

        let mut ranked: Vec<RulePerformance> = totals.into_values().collect();
        if ranked.len() < 2 {
            return None;
        }
        ranked.sort_by(|a, b| {
            b.ctr
                .partial_cmp(&a.ctr)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.engagement_mean
                        .partial_cmp(&a.engagement_mean)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        let best = ranked.first().cloned()?;
        let worst = ranked.last().cloned()?;
        Some((best, worst))
    }

    /// Flag days whose CTR deviates from the trailing-window mean by more
    /// than the configured fraction. A day needs at least three trailing
    /// days with impressions before it can be judged.
    pub fn detect_anomalies(&self, now: DateTime<Utc>) -> Vec<Anomaly> {
        // one extra trailing window of history so the earliest judged day
        // has context
        let horizon = self.cfg.trailing_days * 2;
        let days = self.daily_stats(now, horizon);

        let mut per_rule: BTreeMap<&str, Vec<&DailyRuleStats>> = BTreeMap::new();
        for day in &days {
            if day.impressions > 0 {
                per_rule.entry(day.rule_id.as_str()).or_default().push(day);
            }
        }

        let mut anomalies = Vec::new();
        for (rule_id, series) in per_rule {
            for day in &series {
                let window_start = day.date - Duration::days(self.cfg.trailing_days);
                let trailing: Vec<f64> = series
                    .iter()
                    .filter(|d| d.date >= window_start && d.date < day.date)
                    .map(|d| d.ctr)
                    .collect();
                if trailing.len() < 3 {
                    continue;
                }
                let mean = trailing.iter().sum::<f64>() / trailing.len() as f64;
                if mean <= 0.0 {
                    continue;
                }
                let deviation = (day.ctr - mean).abs() / mean;
                if deviation > self.cfg.anomaly_threshold {
                    anomalies.push(Anomaly {
                        rule_id: rule_id.to_string(),
                        date: day.date,
                        ctr: day.ctr,
                        trailing_mean: mean,
                        deviation,
                    });
                }
            }
        }
        anomalies
    }

    /// Estimated value of automation: saved moderator time minus what the
    /// automated responses cost.
    pub fn roi(&self, responses: u64) -> f64 {
        let r = &self.cfg.roi;
        let saved = responses as f64 * r.seconds_per_manual_response / 3600.0 * r.hourly_rate;
        let spent = responses as f64 * r.cost_per_response;
        saved - spent
    }

    /// ROI over a trailing window, counted from executed respond records.
    pub fn roi_for_window(&self, now: DateTime<Utc>, days: i64) -> f64 {
        let responses = self
            .daily_stats(now, days)
            .iter()
            .map(|d| d.responses)
            .sum::<u64>();
        self.roi(responses)
    }

    /// Significance-driven suggestions for every rule with recorded outcomes.
    /// Consumed by `selector::auto_optimize` / `selector::apply_suggestion`.
    pub fn reweight_suggestions(&self, now: DateTime<Utc>, days: i64) -> Vec<Suggestion> {
        let since = now - Duration::days(days);
        let mut rule_ids: Vec<String> = self
            .metrics
            .events_since(since)
            .into_iter()
            .map(|e| e.rule_id)
            .collect();
        rule_ids.sort();
        rule_ids.dedup();

        let mut out = Vec::new();
        for rule_id in rule_ids {
            let outcomes = calculate_winner(
                self.metrics.as_ref(),
                &rule_id,
                self.stats_cfg.min_samples_per_variant,
            );
            out.extend(suggestions_for(&rule_id, &outcomes));
        }
        out
    }
}
