//! # Engine Configuration
//! Tunables for the loops, limits and analytics, loaded from TOML or JSON
//! with an env-var path override and sensible defaults when no file exists:
//! 1) `$AUTORESPONDER_CONFIG_PATH`
//! 2) `config/engine.toml`
//! 3) `config/engine.json`
//! 4) built-in defaults

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::rules::ActionKind;

const ENV_PATH: &str = "AUTORESPONDER_CONFIG_PATH";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub ticks: TickConfig,
    #[serde(default)]
    pub engine: EngineLimits,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
}

/// Intervals for the three background loops.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TickConfig {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_automation_secs")]
    pub automation_secs: u64,
    #[serde(default = "default_approval_sweep_secs")]
    pub approval_sweep_secs: u64,
}

fn default_poll_secs() -> u64 {
    60
}
fn default_automation_secs() -> u64 {
    300
}
fn default_approval_sweep_secs() -> u64 {
    60
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
            automation_secs: default_automation_secs(),
            approval_sweep_secs: default_approval_sweep_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EngineLimits {
    /// Per-run execution cap when no rule sets `response_limit_per_run`.
    #[serde(default = "default_response_limit")]
    pub default_response_limit: u32,
    /// How many pending items one engine run fetches per scope.
    #[serde(default = "default_max_items")]
    pub max_items_per_run: usize,
    /// Approval priority at or above this is urgent.
    #[serde(default = "default_urgent_threshold")]
    pub urgent_threshold: i32,
    /// Minutes until a queued approval auto-approves; absent = never.
    #[serde(default)]
    pub auto_approve_minutes: Option<i64>,
}

fn default_response_limit() -> u32 {
    20
}
fn default_max_items() -> usize {
    100
}
fn default_urgent_threshold() -> i32 {
    8
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            default_response_limit: default_response_limit(),
            max_items_per_run: default_max_items(),
            urgent_threshold: default_urgent_threshold(),
            auto_approve_minutes: None,
        }
    }
}

/// Per-minute admission ceilings, one per action type.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_respond_per_minute")]
    pub respond_per_minute: u32,
    #[serde(default = "default_delete_per_minute")]
    pub delete_per_minute: u32,
    #[serde(default = "default_flag_per_minute")]
    pub flag_per_minute: u32,
}

fn default_respond_per_minute() -> u32 {
    30
}
fn default_delete_per_minute() -> u32 {
    15
}
fn default_flag_per_minute() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            respond_per_minute: default_respond_per_minute(),
            delete_per_minute: default_delete_per_minute(),
            flag_per_minute: default_flag_per_minute(),
        }
    }
}

impl RateLimitConfig {
    pub fn ceiling_for(&self, kind: ActionKind) -> u32 {
        match kind {
            ActionKind::Respond => self.respond_per_minute,
            ActionKind::Delete => self.delete_per_minute,
            ActionKind::Flag => self.flag_per_minute,
        }
    }
}

/// Human-like pacing ranges in seconds, per action type. Disabled in tests.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_respond_range")]
    pub respond_secs: [f64; 2],
    #[serde(default = "default_delete_range")]
    pub delete_secs: [f64; 2],
    #[serde(default = "default_flag_range")]
    pub flag_secs: [f64; 2],
}

fn default_true() -> bool {
    true
}
fn default_respond_range() -> [f64; 2] {
    [0.5, 2.0]
}
fn default_delete_range() -> [f64; 2] {
    [1.0, 2.5]
}
fn default_flag_range() -> [f64; 2] {
    [0.5, 2.0]
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            respond_secs: default_respond_range(),
            delete_secs: default_delete_range(),
            flag_secs: default_flag_range(),
        }
    }
}

impl PacingConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Range to draw from, or `None` when pacing is off.
    pub fn range_for(&self, kind: ActionKind) -> Option<(f64, f64)> {
        if !self.enabled {
            return None;
        }
        let [lo, hi] = match kind {
            ActionKind::Respond => self.respond_secs,
            ActionKind::Delete => self.delete_secs,
            ActionKind::Flag => self.flag_secs,
        };
        Some((lo.min(hi), lo.max(hi)))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct StatsConfig {
    #[serde(default = "default_min_samples")]
    pub min_samples_per_variant: u64,
}

fn default_min_samples() -> u64 {
    30
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            min_samples_per_variant: default_min_samples(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnalyticsConfig {
    /// Fractional day-over-day CTR deviation (vs the trailing mean) that
    /// counts as an anomaly.
    #[serde(default = "default_anomaly_threshold")]
    pub anomaly_threshold: f64,
    /// Trailing window for the mean, in days.
    #[serde(default = "default_trailing_days")]
    pub trailing_days: i64,
    #[serde(default)]
    pub roi: RoiConfig,
}

fn default_anomaly_threshold() -> f64 {
    0.3
}
fn default_trailing_days() -> i64 {
    7
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: default_anomaly_threshold(),
            trailing_days: default_trailing_days(),
            roi: RoiConfig::default(),
        }
    }
}

/// Inputs of the ROI estimate: what a manual reply would have cost, minus
/// what an automated one does cost.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RoiConfig {
    #[serde(default = "default_seconds_per_manual")]
    pub seconds_per_manual_response: f64,
    #[serde(default = "default_hourly_rate")]
    pub hourly_rate: f64,
    #[serde(default = "default_cost_per_response")]
    pub cost_per_response: f64,
}

fn default_seconds_per_manual() -> f64 {
    180.0
}
fn default_hourly_rate() -> f64 {
    25.0
}
fn default_cost_per_response() -> f64 {
    0.02
}

impl Default for RoiConfig {
    fn default() -> Self {
        Self {
            seconds_per_manual_response: default_seconds_per_manual(),
            hourly_rate: default_hourly_rate(),
            cost_per_response: default_cost_per_response(),
        }
    }
}

impl EngineConfig {
    /// Load from an explicit path. TOML or JSON, picked by extension with a
    /// content fallback.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if ext == "json" {
            return serde_json::from_str(&content).context("parsing JSON engine config");
        }
        match toml::from_str(&content) {
            Ok(v) => Ok(v),
            Err(toml_err) => serde_json::from_str(&content)
                .map_err(|_| anyhow!("unsupported engine config format: {toml_err}")),
        }
    }

    /// Env-path override, then file fallbacks, then defaults.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_PATH} points to a non-existent path"));
        }
        for candidate in ["config/engine.toml", "config/engine.json"] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        Ok(Self::default())
    }
}
