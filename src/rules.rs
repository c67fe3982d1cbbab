//! # Rules
//! Named, scoped policies the engine evaluates against queued interactions.
//!
//! A rule carries:
//! - a condition (classification equality, keyword containment, author-status
//!   match; a rule with no conditions matches everything),
//! - a typed action config (`respond` | `delete` | `flag`),
//! - optional embedded A/B tests (named test -> weighted variants),
//! - a per-run response limit and a require-approval flag.
//!
//! Rule files are JSON or TOML and validated at load time, so untyped config
//! never reaches execution.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::QueuedItem;

/// Action kinds, used for rate-limit keys and log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Respond,
    Delete,
    Flag,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Respond => "respond",
            ActionKind::Delete => "delete",
            ActionKind::Flag => "flag",
        }
    }
}

/// Typed action configuration, tagged by action kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionConfig {
    Respond(RespondConfig),
    Delete(DeleteConfig),
    Flag(FlagConfig),
}

impl ActionConfig {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionConfig::Respond(_) => ActionKind::Respond,
            ActionConfig::Delete(_) => ActionKind::Delete,
            ActionConfig::Flag(_) => ActionKind::Flag,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RespondConfig {
    /// Fallback template ref when the chosen variant has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Criteria handed to the safety/moderation collaborator before a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteConfig {
    /// Minimum moderation confidence required to go through with a delete.
    #[serde(default = "default_delete_threshold")]
    pub threshold: f64,
    /// Violation categories this rule deletes for (e.g. "spam", "abuse").
    #[serde(default)]
    pub categories: Vec<String>,
}

fn default_delete_threshold() -> f64 {
    0.8
}

impl Default for DeleteConfig {
    fn default() -> Self {
        Self {
            threshold: default_delete_threshold(),
            categories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlagConfig {
    /// Note surfaced to the reviewer alongside the flagged item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// One arm of a named A/B test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    /// Non-negative. If all weights of a test sum to zero the selector falls
    /// back to a uniform choice.
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AbTest {
    pub variants: Vec<Variant>,
}

/// Conditions are conjunctive: every present field must match. An empty
/// condition matches every item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuleCondition {
    /// Exact classification label match (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<String>,
    /// Match if ANY keyword appears in the item text (case-insensitive
    /// substring containment).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Exact author-status match (case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_status: Option<String>,
}

impl RuleCondition {
    pub fn is_empty(&self) -> bool {
        self.classification.is_none() && self.keywords.is_empty() && self.author_status.is_none()
    }

    pub fn matches(&self, item: &QueuedItem) -> bool {
        if let Some(wanted) = &self.classification {
            let got = item.classification.as_deref().unwrap_or("");
            if !wanted.eq_ignore_ascii_case(got) {
                return false;
            }
        }
        if !self.keywords.is_empty() {
            let text = item.text.to_lowercase();
            if !self
                .keywords
                .iter()
                .any(|k| text.contains(k.to_lowercase().as_str()))
            {
                return false;
            }
        }
        if let Some(wanted) = &self.author_status {
            let got = item.author_status.as_deref().unwrap_or("");
            if !wanted.eq_ignore_ascii_case(got) {
                return false;
            }
        }
        true
    }
}

/// A scoped response policy. Read-only to the engine during a run; reweighting
/// and configuration changes land between runs through the rule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub scope_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Primary tie-break: when several rules match an item, the highest
    /// priority wins.
    pub priority: i32,
    #[serde(default)]
    pub condition: RuleCondition,
    pub action: ActionConfig,
    /// Cap on executions per engine run; `None` falls back to the configured
    /// default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_limit_per_run: Option<u32>,
    #[serde(default)]
    pub require_approval: bool,
    /// Named A/B tests; BTreeMap so "first test" is deterministic.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ab_tests: BTreeMap<String, AbTest>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Validate invariants that must hold before a rule is allowed into the
    /// store: non-empty ids, non-negative variant weights, variants present
    /// for every declared test, a zero limit is rejected (use `None`).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("rule has empty id");
        }
        if self.scope_id.trim().is_empty() {
            bail!("rule {}: empty scope_id", self.id);
        }
        if self.response_limit_per_run == Some(0) {
            bail!("rule {}: response_limit_per_run must be > 0 when set", self.id);
        }
        for (test_id, test) in &self.ab_tests {
            if test.variants.is_empty() {
                bail!("rule {}: test {test_id} has no variants", self.id);
            }
            for v in &test.variants {
                if v.id.trim().is_empty() {
                    bail!("rule {}: test {test_id} has a variant with empty id", self.id);
                }
                if v.weight < 0.0 || !v.weight.is_finite() {
                    bail!(
                        "rule {}: test {test_id} variant {} has invalid weight {}",
                        self.id,
                        v.id,
                        v.weight
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuleFile {
    pub rules: Vec<Rule>,
}

/// Load and validate a rule file. Supports TOML and JSON, picked by file
/// extension with a content-sniffing fallback, same as the other config
/// loaders in this crate.
pub fn load_rules_file(path: &Path) -> Result<Vec<Rule>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading rules from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let parsed: RuleFile = if ext == "toml" {
        toml::from_str(&content).context("parsing TOML rules")?
    } else if ext == "json" {
        serde_json::from_str(&content).context("parsing JSON rules")?
    } else {
        match toml::from_str(&content) {
            Ok(v) => v,
            Err(_) => serde_json::from_str(&content).context("parsing rules (tried TOML, JSON)")?,
        }
    };

    for rule in &parsed.rules {
        rule.validate()
            .with_context(|| format!("invalid rule in {}", path.display()))?;
    }
    Ok(parsed.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::model::ItemStatus;

    fn item(text: &str, classification: Option<&str>, author_status: Option<&str>) -> QueuedItem {
        QueuedItem {
            id: "i1".into(),
            scope_id: "s1".into(),
            parent_id: "p1".into(),
            text: text.into(),
            classification: classification.map(str::to_string),
            author_id: None,
            author_status: author_status.map(str::to_string),
            status: ItemStatus::Pending,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn empty_condition_matches_everything() {
        let c = RuleCondition::default();
        assert!(c.matches(&item("anything", None, None)));
    }

    #[test]
    fn keyword_containment_is_case_insensitive() {
        let c = RuleCondition {
            keywords: vec!["Refund".into()],
            ..Default::default()
        };
        assert!(c.matches(&item("can I get a REFUND please", None, None)));
        assert!(!c.matches(&item("great video", None, None)));
    }

    #[test]
    fn classification_and_author_status_must_both_hold() {
        let c = RuleCondition {
            classification: Some("question".into()),
            author_status: Some("subscriber".into()),
            ..Default::default()
        };
        assert!(c.matches(&item("how?", Some("Question"), Some("subscriber"))));
        assert!(!c.matches(&item("how?", Some("question"), Some("new"))));
        assert!(!c.matches(&item("how?", None, Some("subscriber"))));
    }

    #[test]
    fn validate_rejects_negative_weight_and_zero_limit() {
        let mut rule = Rule {
            id: "r1".into(),
            name: "test".into(),
            scope_id: "s1".into(),
            enabled: true,
            priority: 5,
            condition: RuleCondition::default(),
            action: ActionConfig::Respond(RespondConfig::default()),
            response_limit_per_run: Some(0),
            require_approval: false,
            ab_tests: BTreeMap::new(),
        };
        assert!(rule.validate().is_err());

        rule.response_limit_per_run = None;
        rule.ab_tests.insert(
            "greeting".into(),
            AbTest {
                variants: vec![Variant {
                    id: "A".into(),
                    weight: -1.0,
                    template: None,
                }],
            },
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rule_file_round_trips_json_and_toml() {
        let dir = std::env::temp_dir();

        let json_path = dir.join(format!("rules_{}.json", std::process::id()));
        std::fs::write(
            &json_path,
            r#"{
                "rules": [{
                    "id": "greet",
                    "name": "greet subscribers",
                    "scope_id": "s1",
                    "priority": 3,
                    "condition": { "author_status": "subscriber" },
                    "action": { "type": "respond", "template": "thanks" }
                }]
            }"#,
        )
        .unwrap();
        let rules = load_rules_file(&json_path).unwrap();
        std::fs::remove_file(&json_path).ok();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, "greet");
        assert!(rules[0].enabled, "enabled defaults to true");
        assert_eq!(rules[0].action.kind(), ActionKind::Respond);

        let toml_path = dir.join(format!("rules_{}.toml", std::process::id()));
        std::fs::write(
            &toml_path,
            r#"
            [[rules]]
            id = "purge"
            name = "purge spam"
            scope_id = "s1"
            priority = 9
            require_approval = false

            [rules.condition]
            classification = "spam"

            [rules.action]
            type = "delete"
            threshold = 0.9
            "#,
        )
        .unwrap();
        let rules = load_rules_file(&toml_path).unwrap();
        std::fs::remove_file(&toml_path).ok();
        assert_eq!(rules[0].action.kind(), ActionKind::Delete);

        let bad_path = dir.join(format!("rules_bad_{}.json", std::process::id()));
        std::fs::write(
            &bad_path,
            r#"{"rules": [{"id": "", "name": "x", "scope_id": "s1", "priority": 1,
                "action": {"type": "flag"}}]}"#,
        )
        .unwrap();
        assert!(load_rules_file(&bad_path).is_err(), "validation runs at load");
        std::fs::remove_file(&bad_path).ok();
    }

    #[test]
    fn action_config_json_is_tagged() {
        let a = ActionConfig::Delete(DeleteConfig {
            threshold: 0.9,
            categories: vec!["spam".into()],
        });
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["type"], serde_json::json!("delete"));
        let back: ActionConfig = serde_json::from_value(v).unwrap();
        assert_eq!(back.kind(), ActionKind::Delete);
    }
}
