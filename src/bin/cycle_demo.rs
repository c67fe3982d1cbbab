//! Demo that drives one polling tick, one automation cycle and one approval
//! sweep against in-memory stores and a canned source connector, then prints
//! what the engine did.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};

use social_autoresponder::analytics::Analyzer;
use social_autoresponder::approval::ApprovalQueue;
use social_autoresponder::config::{EngineConfig, PacingConfig};
use social_autoresponder::connector::{
    Classification, Classifier, ContentRef, DeleteEvaluation, PostReceipt, RawItem,
    SafetyModeration, SourceConnector, TemplateRenderer,
};
use social_autoresponder::engine::RuleEngine;
use social_autoresponder::executor::{ActionExecutor, ExecutorParts};
use social_autoresponder::ingest::Poller;
use social_autoresponder::model::{QueuedItem, Scope};
use social_autoresponder::notify::LogNotifier;
use social_autoresponder::ratelimit::MinuteWindowLimiter;
use social_autoresponder::rules::{
    AbTest, ActionConfig, DeleteConfig, FlagConfig, RespondConfig, Rule, RuleCondition, Variant,
};
use social_autoresponder::selector::VariantSelector;
use social_autoresponder::scheduler::Scheduler;
use social_autoresponder::store::{
    ExecutionLog, InMemoryApprovals, InMemoryExecutionLog, InMemoryItems, InMemoryMetrics,
    InMemoryRules, InMemoryScopes, RuleStore, ScopeStore,
};

/// Canned platform: one video, a handful of comments.
struct FixtureConnector;

#[async_trait::async_trait]
impl SourceConnector for FixtureConnector {
    async fn list_new_parent_content(
        &self,
        _scope_id: &str,
        _since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<ContentRef>> {
        Ok(vec![ContentRef {
            id: "video-1".into(),
            published_at: Utc::now() - Duration::hours(2),
        }])
    }

    async fn list_new_child_items(
        &self,
        _scope_id: &str,
        content: &ContentRef,
    ) -> Result<Vec<RawItem>> {
        let mk = |id: &str, text: &str, author: &str, status: &str| RawItem {
            id: id.into(),
            parent_id: content.id.clone(),
            text: text.into(),
            author_id: Some(author.into()),
            author_status: Some(status.into()),
            published_at: Utc::now() - Duration::minutes(30),
        };
        Ok(vec![
            mk("c1", "Loved this, thank you!", "ann", "subscriber"),
            mk("c2", "Can I get a refund for my order?", "bob", "new"),
            mk("c3", "How did you film the intro?", "cat", "subscriber"),
            mk("c4", "buy followers now http://sp.am", "spambot", "new"),
        ])
    }

    async fn post_response(
        &self,
        _scope_id: &str,
        item_id: &str,
        text: &str,
    ) -> Result<PostReceipt> {
        println!("  -> would post under {item_id}: {text}");
        Ok(PostReceipt {
            success: true,
            external_id: Some(format!("ext-{item_id}")),
        })
    }

    async fn delete_item(&self, _scope_id: &str, item_id: &str) -> Result<()> {
        println!("  -> platform delete of {item_id}");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fixture"
    }
}

struct KeywordClassifier;

#[async_trait::async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Classification> {
        let lower = text.to_lowercase();
        let label = if lower.contains("http") || lower.contains("buy followers") {
            "spam"
        } else if lower.contains('?') || lower.starts_with("how") {
            "question"
        } else {
            "praise"
        };
        Ok(Classification {
            label: label.into(),
            keywords: vec![],
            language: Some("en".into()),
        })
    }
}

struct SimpleRenderer;

#[async_trait::async_trait]
impl TemplateRenderer for SimpleRenderer {
    async fn render(&self, template_ref: &str, item: &QueuedItem) -> Result<String> {
        let author = item.author_id.as_deref().unwrap_or("there");
        let body = match template_ref {
            "question-warm" => format!("Great question, {author}! We cover that in the pinned comment."),
            "question-short" => "Check the pinned comment for this one!".to_string(),
            "thanks" => format!("Thanks {author}, appreciate you watching!"),
            other => format!("({other}) Thanks for the comment, {author}!"),
        };
        Ok(body)
    }
}

struct KeywordSafety;

#[async_trait::async_trait]
impl SafetyModeration for KeywordSafety {
    async fn evaluate_delete_criteria(
        &self,
        item: &QueuedItem,
        criteria: &DeleteConfig,
    ) -> Result<DeleteEvaluation> {
        let lower = item.text.to_lowercase();
        let spammy = lower.contains("http") || lower.contains("buy followers");
        Ok(DeleteEvaluation {
            recommended_delete: spammy,
            confidence: if spammy { 0.97 } else { 0.2 },
            threshold: criteria.threshold,
            legitimate: !spammy,
            reason: if spammy {
                "link spam pattern".into()
            } else {
                "looks legitimate".into()
            },
        })
    }
}

fn demo_rules() -> Vec<Rule> {
    let mut greeting = BTreeMap::new();
    greeting.insert(
        "greeting".to_string(),
        AbTest {
            variants: vec![
                Variant {
                    id: "warm".into(),
                    weight: 0.7,
                    template: Some("question-warm".into()),
                },
                Variant {
                    id: "short".into(),
                    weight: 0.3,
                    template: Some("question-short".into()),
                },
            ],
        },
    );

    vec![
        Rule {
            id: "delete-spam".into(),
            name: "remove link spam".into(),
            scope_id: "channel-1".into(),
            enabled: true,
            priority: 10,
            condition: RuleCondition {
                classification: Some("spam".into()),
                ..Default::default()
            },
            action: ActionConfig::Delete(DeleteConfig::default()),
            response_limit_per_run: None,
            require_approval: false,
            ab_tests: BTreeMap::new(),
        },
        Rule {
            id: "flag-refunds".into(),
            name: "flag refund requests".into(),
            scope_id: "channel-1".into(),
            enabled: true,
            priority: 8,
            condition: RuleCondition {
                keywords: vec!["refund".into(), "chargeback".into()],
                ..Default::default()
            },
            action: ActionConfig::Flag(FlagConfig {
                note: Some("billing, needs a human".into()),
            }),
            response_limit_per_run: None,
            require_approval: false,
            ab_tests: BTreeMap::new(),
        },
        Rule {
            id: "answer-questions".into(),
            name: "answer questions".into(),
            scope_id: "channel-1".into(),
            enabled: true,
            priority: 5,
            condition: RuleCondition {
                classification: Some("question".into()),
                ..Default::default()
            },
            action: ActionConfig::Respond(RespondConfig::default()),
            response_limit_per_run: Some(10),
            require_approval: false,
            ab_tests: greeting,
        },
        Rule {
            id: "thank-praise".into(),
            name: "thank nice comments".into(),
            scope_id: "channel-1".into(),
            enabled: true,
            priority: 1,
            condition: RuleCondition::default(),
            action: ActionConfig::Respond(RespondConfig {
                template: Some("thanks".into()),
            }),
            response_limit_per_run: None,
            require_approval: true,
            ab_tests: BTreeMap::new(),
        },
    ]
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();
    let prometheus = social_autoresponder::metrics::Metrics::init();

    let mut cfg = EngineConfig::load_default()?;
    cfg.pacing = PacingConfig::disabled(); // keep the demo snappy
    cfg.engine.auto_approve_minutes = Some(0); // expire queued approvals immediately

    let scopes = Arc::new(InMemoryScopes::new());
    scopes.upsert(Scope::new("channel-1", 15));

    let rules = Arc::new(InMemoryRules::new());
    for rule in demo_rules() {
        rules.upsert(rule)?;
    }

    let items = Arc::new(InMemoryItems::new());
    let log = Arc::new(InMemoryExecutionLog::new());
    let metrics = Arc::new(InMemoryMetrics::new());
    let approvals = Arc::new(InMemoryApprovals::new());
    let connector = Arc::new(FixtureConnector);

    let queue = Arc::new(ApprovalQueue::new(
        approvals.clone(),
        Arc::new(LogNotifier),
        cfg.engine.urgent_threshold,
    ));

    let executor = Arc::new(ActionExecutor::new(
        ExecutorParts {
            items: items.clone(),
            log: log.clone(),
            metrics: metrics.clone(),
            limiter: Arc::new(MinuteWindowLimiter::new()),
            selector: Arc::new(VariantSelector::new()),
            renderer: Arc::new(SimpleRenderer),
            safety: Arc::new(KeywordSafety),
            connector: connector.clone(),
            approvals: queue.clone(),
        },
        &cfg,
    ));

    let poller = Arc::new(Poller::new(
        scopes.clone(),
        items.clone(),
        connector,
        Arc::new(KeywordClassifier),
    ));
    let engine = Arc::new(RuleEngine::new(
        rules.clone(),
        items.clone(),
        executor,
        cfg.engine.default_response_limit,
        cfg.engine.max_items_per_run,
    ));

    // Short intervals so the demo sees each loop fire a few times.
    println!("== running scheduler loops for ~1s ==");
    let mut scheduler = Scheduler::new();
    {
        let poller = poller.clone();
        scheduler.spawn_loop("poll", std::time::Duration::from_millis(300), move || {
            let poller = poller.clone();
            async move {
                poller.run_once(Utc::now()).await;
                Ok(())
            }
        });
    }
    {
        let engine = engine.clone();
        scheduler.spawn_loop("automation", std::time::Duration::from_millis(300), move || {
            let engine = engine.clone();
            async move {
                engine.run_cycle().await;
                Ok(())
            }
        });
    }
    {
        let queue = queue.clone();
        scheduler.spawn_loop("approval-sweep", std::time::Duration::from_millis(300), move || {
            let queue = queue.clone();
            async move {
                queue.auto_approve_expired(Utc::now());
                Ok(())
            }
        });
    }
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    scheduler.stop().await;

    println!("\n== execution log ==");
    for record in log.all() {
        println!(
            "  [{:>12}] {:<7} item {} -> {:?} {}",
            record.rule_id.as_deref().unwrap_or("-"),
            record.action,
            record.item_id,
            record.status,
            record.detail.as_deref().unwrap_or("")
        );
    }

    println!("\n== approval sweep ==");
    let auto = queue.auto_approve_expired(Utc::now());
    println!("auto-approved {auto} expired entr(ies)");

    let analyzer = Analyzer::new(log.clone(), metrics.clone(), cfg.analytics, cfg.stats);
    println!("\nROI over the last day: {:.2}", analyzer.roi_for_window(Utc::now(), 1));
    for suggestion in analyzer.reweight_suggestions(Utc::now(), 7) {
        println!("suggestion: {suggestion:?}");
    }

    let rendered = prometheus.render();
    println!("\n== metrics (first lines) ==");
    for line in rendered.lines().take(12) {
        println!("{line}");
    }

    println!("\ncycle-demo done");
    Ok(())
}
