// tests/engine_cycle.rs
//
// End-to-end runs of the rule engine against in-memory stores: ordering,
// per-run caps, first-match semantics and the autopost hand-off.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};

use social_autoresponder::approval::ApprovalQueue;
use social_autoresponder::config::{EngineConfig, PacingConfig};
use social_autoresponder::connector::{
    ContentRef, DeleteEvaluation, PostReceipt, RawItem, SafetyModeration, SourceConnector,
    TemplateRenderer,
};
use social_autoresponder::engine::RuleEngine;
use social_autoresponder::executor::{ActionExecutor, ExecutorParts};
use social_autoresponder::model::{ExecutionStatus, ItemStatus, QueuedItem};
use social_autoresponder::notify::LogNotifier;
use social_autoresponder::ratelimit::MinuteWindowLimiter;
use social_autoresponder::rules::{
    ActionConfig, FlagConfig, RespondConfig, Rule, RuleCondition,
};
use social_autoresponder::selector::VariantSelector;
use social_autoresponder::store::{
    ExecutionLog, InMemoryApprovals, InMemoryExecutionLog, InMemoryItems, InMemoryMetrics,
    InMemoryRules, ItemStore, RuleStore,
};

struct EchoRenderer;

#[async_trait::async_trait]
impl TemplateRenderer for EchoRenderer {
    async fn render(&self, _template_ref: &str, item: &QueuedItem) -> Result<String> {
        Ok(format!("reply to {}", item.id))
    }
}

struct AlwaysDelete;

#[async_trait::async_trait]
impl SafetyModeration for AlwaysDelete {
    async fn evaluate_delete_criteria(
        &self,
        _item: &QueuedItem,
        criteria: &social_autoresponder::rules::DeleteConfig,
    ) -> Result<DeleteEvaluation> {
        Ok(DeleteEvaluation {
            recommended_delete: true,
            confidence: 0.95,
            threshold: criteria.threshold,
            legitimate: false,
            reason: "test".into(),
        })
    }
}

struct NullConnector;

#[async_trait::async_trait]
impl SourceConnector for NullConnector {
    async fn list_new_parent_content(
        &self,
        _scope_id: &str,
        _since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<ContentRef>> {
        Ok(vec![])
    }

    async fn list_new_child_items(
        &self,
        _scope_id: &str,
        _content: &ContentRef,
    ) -> Result<Vec<RawItem>> {
        Ok(vec![])
    }

    async fn post_response(
        &self,
        _scope_id: &str,
        _item_id: &str,
        _text: &str,
    ) -> Result<PostReceipt> {
        Ok(PostReceipt {
            success: true,
            external_id: None,
        })
    }

    async fn delete_item(&self, _scope_id: &str, _item_id: &str) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "null"
    }
}

struct Fixture {
    items: Arc<InMemoryItems>,
    rules: Arc<InMemoryRules>,
    log: Arc<InMemoryExecutionLog>,
    approvals: Arc<InMemoryApprovals>,
    engine: RuleEngine,
}

fn fixture() -> Fixture {
    let mut cfg = EngineConfig::default();
    cfg.pacing = PacingConfig::disabled();

    let items = Arc::new(InMemoryItems::new());
    let rules = Arc::new(InMemoryRules::new());
    let log = Arc::new(InMemoryExecutionLog::new());
    let approvals = Arc::new(InMemoryApprovals::new());

    let queue = Arc::new(ApprovalQueue::new(
        approvals.clone(),
        Arc::new(LogNotifier),
        cfg.engine.urgent_threshold,
    ));
    let executor = Arc::new(
        ActionExecutor::new(
            ExecutorParts {
                items: items.clone(),
                log: log.clone(),
                metrics: Arc::new(InMemoryMetrics::new()),
                limiter: Arc::new(MinuteWindowLimiter::new()),
                selector: Arc::new(VariantSelector::seeded(3)),
                renderer: Arc::new(EchoRenderer),
                safety: Arc::new(AlwaysDelete),
                connector: Arc::new(NullConnector),
                approvals: queue,
            },
            &cfg,
        )
        .with_seeded_pacing(3),
    );

    let engine = RuleEngine::new(
        rules.clone(),
        items.clone(),
        executor,
        cfg.engine.default_response_limit,
        cfg.engine.max_items_per_run,
    );

    Fixture {
        items,
        rules,
        log,
        approvals,
        engine,
    }
}

fn item(id: &str, text: &str, classification: Option<&str>, priority: i32) -> QueuedItem {
    QueuedItem {
        id: id.into(),
        scope_id: "s1".into(),
        parent_id: "p1".into(),
        text: text.into(),
        classification: classification.map(str::to_string),
        author_id: None,
        author_status: None,
        status: ItemStatus::Pending,
        priority,
        created_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    }
}

fn respond_all(id: &str, priority: i32, limit: Option<u32>, require_approval: bool) -> Rule {
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

#[tokio::test]
async fn items_run_in_priority_order() {
    let f = fixture();
    f.rules.upsert(respond_all("r1", 1, None, false)).unwrap();
    for (id, priority) in [("a", 10), ("b", 50), ("c", 5)] {
        f.items.insert_if_absent(item(id, "hi", None, priority));
    }

    let summary = f.engine.run_scope("s1").await;
    assert_eq!(summary.executed, 3);

    let processed: Vec<String> = f.log.all().into_iter().map(|r| r.item_id).collect();
    assert_eq!(processed, vec!["b", "a", "c"]);
}

#[tokio::test]
async fn per_run_cap_stops_executions() {
    let f = fixture();
    f.rules
        .upsert(respond_all("r1", 1, Some(3), false))
        .unwrap();
    for i in 0..10 {
        f.items
            .insert_if_absent(item(&format!("i{i}"), "hello", None, 0));
    }

    let summary = f.engine.run_scope("s1").await;
    assert_eq!(summary.executed, 3);

    let executed: Vec<_> = f
        .log
        .all()
        .into_iter()
        .filter(|r| r.status == ExecutionStatus::Executed)
        .collect();
    assert_eq!(executed.len(), 3);
}

#[tokio::test]
async fn first_matching_rule_wins_by_priority() {
    let f = fixture();

    // priority 10: keyword "refund" -> flag
    f.rules
        .upsert(Rule {
            id: "flag-refund".into(),
            name: "flag refunds".into(),
            scope_id: "s1".into(),
            enabled: true,
            priority: 10,
            condition: RuleCondition {
                keywords: vec!["refund".into()],
                ..Default::default()
            },
            action: ActionConfig::Flag(FlagConfig::default()),
            response_limit_per_run: None,
            require_approval: false,
            ab_tests: BTreeMap::new(),
        })
        .unwrap();
    // priority 5: classification "question" -> respond
    f.rules
        .upsert(Rule {
            id: "answer".into(),
            name: "answer questions".into(),
            scope_id: "s1".into(),
            enabled: true,
            priority: 5,
            condition: RuleCondition {
                classification: Some("question".into()),
                ..Default::default()
            },
            action: ActionConfig::Respond(RespondConfig::default()),
            response_limit_per_run: None,
            require_approval: false,
            ab_tests: BTreeMap::new(),
        })
        .unwrap();

    f.items.insert_if_absent(item(
        "i1",
        "Can I get a refund?",
        Some("question"),
        0,
    ));

    let summary = f.engine.run_scope("s1").await;
    assert_eq!(summary.executed, 1);

    // the flag rule won; no respond record exists for the item
    let records = f.log.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rule_id.as_deref(), Some("flag-refund"));
    assert_eq!(records[0].action, "flag");
    assert_eq!(
        f.items.get("i1").unwrap().status,
        ItemStatus::NeedsReview
    );
}

#[tokio::test]
async fn autopost_marks_responded_items_processing() {
    let f = fixture();
    f.rules.upsert(respond_all("r1", 1, None, false)).unwrap();
    f.items.insert_if_absent(item("i1", "hello", None, 0));

    f.engine.run_scope("s1").await;
    assert_eq!(f.items.get("i1").unwrap().status, ItemStatus::Processing);
}

#[tokio::test]
async fn approval_only_scopes_leave_items_pending() {
    let f = fixture();
    f.rules.upsert(respond_all("r1", 1, None, true)).unwrap();
    f.items.insert_if_absent(item("i1", "hello", None, 0));

    let summary = f.engine.run_scope("s1").await;
    assert_eq!(summary.executed, 1);
    // no autopost rule in the scope, so the item stays pending for the
    // approval path to resolve
    assert_eq!(f.items.get("i1").unwrap().status, ItemStatus::Pending);

    use social_autoresponder::store::ApprovalStore;
    assert_eq!(f.approvals.pending(Some("s1"), 10).len(), 1);
}

#[tokio::test]
async fn run_cycle_covers_all_scopes_with_rules() {
    let f = fixture();
    f.rules.upsert(respond_all("r1", 1, None, false)).unwrap();
    let mut other = respond_all("r2", 1, None, false);
    other.scope_id = "s2".into();
    f.rules.upsert(other).unwrap();

    f.items.insert_if_absent(item("i1", "hello", None, 0));
    let mut foreign = item("i2", "hello", None, 0);
    foreign.scope_id = "s2".into();
    f.items.insert_if_absent(foreign);

    let cycle = f.engine.run_cycle().await;
    assert_eq!(cycle.scopes, 2);
    assert_eq!(cycle.executed, 2);
    assert_eq!(cycle.failed_scopes, 0);
}
