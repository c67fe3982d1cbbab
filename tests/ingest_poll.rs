// tests/ingest_poll.rs
//
// Polling loop behavior against a scripted connector: idempotent ingestion,
// per-content fault isolation, and interval gating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};

use social_autoresponder::connector::{
    Classification, Classifier, ContentRef, PostReceipt, RawItem, SourceConnector,
};
use social_autoresponder::ingest::Poller;
use social_autoresponder::model::{ItemStatus, Scope};
use social_autoresponder::store::{
    InMemoryItems, InMemoryScopes, ItemStore, ScopeStore,
};

struct ScriptedConnector {
    /// Parent content ids; children named `<parent>-c<i>`.
    parents: Vec<&'static str>,
    children_per_parent: usize,
    /// Parents whose child fetch should fail.
    broken_parents: Vec<&'static str>,
    child_calls: AtomicUsize,
}

impl ScriptedConnector {
    fn new(parents: Vec<&'static str>, children_per_parent: usize) -> Self {
        Self {
            parents,
            children_per_parent,
            broken_parents: vec![],
            child_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl SourceConnector for ScriptedConnector {
    async fn list_new_parent_content(
        &self,
        _scope_id: &str,
        _since: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<ContentRef>> {
        Ok(self
            .parents
            .iter()
            .map(|id| ContentRef {
                id: id.to_string(),
                published_at: Utc::now() - Duration::hours(1),
            })
            .collect())
    }

    async fn list_new_child_items(
        &self,
        _scope_id: &str,
        content: &ContentRef,
    ) -> Result<Vec<RawItem>> {
        self.child_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_parents.contains(&content.id.as_str()) {
            anyhow::bail!("upstream 500 for {}", content.id);
        }
        Ok((0..self.children_per_parent)
            .map(|i| RawItem {
                id: format!("{}-c{i}", content.id),
                parent_id: content.id.clone(),
                text: format!("comment {i} on {}", content.id),
                author_id: Some("user".into()),
                author_status: Some("subscriber".into()),
                published_at: Utc::now() - Duration::minutes(5),
            })
            .collect())
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
        "scripted"
    }
}

struct StaticClassifier;

#[async_trait::async_trait]
impl Classifier for StaticClassifier {
    async fn classify(&self, _text: &str) -> Result<Classification> {
        Ok(Classification {
            label: "other".into(),
            keywords: vec![],
            language: None,
        })
    }
}

fn poller(connector: Arc<ScriptedConnector>) -> (Poller, Arc<InMemoryScopes>, Arc<InMemoryItems>) {
    let scopes = Arc::new(InMemoryScopes::new());
    let items = Arc::new(InMemoryItems::new());
    let p = Poller::new(
        scopes.clone(),
        items.clone(),
        connector,
        Arc::new(StaticClassifier),
    );
    (p, scopes, items)
}

#[tokio::test]
async fn polling_twice_enqueues_no_duplicates() {
    let connector = Arc::new(ScriptedConnector::new(vec!["post-1", "post-2"], 3));
    let (poller, scopes, items) = poller(connector);
    scopes.upsert(Scope::new("s1", 0)); // zero interval: always due

    let first = poller.run_once(Utc::now()).await;
    assert_eq!(first.scopes_polled, 1);
    assert_eq!(first.enqueued, 6);

    let second = poller.run_once(Utc::now()).await;
    assert_eq!(second.enqueued, 0, "no new upstream items, no new rows");

    // everything that landed is pending at priority 0
    for parent in ["post-1", "post-2"] {
        for i in 0..3 {
            let item = items.get(&format!("{parent}-c{i}")).unwrap();
            assert_eq!(item.status, ItemStatus::Pending);
            assert_eq!(item.priority, 0);
        }
    }
}

#[tokio::test]
async fn broken_content_does_not_abort_siblings() {
    let mut connector = ScriptedConnector::new(vec!["ok-1", "broken", "ok-2"], 2);
    connector.broken_parents = vec!["broken"];
    let connector = Arc::new(connector);
    let (poller, scopes, items) = poller(connector.clone());
    scopes.upsert(Scope::new("s1", 0));

    let summary = poller.run_once(Utc::now()).await;
    assert_eq!(summary.failed_scopes, 0, "a child failure is not a scope failure");
    assert_eq!(summary.enqueued, 4);
    assert_eq!(connector.child_calls.load(Ordering::SeqCst), 3);
    assert!(items.get("ok-1-c0").is_some());
    assert!(items.get("ok-2-c1").is_some());
    assert!(items.get("broken-c0").is_none());
}

#[tokio::test]
async fn recently_polled_scopes_are_skipped() {
    let connector = Arc::new(ScriptedConnector::new(vec!["post-1"], 1));
    let (poller, scopes, _items) = poller(connector);

    let now = Utc::now();
    let mut scope = Scope::new("s1", 15);
    scope.last_polled_at = Some(now - Duration::minutes(5));
    scopes.upsert(scope);

    let summary = poller.run_once(now).await;
    assert_eq!(summary.scopes_polled, 0);

    // once the interval elapses the scope is due again and gets stamped
    let later = now + Duration::minutes(11);
    let summary = poller.run_once(later).await;
    assert_eq!(summary.scopes_polled, 1);
    assert_eq!(scopes.get("s1").unwrap().last_polled_at, Some(later));
}

#[tokio::test]
async fn disabled_scopes_are_never_polled() {
    let connector = Arc::new(ScriptedConnector::new(vec!["post-1"], 1));
    let (poller, scopes, _items) = poller(connector.clone());

    let mut scope = Scope::new("s1", 0);
    scope.polling_enabled = false;
    scopes.upsert(scope);

    let summary = poller.run_once(Utc::now()).await;
    assert_eq!(summary.scopes_polled, 0);
    assert_eq!(connector.child_calls.load(Ordering::SeqCst), 0);
}
