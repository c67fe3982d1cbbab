//! # Polling / Ingestion Loop
//! Decides which scopes are due, pulls fresh parent content and its child
//! items through the source connector, normalizes the text and enqueues
//! anything not seen before. Inserts are idempotent on the external item id,
//! so re-polling a quiet scope enqueues nothing.
//!
//! Failures stay local: one piece of content failing to fetch never aborts
//! its siblings, and one scope failing never aborts the tick.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use metrics::counter;

use crate::connector::{Classifier, SourceConnector};
use crate::model::{ItemStatus, QueuedItem, Scope};
use crate::store::{ItemStore, ScopeStore};

/// True iff the scope is due for polling: never polled, or the configured
/// interval has elapsed since the last poll.
pub fn should_poll(scope: &Scope, now: DateTime<Utc>) -> bool {
    match scope.last_polled_at {
        None => true,
        Some(last) => now >= last + Duration::minutes(scope.poll_interval_minutes),
    }
}

/// Normalize raw interaction text: decode HTML entities, strip tags, fold
/// typographic quotes to ASCII, collapse whitespace, drop trailing sentence
/// punctuation and cap the length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '.' | ',') {
            out.pop();
        } else {
            break;
        }
    }

    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollSummary {
    pub scopes_polled: usize,
    pub enqueued: usize,
    pub failed_scopes: usize,
}

pub struct Poller {
    scopes: Arc<dyn ScopeStore>,
    items: Arc<dyn ItemStore>,
    connector: Arc<dyn SourceConnector>,
    classifier: Arc<dyn Classifier>,
}

impl Poller {
    pub fn new(
        scopes: Arc<dyn ScopeStore>,
        items: Arc<dyn ItemStore>,
        connector: Arc<dyn SourceConnector>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            scopes,
            items,
            connector,
            classifier,
        }
    }

    /// Poll one scope: parent content since the last poll, child items per
    /// content, idempotent enqueue. Child fetch failures are logged and
    /// skipped so sibling content still gets ingested. Returns how many new
    /// items were enqueued and stamps `last_polled_at`.
    pub async fn poll_scope(&self, scope: &Scope, now: DateTime<Utc>) -> Result<usize> {
        let contents = self
            .connector
            .list_new_parent_content(&scope.id, scope.last_polled_at)
            .await
            .with_context(|| format!("listing content for scope {}", scope.id))?;

        let mut enqueued = 0usize;
        for content in &contents {
            let raw_items = match self.connector.list_new_child_items(&scope.id, content).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(
                        target: "ingest",
                        scope = %scope.id,
                        content = %content.id,
                        error = ?e,
                        "child item fetch failed, skipping content"
                    );
                    counter!("ingest_fetch_errors_total").increment(1);
                    continue;
                }
            };

            for raw in raw_items {
                let text = normalize_text(&raw.text);
                if text.is_empty() {
                    counter!("ingest_filtered_total").increment(1);
                    continue;
                }

                // Classification is best-effort; an unclassified item still
                // gets enqueued and can match keyword/author conditions.
                let classification = match self.classifier.classify(&text).await {
                    Ok(c) => Some(c.label),
                    Err(e) => {
                        tracing::debug!(
                            target: "ingest",
                            item = %raw.id,
                            error = ?e,
                            "classification failed"
                        );
                        None
                    }
                };

                let inserted = self.items.insert_if_absent(QueuedItem {
                    id: raw.id,
                    scope_id: scope.id.clone(),
                    parent_id: raw.parent_id,
                    text,
                    classification,
                    author_id: raw.author_id,
                    author_status: raw.author_status,
                    status: ItemStatus::Pending,
                    priority: 0,
                    created_at: now,
                });
                if inserted {
                    enqueued += 1;
                    counter!("ingest_enqueued_total").increment(1);
                } else {
                    counter!("ingest_dedup_total").increment(1);
                }
            }
        }

        self.scopes.set_last_polled(&scope.id, now);
        Ok(enqueued)
    }

    /// One polling tick across all due scopes. Scope failures are counted
    /// and logged, never propagated.
    pub async fn run_once(&self, now: DateTime<Utc>) -> PollSummary {
        crate::metrics::ensure_metrics_described();

        let mut summary = PollSummary::default();
        for scope in self.scopes.polling_enabled() {
            if !should_poll(&scope, now) {
                continue;
            }
            match self.poll_scope(&scope, now).await {
                Ok(enqueued) => {
                    summary.scopes_polled += 1;
                    summary.enqueued += enqueued;
                }
                Err(e) => {
                    summary.failed_scopes += 1;
                    tracing::warn!(
                        target: "ingest",
                        scope = %scope.id,
                        error = ?e,
                        "scope poll failed"
                    );
                    counter!("ingest_scope_errors_total").increment(1);
                }
            }
        }

        tracing::info!(
            target: "ingest",
            polled = summary.scopes_polled,
            enqueued = summary.enqueued,
            failed = summary.failed_scopes,
            "poll tick finished"
        );
        summary
    }
}
