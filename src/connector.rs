//! # Collaborator Interfaces
//! Async seams to the systems this engine orchestrates but does not own:
//! the platform connector that fetches and mutates content, the opaque
//! classifier, the template renderer, and safety/moderation.
//!
//! Implementations live with the host application (or in test doubles); the
//! engine only depends on these traits.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::QueuedItem;
use crate::rules::DeleteConfig;

/// A piece of parent content (post, video) comments hang off of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRef {
    pub id: String,
    pub published_at: DateTime<Utc>,
}

/// A raw, not-yet-ingested interaction as the platform reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// External id, unique per platform. Ingestion dedups on it.
    pub id: String,
    pub parent_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_status: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// Receipt for a posted response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostReceipt {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

#[async_trait::async_trait]
pub trait SourceConnector: Send + Sync {
    /// Recently-published parent content for a scope, newer than `since`.
    async fn list_new_parent_content(
        &self,
        scope_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ContentRef>>;

    /// New child items (comments) under one piece of parent content.
    async fn list_new_child_items(
        &self,
        scope_id: &str,
        content: &ContentRef,
    ) -> Result<Vec<RawItem>>;

    /// Publish a response under an item. Used by the downstream poster, not
    /// by the engine core.
    async fn post_response(&self, scope_id: &str, item_id: &str, text: &str)
        -> Result<PostReceipt>;

    /// Remove an item on the platform.
    async fn delete_item(&self, scope_id: &str, item_id: &str) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Opaque classification output. Rule conditions consume only the label and
/// keywords.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification>;
}

#[async_trait::async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// Render a response template against the interaction being answered.
    async fn render(&self, template_ref: &str, item: &QueuedItem) -> Result<String>;
}

/// Structured moderation verdict for a proposed delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteEvaluation {
    pub recommended_delete: bool,
    pub confidence: f64,
    pub threshold: f64,
    /// The content looks like a legitimate interaction (mitigates against
    /// deleting critics rather than spam).
    pub legitimate: bool,
    pub reason: String,
}

#[async_trait::async_trait]
pub trait SafetyModeration: Send + Sync {
    async fn evaluate_delete_criteria(
        &self,
        item: &QueuedItem,
        criteria: &DeleteConfig,
    ) -> Result<DeleteEvaluation>;
}
