//! # Metrics
//! Prometheus recorder bootstrap plus one-time descriptions for every series
//! the engine emits, so they all show up with help text on first render.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once from the binary.
    pub fn init() -> Self {
        // Use default buckets to avoid API differences across crate versions.
        let builder = PrometheusBuilder::new();

        let handle = builder
            .install_recorder()
            .expect("prometheus: install recorder");

        ensure_metrics_described();

        Self { handle }
    }

    /// Current exposition-format snapshot for operators.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// One-time metrics registration (so series show up described).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_enqueued_total", "New items enqueued by polling.");
        describe_counter!(
            "ingest_dedup_total",
            "Items skipped because the external id was already known."
        );
        describe_counter!(
            "ingest_filtered_total",
            "Items dropped at ingest (empty after normalization)."
        );
        describe_counter!(
            "ingest_fetch_errors_total",
            "Child item fetch failures (content skipped)."
        );
        describe_counter!("ingest_scope_errors_total", "Whole-scope poll failures.");

        describe_counter!("engine_cycles_total", "Automation cycles completed.");
        describe_counter!(
            "engine_executions_total",
            "Successful action executions across all scopes."
        );
        describe_gauge!("engine_last_cycle_ts", "Unix ts of the last automation cycle.");

        describe_counter!(
            "executor_actions_total",
            "Executor invocations by action and outcome."
        );
        describe_histogram!("executor_elapsed_ms", "Executor invocation time in ms.");

        describe_counter!("approval_enqueued_total", "Approval entries queued.");
        describe_counter!("approval_approved_total", "Entries approved by humans.");
        describe_counter!(
            "approval_auto_approved_total",
            "Entries auto-approved by the expiry sweep."
        );
        describe_counter!("approval_rejected_total", "Entries rejected.");
        describe_counter!(
            "approval_feedback_events_total",
            "Learning events emitted on approval."
        );
    });
}
