//! Orchestrator: turns one user query into an Aggregated Result.
//!
//! Flow per query:
//! 1. **Classify**: pattern table picks the relevant tool classes.
//! 2. **Invoke**: each class runs concurrently through its own attempt
//!    sequence: the unmodified call first, then each recovery strategy in
//!    order, strictly one after another.
//! 3. **Aggregate**: successes and failure descriptors land in one map;
//!    a failed class never fails the whole query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::classifier::{ClassifierError, PatternTable};
use super::invoker::ToolInvoker;
use super::performance::PerformanceTracker;
use super::recovery::{strategies_for, RecoveryPlanner, RecoveryStrategy};
use super::tool_classes::{resolve_specs, ToolClassSpec};
use super::types::{AggregatedResult, ToolOutcome};
use crate::config::GatherSettings;
use crate::mcp_client::{ConnectionPool, ServerHealth};

/// Entry point for the conversational layer.
pub struct Orchestrator {
    invoker: ToolInvoker,
    planner: RecoveryPlanner,
    classifier: PatternTable,
    specs: Vec<ToolClassSpec>,
}

impl Orchestrator {
    pub fn new(pool: Arc<ConnectionPool>, settings: &GatherSettings) -> Result<Self, ClassifierError> {
        Ok(Self::with_classifier(
            pool,
            settings,
            PatternTable::default_table()?,
        ))
    }

    /// Build with a custom pattern table.
    pub fn with_classifier(
        pool: Arc<ConnectionPool>,
        settings: &GatherSettings,
        classifier: PatternTable,
    ) -> Self {
        let tracker = Arc::new(PerformanceTracker::new(&settings.tracker));
        Self {
            planner: RecoveryPlanner::new(Arc::clone(&tracker)),
            invoker: ToolInvoker::new(pool, tracker, settings.retry.clone()),
            classifier,
            specs: resolve_specs(settings),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.invoker.pool()
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        self.invoker.tracker()
    }

    /// Tool classes to query: pattern matches whose class is enabled and
    /// whose server is configured and enabled.
    pub fn classify(&self, query: &str, context: Option<&str>) -> Vec<&ToolClassSpec> {
        let matched = self.classifier.classify(query, context);
        self.specs
            .iter()
            .filter(|spec| matched.contains(&spec.class))
            .filter(|spec| {
                let usable = spec.enabled && self.pool().is_enabled(&spec.server_key);
                if !usable {
                    tracing::debug!(
                        class = spec.class.result_key(),
                        server = %spec.server_key,
                        "skipping class: disabled or server not configured"
                    );
                }
                usable
            })
            .collect()
    }

    /// Query every relevant tool class and aggregate the outcomes.
    ///
    /// Always returns a complete result; failures appear as descriptors.
    pub async fn gather_data(&self, query: &str, context: Option<&str>) -> AggregatedResult {
        let query_id = Uuid::new_v4();
        let started = Instant::now();
        let specs = self.classify(query, context);

        if specs.is_empty() {
            tracing::info!(%query_id, "gather: no tool classes matched");
            return AggregatedResult::default();
        }

        tracing::info!(
            %query_id,
            classes = ?specs.iter().map(|s| s.class.result_key()).collect::<Vec<_>>(),
            "gather: querying tool classes"
        );

        let runs = specs.into_iter().map(|spec| async move {
            let outcome = self.run_class(query_id, spec, query).await;
            (spec.class.result_key().to_string(), outcome)
        });
        let results: BTreeMap<String, ToolOutcome> =
            futures::future::join_all(runs).await.into_iter().collect();

        let succeeded = results.values().filter(|o| o.is_success()).count();
        tracing::info!(
            %query_id,
            succeeded,
            failed = results.len() - succeeded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gather: complete"
        );

        AggregatedResult { results }
    }

    /// Probe every enabled server.
    pub async fn health_check(&self) -> BTreeMap<String, ServerHealth> {
        self.pool().health_check().await
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        self.pool().shutdown_all().await;
    }

    /// Drive one class from its first attempt to success or exhaustion.
    async fn run_class(&self, query_id: Uuid, spec: &ToolClassSpec, query: &str) -> ToolOutcome {
        let base = spec.base_params(query);
        let mut params = base.clone();
        let mut strategy: Option<&'static RecoveryStrategy> = None;
        let mut attempts: u32 = 0;

        loop {
            let timeout = self.planner.attempt_timeout(spec, strategy);
            let result = self
                .invoker
                .call_with_timeout(&spec.server_key, &spec.tool_name, params, timeout)
                .await;
            attempts += 1;

            let error = match result {
                Ok(value) => {
                    if let Some(s) = strategy {
                        tracing::info!(
                            %query_id,
                            class = spec.class.result_key(),
                            strategy = s.name,
                            attempts,
                            "gather: recovered"
                        );
                    }
                    return ToolOutcome::Success(value);
                }
                Err(e) => e,
            };

            // Strategies are the retries, so retry n uses strategy n.
            let retry_index = (attempts - 1) as usize;

            if error.is_connection_error() {
                tracing::warn!(
                    %query_id,
                    class = spec.class.result_key(),
                    error = %error,
                    "gather: no connection"
                );
                let remaining = strategies_for(spec.class)
                    .get(retry_index..)
                    .unwrap_or_default();
                return ToolOutcome::failure(
                    self.planner
                        .failure_descriptor(spec, &error, attempts, false, remaining),
                );
            }

            match self.planner.next_strategy(spec.class, retry_index) {
                Some(next) => {
                    tracing::info!(
                        %query_id,
                        class = spec.class.result_key(),
                        error = %error,
                        next = next.name,
                        "gather: attempt failed, degrading"
                    );
                    let delay = self.invoker.retry_settings().delay_for(retry_index as u32);
                    tokio::time::sleep(delay).await;
                    params = next.apply(spec, &base, query);
                    strategy = Some(next);
                }
                None => {
                    tracing::warn!(
                        %query_id,
                        class = spec.class.result_key(),
                        attempts,
                        error = %error,
                        "gather: strategies exhausted"
                    );
                    return ToolOutcome::failure(self.planner.failure_descriptor(
                        spec,
                        &error,
                        attempts,
                        true,
                        strategies_for(spec.class),
                    ));
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
