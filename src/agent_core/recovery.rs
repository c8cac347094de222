//! Recovery planning for failed tool calls.
//!
//! Each tool class has a static, ordered list of degradation strategies.
//! The orchestrator walks the list one attempt at a time; the planner picks
//! the strategy, rewrites the call parameters, and sizes the timeout from
//! observed latency. When a class fails, the planner also writes the
//! user-facing failure descriptor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use super::performance::PerformanceTracker;
use super::tool_classes::ToolClassSpec;
use super::types::{
    ErrorKind, FailureDescriptor, PerformanceContext, RecoveryOption, ToolClass,
};
use crate::mcp_client::McpError;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Headroom over the observed p95 when sizing an adaptive timeout.
const P95_HEADROOM: f64 = 1.2;

/// Adaptive timeouts never exceed this multiple of the base timeout.
const MAX_TIMEOUT_MULTIPLIER: u32 = 2;

/// Success rate assumed for a tool with no history.
const UNKNOWN_SUCCESS_RATE: f64 = 0.5;

/// Estimate bonus for strategies that make the query smaller.
const SHRINK_BONUS: f64 = 0.2;

// ─── Strategies ─────────────────────────────────────────────────────────────

/// One degradation step applied on retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryStrategy {
    pub name: &'static str,
    pub description: &'static str,
    /// Upper bound for the result-count parameter.
    pub result_cap: Option<u32>,
    /// Scope the search to a sub-resource named in the query.
    pub narrow: bool,
    /// Multiplier on the adaptive timeout for this attempt.
    pub timeout_factor: f64,
}

impl RecoveryStrategy {
    /// Whether the strategy asks the server for less work.
    pub fn shrinks_query(&self) -> bool {
        self.result_cap.is_some() || self.narrow
    }

    /// Rewrite the base parameters for this attempt.
    ///
    /// When narrowing finds no sub-resource in the query, the result count
    /// is halved instead so the attempt still asks for less.
    pub fn apply(
        &self,
        spec: &ToolClassSpec,
        base: &serde_json::Value,
        query: &str,
    ) -> serde_json::Value {
        let mut params = base.clone();
        if let Some(obj) = params.as_object_mut() {
            self.rewrite(spec, obj, query);
        }
        params
    }

    fn rewrite(
        &self,
        spec: &ToolClassSpec,
        obj: &mut serde_json::Map<String, serde_json::Value>,
        query: &str,
    ) {
        let mut limit = obj
            .get(&spec.limit_param)
            .and_then(|v| v.as_u64())
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(spec.default_limit);

        if let Some(cap) = self.result_cap {
            limit = limit.min(cap);
        }

        if self.narrow {
            match extract_subresource(spec.class, query) {
                Some(scope) => {
                    obj.insert(spec.subresource_param.clone(), serde_json::json!(scope));
                }
                None => limit = (limit / 2).max(1),
            }
        }

        obj.insert(spec.limit_param.clone(), serde_json::json!(limit));
    }
}

static ISSUE_STRATEGIES: [RecoveryStrategy; 3] = [
    RecoveryStrategy {
        name: "reduce_results",
        description: "Fetch fewer issues (at most 20)",
        result_cap: Some(20),
        narrow: false,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "narrow_to_project",
        description: "Search only the project named in the question",
        result_cap: Some(20),
        narrow: true,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "extend_timeout",
        description: "Retry a small search with a longer timeout",
        result_cap: Some(10),
        narrow: false,
        timeout_factor: 2.0,
    },
];

static PAGE_STRATEGIES: [RecoveryStrategy; 3] = [
    RecoveryStrategy {
        name: "reduce_results",
        description: "Fetch fewer pages (at most 10)",
        result_cap: Some(10),
        narrow: false,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "narrow_to_space",
        description: "Search only the space named in the question",
        result_cap: Some(10),
        narrow: true,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "extend_timeout",
        description: "Retry a small search with a longer timeout",
        result_cap: Some(5),
        narrow: false,
        timeout_factor: 2.0,
    },
];

static DRIVE_STRATEGIES: [RecoveryStrategy; 3] = [
    RecoveryStrategy {
        name: "reduce_results",
        description: "Fetch fewer files (at most 10)",
        result_cap: Some(10),
        narrow: false,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "narrow_to_folder",
        description: "Search only the folder named in the question",
        result_cap: Some(10),
        narrow: true,
        timeout_factor: 1.0,
    },
    RecoveryStrategy {
        name: "extend_timeout",
        description: "Retry a small search with a longer timeout",
        result_cap: Some(5),
        narrow: false,
        timeout_factor: 2.0,
    },
];

/// Ordered strategies for a class.
pub fn strategies_for(class: ToolClass) -> &'static [RecoveryStrategy] {
    match class {
        ToolClass::IssueSearch => &ISSUE_STRATEGIES,
        ToolClass::PageSearch => &PAGE_STRATEGIES,
        ToolClass::DriveSearch => &DRIVE_STRATEGIES,
    }
}

/// Sub-resource patterns per class, tried in order. Group 1 is the scope.
const SCOPE_PATTERNS: &[(ToolClass, &[&str])] = &[
    // An issue key like `OPS-142` names its project.
    (
        ToolClass::IssueSearch,
        &[r"\b([A-Z][A-Z0-9]+)-\d+\b", r"(?i)\bproject\s+([A-Za-z0-9_-]+)"],
    ),
    (ToolClass::PageSearch, &[r"(?i)\bspace\s+([A-Za-z0-9_-]+)"]),
    (
        ToolClass::DriveSearch,
        &[r#"(?i)\bfolder\s+"([^"]+)""#, r"(?i)\bfolder\s+([A-Za-z0-9_-]+)"],
    ),
];

static SCOPE_REGEXES: Lazy<HashMap<ToolClass, Vec<Regex>>> = Lazy::new(|| {
    SCOPE_PATTERNS
        .iter()
        .map(|(class, patterns)| {
            let compiled = patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::error!(pattern = %p, error = %e, "invalid scope pattern");
                        None
                    }
                })
                .collect();
            (*class, compiled)
        })
        .collect()
});

/// Pull a project key, space key or folder name out of the query text.
pub fn extract_subresource(class: ToolClass, query: &str) -> Option<String> {
    SCOPE_REGEXES.get(&class)?.iter().find_map(|re| {
        re.captures(query)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}

// ─── Planner ────────────────────────────────────────────────────────────────

/// Chooses retry strategies and timeouts, and explains failures.
pub struct RecoveryPlanner {
    tracker: Arc<PerformanceTracker>,
}

impl RecoveryPlanner {
    pub fn new(tracker: Arc<PerformanceTracker>) -> Self {
        Self { tracker }
    }

    /// Strategy for retry number `attempt` (0-based), or `None` once exhausted.
    pub fn next_strategy(
        &self,
        class: ToolClass,
        attempt: usize,
    ) -> Option<&'static RecoveryStrategy> {
        strategies_for(class).get(attempt)
    }

    /// `min(p95 * 1.2, base * 2)` with enough samples, else `base`.
    pub fn suggested_timeout(&self, tool: &str, base: Duration) -> Duration {
        match self.tracker.stats(tool) {
            Some(stats) => {
                let adaptive =
                    Duration::from_millis((stats.p95_ms as f64 * P95_HEADROOM).round() as u64);
                adaptive.min(base * MAX_TIMEOUT_MULTIPLIER)
            }
            None => base,
        }
    }

    /// The single timeout budget for an attempt: the adaptive timeout scaled
    /// by the strategy's factor.
    pub fn attempt_timeout(
        &self,
        spec: &ToolClassSpec,
        strategy: Option<&RecoveryStrategy>,
    ) -> Duration {
        let base = self.suggested_timeout(&spec.tool_name, spec.base_timeout);
        match strategy {
            Some(s) => base.mul_f64(s.timeout_factor.max(0.1)),
            None => base,
        }
    }

    /// Estimated chance a strategy succeeds, from history plus a bonus for
    /// strategies that shrink the query.
    pub fn estimate_success(&self, tool: &str, strategy: &RecoveryStrategy) -> f64 {
        let history = self
            .tracker
            .success_rate(tool)
            .unwrap_or(UNKNOWN_SUCCESS_RATE);
        let bonus = if strategy.shrinks_query() { SHRINK_BONUS } else { 0.0 };
        let estimate = history * 0.7 + bonus;
        (estimate.clamp(0.05, 0.95) * 100.0).round() / 100.0
    }

    /// Build the structured failure report for a class.
    ///
    /// `options` are the strategies to offer; a manual-check option is
    /// always appended.
    pub fn failure_descriptor(
        &self,
        spec: &ToolClassSpec,
        error: &McpError,
        attempts: u32,
        exhausted: bool,
        options: &[RecoveryStrategy],
    ) -> FailureDescriptor {
        let kind = ErrorKind::from_error(error);
        let system = spec.class.display_name();

        let mut recovery_options: Vec<RecoveryOption> = options
            .iter()
            .map(|s| RecoveryOption {
                strategy: s.name.to_string(),
                description: s.description.to_string(),
                estimated_success_rate: Some(self.estimate_success(&spec.tool_name, s)),
            })
            .collect();
        recovery_options.push(RecoveryOption {
            strategy: "manual_check".to_string(),
            description: format!("Check {system} directly"),
            estimated_success_rate: None,
        });

        let performance_context = self.tracker.stats(&spec.tool_name).map(|stats| {
            PerformanceContext {
                suggested_timeout_ms: self
                    .suggested_timeout(&spec.tool_name, spec.base_timeout)
                    .as_millis() as u64,
                stats,
            }
        });

        let summary = compose_summary(
            system,
            kind,
            attempts,
            exhausted,
            performance_context.as_ref(),
            &recovery_options,
        );

        FailureDescriptor {
            error: kind,
            message: error.to_string(),
            summary,
            recovery_options,
            performance_context,
            attempts,
            exhausted,
        }
    }
}

fn compose_summary(
    system: &str,
    kind: ErrorKind,
    attempts: u32,
    exhausted: bool,
    perf: Option<&PerformanceContext>,
    options: &[RecoveryOption],
) -> String {
    let plural = if attempts == 1 { "attempt" } else { "attempts" };
    let mut summary = format!("The {system} search {} after {attempts} {plural}", kind.describe());
    if exhausted {
        summary.push_str(", and every fallback strategy was tried");
    }
    summary.push('.');

    if let Some(perf) = perf {
        summary.push_str(&format!(
            " It usually answers in {}ms (p95 {}ms) and succeeds {:.0}% of the time.",
            perf.stats.p50_ms,
            perf.stats.p95_ms,
            perf.stats.success_rate * 100.0
        ));
    }

    let best = options
        .iter()
        .filter_map(|o| o.estimated_success_rate.map(|r| (o, r)))
        .max_by(|a, b| a.1.total_cmp(&b.1));
    match best {
        Some((option, rate)) => summary.push_str(&format!(
            " Best next step: {} (about {:.0}% likely to work), or check {system} directly.",
            option.description.to_lowercase(),
            rate * 100.0
        )),
        None => summary.push_str(&format!(" Try checking {system} directly.")),
    }

    summary
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerSettings;

    fn planner() -> (RecoveryPlanner, Arc<PerformanceTracker>) {
        let tracker = Arc::new(PerformanceTracker::new(&TrackerSettings::default()));
        (RecoveryPlanner::new(Arc::clone(&tracker)), tracker)
    }

    fn timeout_error() -> McpError {
        McpError::Timeout {
            tool: "jira_search".into(),
            timeout_ms: 15_000,
        }
    }

    #[test]
    fn test_next_strategy_exhausts_monotonically() {
        let (planner, _) = planner();
        for class in ToolClass::ALL {
            let len = strategies_for(class).len();
            assert!(len > 0);
            for attempt in 0..len {
                assert!(planner.next_strategy(class, attempt).is_some());
            }
            for attempt in len..len + 5 {
                assert!(planner.next_strategy(class, attempt).is_none());
            }
        }
    }

    #[test]
    fn test_suggested_timeout_without_data_is_base() {
        let (planner, _) = planner();
        let base = Duration::from_secs(10);
        assert_eq!(planner.suggested_timeout("jira_search", base), base);
    }

    #[test]
    fn test_suggested_timeout_tracks_p95() {
        let (planner, tracker) = planner();
        for d in [100, 120, 110, 130, 125, 115] {
            tracker.record("jira_search", d, true);
        }
        // p95 = 130 → 156ms, well under 2 * base.
        let t = planner.suggested_timeout("jira_search", Duration::from_secs(10));
        assert_eq!(t, Duration::from_millis(156));
    }

    #[test]
    fn test_suggested_timeout_capped_at_twice_base() {
        let (planner, tracker) = planner();
        for _ in 0..10 {
            tracker.record("search", 60_000, true);
        }
        let t = planner.suggested_timeout("search", Duration::from_secs(5));
        assert_eq!(t, Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_timeout_applies_strategy_factor() {
        let (planner, _) = planner();
        let spec = ToolClassSpec::builtin(ToolClass::IssueSearch);
        let extend = planner.next_strategy(ToolClass::IssueSearch, 2).unwrap();
        assert_eq!(extend.name, "extend_timeout");
        assert_eq!(planner.attempt_timeout(&spec, None), spec.base_timeout);
        assert_eq!(
            planner.attempt_timeout(&spec, Some(extend)),
            spec.base_timeout * 2
        );
    }

    #[test]
    fn test_narrow_uses_issue_key_project() {
        let spec = ToolClassSpec::builtin(ToolClass::IssueSearch);
        let base = spec.base_params("what is blocking OPS-142?");
        let narrow = &strategies_for(ToolClass::IssueSearch)[1];
        let params = narrow.apply(&spec, &base, "what is blocking OPS-142?");
        assert_eq!(params["project"], "OPS");
        assert_eq!(params["limit"], 20);
        assert_eq!(params["query"], "what is blocking OPS-142?");
    }

    #[test]
    fn test_narrow_without_subresource_halves_limit() {
        let spec = ToolClassSpec::builtin(ToolClass::PageSearch);
        let query = "confluence pages about onboarding";
        let base = spec.base_params(query);
        let narrow = &strategies_for(ToolClass::PageSearch)[1];
        let params = narrow.apply(&spec, &base, query);
        assert!(params.get("space").is_none());
        assert_eq!(params["limit"], 5);
    }

    #[test]
    fn test_every_scope_pattern_compiles() {
        for (class, patterns) in SCOPE_PATTERNS {
            assert_eq!(SCOPE_REGEXES[class].len(), patterns.len(), "{class:?}");
        }
    }

    #[test]
    fn test_oversized_limit_saturates_before_cap() {
        let spec = ToolClassSpec::builtin(ToolClass::IssueSearch);
        let mut base = spec.base_params("open bugs");
        // Would wrap to 0 if narrowed to 32 bits.
        base["limit"] = serde_json::json!(1u64 << 32);
        let reduce = &strategies_for(ToolClass::IssueSearch)[0];
        let params = reduce.apply(&spec, &base, "open bugs");
        assert_eq!(params["limit"], 20);
    }

    #[test]
    fn test_extract_quoted_drive_folder() {
        let folder = extract_subresource(
            ToolClass::DriveSearch,
            r#"find the deck in folder "Q3 Planning" on drive"#,
        );
        assert_eq!(folder.as_deref(), Some("Q3 Planning"));
        assert_eq!(
            extract_subresource(ToolClass::PageSearch, "runbooks in space OPS"),
            Some("OPS".to_string())
        );
        assert!(extract_subresource(ToolClass::IssueSearch, "open bugs").is_none());
    }

    #[test]
    fn test_estimate_rewards_shrinking_strategies() {
        let (planner, tracker) = planner();
        tracker.record("jira_search", 100, true);
        tracker.record("jira_search", 100, false);
        let shrink = RecoveryStrategy {
            name: "reduce_results",
            description: "",
            result_cap: Some(5),
            narrow: false,
            timeout_factor: 1.0,
        };
        let wait = RecoveryStrategy {
            result_cap: None,
            name: "wait",
            ..shrink.clone()
        };
        let a = planner.estimate_success("jira_search", &shrink);
        let b = planner.estimate_success("jira_search", &wait);
        assert!(a > b);
        assert!((b - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_failure_descriptor_lists_options_and_manual_check() {
        let (planner, _) = planner();
        let spec = ToolClassSpec::builtin(ToolClass::IssueSearch);
        let d = planner.failure_descriptor(
            &spec,
            &timeout_error(),
            4,
            true,
            strategies_for(ToolClass::IssueSearch),
        );
        assert_eq!(d.error, ErrorKind::TimeoutError);
        assert_eq!(d.recovery_options.len(), 4);
        assert_eq!(d.recovery_options[3].strategy, "manual_check");
        assert!(d.recovery_options[..3]
            .iter()
            .all(|o| o.estimated_success_rate.is_some()));
        assert!(d.performance_context.is_none());
        assert!(d.summary.contains("Jira"));
        assert!(d.summary.contains("timed out"));
    }

    #[test]
    fn test_failure_descriptor_includes_performance_context() {
        let (planner, tracker) = planner();
        for d in [200, 220, 210, 230, 240] {
            tracker.record("search", d, true);
        }
        let spec = ToolClassSpec::builtin(ToolClass::DriveSearch);
        let error = McpError::TransportError {
            server: "googleDrive".into(),
            reason: "server stdout closed".into(),
        };
        let d = planner.failure_descriptor(&spec, &error, 1, false, &[]);
        assert_eq!(d.error, ErrorKind::TransportError);
        assert_eq!(d.recovery_options.len(), 1);
        let perf = d.performance_context.unwrap();
        assert_eq!(perf.stats.sample_size, 5);
        assert_eq!(perf.suggested_timeout_ms, 288);
        assert!(d.summary.contains("p95 240ms"));
    }
}
