//! Agent core shared types.
//!
//! Tool classes, invocation records, failure descriptors, and the
//! per-query Aggregated Result handed to the conversational layer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::mcp_client::McpError;

use super::performance::PerformanceStats;

// ─── Tool Classes ───────────────────────────────────────────────────────────

/// A logical group of tool-server operations used for query routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ToolClass {
    /// Issue tracking (Jira).
    IssueSearch,
    /// Wiki / page search (Confluence).
    PageSearch,
    /// File search (Google Drive).
    DriveSearch,
}

impl ToolClass {
    pub const ALL: [ToolClass; 3] = [
        ToolClass::IssueSearch,
        ToolClass::PageSearch,
        ToolClass::DriveSearch,
    ];

    /// Key under which this class appears in the Aggregated Result.
    pub fn result_key(self) -> &'static str {
        match self {
            ToolClass::IssueSearch => "jira",
            ToolClass::PageSearch => "confluence",
            ToolClass::DriveSearch => "googleDrive",
        }
    }

    /// Name used in user-facing summaries.
    pub fn display_name(self) -> &'static str {
        match self {
            ToolClass::IssueSearch => "Jira",
            ToolClass::PageSearch => "Confluence",
            ToolClass::DriveSearch => "Google Drive",
        }
    }
}

// ─── Invocation Attempts ────────────────────────────────────────────────────

/// How a single tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    TransportError,
    ServerError,
    ConnectionError,
}

impl AttemptOutcome {
    pub fn from_result(result: &Result<serde_json::Value, McpError>) -> Self {
        match result {
            Ok(_) => AttemptOutcome::Success,
            Err(McpError::Timeout { .. }) => AttemptOutcome::Timeout,
            Err(McpError::TransportError { .. }) => AttemptOutcome::TransportError,
            Err(McpError::ServerError { .. }) => AttemptOutcome::ServerError,
            Err(_) => AttemptOutcome::ConnectionError,
        }
    }
}

/// Record of one tool call, folded into the performance tracker.
#[derive(Debug, Clone)]
pub struct InvocationAttempt {
    pub tool_name: String,
    pub params: serde_json::Value,
    pub timeout: Duration,
    pub started_at: Instant,
    pub duration: Duration,
    pub outcome: AttemptOutcome,
}

impl InvocationAttempt {
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

// ─── Failure Descriptors ────────────────────────────────────────────────────

/// Category of a failure as reported to the conversational layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TimeoutError,
    TransportError,
    ToolError,
    ConnectionError,
}

impl ErrorKind {
    pub fn from_error(error: &McpError) -> Self {
        match error {
            McpError::Timeout { .. } => ErrorKind::TimeoutError,
            McpError::TransportError { .. } => ErrorKind::TransportError,
            McpError::ServerError { .. } => ErrorKind::ToolError,
            _ => ErrorKind::ConnectionError,
        }
    }

    /// Short phrase for summaries ("timed out", "lost its connection", ...).
    pub fn describe(self) -> &'static str {
        match self {
            ErrorKind::TimeoutError => "timed out",
            ErrorKind::TransportError => "lost its connection mid-request",
            ErrorKind::ToolError => "returned an error",
            ErrorKind::ConnectionError => "could not be reached",
        }
    }
}

/// A suggested next step after a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOption {
    pub strategy: String,
    pub description: String,
    /// Estimated chance the option succeeds; `None` for manual steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_success_rate: Option<f64>,
}

/// Observed latency for the failing tool, attached when enough samples exist.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceContext {
    #[serde(flatten)]
    pub stats: PerformanceStats,
    pub suggested_timeout_ms: u64,
}

/// Structured description of a failed tool class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDescriptor {
    pub error: ErrorKind,
    /// The last underlying error message.
    pub message: String,
    pub summary: String,
    pub recovery_options: Vec<RecoveryOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance_context: Option<PerformanceContext>,
    pub attempts: u32,
    /// Every recovery strategy was tried.
    pub exhausted: bool,
}

// ─── Aggregated Result ──────────────────────────────────────────────────────

/// Outcome for one tool class within a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ToolOutcome {
    Success(serde_json::Value),
    Timeout(FailureDescriptor),
    Error(FailureDescriptor),
}

impl ToolOutcome {
    /// Wrap a descriptor in the variant matching its error kind.
    pub fn failure(descriptor: FailureDescriptor) -> Self {
        match descriptor.error {
            ErrorKind::TimeoutError => ToolOutcome::Timeout(descriptor),
            _ => ToolOutcome::Error(descriptor),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn descriptor(&self) -> Option<&FailureDescriptor> {
        match self {
            ToolOutcome::Success(_) => None,
            ToolOutcome::Timeout(d) | ToolOutcome::Error(d) => Some(d),
        }
    }
}

/// Per-query map from result key to outcome. Absent key: class not queried.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct AggregatedResult {
    pub results: BTreeMap<String, ToolOutcome>,
}

impl AggregatedResult {
    pub fn get(&self, key: &str) -> Option<&ToolOutcome> {
        self.results.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.results.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
