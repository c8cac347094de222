//! Agent Core: query-time orchestration over the tool servers.
//!
//! Submodules:
//! - `types`: Tool classes, invocation records, failure descriptors, Aggregated Result
//! - `performance`: Per-tool latency window and success counters
//! - `tool_classes`: Server/tool/parameter mapping per tool class
//! - `recovery`: Degradation strategies, adaptive timeouts, failure descriptors
//! - `invoker`: Timeout-bounded tool calls with retry
//! - `classifier`: Keyword pattern table for query routing
//! - `orchestrator`: `gather_data` entry point

pub mod classifier;
pub mod invoker;
pub mod orchestrator;
pub mod performance;
pub mod recovery;
pub mod tool_classes;
pub mod types;

// Re-exports for convenience
pub use classifier::{ClassifierError, PatternTable};
pub use invoker::{RetryFailure, ToolInvoker};
pub use orchestrator::Orchestrator;
pub use performance::{PerformanceStats, PerformanceTracker};
pub use recovery::{RecoveryPlanner, RecoveryStrategy};
pub use tool_classes::ToolClassSpec;
pub use types::{AggregatedResult, ErrorKind, FailureDescriptor, ToolClass, ToolOutcome};
