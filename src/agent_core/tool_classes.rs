//! Tool class definitions: which server and tool serve each class, and how
//! a free-text query becomes call parameters.
//!
//! Built-in defaults target the Atlassian and Google Drive servers; any field
//! can be overridden per class in `settings.yaml`.

use std::time::Duration;

use crate::config::{GatherSettings, ToolClassOverride};

use super::types::ToolClass;

/// Resolved configuration for one tool class.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolClassSpec {
    pub class: ToolClass,
    pub enabled: bool,
    pub server_key: String,
    pub tool_name: String,
    pub query_param: String,
    pub limit_param: String,
    pub default_limit: u32,
    /// Parameter that scopes a search to a project, space or folder.
    pub subresource_param: String,
    pub base_timeout: Duration,
}

impl ToolClassSpec {
    /// Built-in defaults for a class.
    pub fn builtin(class: ToolClass) -> Self {
        let (server_key, tool_name, limit_param, default_limit, subresource_param, timeout_ms) =
            match class {
                ToolClass::IssueSearch => ("atlassian", "jira_search", "limit", 50, "project", 15_000),
                ToolClass::PageSearch => ("atlassian", "confluence_search", "limit", 25, "space", 15_000),
                ToolClass::DriveSearch => ("googleDrive", "search", "pageSize", 25, "folder", 20_000),
            };

        Self {
            class,
            enabled: true,
            server_key: server_key.to_string(),
            tool_name: tool_name.to_string(),
            query_param: "query".to_string(),
            limit_param: limit_param.to_string(),
            default_limit,
            subresource_param: subresource_param.to_string(),
            base_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Apply the set fields of an override.
    pub fn with_override(mut self, o: &ToolClassOverride) -> Self {
        if let Some(enabled) = o.enabled {
            self.enabled = enabled;
        }
        if let Some(v) = &o.server_key {
            self.server_key = v.clone();
        }
        if let Some(v) = &o.tool_name {
            self.tool_name = v.clone();
        }
        if let Some(v) = &o.query_param {
            self.query_param = v.clone();
        }
        if let Some(v) = &o.limit_param {
            self.limit_param = v.clone();
        }
        if let Some(v) = o.default_limit {
            self.default_limit = v;
        }
        if let Some(v) = &o.subresource_param {
            self.subresource_param = v.clone();
        }
        if let Some(ms) = o.base_timeout_ms {
            self.base_timeout = Duration::from_millis(ms);
        }
        self
    }

    /// Parameters for the first, undegraded attempt.
    pub fn base_params(&self, query: &str) -> serde_json::Value {
        let mut params = serde_json::Map::new();
        params.insert(self.query_param.clone(), serde_json::json!(query));
        params.insert(self.limit_param.clone(), serde_json::json!(self.default_limit));
        serde_json::Value::Object(params)
    }
}

/// Resolve every class against the settings overrides.
pub fn resolve_specs(settings: &GatherSettings) -> Vec<ToolClassSpec> {
    ToolClass::ALL
        .into_iter()
        .map(|class| {
            let spec = ToolClassSpec::builtin(class);
            match settings.classes.get(class.result_key()) {
                Some(o) => spec.with_override(o),
                None => spec,
            }
        })
        .collect()
}
