//! Query classification by keyword pattern.
//!
//! A `PatternTable` maps each tool class to a list of case-insensitive
//! patterns. A class is relevant when any of its patterns matches the query
//! text or the optional context hint.

use std::collections::BTreeSet;

use regex::Regex;
use thiserror::Error;

use super::types::ToolClass;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("invalid pattern '{pattern}' for {class:?}: {reason}")]
    InvalidPattern {
        class: ToolClass,
        pattern: String,
        reason: String,
    },
}

const ISSUE_PATTERNS: &[&str] = &[
    r"\bjira\b",
    r"\btickets?\b",
    r"\bissues?\b",
    r"\bbugs?\b",
    r"\bsprints?\b",
    r"\bepics?\b",
    // Issue keys like `OPS-142`; the project part stays case-sensitive.
    r"\b(?-i:[A-Z][A-Z0-9]+)-\d+\b",
    r"\batlassian\b",
];

const PAGE_PATTERNS: &[&str] = &[
    r"\bconfluence\b",
    r"\bwiki\b",
    r"\bpages?\b",
    r"\bdocumentation\b",
    r"\bspaces?\b",
    r"\brunbooks?\b",
    r"\batlassian\b",
];

const DRIVE_PATTERNS: &[&str] = &[
    r"\bdrive\b",
    r"\bgoogle\s+docs?\b",
    r"\bspreadsheets?\b",
    r"\bsheets?\b",
    r"\bslides?\b",
    r"\bfolders?\b",
    r"\bfiles?\b",
    r"\bgoogle\b",
];

/// Tool class → compiled trigger patterns.
#[derive(Debug)]
pub struct PatternTable {
    entries: Vec<(ToolClass, Vec<Regex>)>,
}

impl PatternTable {
    /// Compile a table. Patterns match case-insensitively.
    pub fn new(table: &[(ToolClass, &[&str])]) -> Result<Self, ClassifierError> {
        let mut entries = Vec::with_capacity(table.len());
        for (class, patterns) in table {
            let compiled = patterns
                .iter()
                .map(|p| {
                    Regex::new(&format!("(?i){p}")).map_err(|e| ClassifierError::InvalidPattern {
                        class: *class,
                        pattern: p.to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            entries.push((*class, compiled));
        }
        Ok(Self { entries })
    }

    /// Built-in triggers for the Jira, Confluence and Drive classes.
    pub fn default_table() -> Result<Self, ClassifierError> {
        Self::new(&[
            (ToolClass::IssueSearch, ISSUE_PATTERNS),
            (ToolClass::PageSearch, PAGE_PATTERNS),
            (ToolClass::DriveSearch, DRIVE_PATTERNS),
        ])
    }

    /// Classes whose patterns match the query or the context hint.
    pub fn classify(&self, query: &str, context: Option<&str>) -> BTreeSet<ToolClass> {
        let matches = |text: &str, patterns: &[Regex]| patterns.iter().any(|re| re.is_match(text));

        self.entries
            .iter()
            .filter(|(_, patterns)| {
                matches(query, patterns.as_slice())
                    || context.is_some_and(|c| matches(c, patterns.as_slice()))
            })
            .map(|(class, _)| *class)
            .collect()
    }
}
