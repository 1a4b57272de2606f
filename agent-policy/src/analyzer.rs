//! Static risk scoring for agent source text.
//!
//! The analyzer is advisory: it grades code for reviewers and threat
//! detection. The sandbox's binding stripping is what actually contains agent
//! code; publish-time rejection lives in the registry's blocked pattern list.

use agent_primitives::RiskLevel;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// What kind of behaviour an issue points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    /// Dynamic code evaluation.
    CodeInjection,
    /// Host process or global state access.
    SystemAccess,
    /// Dynamic module loading.
    ModuleAccess,
    /// Filesystem access.
    FileAccess,
    /// Spawning commands.
    CommandExecution,
    /// Outbound network calls.
    NetworkAccess,
    /// Secrets assigned in source.
    SensitiveData,
}

/// One row of the rule table.
#[derive(Debug, Clone)]
pub struct AnalysisRule {
    pattern: Regex,
    category: IssueCategory,
    severity: RiskLevel,
    message: String,
}

impl AnalysisRule {
    /// Compiles a rule.
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error when `pattern` is invalid.
    pub fn new(
        pattern: &str,
        category: IssueCategory,
        severity: RiskLevel,
        message: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            category,
            severity,
            message: message.into(),
        })
    }

    /// Returns the rule category.
    #[must_use]
    pub fn category(&self) -> IssueCategory {
        self.category
    }

    /// Returns the rule severity.
    #[must_use]
    pub fn severity(&self) -> RiskLevel {
        self.severity
    }
}

/// A single finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeIssue {
    /// 1-based line number.
    pub line: usize,
    /// Issue category.
    pub category: IssueCategory,
    /// Issue severity.
    pub severity: RiskLevel,
    /// Rule description.
    pub message: String,
    /// Matched text.
    pub snippet: String,
}

/// Aggregate result of analysing one source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeAnalysis {
    /// Overall risk derived from the issues.
    pub risk_level: RiskLevel,
    /// Every finding, in line order.
    pub issues: Vec<CodeIssue>,
}

impl CodeAnalysis {
    /// Returns `true` when nothing was found.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Counts issues with the given severity.
    #[must_use]
    pub fn count(&self, severity: RiskLevel) -> usize {
        self.issues
            .iter()
            .filter(|issue| issue.severity == severity)
            .count()
    }
}

/// Line scanner over a `(pattern, category, severity)` rule table.
#[derive(Debug, Clone)]
pub struct CodeAnalyzer {
    rules: Vec<AnalysisRule>,
}

const DEFAULT_RULES: &[(&str, IssueCategory, RiskLevel, &str)] = &[
    (
        r"\beval\s*\(",
        IssueCategory::CodeInjection,
        RiskLevel::Critical,
        "dynamic evaluation via eval",
    ),
    (
        r"\bFunction\s*\(",
        IssueCategory::CodeInjection,
        RiskLevel::Critical,
        "dynamic evaluation via the Function constructor",
    ),
    (
        r"\bprocess\.",
        IssueCategory::SystemAccess,
        RiskLevel::High,
        "host process access",
    ),
    (
        r"\bglobal(This)?\.",
        IssueCategory::SystemAccess,
        RiskLevel::High,
        "global state access",
    ),
    (
        r"\brequire\s*\(",
        IssueCategory::ModuleAccess,
        RiskLevel::High,
        "dynamic require",
    ),
    (
        r"\bimport\s*\(",
        IssueCategory::ModuleAccess,
        RiskLevel::Medium,
        "dynamic import",
    ),
    (
        r"\bfs\.|\b(readFile|writeFile|appendFile|unlink|rmdir|mkdir)(Sync)?\s*\(",
        IssueCategory::FileAccess,
        RiskLevel::High,
        "filesystem access",
    ),
    (
        r"\.(exec|execSync|execFile|spawn|spawnSync|fork)\s*\(|child_process",
        IssueCategory::CommandExecution,
        RiskLevel::Critical,
        "command execution",
    ),
    (
        r"\bfetch\s*\(|XMLHttpRequest|\bWebSocket\s*\(",
        IssueCategory::NetworkAccess,
        RiskLevel::Medium,
        "outbound network call",
    ),
    (
        r"(?i)\b(password|secret|token|api_key|apikey|credential)s?\w*\s*[:=]",
        IssueCategory::SensitiveData,
        RiskLevel::Medium,
        "possible hard-coded secret",
    ),
];

impl Default for CodeAnalyzer {
    fn default() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .map(|(pattern, category, severity, message)| {
                AnalysisRule::new(pattern, *category, *severity, *message)
                    .expect("built-in analysis rule must compile")
            })
            .collect();
        Self { rules }
    }
}

impl CodeAnalyzer {
    /// Creates an analyzer with the built-in rule table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an analyzer with no rules.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule to the table.
    #[must_use]
    pub fn with_rule(mut self, rule: AnalysisRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns the active rule table.
    #[must_use]
    pub fn rules(&self) -> &[AnalysisRule] {
        &self.rules
    }

    /// Scans `code` line by line and grades the result.
    #[must_use]
    pub fn analyze(&self, code: &str) -> CodeAnalysis {
        let mut issues = Vec::new();
        for (index, line) in code.lines().enumerate() {
            for rule in &self.rules {
                if let Some(found) = rule.pattern.find(line) {
                    issues.push(CodeIssue {
                        line: index + 1,
                        category: rule.category,
                        severity: rule.severity,
                        message: rule.message.clone(),
                        snippet: found.as_str().to_owned(),
                    });
                }
            }
        }

        let risk_level = overall_risk(&issues);
        debug!(issues = issues.len(), %risk_level, "code analysis finished");
        CodeAnalysis { risk_level, issues }
    }
}

fn overall_risk(issues: &[CodeIssue]) -> RiskLevel {
    let count = |level| issues.iter().filter(|i| i.severity == level).count();
    let medium = count(RiskLevel::Medium);

    if count(RiskLevel::Critical) > 0 {
        RiskLevel::Critical
    } else if count(RiskLevel::High) > 0 || medium > 2 {
        RiskLevel::High
    } else if medium >= 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}
