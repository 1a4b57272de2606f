//! Publish-time checks on metadata and code.

use std::sync::LazyLock;

use agent_primitives::AgentMetadata;
use agent_sandbox::{ScriptEngine, ScriptError};
use regex::Regex;

use crate::{RegistryError, RegistryResult};

/// Largest publishable code body, in bytes.
pub const MAX_CODE_BYTES: usize = 1024 * 1024;

const MIN_NAME_CHARS: usize = 3;
const MIN_DESCRIPTION_CHARS: usize = 10;

/// Constructs that reject a publish outright, independent of the advisory
/// risk score.
const BLOCKED: &[(&str, &str)] = &[
    ("eval", r"\beval\b"),
    ("Function(", r"\bFunction\s*\("),
    ("process.", r"\bprocess\s*\."),
    ("require(", r"\brequire\s*\("),
    ("import ", r"\bimport\s"),
    ("child_process", r"child_process"),
    ("fs.", r"\bfs\s*\."),
    (".exec(", r"\.exec\s*\("),
    (".spawn(", r"\.spawn\s*\("),
];

static BLOCKED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    BLOCKED
        .iter()
        .map(|(label, pattern)| {
            (
                *label,
                Regex::new(pattern).expect("built-in rule must compile"),
            )
        })
        .collect()
});

/// Checks name, description and capability shape.
///
/// # Errors
///
/// Returns [`RegistryError::Validation`] naming the first offending field.
pub fn validate_metadata(metadata: &AgentMetadata) -> RegistryResult<()> {
    if metadata.name().trim().chars().count() < MIN_NAME_CHARS {
        return Err(RegistryError::validation(
            "name",
            format!("must be at least {MIN_NAME_CHARS} characters"),
        ));
    }
    if metadata.description().trim().chars().count() < MIN_DESCRIPTION_CHARS {
        return Err(RegistryError::validation(
            "description",
            format!("must be at least {MIN_DESCRIPTION_CHARS} characters"),
        ));
    }
    if metadata.capabilities().is_empty() {
        return Err(RegistryError::validation(
            "capabilities",
            "at least one capability is required",
        ));
    }
    for capability in metadata.capabilities() {
        if capability.name().trim().is_empty() {
            return Err(RegistryError::validation("capabilities", "capability name is empty"));
        }
        if capability.description().trim().is_empty() {
            return Err(RegistryError::validation(
                "capabilities",
                format!("capability `{}` has no description", capability.name()),
            ));
        }
    }
    Ok(())
}

/// Returns the label of the first blocked construct in `code`.
#[must_use]
pub fn find_blocked_pattern(code: &str) -> Option<&'static str> {
    BLOCKED_PATTERNS
        .iter()
        .find(|(_, regex)| regex.is_match(code))
        .map(|(label, _)| *label)
}

/// Checks size, syntax and blocked constructs.
///
/// # Errors
///
/// Returns [`RegistryError::CodeTooLarge`], [`RegistryError::Syntax`] or
/// [`RegistryError::BlockedPattern`].
pub fn validate_code(code: &str, engine: &dyn ScriptEngine) -> RegistryResult<()> {
    if code.trim().is_empty() {
        return Err(RegistryError::validation("code", "must not be empty"));
    }
    if code.len() > MAX_CODE_BYTES {
        return Err(RegistryError::CodeTooLarge {
            size: code.len(),
            limit: MAX_CODE_BYTES,
        });
    }
    engine.check_syntax(code).map_err(|err| match err {
        ScriptError::Syntax { line, message } => RegistryError::Syntax { line, message },
        other => RegistryError::Syntax {
            line: 0,
            message: other.to_string(),
        },
    })?;
    if let Some(pattern) = find_blocked_pattern(code) {
        return Err(RegistryError::BlockedPattern { pattern });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_sandbox::NativeEngine;

    #[test]
    fn every_blocked_pattern_rejects() {
        let engine = NativeEngine::new();
        let samples = [
            "const x = eval(input);",
            "const f = new Function('return 1');",
            "const key = process.env.KEY;",
            "const fs2 = require('fs');",
            "import os from 'os';",
            "load('child_process');",
            "fs.readFileSync('/etc/passwd');",
            "/x/.exec(input);",
            "runner.spawn('sh');",
        ];
        for sample in samples {
            let err = validate_code(sample, &engine).unwrap_err();
            assert!(
                matches!(err, RegistryError::BlockedPattern { .. }),
                "{sample} should be blocked"
            );
        }
    }

    #[test]
    fn benign_code_passes() {
        let engine = NativeEngine::new();
        let code = "function summarize(input) { return input.text.slice(0, 100); } // evaluate";
        validate_code(code, &engine).unwrap();
    }

    #[test]
    fn oversized_and_unbalanced_code_rejected() {
        let engine = NativeEngine::new();
        let big = "a".repeat(MAX_CODE_BYTES + 1);
        assert!(matches!(
            validate_code(&big, &engine),
            Err(RegistryError::CodeTooLarge { .. })
        ));
        assert!(matches!(
            validate_code("function f() { return 1;", &engine),
            Err(RegistryError::Syntax { .. })
        ));
    }
}
