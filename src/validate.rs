//! Argument Validation
//!
//! Two layers run before any command is built. The first walks the tool's
//! parameter specs in order: missing required values fail immediately, and
//! supplied values are checked against their declared kind and per-argument
//! validator. The second is a request-wide dangerous-input screen over every
//! supplied value; no tool definition can weaken it.

use serde_json::Value;

use crate::error::GateError;
use crate::registry::{ParameterKind, ToolDefinition};

/// Argument map supplied by callers: unique keys, order irrelevant.
pub type ArgumentMap = serde_json::Map<String, Value>;

/// Substrings that are never allowed in any argument value
const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "mkfs",
    "dd if=",
    ":(){",
    "shutdown",
    "reboot",
    "halt -f",
    "init 0",
    "/etc/shadow",
    "/etc/passwd",
];

/// Shell metacharacters that could break out of an argument position
const SHELL_METACHARACTERS: &[char] = &[
    '|', '&', ';', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\n', '\r',
];

/// Render a JSON value the way it will appear on the command line.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fill in declared defaults for absent arguments.
pub fn apply_defaults(tool: &ToolDefinition, args: &ArgumentMap) -> ArgumentMap {
    let mut merged = args.clone();
    for spec in &tool.parameters {
        if !merged.contains_key(&spec.name) {
            if let Some(default) = &spec.default {
                merged.insert(spec.name.clone(), default.clone());
            }
        }
    }
    merged
}

/// Validate a request's arguments against a tool definition.
///
/// Checks run in spec order: required presence, declared kind, per-argument
/// validator. The dangerous-input screen then runs over every supplied
/// value, including ones no parameter spec mentions.
pub fn validate_arguments(tool: &ToolDefinition, args: &ArgumentMap) -> Result<(), GateError> {
    for spec in &tool.parameters {
        let value = match args.get(&spec.name) {
            Some(value) => value,
            None => {
                if spec.required {
                    return Err(GateError::MissingRequiredArgument(spec.name.clone()));
                }
                continue;
            }
        };

        check_kind(&spec.name, spec.kind, value)?;

        if let Some(validator) = spec.validator {
            let text = value_to_string(value);
            if let Err(reason) = validator(&text) {
                return Err(GateError::InvalidArgumentValue {
                    argument: spec.name.clone(),
                    reason,
                });
            }
        }
    }

    // Request-wide screen, independent of per-tool validators
    for (name, value) in args {
        screen_dangerous(name, &value_to_string(value))?;
    }

    Ok(())
}

fn check_kind(name: &str, kind: ParameterKind, value: &Value) -> Result<(), GateError> {
    let text = value_to_string(value);
    let ok = match kind {
        ParameterKind::String => value.is_string(),
        ParameterKind::Number => value.is_number() || text.parse::<f64>().is_ok(),
        ParameterKind::Boolean => {
            value.is_boolean() || matches!(text.as_str(), "true" | "false")
        }
        ParameterKind::File | ParameterKind::Directory => {
            value.is_string() && !text.is_empty()
        }
    };
    if ok {
        Ok(())
    } else {
        Err(GateError::InvalidArgumentValue {
            argument: name.to_string(),
            reason: format!("expected a {} value", kind_name(kind)),
        })
    }
}

fn kind_name(kind: ParameterKind) -> &'static str {
    match kind {
        ParameterKind::String => "string",
        ParameterKind::Number => "number",
        ParameterKind::Boolean => "boolean",
        ParameterKind::File => "file path",
        ParameterKind::Directory => "directory path",
    }
}

/// The global dangerous-input screen. Rejects blacklisted substrings,
/// path-traversal sequences, and embedded shell metacharacters.
pub fn screen_dangerous(name: &str, value: &str) -> Result<(), GateError> {
    let lowered = value.to_lowercase();

    for pattern in DANGEROUS_PATTERNS {
        if lowered.contains(pattern) {
            return Err(GateError::DangerousInput {
                argument: name.to_string(),
                reason: format!("contains blacklisted pattern '{pattern}'"),
            });
        }
    }

    if value.contains("../") || value.contains("..\\") {
        return Err(GateError::DangerousInput {
            argument: name.to_string(),
            reason: "contains path traversal sequence".to_string(),
        });
    }

    for &ch in SHELL_METACHARACTERS {
        if value.contains(ch) {
            return Err(GateError::DangerousInput {
                argument: name.to_string(),
                reason: format!("contains shell metacharacter '{}'", ch.escape_default()),
            });
        }
    }

    Ok(())
}
