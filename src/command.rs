//! Command Builder
//!
//! Turns a validated argument map into a single executable command line.
//! Formatting is a closed per-tool policy table: nmap uses positional
//! ordering (scan type, ports, bare target last); every other tool uses
//! long-form flags. Escaping here is defense in depth on top of the
//! dangerous-input screen, which runs first and rejects most unsafe input
//! outright.

use crate::registry::{ParameterKind, ToolDefinition};
use crate::validate::{value_to_string, ArgumentMap};

/// Characters that pass through unescaped
fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '_' | '-' | '/' | '.' | ':' | '?' | '=' | '&' | '%' | '@' | '+' | '~' | ','
        )
}

/// Escape a value for a single shell argument position.
///
/// Empty input becomes an empty quoted literal; input already wrapped in
/// matching quotes passes through unchanged; input made entirely of safe
/// characters passes through unescaped; anything else is single-quoted with
/// embedded single quotes rendered as `'\''`.
pub fn shell_escape(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }

    let bytes = input.as_bytes();
    if input.len() >= 2 {
        let first = bytes[0];
        let last = bytes[input.len() - 1];
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return input.to_string();
        }
    }

    if input.chars().all(is_safe_char) {
        return input.to_string();
    }

    let mut escaped = String::with_capacity(input.len() + 2);
    escaped.push('\'');
    for c in input.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}

/// Build the full command line for a tool from validated arguments.
/// Defaults must already be applied.
pub fn build_command(tool: &ToolDefinition, args: &ArgumentMap) -> String {
    match tool.name.as_str() {
        "nmap" => build_positional(tool, args),
        _ => build_flags(tool, args),
    }
}

/// Positional mode: scan-type flag first, then `-p <ports>`, then the bare
/// target last. Order is fixed and significant.
fn build_positional(tool: &ToolDefinition, args: &ArgumentMap) -> String {
    let mut parts = vec![tool.executable.clone()];

    if let Some(scan_type) = args.get("scan_type") {
        let text = value_to_string(scan_type);
        if !text.is_empty() {
            parts.push(shell_escape(&text));
        }
    }

    if let Some(ports) = args.get("ports") {
        let text = value_to_string(ports);
        if !text.is_empty() {
            parts.push("-p".to_string());
            parts.push(shell_escape(&text));
        }
    }

    if let Some(target) = args.get("target") {
        let text = value_to_string(target);
        if !text.is_empty() {
            parts.push(shell_escape(&text));
        }
    }

    parts.join(" ")
}

/// Flag mode: every non-empty argument emits `--name value` (short form for
/// single-character names); booleans emit the bare flag only when true; the
/// `output` path is passed through unescaped so the target tool can
/// interpret it as a shell path.
fn build_flags(tool: &ToolDefinition, args: &ArgumentMap) -> String {
    let mut parts = vec![tool.executable.clone()];

    // Declared parameters first, in spec order, then any extras in map order
    let mut emitted: Vec<&str> = Vec::new();
    for spec in &tool.parameters {
        if let Some(value) = args.get(&spec.name) {
            emit_flag(&mut parts, &spec.name, value, spec.kind == ParameterKind::Boolean);
            emitted.push(spec.name.as_str());
        }
    }
    for (name, value) in args {
        if !emitted.contains(&name.as_str()) {
            emit_flag(&mut parts, name, value, value.is_boolean());
        }
    }

    parts.join(" ")
}

fn emit_flag(parts: &mut Vec<String>, name: &str, value: &serde_json::Value, boolean: bool) {
    let flag = if name.chars().count() == 1 {
        format!("-{name}")
    } else {
        format!("--{name}")
    };

    if boolean {
        if value.as_bool() == Some(true) || value.as_str() == Some("true") {
            parts.push(flag);
        }
        return;
    }

    let text = value_to_string(value);
    if text.is_empty() {
        return;
    }

    parts.push(flag);
    if name == "output" {
        // Passed through unescaped so the tool can expand it as a path
        parts.push(text);
    } else {
        parts.push(shell_escape(&text));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolRegistry;
    use proptest::prelude::*;
    use serde_json::json;

    fn args(pairs: &[(&str, serde_json::Value)]) -> ArgumentMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_nmap_positional_order() {
        let registry = ToolRegistry::builtin();
        let nmap = registry.get("nmap").unwrap();

        let cmd = build_command(
            nmap,
            &args(&[
                ("target", json!("scanme.nmap.org")),
                ("ports", json!("1-1024")),
                ("scan_type", json!("-sS")),
            ]),
        );
        assert_eq!(cmd, "nmap -sS -p 1-1024 scanme.nmap.org");
    }

    #[test]
    fn test_nmap_target_only() {
        let registry = ToolRegistry::builtin();
        let nmap = registry.get("nmap").unwrap();
        let cmd = build_command(nmap, &args(&[("target", json!("10.0.0.1"))]));
        assert_eq!(cmd, "nmap 10.0.0.1");
    }

    #[test]
    fn test_flag_mode_long_flags() {
        let registry = ToolRegistry::builtin();
        let gobuster = registry.get("gobuster").unwrap();
        let cmd = build_command(
            gobuster,
            &args(&[
                ("url", json!("https://example.com")),
                ("wordlist", json!("/usr/share/wordlists/common.txt")),
                ("threads", json!(10)),
            ]),
        );
        assert_eq!(
            cmd,
            "gobuster --url https://example.com --wordlist /usr/share/wordlists/common.txt --threads 10"
        );
    }

    #[test]
    fn test_boolean_emits_bare_flag_only_when_true() {
        let registry = ToolRegistry::builtin();
        let nikto = registry.get("nikto").unwrap();

        let cmd = build_command(
            nikto,
            &args(&[("host", json!("example.com")), ("ssl", json!(true))]),
        );
        assert_eq!(cmd, "nikto --host example.com --ssl");

        let cmd = build_command(
            nikto,
            &args(&[("host", json!("example.com")), ("ssl", json!(false))]),
        );
        assert_eq!(cmd, "nikto --host example.com");
    }

    #[test]
    fn test_single_character_name_uses_short_flag() {
        let registry = ToolRegistry::builtin();
        let nikto = registry.get("nikto").unwrap();
        let cmd = build_command(
            nikto,
            &args(&[("host", json!("example.com")), ("v", json!("3"))]),
        );
        assert_eq!(cmd, "nikto --host example.com -v 3");
    }

    #[test]
    fn test_output_path_passes_unescaped() {
        let registry = ToolRegistry::builtin();
        let nikto = registry.get("nikto").unwrap();
        let cmd = build_command(
            nikto,
            &args(&[
                ("host", json!("example.com")),
                ("output", json!("~/reports/scan 1.txt")),
            ]),
        );
        assert_eq!(cmd, "nikto --host example.com --output ~/reports/scan 1.txt");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let registry = ToolRegistry::builtin();
        let nikto = registry.get("nikto").unwrap();
        let cmd = build_command(
            nikto,
            &args(&[("host", json!("example.com")), ("port", json!(""))]),
        );
        assert_eq!(cmd, "nikto --host example.com");
    }

    #[test]
    fn test_shell_escape_rules() {
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("'quoted'"), "'quoted'");
        assert_eq!(shell_escape("\"quoted\""), "\"quoted\"");
        assert_eq!(shell_escape("safe-value_1.2:3"), "safe-value_1.2:3");
        assert_eq!(shell_escape("has space"), "'has space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    proptest! {
        /// Escaped output never contains an unquoted single quote that could
        /// terminate the argument position.
        #[test]
        fn prop_escaped_value_stays_in_position(input in ".{0,40}") {
            let escaped = shell_escape(&input);
            if escaped.starts_with('\'') && !input.starts_with('\'') {
                // Inside a quoted span, every single quote must belong to
                // the '\'' escape sequence.
                let inner = &escaped[1..escaped.len() - 1];
                let stripped = inner.replace("'\\''", "");
                prop_assert!(!stripped.contains('\''));
            }
        }

        #[test]
        fn prop_safe_class_unchanged(input in "[a-zA-Z0-9_/.:,=-]{1,40}") {
            prop_assert_eq!(shell_escape(&input), input);
        }
    }
}
