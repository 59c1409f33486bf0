//! Tool Registry
//!
//! Immutable catalog of wrapped security tools. Each definition carries the
//! underlying executable, an ordered parameter list with per-argument
//! validators, a per-tool timeout, and an optional output validator.
//! Definitions are constructed once at startup and never mutated; callers
//! only ever see the redacted `ToolSummary` view.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::GateError;

/// Per-argument value validator. Receives the string form of the supplied
/// value and returns a human-readable reason on failure.
pub type ValueValidator = fn(&str) -> Result<(), String>;

/// Post-execution output validator for a tool's captured stdout.
pub type OutputValidator = fn(&str) -> Result<(), String>;

/// Declared type of a tool parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    File,
    Directory,
}

/// Specification of a single tool parameter
#[derive(Clone)]
pub struct ParameterSpec {
    /// Argument name as supplied by callers
    pub name: String,

    /// Human-readable description (exposed in the redacted listing)
    pub description: String,

    /// Whether the argument must be supplied
    pub required: bool,

    /// Declared value type
    pub kind: ParameterKind,

    /// Default value applied when the argument is absent
    pub default: Option<serde_json::Value>,

    /// Optional per-argument validator
    pub validator: Option<ValueValidator>,
}

impl ParameterSpec {
    /// Create a required parameter
    pub fn required(name: &str, description: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: true,
            kind,
            default: None,
            validator: None,
        }
    }

    /// Create an optional parameter
    pub fn optional(name: &str, description: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            required: false,
            kind,
            default: None,
            validator: None,
        }
    }

    /// Attach a validator
    pub fn with_validator(mut self, validator: ValueValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attach a default value
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

impl std::fmt::Debug for ParameterSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterSpec")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("kind", &self.kind)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

/// Definition of a wrapped tool
#[derive(Clone)]
pub struct ToolDefinition {
    /// Tool name exposed to callers
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Underlying executable invoked by the command builder
    pub executable: String,

    /// Ordered parameter specifications
    pub parameters: Vec<ParameterSpec>,

    /// Per-tool execution timeout
    pub timeout: Duration,

    /// Optional post-execution output validator
    pub output_validator: Option<OutputValidator>,
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("executable", &self.executable)
            .field("parameters", &self.parameters)
            .field("timeout", &self.timeout)
            .field("has_output_validator", &self.output_validator.is_some())
            .finish()
    }
}

impl ToolDefinition {
    /// Look up a parameter spec by argument name
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Redacted argument view for the listing call
#[derive(Debug, Clone, Serialize)]
pub struct ArgumentSummary {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
}

/// Redacted tool view for the listing call. Validators and the underlying
/// executable are never exposed.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub arguments: Vec<ArgumentSummary>,
}

/// Read-only catalog of tool definitions
#[derive(Debug)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
}

impl ToolRegistry {
    /// Build a registry from explicit definitions
    pub fn new(definitions: Vec<ToolDefinition>) -> Self {
        let tools = definitions
            .into_iter()
            .map(|def| (def.name.clone(), def))
            .collect();
        Self { tools }
    }

    /// Build the fixed catalog of wrapped security tools
    pub fn builtin() -> Self {
        Self::new(builtin_definitions())
    }

    /// Look up a tool definition by name
    pub fn get(&self, name: &str) -> Result<&ToolDefinition, GateError> {
        self.tools
            .get(name)
            .ok_or_else(|| GateError::ToolNotFound(name.to_string()))
    }

    /// Redacted catalog listing, sorted by tool name
    pub fn list(&self) -> Vec<ToolSummary> {
        let mut summaries: Vec<ToolSummary> = self
            .tools
            .values()
            .map(|def| ToolSummary {
                name: def.name.clone(),
                description: def.description.clone(),
                arguments: def
                    .parameters
                    .iter()
                    .map(|p| ArgumentSummary {
                        name: p.name.clone(),
                        description: p.description.clone(),
                        required: p.required,
                        kind: p.kind,
                    })
                    .collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// True when the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// --- Per-argument validators for the built-in catalog ---

/// Hostname, IPv4/IPv6 address, or CIDR range
pub fn validate_target(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("target must not be empty".to_string());
    }
    if value.len() > 255 {
        return Err("target is too long".to_string());
    }
    let ok = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '/'));
    if !ok {
        return Err("target contains invalid characters".to_string());
    }
    Ok(())
}

/// Port list or range, e.g. `80`, `1-1024`, `80,443,8080`
pub fn validate_ports(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("port specification must not be empty".to_string());
    }
    for part in value.split(',') {
        let bounds: Vec<&str> = part.split('-').collect();
        if bounds.len() > 2 || bounds.iter().any(|b| b.is_empty()) {
            return Err(format!("'{part}' is not a valid port range"));
        }
        for bound in bounds {
            match bound.parse::<u32>() {
                Ok(port) if (1..=65535).contains(&port) => {}
                _ => return Err(format!("'{bound}' is not a valid port number")),
            }
        }
    }
    Ok(())
}

/// Nmap scan-type flag, restricted to a fixed allowlist
pub fn validate_scan_type(value: &str) -> Result<(), String> {
    const ALLOWED: &[&str] = &["-sS", "-sT", "-sU", "-sV", "-sn", "-sC", "-A", "-O"];
    if ALLOWED.contains(&value) {
        Ok(())
    } else {
        Err(format!("'{value}' is not an allowed scan type"))
    }
}

/// HTTP or HTTPS URL
pub fn validate_url(value: &str) -> Result<(), String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err("URL must start with http:// or https://".to_string())
    }
}

/// Positive integer (rates, thread counts)
pub fn validate_positive_number(value: &str) -> Result<(), String> {
    match value.parse::<u64>() {
        Ok(n) if n > 0 => Ok(()),
        _ => Err("must be a positive integer".to_string()),
    }
}

/// Plain file path without traversal sequences
pub fn validate_path(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if value.contains("..") {
        return Err("path must not contain traversal sequences".to_string());
    }
    Ok(())
}

/// Nmap prints a banner line on every run; an empty or foreign capture
/// means the scan did not actually execute.
pub fn validate_nmap_output(output: &str) -> Result<(), String> {
    if output.trim().is_empty() {
        return Err("scan produced no output".to_string());
    }
    if !output.contains("Nmap") {
        return Err("output does not look like an nmap report".to_string());
    }
    Ok(())
}

fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "nmap".to_string(),
            description: "Network exploration and port scanning".to_string(),
            executable: "nmap".to_string(),
            parameters: vec![
                ParameterSpec::required("target", "Host, address, or CIDR range", ParameterKind::String)
                    .with_validator(validate_target),
                ParameterSpec::optional("ports", "Port list or range", ParameterKind::String)
                    .with_validator(validate_ports),
                ParameterSpec::optional("scan_type", "Scan type flag", ParameterKind::String)
                    .with_validator(validate_scan_type),
            ],
            timeout: Duration::from_secs(600),
            output_validator: Some(validate_nmap_output),
        },
        ToolDefinition {
            name: "masscan".to_string(),
            description: "High-speed asynchronous port scanner".to_string(),
            executable: "masscan".to_string(),
            parameters: vec![
                ParameterSpec::required("range", "Address range to scan", ParameterKind::String)
                    .with_validator(validate_target),
                ParameterSpec::required("ports", "Ports to probe", ParameterKind::String)
                    .with_validator(validate_ports),
                ParameterSpec::optional("rate", "Packets per second", ParameterKind::Number)
                    .with_validator(validate_positive_number),
            ],
            timeout: Duration::from_secs(900),
            output_validator: None,
        },
        ToolDefinition {
            name: "nikto".to_string(),
            description: "Web server vulnerability scanner".to_string(),
            executable: "nikto".to_string(),
            parameters: vec![
                ParameterSpec::required("host", "Target host or URL", ParameterKind::String)
                    .with_validator(validate_target),
                ParameterSpec::optional("port", "Target port", ParameterKind::Number)
                    .with_validator(validate_positive_number),
                ParameterSpec::optional("ssl", "Force SSL mode", ParameterKind::Boolean),
                ParameterSpec::optional("output", "Report output path", ParameterKind::File)
                    .with_validator(validate_path),
            ],
            timeout: Duration::from_secs(1200),
            output_validator: None,
        },
        ToolDefinition {
            name: "sqlmap".to_string(),
            description: "Automated SQL injection detection".to_string(),
            executable: "sqlmap".to_string(),
            parameters: vec![
                ParameterSpec::required("url", "Target URL", ParameterKind::String)
                    .with_validator(validate_url),
                ParameterSpec::optional("level", "Test level (1-5)", ParameterKind::Number)
                    .with_validator(validate_positive_number),
                ParameterSpec::optional("risk", "Risk level (1-3)", ParameterKind::Number)
                    .with_validator(validate_positive_number),
                ParameterSpec::optional("batch", "Never ask for user input", ParameterKind::Boolean)
                    .with_default(serde_json::Value::Bool(true)),
            ],
            timeout: Duration::from_secs(1800),
            output_validator: None,
        },
        ToolDefinition {
            name: "gobuster".to_string(),
            description: "Directory and DNS brute-forcing".to_string(),
            executable: "gobuster".to_string(),
            parameters: vec![
                ParameterSpec::required("url", "Target URL", ParameterKind::String)
                    .with_validator(validate_url),
                ParameterSpec::required("wordlist", "Wordlist path", ParameterKind::File)
                    .with_validator(validate_path),
                ParameterSpec::optional("threads", "Concurrent threads", ParameterKind::Number)
                    .with_validator(validate_positive_number),
            ],
            timeout: Duration::from_secs(900),
            output_validator: None,
        },
        ToolDefinition {
            name: "hydra".to_string(),
            description: "Online password brute-forcing".to_string(),
            executable: "hydra".to_string(),
            parameters: vec![
                ParameterSpec::required("target", "Target host", ParameterKind::String)
                    .with_validator(validate_target),
                ParameterSpec::required("service", "Service to attack (ssh, ftp, ...)", ParameterKind::String)
                    .with_validator(validate_target),
                ParameterSpec::optional("login", "Username or user list path", ParameterKind::String),
                ParameterSpec::optional("passwords", "Password list path", ParameterKind::File)
                    .with_validator(validate_path),
            ],
            timeout: Duration::from_secs(1800),
            output_validator: None,
        },
        ToolDefinition {
            name: "john".to_string(),
            description: "Offline password hash cracking".to_string(),
            executable: "john".to_string(),
            parameters: vec![
                ParameterSpec::required("hashfile", "Path to hash file", ParameterKind::File)
                    .with_validator(validate_path),
                ParameterSpec::optional("wordlist", "Wordlist path", ParameterKind::File)
                    .with_validator(validate_path),
                ParameterSpec::optional("format", "Hash format", ParameterKind::String),
            ],
            timeout: Duration::from_secs(1800),
            output_validator: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_lookup() {
        let registry = ToolRegistry::builtin();
        assert!(registry.get("nmap").is_ok());
        assert!(registry.get("hydra").is_ok());

        let err = registry.get("metasploit").unwrap_err();
        assert!(matches!(err, GateError::ToolNotFound(_)));
        assert!(err.to_string().contains("metasploit"));
    }

    #[test]
    fn test_listing_is_redacted_and_sorted() {
        let registry = ToolRegistry::builtin();
        let listing = registry.list();

        assert_eq!(listing.len(), registry.len());
        let names: Vec<&str> = listing.iter().map(|t| t.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);

        // The serialized view must not leak executables or validators
        let json = serde_json::to_string(&listing).unwrap();
        assert!(!json.contains("executable"));
        assert!(!json.contains("validator"));
        assert!(json.contains("\"required\":true"));
    }

    #[test]
    fn test_parameter_lookup() {
        let registry = ToolRegistry::builtin();
        let nmap = registry.get("nmap").unwrap();
        assert!(nmap.parameter("target").unwrap().required);
        assert!(!nmap.parameter("ports").unwrap().required);
        assert!(nmap.parameter("bogus").is_none());
    }

    #[test]
    fn test_validate_target() {
        assert!(validate_target("scanme.nmap.org").is_ok());
        assert!(validate_target("10.0.0.0/24").is_ok());
        assert!(validate_target("fe80::1").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("host name").is_err());
        assert!(validate_target("host;rm").is_err());
    }

    #[test]
    fn test_validate_ports() {
        assert!(validate_ports("80").is_ok());
        assert!(validate_ports("1-1024").is_ok());
        assert!(validate_ports("80,443,8080").is_ok());
        assert!(validate_ports("0").is_err());
        assert!(validate_ports("65536").is_err());
        assert!(validate_ports("80-").is_err());
        assert!(validate_ports("abc").is_err());
    }

    #[test]
    fn test_validate_scan_type() {
        assert!(validate_scan_type("-sS").is_ok());
        assert!(validate_scan_type("-sV").is_ok());
        assert!(validate_scan_type("--script=vuln").is_err());
        assert!(validate_scan_type("").is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/login").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("example.com").is_err());
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        assert!(validate_path("/tmp/wordlist.txt").is_ok());
        assert!(validate_path("../../etc/shadow").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn test_nmap_output_validator() {
        assert!(validate_nmap_output("Starting Nmap 7.94 ...").is_ok());
        assert!(validate_nmap_output("").is_err());
        assert!(validate_nmap_output("command not found").is_err());
    }
}
