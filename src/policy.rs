//! Permission Policy
//!
//! Ordered rule evaluation with explicit override semantics: a sentinel
//! default-deny-all rule always sits first, and the last rule whose pattern
//! matches the normalized command name wins. The manager also tracks
//! per-identity in-flight commands so `max_concurrent` bounds hold across
//! every exit path; slots are released through a Drop guard rather than a
//! manual call.

use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::GateError;

/// Rule pattern, evaluated through one dispatch
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Exact command-name match
    Exact(String),
    /// Compiled regular expression match
    Regex(Regex),
}

impl Pattern {
    /// Compile a regex pattern
    pub fn regex(pattern: &str) -> Result<Self, GateError> {
        Regex::new(pattern)
            .map(Pattern::Regex)
            .map_err(|e| GateError::PermissionDenied(format!("invalid rule pattern: {e}")))
    }

    /// Match against a normalized command name
    pub fn matches(&self, command: &str) -> bool {
        match self {
            Pattern::Exact(name) => name == command,
            Pattern::Regex(re) => re.is_match(command),
        }
    }
}

/// Per-rule rate-limit override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateSpec {
    /// Token bucket capacity
    pub capacity: u32,
    /// Refill window in seconds
    pub window_secs: u64,
}

/// A single permission rule
#[derive(Debug, Clone)]
pub struct PermissionRule {
    /// Command pattern this rule applies to
    pub pattern: Pattern,

    /// Whether a match allows or denies the command
    pub allow: bool,

    /// Identity must hold at least one of these roles, when present
    pub required_roles: Option<Vec<String>>,

    /// Per-identity in-flight bound for this command, when present
    pub max_concurrent: Option<usize>,

    /// Rate-limit override for identities admitted through this rule
    pub rate_limit: Option<RateSpec>,
}

impl PermissionRule {
    /// Allow a command by exact name
    pub fn allow(command: &str) -> Self {
        Self {
            pattern: Pattern::Exact(command.to_string()),
            allow: true,
            required_roles: None,
            max_concurrent: None,
            rate_limit: None,
        }
    }

    /// Deny a command by exact name
    pub fn deny(command: &str) -> Self {
        Self {
            pattern: Pattern::Exact(command.to_string()),
            allow: false,
            required_roles: None,
            max_concurrent: None,
            rate_limit: None,
        }
    }

    /// Require at least one of the given roles
    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.required_roles = Some(roles.iter().map(|r| r.to_string()).collect());
        self
    }

    /// Bound concurrent executions per identity
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Override the rate limit for this rule
    pub fn with_rate_limit(mut self, capacity: u32, window_secs: u64) -> Self {
        self.rate_limit = Some(RateSpec {
            capacity,
            window_secs,
        });
        self
    }

    /// The sentinel default-deny-all rule that opens every rule list
    fn default_deny_all() -> Self {
        Self {
            pattern: Pattern::Regex(Regex::new(".*").expect("static pattern")),
            allow: false,
            required_roles: None,
            max_concurrent: None,
            rate_limit: None,
        }
    }
}

/// Outcome of a successful permission check
#[derive(Debug, Clone)]
pub struct Decision {
    /// In-flight bound from the winning rule
    pub max_concurrent: Option<usize>,

    /// Rate-limit override from the winning rule
    pub rate_limit: Option<RateSpec>,
}

type ActiveCommands = HashMap<String, HashMap<String, usize>>;

/// Permission manager: ordered rules plus in-flight command tracking
#[derive(Debug)]
pub struct PermissionManager {
    rules: Vec<PermissionRule>,
    active: Arc<Mutex<ActiveCommands>>,
}

impl PermissionManager {
    /// Create a manager; the sentinel default-deny-all rule is always
    /// prepended so an empty rule list denies everything.
    pub fn new(rules: Vec<PermissionRule>) -> Self {
        let mut all = vec![PermissionRule::default_deny_all()];
        all.extend(rules);
        Self {
            rules: all,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Normalize a command line to its first token
    fn normalize(command: &str) -> &str {
        command.split_whitespace().next().unwrap_or("")
    }

    /// Evaluate the rule list for a command under an identity.
    ///
    /// Deterministic and total: the last matching rule in list order
    /// produces the decision. Role and in-flight bounds from the winning
    /// rule are enforced here as well.
    pub fn check(
        &self,
        command: &str,
        identity: &str,
        roles: &[String],
    ) -> Result<Decision, GateError> {
        let name = Self::normalize(command);

        let winning = self.rules.iter().filter(|r| r.pattern.matches(name)).last();

        let rule = match winning {
            Some(rule) => rule,
            None => {
                return Err(GateError::PermissionDenied(format!(
                    "no matching rule for command '{name}'"
                )))
            }
        };

        if !rule.allow {
            return Err(GateError::PermissionDenied(format!(
                "command '{name}' is denied by policy"
            )));
        }

        if let Some(required) = &rule.required_roles {
            let held = required.iter().any(|r| roles.contains(r));
            if !held {
                return Err(GateError::PermissionDenied(format!(
                    "identity '{identity}' lacks a required role for '{name}'"
                )));
            }
        }

        if let Some(max) = rule.max_concurrent {
            let active = self.active.lock().expect("active commands lock");
            let in_flight = active
                .get(identity)
                .and_then(|cmds| cmds.get(name))
                .copied()
                .unwrap_or(0);
            if in_flight >= max {
                return Err(GateError::PermissionDenied(
                    "maximum concurrent command limit reached".to_string(),
                ));
            }
        }

        debug!(command = name, identity, "permission granted");
        Ok(Decision {
            max_concurrent: rule.max_concurrent,
            rate_limit: rule.rate_limit.clone(),
        })
    }

    /// Acquire an in-flight slot for a command. The bound is rechecked under
    /// the lock so concurrent acquisitions cannot overshoot it. The returned
    /// guard releases the slot on drop, covering timeout and panic paths.
    pub fn track_start(
        &self,
        identity: &str,
        command: &str,
        max_concurrent: Option<usize>,
    ) -> Result<ExecutionSlot, GateError> {
        let name = Self::normalize(command).to_string();
        let mut active = self.active.lock().expect("active commands lock");
        let count = active
            .entry(identity.to_string())
            .or_default()
            .entry(name.clone())
            .or_insert(0);

        if let Some(max) = max_concurrent {
            if *count >= max {
                return Err(GateError::PermissionDenied(
                    "maximum concurrent command limit reached".to_string(),
                ));
            }
        }
        *count += 1;

        Ok(ExecutionSlot {
            active: Arc::clone(&self.active),
            identity: identity.to_string(),
            command: name,
        })
    }

    /// Current in-flight count for an identity/command pair
    pub fn in_flight(&self, identity: &str, command: &str) -> usize {
        let name = Self::normalize(command);
        let active = self.active.lock().expect("active commands lock");
        active
            .get(identity)
            .and_then(|cmds| cmds.get(name))
            .copied()
            .unwrap_or(0)
    }
}

/// Scoped in-flight slot. Dropping the slot releases the concurrency
/// capacity, so every exit path gives it back.
#[derive(Debug)]
pub struct ExecutionSlot {
    active: Arc<Mutex<ActiveCommands>>,
    identity: String,
    command: String,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        let mut active = self.active.lock().expect("active commands lock");
        if let Some(cmds) = active.get_mut(&self.identity) {
            if let Some(count) = cmds.get_mut(&self.command) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    cmds.remove(&self.command);
                }
            }
            if cmds.is_empty() {
                active.remove(&self.identity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_empty_rule_list_denies_everything() {
        let manager = PermissionManager::new(vec![]);
        let err = manager.check("nmap", "alice", &[]).unwrap_err();
        assert!(err.to_string().contains("denied by policy"));
    }

    #[test]
    fn test_last_matching_rule_wins() {
        // deny-all sentinel, then allow ping, then deny ping again
        let manager = PermissionManager::new(vec![
            PermissionRule::allow("ping"),
            PermissionRule::deny("ping"),
        ]);
        assert!(manager.check("ping", "alice", &[]).is_err());

        let manager = PermissionManager::new(vec![
            PermissionRule::deny("ping"),
            PermissionRule::allow("ping"),
        ]);
        assert!(manager.check("ping", "alice", &[]).is_ok());
    }

    #[test]
    fn test_check_is_deterministic() {
        let manager = PermissionManager::new(vec![PermissionRule::allow("nmap")]);
        for _ in 0..10 {
            assert!(manager.check("nmap", "alice", &[]).is_ok());
            assert!(manager.check("masscan", "alice", &[]).is_err());
        }
    }

    #[test]
    fn test_command_normalized_to_first_token() {
        let manager = PermissionManager::new(vec![PermissionRule::allow("nmap")]);
        assert!(manager.check("nmap -sS -p 80 host1", "alice", &[]).is_ok());
    }

    #[test]
    fn test_regex_pattern() {
        let manager = PermissionManager::new(vec![PermissionRule {
            pattern: Pattern::regex("^go.*").unwrap(),
            allow: true,
            required_roles: None,
            max_concurrent: None,
            rate_limit: None,
        }]);
        assert!(manager.check("gobuster", "alice", &[]).is_ok());
        assert!(manager.check("nmap", "alice", &[]).is_err());
    }

    #[test]
    fn test_role_gating() {
        let manager = PermissionManager::new(vec![
            PermissionRule::allow("hydra").with_roles(&["cracker", "admin"])
        ]);

        assert!(manager.check("hydra", "alice", &roles(&["viewer"])).is_err());
        assert!(manager.check("hydra", "alice", &[]).is_err());
        assert!(manager
            .check("hydra", "alice", &roles(&["admin"]))
            .is_ok());
    }

    #[test]
    fn test_max_concurrent_denies_second_call() {
        let manager =
            PermissionManager::new(vec![PermissionRule::allow("ping").with_max_concurrent(1)]);

        let decision = manager.check("ping", "alice", &[]).unwrap();
        let slot = manager
            .track_start("alice", "ping", decision.max_concurrent)
            .unwrap();

        // Second call from the same identity while the first is in flight
        let err = manager.check("ping", "alice", &[]).unwrap_err();
        assert!(err
            .to_string()
            .contains("maximum concurrent command limit reached"));

        // A different identity still has capacity
        assert!(manager.check("ping", "bob", &[]).is_ok());

        drop(slot);
        assert!(manager.check("ping", "alice", &[]).is_ok());
    }

    #[test]
    fn test_slot_released_on_drop() {
        let manager =
            PermissionManager::new(vec![PermissionRule::allow("nmap").with_max_concurrent(2)]);

        {
            let _a = manager.track_start("alice", "nmap", Some(2)).unwrap();
            let _b = manager.track_start("alice", "nmap", Some(2)).unwrap();
            assert_eq!(manager.in_flight("alice", "nmap"), 2);
            assert!(manager.track_start("alice", "nmap", Some(2)).is_err());
        }

        assert_eq!(manager.in_flight("alice", "nmap"), 0);
    }

    #[test]
    fn test_track_start_rechecks_bound_under_lock() {
        let manager = PermissionManager::new(vec![PermissionRule::allow("ping")]);
        let _slot = manager.track_start("alice", "ping", Some(1)).unwrap();
        assert!(manager.track_start("alice", "ping", Some(1)).is_err());
    }

    #[test]
    fn test_rate_limit_override_carried_in_decision() {
        let manager = PermissionManager::new(vec![
            PermissionRule::allow("masscan").with_rate_limit(2, 30)
        ]);
        let decision = manager.check("masscan", "alice", &[]).unwrap();
        assert_eq!(
            decision.rate_limit,
            Some(RateSpec {
                capacity: 2,
                window_secs: 30
            })
        );
    }
}
