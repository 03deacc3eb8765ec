//! Policy decisions for claimed handles.
//!
//! When a resource judges a claimed handle, the configured policy decides
//! its fate: fail the checkpoint, close it silently, close with a warning
//! and reopen after restore, or ignore it. The core consumes only this
//! decision contract; `FilePolicy` is one implementation, loaded from a
//! YAML rule list the same way orchestrator configuration usually is -
//! parsed raw, then validated before use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Kind of OS handle a policy rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleKind {
    File,
    Socket,
    Pipe,
}

/// Which side of the checkpoint boundary a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPhase {
    Checkpoint,
    Restore,
    #[default]
    Any,
}

/// Closed set of actions a policy can prescribe for an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// The open handle fails the checkpoint (the default).
    Error,
    /// Close the handle silently before the image is captured.
    Close,
    /// Close with a warning and reopen after restore, possibly at a
    /// replacement path/address given in the params.
    WarnCloseReopen,
    /// Leave the handle alone.
    Ignore,
}

/// A policy verdict: the action plus free-form string parameters (e.g. a
/// replacement path to open after restore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub params: HashMap<String, String>,
}

impl PolicyDecision {
    pub fn action(action: PolicyAction) -> Self {
        Self {
            action,
            params: HashMap::new(),
        }
    }
}

/// The decision contract the core consumes. `subject` is the handle's
/// identity in rule terms: a path for files, an address for sockets.
pub trait PolicyLookup: Send + Sync {
    fn find(&self, is_restore: bool, kind: HandleKind, subject: &str) -> PolicyDecision;
}

/// The no-configuration policy: every open handle is an error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictPolicy;

impl PolicyLookup for StrictPolicy {
    fn find(&self, _is_restore: bool, _kind: HandleKind, _subject: &str) -> PolicyDecision {
        PolicyDecision::action(PolicyAction::Error)
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("policy parse error: {message}")]
    Parse { message: String },

    #[error("invalid policy rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("IO error reading policy file: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw rule as parsed from YAML, before validation.
#[derive(Debug, Deserialize)]
struct RawRule {
    kind: HandleKind,
    /// Exact subject, or a prefix ending in `*`, or bare `*` for all.
    #[serde(rename = "match")]
    pattern: String,
    #[serde(default)]
    phase: PolicyPhase,
    action: PolicyAction,
    #[serde(default)]
    params: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug)]
struct Rule {
    kind: HandleKind,
    pattern: String,
    phase: PolicyPhase,
    decision: PolicyDecision,
}

impl Rule {
    fn matches(&self, is_restore: bool, kind: HandleKind, subject: &str) -> bool {
        if self.kind != kind {
            return false;
        }
        let phase_ok = match self.phase {
            PolicyPhase::Any => true,
            PolicyPhase::Checkpoint => !is_restore,
            PolicyPhase::Restore => is_restore,
        };
        if !phase_ok {
            return false;
        }
        if self.pattern == "*" {
            return true;
        }
        match self.pattern.strip_suffix('*') {
            Some(prefix) => subject.starts_with(prefix),
            None => subject == self.pattern,
        }
    }
}

/// Policy backed by an ordered YAML rule list. The first matching rule
/// wins; with no match the decision is [`PolicyAction::Error`].
#[derive(Debug)]
pub struct FilePolicy {
    rules: Vec<Rule>,
}

impl FilePolicy {
    /// Load and validate a policy from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PolicyError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::load_str(&content)
    }

    /// Load and validate a policy from a YAML string.
    pub fn load_str(content: &str) -> Result<Self, PolicyError> {
        let raw: RawPolicy = serde_yaml::from_str(content).map_err(|e| PolicyError::Parse {
            message: format!("YAML parse error: {}", e),
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawPolicy) -> Result<Self, PolicyError> {
        let mut rules = Vec::with_capacity(raw.rules.len());
        for (index, rule) in raw.rules.into_iter().enumerate() {
            if rule.pattern.is_empty() {
                return Err(PolicyError::InvalidRule {
                    index,
                    reason: "match pattern cannot be empty".to_string(),
                });
            }
            if let Some(pos) = rule.pattern.find('*') {
                if pos != rule.pattern.len() - 1 {
                    return Err(PolicyError::InvalidRule {
                        index,
                        reason: "wildcard is only supported at the end of a pattern".to_string(),
                    });
                }
            }
            rules.push(Rule {
                kind: rule.kind,
                pattern: rule.pattern,
                phase: rule.phase,
                decision: PolicyDecision {
                    action: rule.action,
                    params: rule.params,
                },
            });
        }
        tracing::debug!(rules = rules.len(), "policy loaded");
        Ok(Self { rules })
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl PolicyLookup for FilePolicy {
    fn find(&self, is_restore: bool, kind: HandleKind, subject: &str) -> PolicyDecision {
        for rule in &self.rules {
            if rule.matches(is_restore, kind, subject) {
                return rule.decision.clone();
            }
        }
        PolicyDecision::action(PolicyAction::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
rules:
  - kind: file
    match: "/var/log/*"
    action: warn_close_reopen
    params:
      reopen_path: "/var/log/app.restored.log"
  - kind: file
    match: "/tmp/scratch.dat"
    action: close
  - kind: socket
    match: "*"
    phase: checkpoint
    action: ignore
"#;

    #[test]
    fn test_first_match_wins() {
        let policy = FilePolicy::load_str(SAMPLE).unwrap();
        assert_eq!(policy.rule_count(), 3);

        let decision = policy.find(false, HandleKind::File, "/var/log/app.log");
        assert_eq!(decision.action, PolicyAction::WarnCloseReopen);
        assert_eq!(
            decision.params.get("reopen_path").map(String::as_str),
            Some("/var/log/app.restored.log")
        );

        let decision = policy.find(false, HandleKind::File, "/tmp/scratch.dat");
        assert_eq!(decision.action, PolicyAction::Close);
    }

    #[test]
    fn test_unmatched_subject_defaults_to_error() {
        let policy = FilePolicy::load_str(SAMPLE).unwrap();
        let decision = policy.find(false, HandleKind::File, "/etc/passwd");
        assert_eq!(decision.action, PolicyAction::Error);
    }

    #[test]
    fn test_phase_filter() {
        let policy = FilePolicy::load_str(SAMPLE).unwrap();
        // The socket wildcard only applies on the checkpoint side.
        let decision = policy.find(false, HandleKind::Socket, "tcp 0.0.0.0:8080");
        assert_eq!(decision.action, PolicyAction::Ignore);
        let decision = policy.find(true, HandleKind::Socket, "tcp 0.0.0.0:8080");
        assert_eq!(decision.action, PolicyAction::Error);
    }

    #[test]
    fn test_kind_mismatch_skips_rule() {
        let policy = FilePolicy::load_str(SAMPLE).unwrap();
        let decision = policy.find(false, HandleKind::Pipe, "/var/log/app.log");
        assert_eq!(decision.action, PolicyAction::Error);
    }

    #[test]
    fn test_empty_pattern_rejected() {
        let yaml = r#"
rules:
  - kind: file
    match: ""
    action: close
"#;
        let err = FilePolicy::load_str(yaml).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { index: 0, .. }));
    }

    #[test]
    fn test_interior_wildcard_rejected() {
        let yaml = r#"
rules:
  - kind: file
    match: "/var/*/log"
    action: close
"#;
        let err = FilePolicy::load_str(yaml).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidRule { .. }));
    }

    #[test]
    fn test_empty_policy_parses() {
        let policy = FilePolicy::load_str("rules: []").unwrap();
        assert_eq!(policy.rule_count(), 0);
        assert_eq!(
            policy.find(false, HandleKind::File, "/any").action,
            PolicyAction::Error
        );
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let policy = FilePolicy::load_file(file.path()).unwrap();
        assert_eq!(policy.rule_count(), 3);
    }

    #[test]
    fn test_missing_file() {
        let err = FilePolicy::load_file("/nonexistent/policy.yaml").unwrap_err();
        assert!(matches!(err, PolicyError::NotFound { .. }));
    }
}
