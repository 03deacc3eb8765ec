//! Failure taxonomy for checkpoint/restore coordination.
//!
//! All errors are explicit enum or struct types - no `Box<dyn Error>`,
//! no `anyhow::Result`. Failures raised by individual resources during a
//! notification sweep are never propagated directly; they are folded into
//! an aggregate that is raised once, after every resource has been
//! notified.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// A single leaf failure collected during an attempt.
///
/// Engine-reported problems about OS handles map onto the first three
/// variants; anything raised by a misbehaving resource is wrapped as
/// `Resource`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error("open file: {}", path.display())]
    OpenFile { path: PathBuf },

    #[error("open socket: {description}")]
    OpenSocket { description: String },

    #[error("open pipe")]
    OpenPipe,

    #[error("{message}")]
    Resource { message: String },
}

impl FailureCause {
    /// Wrap a plain message as a generic resource failure.
    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource {
            message: message.into(),
        }
    }
}

/// Aggregate of failures produced by one notification sweep.
///
/// Carries an optional primary message (used when a plain resource fails
/// with no children of its own) plus zero or more leaf causes. Folding a
/// child aggregate flattens its causes into this one - aggregates never
/// nest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepError {
    message: Option<String>,
    causes: Vec<FailureCause>,
}

impl SweepError {
    /// An empty aggregate (nothing has failed yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain failure with a message and no children. This is what a
    /// non-registry resource returns from a failed notification.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            causes: Vec::new(),
        }
    }

    /// An aggregate carrying the given leaf causes.
    pub fn with_causes(causes: Vec<FailureCause>) -> Self {
        Self {
            message: None,
            causes,
        }
    }

    /// Append a single leaf cause.
    pub fn push(&mut self, cause: FailureCause) {
        self.causes.push(cause);
    }

    /// Fold another sweep outcome into this aggregate.
    ///
    /// A child with k > 0 causes contributes exactly those k leaves
    /// (flattening - no aggregates-of-aggregates). A child with no causes
    /// contributes one leaf carrying its message.
    pub fn fold(&mut self, child: SweepError) {
        if child.causes.is_empty() {
            let message = child
                .message
                .unwrap_or_else(|| "resource failed without detail".to_string());
            self.causes.push(FailureCause::Resource { message });
        } else {
            self.causes.extend(child.causes);
        }
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.causes.is_empty() && self.message.is_none()
    }

    /// The collected leaf causes.
    pub fn causes(&self) -> &[FailureCause] {
        &self.causes
    }

    /// Consume the aggregate, yielding its leaves. A bare message (no
    /// children) becomes a single `Resource` leaf.
    pub fn into_causes(self) -> Vec<FailureCause> {
        if self.causes.is_empty() {
            match self.message {
                Some(message) => vec![FailureCause::Resource { message }],
                None => Vec::new(),
            }
        } else {
            self.causes
        }
    }
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.message, self.causes.len()) {
            (Some(message), 0) => write!(f, "{}", message),
            (_, n) => {
                write!(f, "{} failure(s)", n)?;
                for cause in &self.causes {
                    write!(f, "; {}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SweepError {}

/// Raised when the before-checkpoint phase of an attempt failed.
///
/// Enumerates every individual failure encountered: resource
/// notifications, judged open handles, and engine-reported errors. Per
/// attempt this is mutually exclusive with [`RestoreError`]; when the
/// checkpoint phase failed, restore-phase failures are merged in here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointError {
    causes: Vec<FailureCause>,
}

impl CheckpointError {
    pub fn new(causes: Vec<FailureCause>) -> Self {
        Self { causes }
    }

    pub fn causes(&self) -> &[FailureCause] {
        &self.causes
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "checkpoint failed ({} cause(s))", self.causes.len())?;
        for cause in &self.causes {
            write!(f, "; {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for CheckpointError {}

/// Raised when the checkpoint phase was clean but the after-restore sweep
/// (or the entry-point relaunch) failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreError {
    causes: Vec<FailureCause>,
}

impl RestoreError {
    pub fn new(causes: Vec<FailureCause>) -> Self {
        Self { causes }
    }

    pub fn causes(&self) -> &[FailureCause] {
        &self.causes
    }
}

impl fmt::Display for RestoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "restore failed ({} cause(s))", self.causes.len())?;
        for cause in &self.causes {
            write!(f, "; {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for RestoreError {}

/// Top-level outcome of one checkpoint/restore attempt.
#[derive(Debug, Error)]
pub enum CracError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    /// An attempt was requested while another one is already running, or
    /// from inside a running notification sweep. Rejected immediately,
    /// never queued.
    #[error("checkpoint/restore attempt already in progress")]
    AttemptInProgress,

    /// The engine reports the checkpoint feature is not configured. No
    /// notification sweep has been performed.
    #[error("checkpoint engine is not configured")]
    NotConfigured,
}

/// Errors surfaced by resource registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// Registration on a blocking registry from the thread that is
    /// driving the current sweep. Blocking would never wake up, so the
    /// call fails fast instead.
    #[error("registration would deadlock: called from the thread driving the current sweep")]
    WouldDeadlock,

    /// Registration at a priority that the in-progress checkpoint sweep
    /// has already passed (or is currently processing). The registrant
    /// would never be notified for this attempt, which is a programming
    /// error at the call site.
    #[error("priority {priority} already processed by the in-progress checkpoint sweep")]
    PriorityClosed { priority: i64 },
}

/// Errors raised by a checkpoint engine outside of an attempt.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown engine configuration key: {key}")]
    UnknownKey { key: String },

    #[error("invalid value for engine key {key}: {value} - {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("checkpoint engine binary not found")]
    BinaryNotFound,

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias for attempt-level operations.
pub type CracResult<T> = Result<T, CracError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message_folds_to_single_leaf() {
        let mut parent = SweepError::new();
        parent.fold(SweepError::msg("busy"));

        assert_eq!(
            parent.causes(),
            &[FailureCause::resource("busy")],
            "a childless aggregate must become exactly one leaf"
        );
    }

    #[test]
    fn test_child_causes_are_flattened() {
        let child = SweepError::with_causes(vec![
            FailureCause::OpenPipe,
            FailureCause::resource("stale handle"),
        ]);

        let mut parent = SweepError::new();
        parent.push(FailureCause::resource("first"));
        parent.fold(child);

        assert_eq!(parent.causes().len(), 3);
        assert_eq!(parent.causes()[1], FailureCause::OpenPipe);
    }

    #[test]
    fn test_into_causes_promotes_bare_message() {
        let leaves = SweepError::msg("busy").into_causes();
        assert_eq!(leaves, vec![FailureCause::resource("busy")]);
    }

    #[test]
    fn test_empty_aggregate() {
        let agg = SweepError::new();
        assert!(agg.is_empty());
        assert!(agg.into_causes().is_empty());
    }

    #[test]
    fn test_checkpoint_error_display_lists_causes() {
        let err = CheckpointError::new(vec![
            FailureCause::OpenFile {
                path: PathBuf::from("/tmp/data.log"),
            },
            FailureCause::OpenSocket {
                description: "tcp 127.0.0.1:8080".to_string(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 cause(s)"));
        assert!(text.contains("/tmp/data.log"));
        assert!(text.contains("tcp 127.0.0.1:8080"));
    }

    #[test]
    fn test_crac_error_from_aggregates() {
        let err: CracError = CheckpointError::new(vec![FailureCause::OpenPipe]).into();
        assert!(matches!(err, CracError::Checkpoint(_)));

        let err: CracError = RestoreError::new(vec![]).into();
        assert!(matches!(err, CracError::Restore(_)));
    }
}
