//! Contract with the external checkpoint engine.
//!
//! The engine owns the actual process-image capture and restore; the
//! coordination core only prepares for it and interprets its verdict.
//! Engines are configured through discoverable string keys and may expose
//! optional named extensions for auxiliary features.

use std::any::Any;
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::{EngineError, FailureCause};

/// Category attached to an engine-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    Generic,
    OpenFile,
    OpenSocket,
    OpenPipe,
}

/// One (category, message) pair reported by a failed engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl EngineFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Translate into the internal failure taxonomy.
    pub fn into_cause(self) -> FailureCause {
        match self.category {
            FailureCategory::OpenFile => FailureCause::OpenFile {
                path: PathBuf::from(self.message),
            },
            FailureCategory::OpenSocket => FailureCause::OpenSocket {
                description: self.message,
            },
            FailureCategory::OpenPipe => FailureCause::OpenPipe,
            FailureCategory::Generic => FailureCause::Resource {
                message: self.message,
            },
        }
    }
}

/// What the coordinator hands to the engine for one attempt.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    /// Handles that are still open and were judged problematic.
    pub open_fds: Vec<RawFd>,
    /// True when the attempt already carries failures; the engine should
    /// validate but not actually capture an image that could never be
    /// restored cleanly.
    pub dry_run: bool,
}

/// A replacement entry point the restored process should run, resolved by
/// name against the coordinator's entry-point registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointSpec {
    pub name: String,
    pub args: Vec<String>,
}

/// What the engine reports back after a successful restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// System properties to apply before anything else touches them.
    pub properties: Vec<(String, String)>,
    /// Optional replacement entry point to invoke after the restore sweep.
    pub entry_point: Option<EntryPointSpec>,
    /// Opaque blob carried from the checkpointing side.
    pub user_data: Option<Vec<u8>>,
}

/// Verdict of one engine invocation.
#[derive(Debug)]
pub enum CheckpointOutcome {
    /// The checkpoint was taken and a restore has happened; we may be
    /// running in a brand new process instance.
    Restored(RestoreReport),
    /// The engine refused or failed; the process keeps running as-is.
    Failed(Vec<EngineFailure>),
    /// The checkpoint feature is not configured at all.
    NotConfigured,
}

/// Optional named engine capability, discoverable by name and
/// forward-compatible: unknown names simply resolve to `None`.
pub trait EngineExtension: Any + Send + Sync {
    fn name(&self) -> &'static str;

    /// Downcast support for callers that know the concrete capability.
    fn as_any(&self) -> &dyn Any;
}

/// The external checkpoint engine, consumed (never implemented) by the
/// coordination core. One real implementation lives in the `crac-criu`
/// crate; tests use scripted fakes.
pub trait CheckpointEngine: Send + Sync {
    /// Whether the checkpoint feature is usable at all. Probed before any
    /// notification sweep runs: a misconfigured engine must not cause a
    /// single resource to be notified.
    fn is_configured(&self) -> bool;

    /// Whether the engine understands a configuration key.
    fn can_configure(&self, key: &str) -> bool;

    /// Set a configuration value. Unknown keys are rejected.
    fn configure(&mut self, key: &str, value: &str) -> Result<(), EngineError>;

    /// Capture the process image. On success the call returns after the
    /// restore, in what may be a new process instance.
    fn checkpoint(&self, request: &CheckpointRequest) -> CheckpointOutcome;

    /// Look up a named capability.
    fn extension(&self, name: &str) -> Option<&dyn EngineExtension> {
        let _ = name;
        None
    }
}
