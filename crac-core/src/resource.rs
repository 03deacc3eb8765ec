//! The resource notification contract.
//!
//! Anything that must react to a checkpoint/restore boundary - open file
//! descriptors, sockets, native handles, threads blocked in syscalls -
//! implements [`Resource`] and registers into a [`Context`](crate::Context).

use crate::error::SweepError;

/// A unit of state that participates in checkpoint/restore coordination.
///
/// Both notifications are fallible and independent: a failure from
/// `before_checkpoint` never suppresses the later `after_restore` call on
/// the same resource. Notifications for one attempt always arrive
/// sequentially on the single thread driving the attempt; implementations
/// only need to defend against unrelated application threads.
///
/// Registries hold resources weakly. Keep the owning `Arc` alive for as
/// long as the resource should be notified; dropping it unregisters the
/// resource automatically.
pub trait Resource: Send + Sync {
    /// Invoked before the process image is captured. Release or park
    /// anything that cannot cross the checkpoint boundary.
    fn before_checkpoint(&self) -> Result<(), SweepError>;

    /// Invoked after the process has been restored (or after a failed
    /// checkpoint, to undo speculative teardown). Reacquire what
    /// `before_checkpoint` released.
    fn after_restore(&self) -> Result<(), SweepError>;
}

/// How a registry treats registration attempts that arrive while its own
/// checkpoint sweep is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationMode {
    /// Block the registering thread until the sweep completes, so the
    /// registrant is guaranteed not to be missed by the next attempt.
    /// The default for ordinary registries.
    #[default]
    Blocking,

    /// Admit the registrant immediately and give it a synchronous
    /// checkpoint notification on the spot, folding the outcome into the
    /// in-flight sweep. Used sparingly, for late-arriving listeners that
    /// must not be skipped.
    Critical,
}
