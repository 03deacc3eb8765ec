//! Checkpoint/Restore coordination core.
//!
//! Lets a running process be snapshotted and later resumed as a new
//! process instance, giving application and runtime code a chance to
//! release and reacquire resources that cannot cross the process-image
//! boundary. Provides the resource registries and their notification
//! ordering, per-attempt claim tracking for OS handles, failure
//! aggregation, and the coordinator that drives one attempt end to end
//! against an external checkpoint engine.

pub mod claims;
pub mod context;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gate;
pub mod policy;
pub mod priority;
pub mod resource;

// Re-export commonly used types
pub use claims::{ClaimedFds, Claimer, FailureSupplier, FdHandle};
pub use context::Context;
pub use coordinator::{Coordinator, DEFAULT_PRIORITY};
pub use engine::{
    CheckpointEngine, CheckpointOutcome, CheckpointRequest, EngineExtension, EngineFailure,
    EntryPointSpec, FailureCategory, RestoreReport,
};
pub use error::{
    CheckpointError, CracError, CracResult, EngineError, FailureCause, RegistrationError,
    RestoreError, SweepError,
};
pub use policy::{FilePolicy, HandleKind, PolicyAction, PolicyDecision, PolicyLookup, StrictPolicy};
pub use priority::{Priority, PriorityContext};
pub use resource::{RegistrationMode, Resource};
