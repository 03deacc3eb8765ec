//! Orchestration of one end-to-end checkpoint/restore attempt.
//!
//! The [`Coordinator`] owns the top-level registry, the engine, and the
//! per-attempt claim table. Exactly one thread at a time may drive an
//! attempt; a second request while one is running is rejected outright,
//! never queued. All individual resource failures are recovered locally
//! and surfaced as nested causes of one of the two top-level aggregates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;

use crate::claims::ClaimedFds;
use crate::engine::{CheckpointEngine, CheckpointOutcome, CheckpointRequest};
use crate::error::{
    CheckpointError, CracError, CracResult, FailureCause, RestoreError, SweepError,
};
use crate::priority::PriorityContext;

/// Default priority for resources with no ordering requirement.
pub const DEFAULT_PRIORITY: i64 = 0;

type EntryPointFn = Box<dyn Fn(Vec<String>) -> Result<(), SweepError> + Send + Sync>;

static GLOBAL: OnceLock<Coordinator> = OnceLock::new();

/// The process-wide checkpoint/restore coordinator.
pub struct Coordinator {
    engine: Box<dyn CheckpointEngine>,
    context: Arc<PriorityContext>,
    /// Claim table for the attempt currently in flight, if any. Published
    /// here so collaborator resources can claim handles during the sweep.
    claims: Mutex<Option<Arc<ClaimedFds>>>,
    /// Attempt mutual exclusion. Also the recursion guard: a request from
    /// inside a running notification chain sees the flag set.
    in_progress: AtomicBool,
    /// Named entry points supplied by the embedding application, invoked
    /// when the engine reports a replacement entry point after restore.
    entry_points: Mutex<HashMap<String, EntryPointFn>>,
}

impl Coordinator {
    pub fn new(engine: Box<dyn CheckpointEngine>) -> Self {
        Self {
            engine,
            context: PriorityContext::new_shared(),
            claims: Mutex::new(None),
            in_progress: AtomicBool::new(false),
            entry_points: Mutex::new(HashMap::new()),
        }
    }

    /// Initialize the process-wide coordinator, or return the existing
    /// one. Must be called before any resource registers against the
    /// global context; a second call drops its engine argument.
    pub fn init_global(engine: Box<dyn CheckpointEngine>) -> &'static Coordinator {
        let mut fresh = false;
        let coordinator = GLOBAL.get_or_init(|| {
            fresh = true;
            Coordinator::new(engine)
        });
        if !fresh {
            tracing::warn!("global coordinator already initialized; engine dropped");
        }
        coordinator
    }

    /// The process-wide coordinator, if one has been initialized.
    pub fn global() -> Option<&'static Coordinator> {
        GLOBAL.get()
    }

    /// The top-level priority registry resources register into.
    pub fn context(&self) -> &Arc<PriorityContext> {
        &self.context
    }

    /// The engine, for extension discovery.
    pub fn engine(&self) -> &dyn CheckpointEngine {
        self.engine.as_ref()
    }

    /// The claim table of the attempt currently in flight. `None` outside
    /// an attempt; a fresh table is published for each attempt and never
    /// carries state across attempts.
    pub fn claimed_fds(&self) -> Option<Arc<ClaimedFds>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Register a named entry point the engine may select after restore.
    pub fn register_entry_point<F>(&self, name: impl Into<String>, entry: F)
    where
        F: Fn(Vec<String>) -> Result<(), SweepError> + Send + Sync + 'static,
    {
        self.entry_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), Box::new(entry));
    }

    /// Drive one checkpoint/restore attempt end to end.
    ///
    /// Returns normally on a successful restore. Raises exactly one of
    /// [`CracError::Checkpoint`] or [`CracError::Restore`], whose causes
    /// enumerate every individual failure; never both for one attempt.
    pub fn perform_checkpoint_restore(&self) -> CracResult<()> {
        // Guard: reject reentrant and concurrent requests immediately.
        if self.in_progress.swap(true, Ordering::SeqCst) {
            tracing::warn!("attempt rejected: another attempt is in progress");
            return Err(CracError::AttemptInProgress);
        }

        // A misconfigured engine must be detected before a single
        // resource is notified.
        if !self.engine.is_configured() {
            self.in_progress.store(false, Ordering::SeqCst);
            return Err(CracError::NotConfigured);
        }

        let result = self.run_attempt();
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    fn run_attempt(&self) -> CracResult<()> {
        tracing::info!("checkpoint/restore attempt started");

        // Keep-alive unit: something non-daemon must outlive the attempt
        // while it straddles the process boundary.
        let (keepalive_tx, keepalive_rx) = mpsc::channel::<()>();
        let keepalive = thread::Builder::new()
            .name("crac-keepalive".to_string())
            .spawn(move || {
                // Parks until the coordinator drops the sender.
                let _ = keepalive_rx.recv();
            });
        if let Err(err) = &keepalive {
            tracing::warn!(error = %err, "keep-alive thread could not be spawned");
        }

        // Fresh claim table, published for the duration of the sweep.
        let claims = Arc::new(ClaimedFds::new());
        *self.claims.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&claims));

        // Before-checkpoint sweep. Failures are captured, not yet raised.
        let mut checkpoint_agg = SweepError::new();
        if let Err(err) = self.context.checkpoint() {
            checkpoint_agg.fold(err);
        }

        // Judge the claimed handles: each failure supplier runs exactly
        // once, now that all global decisions have been made.
        let mut problem_fds = Vec::new();
        for (fd, supplier) in claims.snapshot() {
            if let Some(cause) = supplier() {
                tracing::debug!(fd, cause = %cause, "open handle judged problematic");
                checkpoint_agg.push(cause);
                problem_fds.push(fd);
            }
        }

        // Hand control to the engine. A known-unsnapshotable process only
        // gets a dry run.
        let request = CheckpointRequest {
            open_fds: problem_fds,
            dry_run: !checkpoint_agg.is_empty(),
        };
        let report = match self.engine.checkpoint(&request) {
            CheckpointOutcome::Restored(report) => {
                tracing::info!("engine returned: process restored");
                Some(report)
            }
            CheckpointOutcome::Failed(failures) => {
                tracing::warn!(failures = failures.len(), "engine reported checkpoint failure");
                for failure in failures {
                    checkpoint_agg.push(failure.into_cause());
                }
                None
            }
            CheckpointOutcome::NotConfigured => {
                // The pre-sweep probe said otherwise; treat as a regular
                // engine failure since resources were already notified.
                checkpoint_agg.push(FailureCause::resource(
                    "engine reported not-configured after notification",
                ));
                None
            }
        };

        // Engine-reported properties apply before anything else runs in
        // the restored process.
        if let Some(report) = &report {
            for (key, value) in &report.properties {
                tracing::debug!(key = %key, "applying restored system property");
                std::env::set_var(key, value);
            }
        }

        // After-restore sweep runs unconditionally: resources that
        // speculatively closed handles get to reopen them even when the
        // checkpoint failed.
        let mut restore_agg = SweepError::new();
        if let Err(err) = self.context.restore() {
            restore_agg.fold(err);
        }

        // Replacement entry point, if the engine selected one.
        if let Some(report) = &report {
            if let Some(spec) = &report.entry_point {
                self.invoke_entry_point(spec.name.as_str(), spec.args.clone(), &mut restore_agg);
            }
        }

        // The attempt's claim table must not leak into the next attempt.
        *self.claims.lock().unwrap_or_else(|e| e.into_inner()) = None;
        drop(keepalive_tx);
        if let Ok(handle) = keepalive {
            let _ = handle.join();
        }

        self.conclude(checkpoint_agg, restore_agg)
    }

    fn invoke_entry_point(&self, name: &str, args: Vec<String>, restore_agg: &mut SweepError) {
        let entry_points = self.entry_points.lock().unwrap_or_else(|e| e.into_inner());
        match entry_points.get(name) {
            Some(entry) => {
                tracing::info!(entry_point = name, "invoking restored entry point");
                if let Err(err) = entry(args) {
                    restore_agg.fold(err);
                }
            }
            None => {
                restore_agg.push(FailureCause::resource(format!(
                    "unknown entry point: {}",
                    name
                )));
            }
        }
    }

    /// Exactly one of the two aggregates may surface. When the checkpoint
    /// phase failed, restore-phase failures merge into the same
    /// checkpoint aggregate as additional causes.
    fn conclude(&self, mut checkpoint_agg: SweepError, restore_agg: SweepError) -> CracResult<()> {
        if !checkpoint_agg.is_empty() {
            if !restore_agg.is_empty() {
                checkpoint_agg.fold(restore_agg);
            }
            let err = CheckpointError::new(checkpoint_agg.into_causes());
            tracing::warn!(causes = err.causes().len(), "attempt failed at checkpoint");
            return Err(err.into());
        }
        if !restore_agg.is_empty() {
            let err = RestoreError::new(restore_agg.into_causes());
            tracing::warn!(causes = err.causes().len(), "attempt failed at restore");
            return Err(err.into());
        }
        tracing::info!("checkpoint/restore attempt completed");
        Ok(())
    }
}
