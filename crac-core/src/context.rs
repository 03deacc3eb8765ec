//! The resource registry and its notification sweeps.
//!
//! A [`Context`] holds weakly-referenced resources in insertion order and
//! notifies them across the checkpoint boundary: reverse-insertion order
//! before a checkpoint (last registered, first notified), exact reverse of
//! the realized checkpoint order after a restore. One resource failing
//! never stops a sweep; failures are folded into a single aggregate.

use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::error::{RegistrationError, SweepError};
use crate::gate::BlockingGate;
use crate::resource::{RegistrationMode, Resource};

struct Registered {
    order: u64,
    resource: Weak<dyn Resource>,
}

/// State of an in-progress checkpoint sweep.
struct Sweep {
    /// The thread driving the sweep. Registration from this thread on a
    /// blocking registry must fail fast instead of self-deadlocking.
    thread: ThreadId,
    /// Resources in the order actually notified, including critical-mode
    /// late arrivals. Becomes the restore snapshot.
    executed: Vec<Weak<dyn Resource>>,
    /// Failures folded in so far, including those from critical-mode
    /// late arrivals notified on foreign threads.
    aggregate: SweepError,
}

struct Inner {
    next_order: u64,
    resources: Vec<Registered>,
    sweep: Option<Sweep>,
    /// Realized checkpoint order, remembered for the paired restore
    /// sweep. Consumed exactly once.
    restore_snapshot: Option<Vec<Weak<dyn Resource>>>,
}

/// An insertion-ordered registry of checkpoint/restore resources.
///
/// Long-lived: created once and registered into a parent registry (a
/// `Context` is itself a [`Resource`], so registries nest). Resources are
/// held weakly - dropping the owning `Arc` unregisters automatically.
pub struct Context {
    mode: RegistrationMode,
    gate: BlockingGate,
    inner: Mutex<Inner>,
}

impl Context {
    /// A registry with the default blocking registration mode.
    pub fn new() -> Self {
        Self::with_mode(RegistrationMode::Blocking)
    }

    /// A registry that admits and immediately notifies resources arriving
    /// mid-sweep.
    pub fn new_critical() -> Self {
        Self::with_mode(RegistrationMode::Critical)
    }

    pub fn with_mode(mode: RegistrationMode) -> Self {
        Self {
            mode,
            gate: BlockingGate::new(),
            inner: Mutex::new(Inner {
                next_order: 0,
                resources: Vec::new(),
                sweep: None,
                restore_snapshot: None,
            }),
        }
    }

    /// A registry wrapped in an Arc for sharing across threads.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a resource.
    ///
    /// On a blocking registry, a call that arrives while a sweep is in
    /// progress parks until the attempt reaches its restore phase, so the
    /// registrant cannot be half-missed. A call from the sweep thread
    /// itself returns [`RegistrationError::WouldDeadlock`].
    ///
    /// On a critical registry, a mid-sweep registrant is admitted and
    /// given its checkpoint notification on the spot; a failure from that
    /// notification lands in the in-flight aggregate, not in this return
    /// value.
    pub fn register<R: Resource + 'static>(
        &self,
        resource: &Arc<R>,
    ) -> Result<(), RegistrationError> {
        let weak = Arc::downgrade(resource);
        let weak: Weak<dyn Resource> = weak;

        match self.mode {
            RegistrationMode::Blocking => {
                {
                    let inner = self.lock();
                    if let Some(sweep) = &inner.sweep {
                        if sweep.thread == thread::current().id() {
                            return Err(RegistrationError::WouldDeadlock);
                        }
                    }
                }
                self.gate.pass();
                let mut inner = self.lock();
                let order = inner.next_order;
                inner.next_order += 1;
                inner.resources.push(Registered {
                    order,
                    resource: weak,
                });
                Ok(())
            }
            RegistrationMode::Critical => {
                let notify_now = {
                    let mut inner = self.lock();
                    let order = inner.next_order;
                    inner.next_order += 1;
                    inner.resources.push(Registered {
                        order,
                        resource: weak.clone(),
                    });
                    // Reserve the restore slot under the same lock that
                    // observes the sweep as active: the sweep may conclude
                    // while the notification below is still running, and
                    // the registrant must not fall out of the snapshot.
                    match inner.sweep.as_mut() {
                        Some(sweep) => {
                            sweep.executed.push(weak);
                            true
                        }
                        None => false,
                    }
                };
                if notify_now {
                    tracing::debug!("late registrant notified synchronously mid-sweep");
                    if let Err(err) = resource.before_checkpoint() {
                        tracing::warn!(error = %err, "late registrant failed checkpoint notification");
                        let mut inner = self.lock();
                        if let Some(sweep) = inner.sweep.as_mut() {
                            sweep.aggregate.fold(err);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Number of currently live registered resources.
    pub fn len(&self) -> usize {
        self.lock()
            .resources
            .iter()
            .filter(|r| r.resource.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the before-checkpoint sweep.
    ///
    /// Notifies every currently registered resource in reverse insertion
    /// order, remembers the realized order for the paired restore sweep,
    /// and closes the registration gate until that restore sweep begins.
    pub fn checkpoint(&self) -> Result<(), SweepError> {
        let snapshot: Vec<Arc<dyn Resource>> = {
            let mut inner = self.lock();
            if inner.sweep.is_some() {
                return Err(SweepError::msg("checkpoint sweep already in progress"));
            }
            // Prune entries whose owner dropped them.
            inner.resources.retain(|r| r.resource.strong_count() > 0);
            debug_assert!(inner.resources.windows(2).all(|w| w[0].order < w[1].order));

            let snapshot: Vec<Arc<dyn Resource>> = inner
                .resources
                .iter()
                .rev()
                .filter_map(|r| r.resource.upgrade())
                .collect();

            inner.sweep = Some(Sweep {
                thread: thread::current().id(),
                executed: Vec::with_capacity(snapshot.len()),
                aggregate: SweepError::new(),
            });
            self.gate.close();
            snapshot
        };

        tracing::debug!(resources = snapshot.len(), "checkpoint sweep started");

        for resource in &snapshot {
            // Record before notifying: a critical-mode registrant admitted
            // during this notification must land after its notifier in the
            // realized order, or the restore replay comes out wrong.
            {
                let mut inner = self.lock();
                if let Some(sweep) = inner.sweep.as_mut() {
                    sweep.executed.push(Arc::downgrade(resource));
                }
            }
            if let Err(err) = resource.before_checkpoint() {
                tracing::warn!(error = %err, "resource failed checkpoint notification");
                let mut inner = self.lock();
                if let Some(sweep) = inner.sweep.as_mut() {
                    sweep.aggregate.fold(err);
                }
            }
        }

        let (executed, aggregate) = {
            let mut inner = self.lock();
            match inner.sweep.take() {
                Some(sweep) => {
                    inner.restore_snapshot = Some(sweep.executed.clone());
                    (sweep.executed, sweep.aggregate)
                }
                None => (Vec::new(), SweepError::new()),
            }
        };

        tracing::debug!(
            notified = executed.len(),
            failures = aggregate.causes().len(),
            "checkpoint sweep finished"
        );

        if aggregate.is_empty() {
            Ok(())
        } else {
            Err(aggregate)
        }
    }

    /// Run the after-restore sweep.
    ///
    /// Reopens the registration gate, then replays the remembered
    /// checkpoint order in exact reverse. The snapshot is consumed: a
    /// second call without an intervening checkpoint is a no-op.
    pub fn restore(&self) -> Result<(), SweepError> {
        let snapshot = {
            let mut inner = self.lock();
            self.gate.open();
            inner.restore_snapshot.take()
        };

        let Some(snapshot) = snapshot else {
            tracing::trace!("restore sweep skipped: no pending checkpoint snapshot");
            return Ok(());
        };

        tracing::debug!(resources = snapshot.len(), "restore sweep started");

        let mut aggregate = SweepError::new();
        for weak in snapshot.iter().rev() {
            let Some(resource) = weak.upgrade() else {
                tracing::trace!("resource dropped between checkpoint and restore");
                continue;
            };
            if let Err(err) = resource.after_restore() {
                tracing::warn!(error = %err, "resource failed restore notification");
                aggregate.fold(err);
            }
        }

        tracing::debug!(failures = aggregate.causes().len(), "restore sweep finished");

        if aggregate.is_empty() {
            Ok(())
        } else {
            Err(aggregate)
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry nests into a parent registry as an ordinary resource. A
/// failed nested sweep still leaves the nested registry in the parent's
/// restore snapshot, so its own resources get their restore notifications.
impl Resource for Context {
    fn before_checkpoint(&self) -> Result<(), SweepError> {
        Context::checkpoint(self)
    }

    fn after_restore(&self) -> Result<(), SweepError> {
        Context::restore(self)
    }
}

#[cfg(test)]
pub(crate) mod probe {
    //! Shared test double: a resource that records every notification in
    //! an order log and can be scripted to fail either phase.

    use std::sync::{Arc, Mutex};

    use crate::error::SweepError;
    use crate::resource::Resource;

    pub type OrderLog = Arc<Mutex<Vec<String>>>;

    pub struct Probe {
        pub name: &'static str,
        pub log: OrderLog,
        pub fail_checkpoint: Option<&'static str>,
        pub fail_restore: Option<&'static str>,
    }

    impl Probe {
        pub fn new(name: &'static str, log: &OrderLog) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: Arc::clone(log),
                fail_checkpoint: None,
                fail_restore: None,
            })
        }

        pub fn failing_checkpoint(
            name: &'static str,
            log: &OrderLog,
            message: &'static str,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: Arc::clone(log),
                fail_checkpoint: Some(message),
                fail_restore: None,
            })
        }
    }

    impl Resource for Probe {
        fn before_checkpoint(&self) -> Result<(), SweepError> {
            self.log.lock().unwrap().push(format!("cp:{}", self.name));
            match self.fail_checkpoint {
                Some(message) => Err(SweepError::msg(message)),
                None => Ok(()),
            }
        }

        fn after_restore(&self) -> Result<(), SweepError> {
            self.log.lock().unwrap().push(format!("rs:{}", self.name));
            match self.fail_restore {
                Some(message) => Err(SweepError::msg(message)),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::probe::{OrderLog, Probe};
    use super::*;
    use crate::error::FailureCause;

    fn new_log() -> OrderLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(log: &OrderLog) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn test_checkpoint_reverses_registration_order() {
        let log = new_log();
        let ctx = Context::new();
        let a = Probe::new("a", &log);
        let b = Probe::new("b", &log);
        let c = Probe::new("c", &log);
        ctx.register(&a).unwrap();
        ctx.register(&b).unwrap();
        ctx.register(&c).unwrap();

        ctx.checkpoint().unwrap();
        ctx.restore().unwrap();

        assert_eq!(
            entries(&log),
            vec!["cp:c", "cp:b", "cp:a", "rs:a", "rs:b", "rs:c"]
        );
    }

    #[test]
    fn test_failure_does_not_stop_sweep() {
        let log = new_log();
        let ctx = Context::new();
        let a = Probe::new("a", &log);
        let b = Probe::failing_checkpoint("b", &log, "busy");
        let c = Probe::new("c", &log);
        ctx.register(&a).unwrap();
        ctx.register(&b).unwrap();
        ctx.register(&c).unwrap();

        let err = ctx.checkpoint().unwrap_err();
        assert_eq!(err.causes(), &[FailureCause::resource("busy")]);
        assert_eq!(entries(&log), vec!["cp:c", "cp:b", "cp:a"]);

        // Every checkpoint-notified resource gets a restore notification,
        // the failed one included.
        ctx.restore().unwrap();
        assert_eq!(
            entries(&log),
            vec!["cp:c", "cp:b", "cp:a", "rs:a", "rs:b", "rs:c"]
        );
    }

    #[test]
    fn test_restore_snapshot_consumed_once() {
        let log = new_log();
        let ctx = Context::new();
        let a = Probe::new("a", &log);
        ctx.register(&a).unwrap();

        ctx.checkpoint().unwrap();
        ctx.restore().unwrap();
        ctx.restore().unwrap();

        assert_eq!(entries(&log), vec!["cp:a", "rs:a"]);
    }

    #[test]
    fn test_restore_without_checkpoint_is_noop() {
        let ctx = Context::new();
        assert!(ctx.restore().is_ok());
    }

    #[test]
    fn test_dropped_resource_is_pruned() {
        let log = new_log();
        let ctx = Context::new();
        let a = Probe::new("a", &log);
        let b = Probe::new("b", &log);
        ctx.register(&a).unwrap();
        ctx.register(&b).unwrap();
        assert_eq!(ctx.len(), 2);

        drop(b);
        assert_eq!(ctx.len(), 1);

        ctx.checkpoint().unwrap();
        ctx.restore().unwrap();
        assert_eq!(entries(&log), vec!["cp:a", "rs:a"]);
    }

    #[test]
    fn test_nested_registry_failure_is_flattened() {
        let log = new_log();
        let parent = Context::new();
        let child = Arc::new(Context::new());
        let a = Probe::failing_checkpoint("a", &log, "inner a");
        let b = Probe::failing_checkpoint("b", &log, "inner b");
        child.register(&a).unwrap();
        child.register(&b).unwrap();
        parent.register(&child).unwrap();

        let err = parent.checkpoint().unwrap_err();
        // Two leaves, no aggregate-of-aggregates.
        assert_eq!(err.causes().len(), 2);
        assert_eq!(
            err.causes(),
            &[
                FailureCause::resource("inner b"),
                FailureCause::resource("inner a"),
            ]
        );

        // The nested registry still restores its own resources.
        parent.restore().unwrap();
        assert!(entries(&log).contains(&"rs:a".to_string()));
        assert!(entries(&log).contains(&"rs:b".to_string()));
    }

    #[test]
    fn test_register_from_sweep_thread_fails_fast() {
        struct SelfRegistering {
            ctx: Mutex<Option<Arc<Context>>>,
            outcome: Mutex<Option<Result<(), RegistrationError>>>,
        }

        impl Resource for SelfRegistering {
            fn before_checkpoint(&self) -> Result<(), SweepError> {
                let ctx = self.ctx.lock().unwrap().clone().unwrap();
                let late = Arc::new(Noop);
                *self.outcome.lock().unwrap() = Some(ctx.register(&late));
                Ok(())
            }

            fn after_restore(&self) -> Result<(), SweepError> {
                Ok(())
            }
        }

        struct Noop;
        impl Resource for Noop {
            fn before_checkpoint(&self) -> Result<(), SweepError> {
                Ok(())
            }
            fn after_restore(&self) -> Result<(), SweepError> {
                Ok(())
            }
        }

        let ctx = Arc::new(Context::new());
        let resource = Arc::new(SelfRegistering {
            ctx: Mutex::new(Some(Arc::clone(&ctx))),
            outcome: Mutex::new(None),
        });
        ctx.register(&resource).unwrap();

        ctx.checkpoint().unwrap();
        assert_eq!(
            resource.outcome.lock().unwrap().clone(),
            Some(Err(RegistrationError::WouldDeadlock))
        );
    }

    #[test]
    fn test_critical_registration_mid_sweep_is_notified_and_restored() {
        struct LateSpawner {
            ctx: Mutex<Option<Arc<Context>>>,
            late: Mutex<Option<Arc<Probe>>>,
            log: OrderLog,
        }

        impl Resource for LateSpawner {
            fn before_checkpoint(&self) -> Result<(), SweepError> {
                self.log.lock().unwrap().push("cp:spawner".to_string());
                let ctx = self.ctx.lock().unwrap().clone().unwrap();
                let late = Probe::failing_checkpoint("late", &self.log, "late busy");
                ctx.register(&late).unwrap();
                *self.late.lock().unwrap() = Some(late);
                Ok(())
            }

            fn after_restore(&self) -> Result<(), SweepError> {
                self.log.lock().unwrap().push("rs:spawner".to_string());
                Ok(())
            }
        }

        let log = new_log();
        let ctx = Arc::new(Context::new_critical());
        let spawner = Arc::new(LateSpawner {
            ctx: Mutex::new(Some(Arc::clone(&ctx))),
            late: Mutex::new(None),
            log: Arc::clone(&log),
        });
        ctx.register(&spawner).unwrap();

        // The late registrant's failure lands in the sweep aggregate.
        let err = ctx.checkpoint().unwrap_err();
        assert_eq!(err.causes(), &[FailureCause::resource("late busy")]);
        assert_eq!(entries(&log), vec!["cp:spawner", "cp:late"]);

        // Restore is the exact reverse of the realized order.
        ctx.restore().unwrap();
        assert_eq!(
            entries(&log),
            vec!["cp:spawner", "cp:late", "rs:late", "rs:spawner"]
        );
    }

    #[test]
    fn test_critical_registration_racing_sweep_end_is_restored() {
        use std::sync::mpsc::{channel, Receiver, Sender};
        use std::thread;

        // Notifies, signals, then parks until released, so the test can
        // hold a registrant inside its checkpoint notification while the
        // sweep that admitted it concludes.
        struct Signalling {
            name: &'static str,
            log: OrderLog,
            notify: Sender<()>,
            wait: Mutex<Receiver<()>>,
        }

        impl Resource for Signalling {
            fn before_checkpoint(&self) -> Result<(), SweepError> {
                self.log.lock().unwrap().push(format!("cp:{}", self.name));
                self.notify.send(()).ok();
                self.wait.lock().unwrap().recv().ok();
                Ok(())
            }

            fn after_restore(&self) -> Result<(), SweepError> {
                self.log.lock().unwrap().push(format!("rs:{}", self.name));
                Ok(())
            }
        }

        let log = new_log();
        let ctx = Arc::new(Context::new_critical());

        let (start_tx, start_rx) = channel();
        let (ack_tx, ack_rx) = channel();
        let (release_tx, release_rx) = channel();

        // The spawner resumes once the late registrant is mid-notification.
        let spawner = Arc::new(Signalling {
            name: "spawner",
            log: Arc::clone(&log),
            notify: start_tx,
            wait: Mutex::new(ack_rx),
        });
        ctx.register(&spawner).unwrap();

        let handle = {
            let ctx = Arc::clone(&ctx);
            let log = Arc::clone(&log);
            thread::spawn(move || {
                start_rx.recv().unwrap();
                let late = Arc::new(Signalling {
                    name: "late",
                    log,
                    notify: ack_tx,
                    wait: Mutex::new(release_rx),
                });
                ctx.register(&late).unwrap();
                late
            })
        };

        // The sweep concludes while the late registrant is still inside
        // its checkpoint notification on the foreign thread.
        ctx.checkpoint().unwrap();
        release_tx.send(()).unwrap();
        let _late = handle.join().unwrap();

        // Every checkpoint-notified resource gets its restore
        // notification, in exact reverse of the realized order.
        ctx.restore().unwrap();
        assert_eq!(
            entries(&log),
            vec!["cp:spawner", "cp:late", "rs:late", "rs:spawner"]
        );
    }

    #[test]
    fn test_blocking_registration_parks_until_restore() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::thread;
        use std::time::Duration;

        struct Slow;
        impl Resource for Slow {
            fn before_checkpoint(&self) -> Result<(), SweepError> {
                thread::sleep(Duration::from_millis(80));
                Ok(())
            }
            fn after_restore(&self) -> Result<(), SweepError> {
                Ok(())
            }
        }

        let ctx = Arc::new(Context::new());
        let slow = Arc::new(Slow);
        ctx.register(&slow).unwrap();

        let registered = Arc::new(AtomicBool::new(false));
        let handle = {
            let ctx = Arc::clone(&ctx);
            let registered = Arc::clone(&registered);
            thread::spawn(move || {
                // Give the sweep a head start.
                thread::sleep(Duration::from_millis(20));
                let late = Arc::new(Slow);
                ctx.register(&late).unwrap();
                registered.store(true, Ordering::SeqCst);
                late
            })
        };

        ctx.checkpoint().unwrap();
        // Gate stays closed until the restore sweep begins.
        thread::sleep(Duration::from_millis(30));
        assert!(!registered.load(Ordering::SeqCst));

        ctx.restore().unwrap();
        handle.join().unwrap();
        assert!(registered.load(Ordering::SeqCst));
    }
}
