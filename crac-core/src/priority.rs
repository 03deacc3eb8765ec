//! Priority-bucketed registry: a registry of registries.
//!
//! Resources are grouped into ordered priority buckets. A checkpoint
//! sweep walks buckets in ascending priority order, finishing each
//! bucket's full sweep before moving on; restore walks the realized
//! bucket order in exact reverse. Buckets created concurrently at a
//! strictly greater priority than the one being processed are picked up
//! within the same attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{RegistrationError, SweepError};
use crate::resource::Resource;

/// Ordering tier for a priority bucket. Compared with a total order;
/// lower values are checkpoint-notified first and restore-notified last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i64);

impl Priority {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Priority {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

struct PrioritySweep {
    /// Highest priority already processed or currently being processed.
    /// Registration at or below this is rejected for the attempt.
    current: Option<Priority>,
    /// Buckets in the order actually swept. Becomes the restore snapshot.
    visited: Vec<(Priority, Arc<Context>)>,
}

struct Inner {
    buckets: BTreeMap<Priority, Arc<Context>>,
    sweep: Option<PrioritySweep>,
    restore_snapshot: Option<Vec<(Priority, Arc<Context>)>>,
}

/// An ordered map from priority to sub-registry.
///
/// Like [`Context`], a `PriorityContext` is long-lived and itself a
/// [`Resource`], so it nests into a parent registry.
pub struct PriorityContext {
    inner: Mutex<Inner>,
}

impl PriorityContext {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                buckets: BTreeMap::new(),
                sweep: None,
                restore_snapshot: None,
            }),
        }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a resource at the given priority, creating the bucket on
    /// first use.
    ///
    /// During an in-progress checkpoint sweep, registration at a priority
    /// the sweep has already reached returns
    /// [`RegistrationError::PriorityClosed`]: the registrant would never
    /// be notified for this attempt, so silently accepting it would be a
    /// bug at the call site. Registration at a strictly greater priority
    /// is legal and picked up later in the same sweep.
    pub fn register<R: Resource + 'static>(
        &self,
        resource: &Arc<R>,
        priority: impl Into<Priority>,
    ) -> Result<(), RegistrationError> {
        let priority = priority.into();
        let bucket = {
            let mut inner = self.lock();
            if let Some(sweep) = &inner.sweep {
                if let Some(current) = sweep.current {
                    if priority <= current {
                        return Err(RegistrationError::PriorityClosed {
                            priority: priority.value(),
                        });
                    }
                }
            }
            Arc::clone(
                inner
                    .buckets
                    .entry(priority)
                    .or_insert_with(|| Arc::new(Context::new())),
            )
        };
        bucket.register(resource)
    }

    /// Number of priority buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.lock().buckets.len()
    }

    /// Sweep buckets in ascending priority order.
    ///
    /// Buckets added at a strictly greater priority while the sweep runs
    /// are found and processed before the sweep completes.
    pub fn checkpoint(&self) -> Result<(), SweepError> {
        {
            let mut inner = self.lock();
            if inner.sweep.is_some() {
                return Err(SweepError::msg("priority sweep already in progress"));
            }
            inner.sweep = Some(PrioritySweep {
                current: None,
                visited: Vec::new(),
            });
        }

        let mut aggregate = SweepError::new();
        loop {
            let next = {
                let mut inner = self.lock();
                let processed = inner
                    .sweep
                    .as_ref()
                    .and_then(|s| s.current)
                    .map(|p| p.value());
                let next = inner
                    .buckets
                    .iter()
                    .find(|(p, _)| processed.is_none_or(|done| p.value() > done))
                    .map(|(p, bucket)| (*p, Arc::clone(bucket)));
                if let (Some((priority, _)), Some(sweep)) = (&next, inner.sweep.as_mut()) {
                    sweep.current = Some(*priority);
                }
                next
            };

            let Some((priority, bucket)) = next else {
                break;
            };

            tracing::debug!(priority = priority.value(), "sweeping priority bucket");
            if let Err(err) = bucket.checkpoint() {
                aggregate.fold(err);
            }

            let mut inner = self.lock();
            if let Some(sweep) = inner.sweep.as_mut() {
                sweep.visited.push((priority, bucket));
            }
        }

        {
            let mut inner = self.lock();
            if let Some(sweep) = inner.sweep.take() {
                inner.restore_snapshot = Some(sweep.visited);
            }
        }

        if aggregate.is_empty() {
            Ok(())
        } else {
            Err(aggregate)
        }
    }

    /// Restore buckets in the exact reverse of the realized sweep order,
    /// delegating per-bucket restore to [`Context::restore`]. Consumed
    /// once; a second call without an intervening checkpoint is a no-op.
    pub fn restore(&self) -> Result<(), SweepError> {
        let snapshot = self.lock().restore_snapshot.take();
        let Some(snapshot) = snapshot else {
            return Ok(());
        };

        let mut aggregate = SweepError::new();
        for (priority, bucket) in snapshot.iter().rev() {
            tracing::debug!(priority = priority.value(), "restoring priority bucket");
            if let Err(err) = bucket.restore() {
                aggregate.fold(err);
            }
        }

        if aggregate.is_empty() {
            Ok(())
        } else {
            Err(aggregate)
        }
    }
}

impl Default for PriorityContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Resource for PriorityContext {
    fn before_checkpoint(&self) -> Result<(), SweepError> {
        PriorityContext::checkpoint(self)
    }

    fn after_restore(&self) -> Result<(), SweepError> {
        PriorityContext::restore(self)
    }
}
