//! Per-attempt tracking of claimed OS handles.
//!
//! During the before-checkpoint sweep, resources claim the file
//! descriptors they are responsible for. Whether an open handle is
//! actually a problem is judged later, at coordinator-assembly time, via
//! a deferred failure supplier: a handle on the configured image path is
//! claimed early but judged harmless, and an early generic claim may be
//! overridden by a more specific owner before judgement.

use std::os::fd::RawFd;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::FailureCause;

/// Deferred judgement for a claimed handle. Returns `None` when the open
/// handle is harmless, or the failure to report when it is not.
pub type FailureSupplier = Arc<dyn Fn() -> Option<FailureCause> + Send + Sync>;

/// Wrapper a resource keeps for each OS handle it claims.
///
/// The tracker holds it weakly: dropping the wrapper (from the owning
/// resource's disposal path) prunes the claim automatically. The wrapper
/// observes the fd, it does not own or close it.
#[derive(Debug)]
pub struct FdHandle {
    fd: RawFd,
}

impl FdHandle {
    pub fn new(fd: RawFd) -> Arc<Self> {
        Arc::new(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

/// Who currently claims a handle. The variants form an explicit,
/// documented specificity order; a more specific claimer overrides a more
/// generic one, never the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimer {
    /// No information about the owner.
    Unknown,
    /// A bare file descriptor of unknown purpose.
    FileDescriptor,
    /// A regular file.
    File,
    /// A network socket.
    Socket,
    /// A pipe end.
    Pipe,
    /// An archive opened through a file (overrides the plain file claim
    /// for the same fd).
    Archive,
    /// A listening endpoint layered over a socket.
    Listener,
}

impl Claimer {
    /// Specificity rank. Unknown < FileDescriptor < File/Socket/Pipe <
    /// Archive/Listener.
    const fn rank(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::FileDescriptor => 1,
            Self::File | Self::Socket | Self::Pipe => 2,
            Self::Archive | Self::Listener => 3,
        }
    }

    /// Whether a claim by `self` replaces an existing claim by `other`.
    ///
    /// True for a re-claim by the same claimer (idempotent, the latest
    /// supplier wins) and for a strictly more specific claimer. Distinct
    /// claimers of equal rank never override each other.
    pub fn overrides(self, other: Claimer) -> bool {
        self == other || self.rank() > other.rank()
    }
}

struct Claim {
    claimer: Claimer,
    handle: Weak<FdHandle>,
    supplier: FailureSupplier,
}

/// The claim table for one checkpoint attempt.
///
/// Created empty when an attempt starts, published process-wide for the
/// duration of the sweep, and discarded when the attempt concludes. Never
/// carries state between attempts.
#[derive(Default)]
pub struct ClaimedFds {
    claims: DashMap<RawFd, Claim>,
}

impl ClaimedFds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim for the handle.
    ///
    /// Kept only if the fd is unclaimed, or the existing claim is one the
    /// new claimer overrides (see [`Claimer::overrides`]). A losing claim
    /// is dropped silently; the earlier, more specific owner keeps the
    /// judgement.
    pub fn claim<F>(&self, handle: &Arc<FdHandle>, claimer: Claimer, supplier: F)
    where
        F: Fn() -> Option<FailureCause> + Send + Sync + 'static,
    {
        let fd = handle.fd();
        let claim = Claim {
            claimer,
            handle: Arc::downgrade(handle),
            supplier: Arc::new(supplier),
        };

        match self.claims.entry(fd) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get().claimer;
                if claimer.overrides(existing) {
                    tracing::trace!(fd, ?existing, new = ?claimer, "claim overridden");
                    entry.insert(claim);
                } else {
                    tracing::trace!(fd, ?existing, rejected = ?claimer, "claim kept");
                }
            }
            Entry::Vacant(entry) => {
                tracing::trace!(fd, ?claimer, "handle claimed");
                entry.insert(claim);
            }
        }
    }

    /// Number of recorded claims, stale entries included.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// The (fd, failure-supplier) pairs for every handle still open at
    /// this moment.
    ///
    /// Entries whose wrapper was dropped, or whose fd no longer answers
    /// `fcntl(F_GETFD)`, are pruned and excluded. Suppliers are returned
    /// uninvoked; the coordinator invokes each exactly once at assembly
    /// time.
    pub fn snapshot(&self) -> Vec<(RawFd, FailureSupplier)> {
        let mut stale = Vec::new();
        let mut open = Vec::new();

        for entry in self.claims.iter() {
            let fd = *entry.key();
            if entry.value().handle.strong_count() == 0 {
                stale.push(fd);
                continue;
            }
            if !fd_is_open(fd) {
                tracing::trace!(fd, "claimed fd closed in the interim");
                continue;
            }
            open.push((fd, Arc::clone(&entry.value().supplier)));
        }

        for fd in stale {
            self.claims.remove(&fd);
        }

        open.sort_by_key(|(fd, _)| *fd);
        open
    }
}

fn fd_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD neither reads nor writes through the descriptor;
    // a closed fd just yields EBADF.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}
