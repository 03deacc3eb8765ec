//! crac-demo
//!
//! Minimal embedding of the coordination engine: registers a log-file
//! resource that consults the configured policy across the checkpoint
//! boundary, then drives one checkpoint/restore attempt against the CRIU
//! engine.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;

use crac_core::{
    CheckpointEngine, Claimer, Coordinator, FailureCause, FdHandle, FilePolicy, HandleKind,
    PolicyAction, PolicyLookup, Resource, StrictPolicy, SweepError, DEFAULT_PRIORITY,
};
use crac_criu::{CriuEngine, KEY_IMAGE_DIR, METRICS_EXTENSION};

/// crac-demo - drive one checkpoint/restore attempt
#[derive(Parser)]
#[command(name = "crac-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory for CRIU image files
    #[arg(short, long, default_value = "/tmp/crac-images")]
    image_dir: String,

    /// Optional YAML policy file for open-handle decisions
    #[arg(short, long)]
    policy: Option<PathBuf>,

    /// Log file the demo resource keeps open across the boundary
    #[arg(short, long, default_value = "/tmp/crac-demo.log")]
    log_file: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// A resource holding an open log file. Before a checkpoint it asks the
/// policy what to do with the handle; after a restore it reopens the
/// file, possibly at a replacement path from the policy params.
struct LogFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
    handle: Mutex<Option<Arc<FdHandle>>>,
    /// Set only by a `WarnCloseReopen` decision; a silently closed
    /// handle stays closed after restore.
    reopen: AtomicBool,
    policy: Arc<dyn PolicyLookup>,
}

impl LogFile {
    fn open(path: PathBuf, policy: Arc<dyn PolicyLookup>) -> Result<Arc<Self>, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Arc::new(Self {
            path,
            file: Mutex::new(Some(file)),
            handle: Mutex::new(None),
            reopen: AtomicBool::new(false),
            policy,
        }))
    }
}

impl Resource for LogFile {
    fn before_checkpoint(&self) -> Result<(), SweepError> {
        let subject = self.path.display().to_string();
        let decision = self.policy.find(false, HandleKind::File, &subject);
        tracing::info!(path = %subject, action = ?decision.action, "policy decision");

        match decision.action {
            PolicyAction::Error => {
                let guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(file) = guard.as_ref() {
                    let claims = Coordinator::global()
                        .and_then(|c| c.claimed_fds())
                        .ok_or_else(|| SweepError::msg("no attempt in progress"))?;
                    let handle = FdHandle::new(file.as_raw_fd());
                    let path = self.path.clone();
                    claims.claim(&handle, Claimer::File, move || {
                        Some(FailureCause::OpenFile { path: path.clone() })
                    });
                    *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                }
                Ok(())
            }
            PolicyAction::Close | PolicyAction::WarnCloseReopen => {
                let reopen = decision.action == PolicyAction::WarnCloseReopen;
                if reopen {
                    tracing::warn!(path = %subject, "closing open file for checkpoint");
                }
                self.reopen.store(reopen, Ordering::SeqCst);
                *self.file.lock().unwrap_or_else(|e| e.into_inner()) = None;
                Ok(())
            }
            PolicyAction::Ignore => Ok(()),
        }
    }

    fn after_restore(&self) -> Result<(), SweepError> {
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }
        if !self.reopen.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let subject = self.path.display().to_string();
        let decision = self.policy.find(true, HandleKind::File, &subject);
        let reopen_path = decision
            .params
            .get("reopen_path")
            .map(PathBuf::from)
            .unwrap_or_else(|| self.path.clone());

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&reopen_path)
            .map_err(|e| SweepError::msg(format!("reopen {}: {}", reopen_path.display(), e)))?;
        tracing::info!(path = %reopen_path.display(), "log file reopened");
        *guard = Some(file);
        Ok(())
    }
}


fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let policy: Arc<dyn PolicyLookup> = match &cli.policy {
        Some(path) => Arc::new(FilePolicy::load_file(path)?),
        None => Arc::new(StrictPolicy),
    };

    let mut engine = CriuEngine::new();
    engine.configure(KEY_IMAGE_DIR, &cli.image_dir)?;
    let coordinator = Coordinator::init_global(Box::new(engine));

    let log_file = LogFile::open(cli.log_file.clone(), Arc::clone(&policy))?;
    coordinator
        .context()
        .register(&log_file, DEFAULT_PRIORITY)?;

    match coordinator.perform_checkpoint_restore() {
        Ok(()) => tracing::info!("restored successfully"),
        Err(err) => {
            tracing::error!(error = %err, "attempt failed");
            std::process::exit(1);
        }
    }

    if let Some(metrics) = coordinator
        .engine()
        .extension(METRICS_EXTENSION)
        .and_then(|ext| ext.as_any().downcast_ref::<crac_criu::ImageMetrics>())
    {
        for (name, value) in metrics.snapshot() {
            tracing::info!(metric = %name, value, "image metric");
        }
    }

    Ok(())
}
