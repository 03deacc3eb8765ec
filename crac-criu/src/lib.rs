//! CRIU-backed checkpoint engine.
//!
//! Implements the [`CheckpointEngine`] contract by shelling out to the
//! CRIU binary: the coordination core decides *when* an image may be
//! taken, this crate performs the actual capture. Failure output from
//! CRIU is translated back into the core's failure categories so open
//! files and sockets surface as typed causes rather than raw stderr.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Instant;

use crac_core::{
    CheckpointEngine, CheckpointOutcome, CheckpointRequest, EngineError, EngineExtension,
    EngineFailure, FailureCategory, RestoreReport,
};

/// Engine configuration keys understood by [`CriuEngine::configure`].
pub const KEY_IMAGE_DIR: &str = "image_dir";
pub const KEY_CRIU_PATH: &str = "criu_path";
pub const KEY_SHELL_JOB: &str = "shell_job";
pub const KEY_TCP_ESTABLISHED: &str = "tcp_established";

const CONFIG_KEYS: &[&str] = &[
    KEY_IMAGE_DIR,
    KEY_CRIU_PATH,
    KEY_SHELL_JOB,
    KEY_TCP_ESTABLISHED,
];

/// Extension name under which [`ImageMetrics`] is discoverable.
pub const METRICS_EXTENSION: &str = "image-metrics";

/// Named capability recording free-form numeric facts about the captured
/// image (dump duration, image size). Discover it via
/// `engine.extension(METRICS_EXTENSION)` and downcast.
#[derive(Default)]
pub struct ImageMetrics {
    values: Mutex<Vec<(String, i64)>>,
}

impl ImageMetrics {
    pub fn record(&self, name: impl Into<String>, value: i64) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), value));
    }

    pub fn snapshot(&self) -> Vec<(String, i64)> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EngineExtension for ImageMetrics {
    fn name(&self) -> &'static str {
        METRICS_EXTENSION
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Checkpoint engine that drives the CRIU binary.
pub struct CriuEngine {
    criu_path: Option<PathBuf>,
    image_dir: Option<PathBuf>,
    shell_job: bool,
    tcp_established: bool,
    metrics: ImageMetrics,
}

impl CriuEngine {
    /// An engine with CRIU discovered on well-known paths. The image
    /// directory must still be configured before the engine reports
    /// itself usable.
    pub fn new() -> Self {
        Self {
            criu_path: find_criu(),
            image_dir: None,
            shell_job: true,
            tcp_established: false,
            metrics: ImageMetrics::default(),
        }
    }

    /// An engine with an explicit CRIU binary and image directory.
    pub fn with_paths(criu_path: impl Into<PathBuf>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            criu_path: Some(criu_path.into()),
            image_dir: Some(image_dir.into()),
            shell_job: true,
            tcp_established: false,
            metrics: ImageMetrics::default(),
        }
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, EngineError> {
        match value {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(EngineError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
                reason: "expected a boolean".to_string(),
            }),
        }
    }

    fn dump(&self, criu: &Path, image_dir: &Path) -> CheckpointOutcome {
        if let Err(err) = std::fs::create_dir_all(image_dir) {
            return CheckpointOutcome::Failed(vec![EngineFailure::new(
                FailureCategory::Generic,
                format!("cannot create image dir {}: {}", image_dir.display(), err),
            )]);
        }

        let pid = std::process::id();
        tracing::debug!(pid, image_dir = %image_dir.display(), "starting criu dump");
        let start = Instant::now();

        let mut command = Command::new(criu);
        command
            .arg("dump")
            .arg("-t")
            .arg(pid.to_string())
            .arg("-D")
            .arg(image_dir)
            .arg("--leave-running");
        if self.shell_job {
            command.arg("--shell-job");
        }
        if self.tcp_established {
            command.arg("--tcp-established");
        }

        let output = match command.output() {
            Ok(output) => output,
            Err(err) => {
                return CheckpointOutcome::Failed(vec![EngineFailure::new(
                    FailureCategory::Generic,
                    format!("failed to execute criu: {}", err),
                )]);
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as i64;
        self.metrics.record("dump_ms", elapsed_ms);

        if output.status.success() {
            tracing::info!(pid, elapsed_ms, "criu dump completed");
            CheckpointOutcome::Restored(RestoreReport::default())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(pid, elapsed_ms, "criu dump failed");
            CheckpointOutcome::Failed(translate_stderr(&stderr))
        }
    }
}

impl Default for CriuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CheckpointEngine for CriuEngine {
    fn is_configured(&self) -> bool {
        match (&self.criu_path, &self.image_dir) {
            (Some(criu), Some(_)) => criu.exists(),
            _ => false,
        }
    }

    fn can_configure(&self, key: &str) -> bool {
        CONFIG_KEYS.contains(&key)
    }

    fn configure(&mut self, key: &str, value: &str) -> Result<(), EngineError> {
        match key {
            KEY_IMAGE_DIR => {
                self.image_dir = Some(PathBuf::from(value));
                Ok(())
            }
            KEY_CRIU_PATH => {
                self.criu_path = Some(PathBuf::from(value));
                Ok(())
            }
            KEY_SHELL_JOB => {
                self.shell_job = Self::parse_bool(key, value)?;
                Ok(())
            }
            KEY_TCP_ESTABLISHED => {
                self.tcp_established = Self::parse_bool(key, value)?;
                Ok(())
            }
            _ => Err(EngineError::UnknownKey {
                key: key.to_string(),
            }),
        }
    }

    fn checkpoint(&self, request: &CheckpointRequest) -> CheckpointOutcome {
        let (Some(criu), Some(image_dir)) = (&self.criu_path, &self.image_dir) else {
            return CheckpointOutcome::NotConfigured;
        };

        if !request.open_fds.is_empty() {
            tracing::warn!(
                fds = ?request.open_fds,
                "problematic handles still open at engine invocation"
            );
        }

        if request.dry_run {
            // The attempt already carries failures; validate only.
            tracing::debug!("dry run: image capture skipped");
            return CheckpointOutcome::Failed(Vec::new());
        }

        self.dump(criu, image_dir)
    }

    fn extension(&self, name: &str) -> Option<&dyn EngineExtension> {
        if name == METRICS_EXTENSION {
            Some(&self.metrics)
        } else {
            None
        }
    }
}

/// Locate the CRIU binary on well-known paths, falling back to `which`.
fn find_criu() -> Option<PathBuf> {
    let candidates = [
        "/usr/sbin/criu",
        "/usr/bin/criu",
        "/sbin/criu",
        "/bin/criu",
        "/usr/local/sbin/criu",
        "/usr/local/bin/criu",
    ];

    for path in candidates {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    if let Ok(output) = Command::new("which").arg("criu").output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
    }

    None
}

/// Map CRIU's stderr onto the core failure categories. CRIU names the
/// offending object in its error lines; files, sockets and pipes get
/// their own category, everything else is reported once, generically.
fn translate_stderr(stderr: &str) -> Vec<EngineFailure> {
    let mut failures = Vec::new();
    for line in stderr.lines() {
        let line = line.trim();
        if !line.starts_with("Error") {
            continue;
        }
        let lower = line.to_ascii_lowercase();
        if lower.contains("socket") {
            failures.push(EngineFailure::new(FailureCategory::OpenSocket, line));
        } else if lower.contains("pipe") || lower.contains("fifo") {
            failures.push(EngineFailure::new(FailureCategory::OpenPipe, line));
        } else if lower.contains("file") || lower.contains("fd ") {
            failures.push(EngineFailure::new(FailureCategory::OpenFile, line));
        } else {
            failures.push(EngineFailure::new(FailureCategory::Generic, line));
        }
    }

    if failures.is_empty() {
        let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join("; ");
        failures.push(EngineFailure::new(
            FailureCategory::Generic,
            format!("criu dump failed: {}", tail),
        ));
    }
    failures
}
