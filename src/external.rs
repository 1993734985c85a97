use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::error::{CatalogError, Result};

pub const FFMPEG_ENV_VAR: &str = "VDJ_FFMPEG_PATH";
pub const PROBE_TIMEOUT_SECS: u64 = 5;

/// Process-scoped handle on external binaries.
///
/// Each tool is probed at most once per handle; share it behind an `Arc`
/// so every worker sees the same verification.
#[derive(Debug)]
pub struct ExternalTools {
    ffmpeg: String,
    ffmpeg_check: OnceCell<std::result::Result<String, String>>,
    probes: AtomicUsize,
}

impl ExternalTools {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffmpeg_check: OnceCell::new(),
            probes: AtomicUsize::new(0),
        }
    }

    /// `$VDJ_FFMPEG_PATH`, falling back to `ffmpeg` on `PATH`.
    pub fn from_env() -> Self {
        let path = std::env::var(FFMPEG_ENV_VAR)
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "ffmpeg".to_string());
        Self::new(path)
    }

    pub fn ffmpeg_path(&self) -> &str {
        &self.ffmpeg
    }

    /// Verified ffmpeg path. The first call runs `ffmpeg -version`;
    /// concurrent callers wait for that one probe.
    pub async fn ffmpeg(&self) -> Result<&str> {
        let check = self
            .ffmpeg_check
            .get_or_init(|| async {
                self.probes.fetch_add(1, Ordering::SeqCst);
                let outcome = probe_version(&self.ffmpeg, &["-version"], Duration::from_secs(PROBE_TIMEOUT_SECS)).await;
                match &outcome {
                    Ok(version) => tracing::info!(path = %self.ffmpeg, %version, "ffmpeg verified"),
                    Err(e) => tracing::warn!(path = %self.ffmpeg, error = %e, "ffmpeg unavailable"),
                }
                outcome
            })
            .await;
        match check {
            Ok(_) => Ok(&self.ffmpeg),
            Err(e) => Err(CatalogError::ExternalToolFailure(e.clone())),
        }
    }

    pub fn ffmpeg_version(&self) -> Option<&str> {
        self.ffmpeg_check.get()?.as_ref().ok().map(String::as_str)
    }

    /// How many times a probe subprocess was started.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

/// Run `path args...` and return its first non-empty stdout line.
/// The child is killed if it outlives `timeout`.
pub(crate) async fn probe_version(
    path: &str,
    args: &[&str],
    timeout: Duration,
) -> std::result::Result<String, String> {
    let child = Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start {path}: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| format!("{path}: {e}"))?,
        Err(_) => return Err(format!("{path} timed out after {}ms", timeout.as_millis())),
    };
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(format!("{path} exited with {}: {stderr}", output.status));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("{path} printed no version"))
}
