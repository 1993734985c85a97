use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::process::Command;
use tokio::time::{Duration, timeout};

use crate::checkpoint::TaskType;
use crate::document::{FieldUpdate, RecordField};
use crate::engine::{RecordOutcome, RecordTask};
use crate::error::{CatalogError, Result};
use crate::external::ExternalTools;

pub const DEFAULT_TARGET_LUFS: f64 = -14.0;
pub const MEASURE_TIMEOUT_SECS: u64 = 120;

/// Raw `loudnorm` first-pass statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnormStats {
    pub input_i: f64,
    pub input_tp: f64,
    pub input_lra: f64,
    pub input_thresh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoudnessMeasurement {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub lra: f64,
    pub threshold: f64,
    pub target_lufs: f64,
    /// `target - integrated`, rounded to 0.01 dB.
    pub gain_db: f64,
}

impl LoudnessMeasurement {
    pub fn from_stats(stats: LoudnormStats, target_lufs: f64) -> Self {
        Self {
            integrated_lufs: stats.input_i,
            true_peak_dbtp: stats.input_tp,
            lra: stats.input_lra,
            threshold: stats.input_thresh,
            target_lufs,
            gain_db: round_to(target_lufs - stats.input_i, 2),
        }
    }

    /// VirtualDJ `Scan Volume`: linear multiplier where 1.0 is unchanged.
    pub fn vdj_volume(&self) -> f64 {
        round_to(10f64.powf(self.gain_db / 20.0), 4)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Pull the loudnorm JSON block out of ffmpeg's stderr.
pub fn parse_loudnorm_stats(stderr: &str) -> Result<LoudnormStats> {
    let search_from = stderr.rfind("Parsed_loudnorm").unwrap_or(0);
    let tail = &stderr[search_from..];
    let block = tail
        .find('{')
        .and_then(|open| tail[open..].find('}').map(|close| &tail[open..open + close + 1]))
        .ok_or_else(|| CatalogError::ExternalToolFailure("no loudnorm JSON in ffmpeg output".into()))?;
    let data: BTreeMap<String, Value> = serde_json::from_str(block)
        .map_err(|e| CatalogError::ExternalToolFailure(format!("unreadable loudnorm JSON: {e}")))?;

    let field = |name: &str| -> Result<f64> {
        let value = data
            .get(name)
            .ok_or_else(|| CatalogError::ExternalToolFailure(format!("loudnorm output lacks {name}")))?;
        let parsed = match value {
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };
        parsed.ok_or_else(|| CatalogError::ExternalToolFailure(format!("loudnorm {name} is not a number: {value}")))
    };

    let stats = LoudnormStats {
        input_i: field("input_i")?,
        input_tp: field("input_tp")?,
        input_lra: field("input_lra")?,
        input_thresh: field("input_thresh")?,
    };
    if !stats.input_i.is_finite() {
        return Err(CatalogError::RecordComputeFailure(
            "integrated loudness is not finite (silent audio?)".into(),
        ));
    }
    Ok(stats)
}

/// ffmpeg `loudnorm` measurement against a LUFS target.
#[derive(Debug, Clone)]
pub struct LoudnessMeasurer {
    tools: Arc<ExternalTools>,
    target_lufs: f64,
    timeout: Duration,
}

impl LoudnessMeasurer {
    pub fn new(tools: Arc<ExternalTools>, target_lufs: f64) -> Self {
        Self {
            tools,
            target_lufs,
            timeout: Duration::from_secs(MEASURE_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target_lufs(&self) -> f64 {
        self.target_lufs
    }

    pub async fn measure(&self, path: &str) -> Result<LoudnessMeasurement> {
        if !Path::new(path).exists() {
            return Err(CatalogError::RecordComputeFailure(format!("file not found: {path}")));
        }
        let ffmpeg = self.tools.ffmpeg().await?;
        let filter = format!(
            "loudnorm=I={}:TP=-1.5:LRA=11:print_format=json",
            self.target_lufs
        );
        let mut command = Command::new(ffmpeg);
        command.args(["-hide_banner", "-nostats", "-i", path, "-af", &filter, "-f", "null", "-"]);
        command.kill_on_drop(true);

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                CatalogError::ExternalToolFailure(format!(
                    "loudness measurement timed out after {}s for '{path}'",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| CatalogError::ExternalToolFailure(format!("failed to start ffmpeg: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let last_line = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty());
            return Err(CatalogError::ExternalToolFailure(format!(
                "ffmpeg failed for '{path}': {}",
                last_line.unwrap_or("(no stderr output)")
            )));
        }
        let stats = parse_loudnorm_stats(&stderr)?;
        Ok(LoudnessMeasurement::from_stats(stats, self.target_lufs))
    }
}

/// Engine task measuring loudness; in normalize mode it also writes
/// the matching `Scan Volume` back to the catalog.
pub struct LoudnessTask {
    measurer: LoudnessMeasurer,
    apply_volume: bool,
}

impl LoudnessTask {
    pub fn measure(measurer: LoudnessMeasurer) -> Self {
        Self {
            measurer,
            apply_volume: false,
        }
    }

    pub fn normalize(measurer: LoudnessMeasurer) -> Self {
        Self {
            measurer,
            apply_volume: true,
        }
    }

    fn outcome(&self, measurement: &LoudnessMeasurement) -> Result<RecordOutcome> {
        let outcome = RecordOutcome::result(serde_json::to_value(measurement)?);
        if self.apply_volume {
            let update = FieldUpdate::new().set(RecordField::Volume, measurement.vdj_volume());
            return Ok(outcome.with_mutation(update));
        }
        Ok(outcome)
    }
}

impl RecordTask for LoudnessTask {
    fn task_type(&self) -> TaskType {
        if self.apply_volume {
            TaskType::Normalize
        } else {
            TaskType::Measure
        }
    }

    fn cache_namespace(&self) -> Option<String> {
        Some(format!("loudness:{}", self.measurer.target_lufs))
    }

    fn config(&self) -> BTreeMap<String, Value> {
        BTreeMap::from([
            ("target_lufs".to_string(), json!(self.measurer.target_lufs)),
            ("apply_volume".to_string(), json!(self.apply_volume)),
        ])
    }

    async fn compute(&self, key: String) -> Result<RecordOutcome> {
        let measurement = self.measurer.measure(&key).await?;
        self.outcome(&measurement)
    }

    fn from_cached(&self, _key: &str, cached: Value) -> Result<RecordOutcome> {
        let measurement: LoudnessMeasurement = serde_json::from_value(cached)?;
        self.outcome(&measurement)
    }
}
