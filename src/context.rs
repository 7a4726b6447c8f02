//! Shared execution context for a single ETL run
//!
//! The context owns all mutable run state: phase lifecycle, progress
//! counters, memory samples, the bounded error list, per-phase checkpoint
//! metadata, and the raw/transformed data buffers that exist between phases
//! of a non-streaming run. It is created once per task and passed by
//! reference into every phase component.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sysinfo::{Pid, System};
use uuid::Uuid;

use crate::config::{DatabaseConfig, PipelineConfig};
use crate::error::{Error, Result};
use crate::models::{RawExport, TransformedExport};

/// Version stamp written into every checkpoint envelope
pub const CHECKPOINT_VERSION: &str = "1.0";

/// Maximum retained error records; older entries are elided beyond this
const MAX_ERRORS: usize = 1000;

/// Pipeline phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Transform,
    Load,
    Streaming,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Extract => write!(f, "extract"),
            Phase::Transform => write!(f, "transform"),
            Phase::Load => write!(f, "load"),
            Phase::Streaming => write!(f, "streaming"),
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Phase::Extract),
            "transform" => Ok(Phase::Transform),
            "load" => Ok(Phase::Load),
            "streaming" => Ok(Phase::Streaming),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Outcome of a completed phase
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseResult {
    pub duration_seconds: f64,
    pub processed_conversations: u64,
    pub processed_messages: u64,
    pub messages_per_second: f64,
}

/// Checkpoint metadata recorded when a phase completes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCheckpoint {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub raw_data_available: bool,
    #[serde(default)]
    pub transformed_data_available: bool,
}

/// One recorded error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: Phase,
    pub message: String,
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

/// One resident-set sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub memory_mb: f64,
}

/// Run-wide metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub memory_samples: Vec<MemorySample>,
    /// Wall-clock phase start times, keyed by phase name
    #[serde(default)]
    pub phase_started: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub conversation_count: u64,
    #[serde(default)]
    pub bytes_read: u64,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            start_time: Utc::now(),
            memory_samples: Vec::new(),
            phase_started: BTreeMap::new(),
            conversation_count: 0,
            bytes_read: 0,
        }
    }
}

/// Shared execution state for one ETL task
#[derive(Debug, Clone)]
pub struct EtlContext {
    pub task_id: String,
    pub db_config: DatabaseConfig,
    pub config: PipelineConfig,

    /// Original input path, when the input came from the filesystem
    pub file_path: Option<String>,
    pub user_display_name: Option<String>,

    pub current_phase: Option<Phase>,
    pub phase_results: BTreeMap<String, PhaseResult>,
    pub checkpoints: BTreeMap<String, PhaseCheckpoint>,
    pub errors: Vec<ErrorRecord>,
    pub metrics: RunMetrics,

    /// Present only between extract and load of a non-streaming run
    pub raw_data: Option<RawExport>,
    pub transformed_data: Option<TransformedExport>,

    /// Archive id once registration has happened
    pub export_id: Option<i64>,

    // Progress counters for the active phase
    progress_conversations: u64,
    progress_messages: u64,

    /// Unknown checkpoint fields, preserved across re-serialization
    extra: Map<String, Value>,
}

impl EtlContext {
    pub fn new(db_config: DatabaseConfig, config: PipelineConfig, task_id: Option<String>) -> Self {
        Self {
            task_id: task_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            db_config,
            config,
            file_path: None,
            user_display_name: None,
            current_phase: None,
            phase_results: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            errors: Vec::new(),
            metrics: RunMetrics::default(),
            raw_data: None,
            transformed_data: None,
            export_id: None,
            progress_conversations: 0,
            progress_messages: 0,
            extra: Map::new(),
        }
    }

    /// Begin a phase. Fails if another phase is still active.
    pub fn start_phase(&mut self, phase: Phase, totals: Option<(u64, u64)>) -> Result<()> {
        if let Some(active) = self.current_phase {
            return Err(Error::InvalidState(format!(
                "cannot start phase {} while {} is active",
                phase, active
            )));
        }

        self.current_phase = Some(phase);
        self.progress_conversations = 0;
        self.progress_messages = 0;
        self.metrics
            .phase_started
            .insert(phase.to_string(), Utc::now());

        if let Some((conversations, messages)) = totals {
            tracing::info!(
                phase = %phase,
                total_conversations = conversations,
                total_messages = messages,
                "Phase started"
            );
        } else {
            tracing::info!(phase = %phase, "Phase started");
        }

        Ok(())
    }

    /// Record progress within the active phase.
    pub fn update_progress(&mut self, conversations: u64, messages: u64) {
        self.progress_conversations += conversations;
        self.progress_messages += messages;
    }

    /// Finish the active phase and record its result.
    pub fn end_phase(&mut self) -> Result<PhaseResult> {
        let phase = self.current_phase.ok_or_else(|| {
            Error::InvalidState("end_phase called with no active phase".to_string())
        })?;

        let started = self
            .metrics
            .phase_started
            .get(&phase.to_string())
            .copied()
            .unwrap_or_else(Utc::now);
        let duration_seconds =
            (Utc::now() - started).num_milliseconds().max(0) as f64 / 1000.0;

        let messages_per_second = if duration_seconds > 0.0 {
            self.progress_messages as f64 / duration_seconds
        } else {
            0.0
        };

        let result = PhaseResult {
            duration_seconds,
            processed_conversations: self.progress_conversations,
            processed_messages: self.progress_messages,
            messages_per_second,
        };

        tracing::info!(
            phase = %phase,
            duration_seconds,
            conversations = result.processed_conversations,
            messages = result.processed_messages,
            "Phase completed"
        );

        self.phase_results.insert(phase.to_string(), result.clone());
        self.current_phase = None;

        Ok(result)
    }

    /// Append an error record. Never fails; fatal handling is the
    /// orchestrator's decision.
    pub fn record_error(&mut self, phase: Phase, error: &Error, fatal: bool) {
        if self.errors.len() >= MAX_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(ErrorRecord {
            phase,
            message: error.to_string(),
            fatal,
            timestamp: Utc::now(),
        });
    }

    /// Sample the process resident set and warn above 80% of the limit.
    ///
    /// Advisory only. Callers that need a hard bound should run the
    /// streaming pipeline instead.
    pub fn check_memory(&mut self) {
        let memory_mb = match current_rss_mb() {
            Some(mb) => mb,
            None => {
                tracing::debug!("Process memory information unavailable");
                return;
            }
        };

        self.metrics.memory_samples.push(MemorySample {
            timestamp: Utc::now(),
            memory_mb,
        });

        let threshold = 0.8 * self.config.memory_limit_mb as f64;
        if memory_mb > threshold {
            tracing::warn!(
                memory_mb,
                limit_mb = self.config.memory_limit_mb,
                "Memory usage above 80% of configured limit"
            );
        }
    }

    /// Record checkpoint metadata for a completed phase.
    pub fn create_checkpoint(&mut self, phase: Phase) {
        self.checkpoints.insert(
            phase.to_string(),
            PhaseCheckpoint {
                timestamp: Utc::now(),
                raw_data_available: self.raw_data.is_some(),
                transformed_data_available: self.transformed_data.is_some(),
            },
        );
    }

    /// Whether the run can resume at `phase`: every phase strictly before it
    /// must have a checkpoint, and the checkpoint producing the artifact
    /// `phase` consumes must carry it.
    pub fn can_resume_from(&self, phase: Phase) -> bool {
        let required: &[Phase] = match phase {
            Phase::Extract | Phase::Streaming => &[],
            Phase::Transform => &[Phase::Extract],
            Phase::Load => &[Phase::Extract, Phase::Transform],
        };

        for earlier in required {
            let checkpoint = match self.checkpoints.get(&earlier.to_string()) {
                Some(c) => c,
                None => return false,
            };
            let artifact_ok = match (phase, *earlier) {
                (Phase::Transform, Phase::Extract) => checkpoint.raw_data_available,
                (Phase::Load, Phase::Transform) => checkpoint.transformed_data_available,
                _ => true,
            };
            if !artifact_ok {
                return false;
            }
        }

        true
    }

    /// Total recorded errors marked fatal.
    pub fn fatal_error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.fatal).count()
    }

    /// Serialize the context into a versioned checkpoint document.
    ///
    /// Only the allowlisted attributes below are written. Unknown fields
    /// read from an older or newer checkpoint are carried in `extra` and
    /// written back here, so re-serialization never drops them.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut context = self.extra.clone();

        context.insert("task_id".into(), Value::String(self.task_id.clone()));
        // Credentials never land in checkpoints; resumption re-reads them
        // from the environment or from the caller's override.
        let mut db_config = self.db_config.clone();
        db_config.password = String::new();
        context.insert("db_config".into(), serde_json::to_value(&db_config)?);
        context.insert("config".into(), serde_json::to_value(&self.config)?);
        context.insert("file_path".into(), serde_json::to_value(&self.file_path)?);
        context.insert(
            "user_display_name".into(),
            serde_json::to_value(&self.user_display_name)?,
        );
        context.insert(
            "current_phase".into(),
            serde_json::to_value(self.current_phase)?,
        );
        context.insert(
            "phase_results".into(),
            serde_json::to_value(&self.phase_results)?,
        );
        context.insert(
            "checkpoints".into(),
            serde_json::to_value(&self.checkpoints)?,
        );
        context.insert("errors".into(), serde_json::to_value(&self.errors)?);
        context.insert("metrics".into(), serde_json::to_value(&self.metrics)?);
        context.insert("raw_data".into(), serde_json::to_value(&self.raw_data)?);
        context.insert(
            "transformed_data".into(),
            serde_json::to_value(&self.transformed_data)?,
        );
        context.insert("export_id".into(), serde_json::to_value(self.export_id)?);

        let envelope = serde_json::json!({
            "checkpoint_version": CHECKPOINT_VERSION,
            "serialized_at": Utc::now(),
            "context": Value::Object(context),
        });

        Ok(serde_json::to_vec_pretty(&envelope)?)
    }

    /// Reconstruct a context from a checkpoint document.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let envelope: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::Checkpoint(format!("invalid checkpoint JSON: {e}")))?;

        let version = envelope
            .get("checkpoint_version")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Checkpoint("missing checkpoint_version".to_string()))?;
        if version != CHECKPOINT_VERSION {
            return Err(Error::Checkpoint(format!(
                "unsupported checkpoint version: {version}"
            )));
        }

        let mut context = match envelope.get("context") {
            Some(Value::Object(map)) => map.clone(),
            _ => return Err(Error::Checkpoint("missing context object".to_string())),
        };

        fn take<T: for<'de> Deserialize<'de>>(
            map: &mut Map<String, Value>,
            key: &str,
        ) -> Result<Option<T>> {
            match map.remove(key) {
                None | Some(Value::Null) => Ok(None),
                Some(value) => {
                    let parsed = serde_json::from_value(value).map_err(|e| {
                        Error::Checkpoint(format!("invalid checkpoint field '{key}': {e}"))
                    })?;
                    Ok(Some(parsed))
                }
            }
        }

        let task_id: String = take(&mut context, "task_id")?
            .ok_or_else(|| Error::Checkpoint("checkpoint has no task_id".to_string()))?;
        let db_config: DatabaseConfig = take(&mut context, "db_config")?.unwrap_or_default();
        let config: PipelineConfig = take(&mut context, "config")?.unwrap_or_default();

        Ok(Self {
            task_id,
            db_config,
            config,
            file_path: take(&mut context, "file_path")?,
            user_display_name: take(&mut context, "user_display_name")?,
            current_phase: take(&mut context, "current_phase")?,
            phase_results: take(&mut context, "phase_results")?.unwrap_or_default(),
            checkpoints: take(&mut context, "checkpoints")?.unwrap_or_default(),
            errors: take(&mut context, "errors")?.unwrap_or_default(),
            metrics: take(&mut context, "metrics")?.unwrap_or_default(),
            raw_data: take(&mut context, "raw_data")?,
            transformed_data: take(&mut context, "transformed_data")?,
            export_id: take(&mut context, "export_id")?,
            progress_conversations: 0,
            progress_messages: 0,
            extra: context,
        })
    }
}

/// Condensed outcome of a run, built from the context's recorded state
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub export_id: Option<i64>,
    pub task_id: String,
    pub total_duration_seconds: f64,
    pub phases: BTreeMap<String, PhaseResult>,
    pub conversation_count: u64,
    pub message_count: u64,
    pub error_count: usize,
    pub errors: Vec<ErrorRecord>,
}

impl EtlContext {
    /// Summarize the run as recorded so far.
    pub fn summary(&self, success: bool) -> RunSummary {
        let totals = ["load", "streaming"]
            .iter()
            .find_map(|phase| self.phase_results.get(*phase))
            .or_else(|| self.phase_results.get("transform"));

        RunSummary {
            success,
            export_id: self.export_id,
            task_id: self.task_id.clone(),
            total_duration_seconds: (Utc::now() - self.metrics.start_time)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0,
            phases: self.phase_results.clone(),
            conversation_count: totals.map(|t| t.processed_conversations).unwrap_or(0),
            message_count: totals.map(|t| t.processed_messages).unwrap_or(0),
            error_count: self.errors.len(),
            errors: self.errors.clone(),
        }
    }
}

/// Resident set size of the current process in megabytes.
fn current_rss_mb() -> Option<f64> {
    use sysinfo::ProcessesToUpdate;

    let mut sys = System::new();
    let pid = Pid::from(std::process::id() as usize);
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);

    let process = sys.process(pid)?;
    Some(process.memory() as f64 / (1024.0 * 1024.0))
}
