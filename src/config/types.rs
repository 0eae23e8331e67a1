/// Core types shared by the governance components
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::safety::sanitizer::{EngineName, OutputFormat, ScratchPath};

/// Kind of heavy job the pipeline runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Format conversion through the transcoder tool
    Transcode,
    /// Source separation through the separation engine
    Separate,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Transcode => "transcode",
            JobKind::Separate => "separate",
        }
    }

    /// Advisory peak-memory multiplier applied to the input size
    pub fn memory_multiplier(self) -> u64 {
        match self {
            JobKind::Transcode => 2,
            JobKind::Separate => 4,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of stems a separation engine can produce
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stem {
    Vocals,
    Drums,
    Bass,
    Other,
}

impl Stem {
    pub const ALL: [Stem; 4] = [Stem::Vocals, Stem::Drums, Stem::Bass, Stem::Other];

    pub fn as_str(self) -> &'static str {
        match self {
            Stem::Vocals => "vocals",
            Stem::Drums => "drums",
            Stem::Bass => "bass",
            Stem::Other => "other",
        }
    }

    /// Exact, case-sensitive lookup
    pub fn parse(name: &str) -> Option<Self> {
        Stem::ALL.into_iter().find(|stem| stem.as_str() == name)
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of host and process memory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub process_rss_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

impl MemorySnapshot {
    /// Headroom left under `ceiling` after the process's own RSS
    pub fn available_budget(&self, ceiling: u64) -> u64 {
        ceiling.saturating_sub(self.process_rss_bytes)
    }
}

/// A fully validated job. Every parameter that can reach a subprocess
/// argument is already one of the sanitizer's newtypes.
#[derive(Clone, Debug)]
pub struct JobRequest {
    job_id: String,
    kind: JobKind,
    declared_input_size_bytes: u64,
    engine_name: Option<EngineName>,
    output_format: OutputFormat,
    stem_selection: Vec<Stem>,
    scratch_input_path: ScratchPath,
    scratch_output_dir: ScratchPath,
}

impl JobRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: impl Into<String>,
        kind: JobKind,
        declared_input_size_bytes: u64,
        engine_name: Option<EngineName>,
        output_format: OutputFormat,
        stem_selection: Vec<Stem>,
        scratch_input_path: ScratchPath,
        scratch_output_dir: ScratchPath,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            declared_input_size_bytes,
            engine_name,
            output_format,
            stem_selection,
            scratch_input_path,
            scratch_output_dir,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn declared_input_size_bytes(&self) -> u64 {
        self.declared_input_size_bytes
    }

    pub fn engine_name(&self) -> Option<&EngineName> {
        self.engine_name.as_ref()
    }

    pub fn output_format(&self) -> &OutputFormat {
        &self.output_format
    }

    /// Requested stems; empty means all of them
    pub fn stem_selection(&self) -> &[Stem] {
        &self.stem_selection
    }

    pub fn scratch_input_path(&self) -> &ScratchPath {
        &self.scratch_input_path
    }

    pub fn scratch_output_dir(&self) -> &ScratchPath {
        &self.scratch_output_dir
    }
}

/// Role of a scratch artifact, which decides when it is deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Ingested upload; deleted as soon as the job ends
    Input,
    /// Tool working directory; deleted as soon as the job ends
    Work,
    /// Result handed to the caller; kept until handoff or ttl expiry
    Output,
}

/// A temporary file or directory owned by exactly one job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScratchArtifact {
    pub path: PathBuf,
    pub owner_job_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: ArtifactKind,
    pub ttl: Duration,
}

impl ScratchArtifact {
    pub fn new(
        path: impl Into<PathBuf>,
        owner_job_id: &str,
        kind: ArtifactKind,
        ttl: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            owner_job_id: owner_job_id.to_string(),
            created_at: Utc::now(),
            kind,
            ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - self.created_at >= ttl,
            // ttl too large to represent never expires
            Err(_) => false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Evidence of the termination escalation applied to a child
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// How a supervised process ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Exited { code: i32 },
    Signaled { signal: i32 },
    MemoryExceeded { rss_bytes: u64, ceiling_bytes: u64 },
    Timeout { limit: Duration },
    Cancelled,
    MemoryUnknown,
}

/// Result of one supervised run, returned for every spawned child
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessResult {
    pub pid: u32,
    pub program: String,
    pub outcome: ProcessOutcome,
    pub wall_time: Duration,
    pub peak_rss_bytes: u64,
    pub stderr_excerpt: String,
    pub kill_report: Option<KillReport>,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.outcome == ProcessOutcome::Exited { code: 0 }
    }

    /// Map the outcome onto the job error taxonomy
    pub fn into_job_result(self) -> Result<ProcessResult> {
        match self.outcome {
            ProcessOutcome::Exited { code: 0 } => Ok(self),
            ProcessOutcome::Exited { code } => Err(JobError::ProcessingFailed {
                exit_code: Some(code),
                signal: None,
                stderr_excerpt: self.stderr_excerpt,
            }),
            ProcessOutcome::Signaled { signal } => Err(JobError::ProcessingFailed {
                exit_code: None,
                signal: Some(signal),
                stderr_excerpt: self.stderr_excerpt,
            }),
            ProcessOutcome::MemoryExceeded {
                rss_bytes,
                ceiling_bytes,
            } => Err(JobError::MemoryExceeded {
                rss_bytes,
                ceiling_bytes,
            }),
            ProcessOutcome::Timeout { limit } => Err(JobError::Timeout(limit)),
            ProcessOutcome::Cancelled => Err(JobError::Cancelled),
            ProcessOutcome::MemoryUnknown => Err(JobError::MemoryUnknown(format!(
                "memory of pid {} could not be read",
                self.pid
            ))),
        }
    }
}

/// Successful job result handed back to the caller
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub kind: JobKind,
    /// Output label (stem name, or "audio" for transcodes) to scratch path
    pub outputs: BTreeMap<String, PathBuf>,
    pub processing_time: Duration,
    pub peak_rss_bytes: u64,
}

/// Error taxonomy for every job-facing operation
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Input exceeds {limit} bytes (received at least {received})")]
    InputTooLarge { limit: u64, received: u64 },

    #[error("Input stream was empty")]
    EmptyInput,

    #[error("Input is not a recognized audio container")]
    InvalidAudio,

    #[error("Engine rejected: {0:?}")]
    EngineRejected(String),

    #[error("Output format rejected: {0:?}")]
    FormatRejected(String),

    #[error("Stem selection rejected: {0:?}")]
    StemRejected(String),

    #[error("Path rejected: {0}")]
    PathRejected(String),

    #[error("No capacity available: {0}")]
    CapacityUnavailable(String),

    #[error("Memory state unknown: {0}")]
    MemoryUnknown(String),

    #[error("Processing failed (exit code {exit_code:?}, signal {signal:?}): {stderr_excerpt}")]
    ProcessingFailed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("Memory ceiling exceeded: {rss_bytes} bytes > {ceiling_bytes} bytes")]
    MemoryExceeded { rss_bytes: u64, ceiling_bytes: u64 },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    #[error("Job cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobError {
    /// Stable snake_case reason string for front ends
    pub fn code(&self) -> &'static str {
        match self {
            JobError::InputTooLarge { .. } => "input_too_large",
            JobError::EmptyInput => "empty_input",
            JobError::InvalidAudio => "invalid_audio",
            JobError::EngineRejected(_) => "engine_rejected",
            JobError::FormatRejected(_) => "format_rejected",
            JobError::StemRejected(_) => "stem_rejected",
            JobError::PathRejected(_) => "path_rejected",
            JobError::CapacityUnavailable(_) => "capacity_unavailable",
            JobError::MemoryUnknown(_) => "memory_unknown",
            JobError::ProcessingFailed { .. } => "processing_failed",
            JobError::MemoryExceeded { .. } => "memory_exceeded",
            JobError::Timeout(_) => "timeout",
            JobError::SpawnFailed { .. } => "spawn_failed",
            JobError::Cancelled => "cancelled",
            JobError::Io(_) => "io",
            JobError::Config(_) => "config",
        }
    }

    /// Transient capacity conditions worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::CapacityUnavailable(_) | JobError::MemoryUnknown(_)
        )
    }

    /// Rejections raised before anything is spawned
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            JobError::InputTooLarge { .. }
                | JobError::EmptyInput
                | JobError::InvalidAudio
                | JobError::EngineRejected(_)
                | JobError::FormatRejected(_)
                | JobError::StemRejected(_)
                | JobError::PathRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
