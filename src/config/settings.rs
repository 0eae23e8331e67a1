//! Governor configuration: one explicit object injected into every component
use crate::config::types::{JobError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Full config.json structure. Missing keys fall back to defaults.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Root under which every per-job scratch directory lives
    pub scratch_root: PathBuf,
    pub max_concurrent_operations: usize,
    /// Admission ceiling for reserved estimates plus our own RSS
    pub memory_ceiling_bytes: u64,
    /// Per-child ceiling enforced by the supervisor
    pub process_memory_ceiling_bytes: u64,
    /// RLIMIT_AS applied to each child before exec; `None` leaves it unlimited
    pub process_address_space_bytes: Option<u64>,
    pub warning_threshold_bytes: u64,
    pub max_upload_bytes: u64,
    pub ingest_chunk_bytes: usize,
    /// Reject uploads whose header is not a known audio container
    pub verify_audio_headers: bool,
    pub job_timeout_secs: u64,
    /// Timeout for each per-stem conversion after separation
    pub transcode_timeout_secs: u64,
    pub admission_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub kill_grace_ms: u64,
    pub stderr_excerpt_bytes: usize,
    pub deny_on_unknown_memory: bool,
    pub scratch_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub allowed_engines: Vec<String>,
    pub allowed_formats: Vec<String>,
    pub default_engine: String,
    pub default_format: String,
    /// Program plus fixed leading arguments of the separation engine
    pub separator_command: Vec<String>,
    /// Program plus fixed leading arguments of the transcoder
    pub transcoder_command: Vec<String>,
    /// Environment variables copied into the child's otherwise empty env
    pub env_passthrough: Vec<String>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            max_concurrent_operations: 3,
            memory_ceiling_bytes: 2048 * MIB,
            process_memory_ceiling_bytes: 1024 * MIB,
            process_address_space_bytes: None,
            warning_threshold_bytes: 1536 * MIB,
            max_upload_bytes: 100 * MIB,
            ingest_chunk_bytes: 8192,
            verify_audio_headers: true,
            job_timeout_secs: 30 * 60,
            transcode_timeout_secs: 5 * 60,
            admission_wait_ms: 30_000,
            poll_interval_ms: 250,
            kill_grace_ms: 2_000,
            stderr_excerpt_bytes: 4096,
            deny_on_unknown_memory: true,
            scratch_ttl_secs: 48 * 3600,
            sweep_interval_secs: 24 * 3600,
            allowed_engines: strings(&["htdemucs", "htdemucs_ft", "mdx_extra", "mdx_extra_q"]),
            allowed_formats: strings(&["mp3", "wav", "flac", "m4a", "aac", "opus"]),
            default_engine: "htdemucs".to_string(),
            default_format: "mp3".to_string(),
            separator_command: strings(&["python3", "-m", "demucs.separate"]),
            transcoder_command: strings(&["ffmpeg"]),
            env_passthrough: strings(&["PATH", "HOME", "LANG", "TMPDIR"]),
        }
    }
}

impl GovernorConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| JobError::Config(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| JobError::Config(format!("Failed to parse config JSON: {}", e)))
    }

    /// Apply `STEMBOX_*` environment overrides on top of the loaded values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(root) = std::env::var_os("STEMBOX_SCRATCH_ROOT") {
            self.scratch_root = PathBuf::from(root);
        }
        override_parsed("STEMBOX_MAX_CONCURRENT_OPERATIONS", &mut self.max_concurrent_operations)?;
        override_parsed("STEMBOX_MEMORY_CEILING_BYTES", &mut self.memory_ceiling_bytes)?;
        override_parsed(
            "STEMBOX_PROCESS_MEMORY_CEILING_BYTES",
            &mut self.process_memory_ceiling_bytes,
        )?;
        override_optional(
            "STEMBOX_PROCESS_ADDRESS_SPACE_BYTES",
            &mut self.process_address_space_bytes,
        )?;
        override_parsed("STEMBOX_WARNING_THRESHOLD_BYTES", &mut self.warning_threshold_bytes)?;
        override_parsed("STEMBOX_MAX_UPLOAD_BYTES", &mut self.max_upload_bytes)?;
        override_parsed("STEMBOX_JOB_TIMEOUT_SECS", &mut self.job_timeout_secs)?;
        override_parsed("STEMBOX_SCRATCH_TTL_SECS", &mut self.scratch_ttl_secs)?;
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn transcode_timeout(&self) -> Duration {
        Duration::from_secs(self.transcode_timeout_secs)
    }

    pub fn admission_wait(&self) -> Duration {
        Duration::from_millis(self.admission_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.scratch_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Per-user scratch root so concurrent users never share a directory
fn default_scratch_root() -> PathBuf {
    let euid = nix::unistd::geteuid().as_raw();
    std::env::temp_dir().join(format!("stembox-uid-{}", euid))
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn override_parsed<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| JobError::Config(format!("{} has invalid value {:?}: {}", key, raw, e)))?;
    }
    Ok(())
}

/// Like `override_parsed`, but an empty or `none` value clears the setting
fn override_optional<T: std::str::FromStr>(key: &str, slot: &mut Option<T>) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        let raw = raw.trim();
        *slot = if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
            None
        } else {
            Some(raw.parse().map_err(|e| {
                JobError::Config(format!("{} has invalid value {:?}: {}", key, raw, e))
            })?)
        };
    }
    Ok(())
}
