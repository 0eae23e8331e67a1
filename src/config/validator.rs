// Startup validation: fail fast with actionable errors, surface soft issues as warnings

use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, Result};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a configuration; any error is fatal
pub fn validate_config(config: &GovernorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_timing(config, &mut result);
    validate_whitelists(config, &mut result);
    validate_tools(config, &mut result);

    if !config.scratch_root.is_absolute() {
        result.add_error(format!(
            "scratch_root must be an absolute path: {:?}",
            config.scratch_root
        ));
    }

    if !result.is_valid() {
        return Err(JobError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_limits(config: &GovernorConfig, result: &mut ValidationResult) {
    if config.max_concurrent_operations == 0 {
        result.add_error("max_concurrent_operations cannot be zero".to_string());
    }
    if config.memory_ceiling_bytes == 0 {
        result.add_error("memory_ceiling_bytes cannot be zero".to_string());
    }
    if config.process_memory_ceiling_bytes == 0 {
        result.add_error("process_memory_ceiling_bytes cannot be zero".to_string());
    }
    match config.process_address_space_bytes {
        Some(0) => result.add_error("process_address_space_bytes cannot be zero".to_string()),
        Some(limit) if limit < config.process_memory_ceiling_bytes => result.add_warning(format!(
            "process_address_space_bytes ({}) is below process_memory_ceiling_bytes ({}), \
             children will fail allocations before the supervisor measures them",
            limit, config.process_memory_ceiling_bytes
        )),
        _ => {}
    }
    if config.max_upload_bytes == 0 {
        result.add_error("max_upload_bytes cannot be zero".to_string());
    }
    if config.ingest_chunk_bytes == 0 {
        result.add_error("ingest_chunk_bytes cannot be zero".to_string());
    }
    if config.stderr_excerpt_bytes == 0 {
        result.add_error("stderr_excerpt_bytes cannot be zero".to_string());
    }

    if config.warning_threshold_bytes >= config.memory_ceiling_bytes {
        result.add_warning(format!(
            "warning_threshold_bytes ({}) is not below memory_ceiling_bytes ({}), \
             warnings will never fire before denials",
            config.warning_threshold_bytes, config.memory_ceiling_bytes
        ));
    }
    if config.process_memory_ceiling_bytes > config.memory_ceiling_bytes {
        result.add_warning(format!(
            "process_memory_ceiling_bytes ({}) exceeds memory_ceiling_bytes ({})",
            config.process_memory_ceiling_bytes, config.memory_ceiling_bytes
        ));
    }
    if config.max_upload_bytes.saturating_mul(4) >= config.memory_ceiling_bytes {
        result.add_warning(format!(
            "a maximum-size separation upload ({} bytes) can never be admitted \
             under memory_ceiling_bytes ({})",
            config.max_upload_bytes, config.memory_ceiling_bytes
        ));
    }
}

fn validate_timing(config: &GovernorConfig, result: &mut ValidationResult) {
    if config.job_timeout_secs == 0 {
        result.add_error("job_timeout_secs cannot be zero".to_string());
    }
    if config.transcode_timeout_secs == 0 {
        result.add_error("transcode_timeout_secs cannot be zero".to_string());
    }
    if config.poll_interval_ms == 0 {
        result.add_error("poll_interval_ms cannot be zero".to_string());
    }
    if config.scratch_ttl_secs == 0 {
        result.add_error("scratch_ttl_secs cannot be zero".to_string());
    }
    if config.sweep_interval_secs == 0 {
        result.add_error("sweep_interval_secs cannot be zero".to_string());
    }
    if config.poll_interval_ms >= config.job_timeout_secs.saturating_mul(1000) {
        result.add_warning(format!(
            "poll_interval_ms ({}) is not shorter than the job timeout",
            config.poll_interval_ms
        ));
    }
    if config.scratch_ttl_secs < config.job_timeout_secs {
        result.add_warning(format!(
            "scratch_ttl_secs ({}) is shorter than job_timeout_secs ({}), \
             the sweep may remove running jobs' files",
            config.scratch_ttl_secs, config.job_timeout_secs
        ));
    }
}

fn validate_whitelists(config: &GovernorConfig, result: &mut ValidationResult) {
    if config.allowed_engines.is_empty() {
        result.add_error("allowed_engines cannot be empty".to_string());
    }
    if config.allowed_formats.is_empty() {
        result.add_error("allowed_formats cannot be empty".to_string());
    }

    for entry in config.allowed_engines.iter().chain(&config.allowed_formats) {
        if !is_plain_token(entry) {
            result.add_error(format!(
                "whitelist entry {:?} contains characters outside [A-Za-z0-9._-]",
                entry
            ));
        }
    }

    if !config.allowed_engines.contains(&config.default_engine) {
        result.add_error(format!(
            "default_engine {:?} is not in allowed_engines",
            config.default_engine
        ));
    }
    if !config.allowed_formats.contains(&config.default_format) {
        result.add_error(format!(
            "default_format {:?} is not in allowed_formats",
            config.default_format
        ));
    }
}

fn validate_tools(config: &GovernorConfig, result: &mut ValidationResult) {
    if config.separator_command.first().map_or(true, |p| p.is_empty()) {
        result.add_error("separator_command must name a program".to_string());
    }
    if config.transcoder_command.first().map_or(true, |p| p.is_empty()) {
        result.add_error("transcoder_command must name a program".to_string());
    }
    if !config.env_passthrough.iter().any(|k| k == "PATH") {
        result.add_warning(
            "env_passthrough omits PATH, tools must be configured with absolute paths".to_string(),
        );
    }
}

fn is_plain_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let result = validate_config(&GovernorConfig::default()).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn zero_concurrency_fails() {
        let config = GovernorConfig {
            max_concurrent_operations: 0,
            ..GovernorConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_concurrent_operations"));
    }

    #[test]
    fn shell_metacharacters_in_whitelist_fail() {
        let mut config = GovernorConfig::default();
        config.allowed_engines.push("htdemucs;id".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn default_engine_must_be_whitelisted() {
        let config = GovernorConfig {
            default_engine: "spleeter".to_string(),
            ..GovernorConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn relative_scratch_root_fails() {
        let config = GovernorConfig {
            scratch_root: "scratch".into(),
            ..GovernorConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn high_warning_threshold_only_warns() {
        let config = GovernorConfig {
            warning_threshold_bytes: u64::MAX,
            ..GovernorConfig::default()
        };
        let result = validate_config(&config).unwrap();
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn address_space_limit_is_checked() {
        let config = GovernorConfig {
            process_address_space_bytes: Some(0),
            ..GovernorConfig::default()
        };
        assert!(validate_config(&config).is_err());

        let config = GovernorConfig {
            process_address_space_bytes: Some(256 * 1024 * 1024),
            ..GovernorConfig::default()
        };
        let result = validate_config(&config).unwrap();
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("process_address_space_bytes")));
    }
}
