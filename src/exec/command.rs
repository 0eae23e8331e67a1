/// External tool invocations built only from sanitized values
use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, JobKind, JobRequest, Result, Stem};
use crate::safety::sanitizer::{EngineName, OutputFormat, ScratchPath};
use std::ffi::{OsStr, OsString};
use std::fmt;

/// Program plus argv, never passed through a shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
}

impl CommandSpec {
    pub(crate) fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub(crate) fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {:?}", arg)?;
        }
        Ok(())
    }
}

/// Codec flags for a whitelisted output format
pub fn format_flags(format: &OutputFormat) -> &'static [&'static str] {
    match format.as_str() {
        "mp3" => &["-codec:a", "libmp3lame", "-b:a", "192k"],
        "flac" => &["-codec:a", "flac"],
        "m4a" | "aac" => &["-codec:a", "aac", "-b:a", "192k"],
        "opus" => &["-codec:a", "libopus"],
        _ => &[],
    }
}

/// Configured separator and transcoder prefixes
#[derive(Debug, Clone)]
pub struct ToolCommands {
    separator: Vec<String>,
    transcoder: Vec<String>,
}

impl ToolCommands {
    pub fn new(separator: Vec<String>, transcoder: Vec<String>) -> Result<Self> {
        if separator.is_empty() || transcoder.is_empty() {
            return Err(JobError::Config(
                "separator_command and transcoder_command must name a program".to_string(),
            ));
        }
        Ok(Self {
            separator,
            transcoder,
        })
    }

    pub fn from_config(config: &GovernorConfig) -> Result<Self> {
        Self::new(
            config.separator_command.clone(),
            config.transcoder_command.clone(),
        )
    }

    fn prefixed(prefix: &[String]) -> CommandSpec {
        prefix[1..]
            .iter()
            .fold(CommandSpec::new(&prefix[0]), |spec, arg| spec.arg(arg))
    }

    /// `<tool> -n <engine> -o <output_dir> <input> [--two-stems <stem>]`
    pub fn separation(
        &self,
        engine: &EngineName,
        output_dir: &ScratchPath,
        input: &ScratchPath,
        stems: &[Stem],
    ) -> CommandSpec {
        let mut spec = Self::prefixed(&self.separator)
            .arg("-n")
            .arg(engine.as_str())
            .arg("-o")
            .arg(output_dir.as_path())
            .arg(input.as_path());
        if let [only] = stems {
            spec = spec.arg("--two-stems").arg(only.as_str());
        }
        spec
    }

    /// `<tool> -i <input> -y <format-flags> <output>`
    pub fn transcode(
        &self,
        input: &ScratchPath,
        format: &OutputFormat,
        output: &ScratchPath,
    ) -> CommandSpec {
        let spec = Self::prefixed(&self.transcoder)
            .arg("-i")
            .arg(input.as_path())
            .arg("-y");
        format_flags(format)
            .iter()
            .fold(spec, |spec, flag| spec.arg(flag))
            .arg(output.as_path())
    }

    /// The job's primary invocation. Transcodes write to `output`.
    pub fn for_request(&self, request: &JobRequest, output: &ScratchPath) -> Result<CommandSpec> {
        match request.kind() {
            JobKind::Separate => {
                let engine = request
                    .engine_name()
                    .ok_or_else(|| JobError::EngineRejected(String::new()))?;
                Ok(self.separation(
                    engine,
                    request.scratch_output_dir(),
                    request.scratch_input_path(),
                    request.stem_selection(),
                ))
            }
            JobKind::Transcode => Ok(self.transcode(
                request.scratch_input_path(),
                request.output_format(),
                output,
            )),
        }
    }
}
