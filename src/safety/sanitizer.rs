/// Allow-list validation of every value that can become a subprocess argument
use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, Result, Stem};
use log::warn;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Whitelisted separation engine name
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineName(String);

/// Whitelisted output format
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputFormat(String);

/// Canonical path contained in a scratch root
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScratchPath(PathBuf);

impl EngineName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl OutputFormat {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ScratchPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for EngineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for ScratchPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Validates engine names, formats, stems and paths before any command is built
#[derive(Debug, Clone)]
pub struct CommandSanitizer {
    engines: BTreeSet<String>,
    formats: BTreeSet<String>,
    scratch_roots: Vec<PathBuf>,
}

impl CommandSanitizer {
    /// Scratch roots must already exist; they are canonicalized once here.
    pub fn new(engines: &[String], formats: &[String], scratch_roots: &[PathBuf]) -> Result<Self> {
        let mut roots = Vec::with_capacity(scratch_roots.len());
        for root in scratch_roots {
            let canonical = root.canonicalize().map_err(|e| {
                JobError::Config(format!(
                    "scratch root {} cannot be resolved: {}",
                    root.display(),
                    e
                ))
            })?;
            roots.push(canonical);
        }
        if roots.is_empty() {
            return Err(JobError::Config("at least one scratch root is required".to_string()));
        }

        Ok(Self {
            engines: engines.iter().cloned().collect(),
            formats: formats.iter().cloned().collect(),
            scratch_roots: roots,
        })
    }

    pub fn from_config(config: &GovernorConfig) -> Result<Self> {
        Self::new(
            &config.allowed_engines,
            &config.allowed_formats,
            std::slice::from_ref(&config.scratch_root),
        )
    }

    pub fn validate_engine(&self, name: &str) -> Result<EngineName> {
        let token = normalize_token(name).ok_or_else(|| reject_engine(name))?;
        if !self.engines.contains(&token) {
            return Err(reject_engine(name));
        }
        Ok(EngineName(token))
    }

    pub fn validate_format(&self, format: &str) -> Result<OutputFormat> {
        let token = normalize_token(format).ok_or_else(|| reject_format(format))?;
        if !self.formats.contains(&token) {
            return Err(reject_format(format));
        }
        Ok(OutputFormat(token))
    }

    /// Validate a stem selection. Duplicates collapse, order is kept.
    pub fn validate_stems<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<Stem>> {
        let mut stems = Vec::new();
        for raw in requested {
            let raw = raw.as_ref();
            let stem = normalize_token(raw)
                .as_deref()
                .and_then(Stem::parse)
                .ok_or_else(|| {
                    warn!("Rejected stem selection {:?}", raw);
                    JobError::StemRejected(raw.to_string())
                })?;
            if !stems.contains(&stem) {
                stems.push(stem);
            }
        }
        Ok(stems)
    }

    /// Resolve symlinks and `..`, then require containment in a scratch root.
    /// The path must exist.
    pub fn validate_path(&self, path: &Path) -> Result<ScratchPath> {
        let canonical = path.canonicalize().map_err(|e| {
            JobError::PathRejected(format!("{} cannot be resolved: {}", path.display(), e))
        })?;
        self.contained(canonical, path)
    }

    /// Like `validate_path`, for an output that does not exist yet:
    /// the parent is canonicalized and the final component must be a plain name.
    pub fn validate_output_path(&self, path: &Path) -> Result<ScratchPath> {
        if path.exists() {
            return self.validate_path(path);
        }

        let name = match path.components().next_back() {
            Some(Component::Normal(name)) => name,
            _ => {
                return Err(JobError::PathRejected(format!(
                    "{} has no plain file name",
                    path.display()
                )))
            }
        };
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| JobError::PathRejected(format!("{} has no parent", path.display())))?;

        let canonical_parent = parent.canonicalize().map_err(|e| {
            JobError::PathRejected(format!("{} cannot be resolved: {}", parent.display(), e))
        })?;
        self.contained(canonical_parent.join(name), path)
    }

    fn contained(&self, canonical: PathBuf, original: &Path) -> Result<ScratchPath> {
        // Path::starts_with compares whole components, so /scratch2 is not under /scratch
        let inside = self
            .scratch_roots
            .iter()
            .any(|root| canonical != *root && canonical.starts_with(root));
        if !inside {
            warn!(
                "Rejected path {} (resolves to {}) outside scratch roots",
                original.display(),
                canonical.display()
            );
            return Err(JobError::PathRejected(format!(
                "{} is outside the scratch root",
                original.display()
            )));
        }
        Ok(ScratchPath(canonical))
    }
}

/// Strip to `[A-Za-z0-9._-]`. Stripping only normalizes: a value that loses
/// any character in the process is rejected outright.
fn normalize_token(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if stripped.is_empty() || stripped != raw {
        return None;
    }
    Some(stripped)
}

fn reject_engine(raw: &str) -> JobError {
    warn!("Rejected engine name {:?}", raw);
    JobError::EngineRejected(raw.to_string())
}

fn reject_format(raw: &str) -> JobError {
    warn!("Rejected output format {:?}", raw);
    JobError::FormatRejected(raw.to_string())
}
