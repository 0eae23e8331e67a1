use crate::admission::{estimate_memory, AdmissionController, OperationSlot};
use crate::config::settings::GovernorConfig;
use crate::config::types::{
    ArtifactKind, JobError, JobKind, JobOutcome, JobRequest, Result, Stem,
};
use crate::config::validator;
use crate::core::cancel::CancelToken;
use crate::exec::command::ToolCommands;
use crate::exec::supervisor::ProcessSupervisor;
use crate::ingest::IngestGate;
use crate::kernel::memory::{MemoryMonitor, MemoryProbe};
use crate::observability::metrics::GovernorMetrics;
use crate::safety::sanitizer::CommandSanitizer;
use crate::safety::scratch::{CleanupReport, JobDisposition, ScratchLifecycle};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const STEM_SEARCH_DEPTH: usize = 4;
const MAX_BASENAME_CHARS: usize = 80;

/// Raw, unvalidated job parameters as received from a front end
#[derive(Debug, Clone)]
pub struct JobSubmission {
    pub kind: JobKind,
    pub engine: Option<String>,
    pub output_format: Option<String>,
    pub stems: Vec<String>,
    pub original_filename: Option<String>,
    pub declared_size_bytes: Option<u64>,
    /// Keep running to completion if the caller detaches
    pub preserve_output_on_detach: bool,
}

impl JobSubmission {
    pub fn separate() -> Self {
        Self::new(JobKind::Separate)
    }

    pub fn transcode(format: impl Into<String>) -> Self {
        Self::new(JobKind::Transcode).with_format(format)
    }

    fn new(kind: JobKind) -> Self {
        Self {
            kind,
            engine: None,
            output_format: None,
            stems: Vec::new(),
            original_filename: None,
            declared_size_bytes: None,
            preserve_output_on_detach: false,
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.output_format = Some(format.into());
        self
    }

    pub fn with_stems<I, S>(mut self, stems: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stems = stems.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.original_filename = Some(filename.into());
        self
    }

    pub fn with_declared_size(mut self, bytes: u64) -> Self {
        self.declared_size_bytes = Some(bytes);
        self
    }

    pub fn preserve_on_detach(mut self) -> Self {
        self.preserve_output_on_detach = true;
        self
    }
}

/// Returns the slot on every exit path, including unwinding
struct SlotLease<'a> {
    admission: &'a AdmissionController,
    metrics: &'a GovernorMetrics,
    slot: OperationSlot,
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        self.admission.release(&mut self.slot);
        self.metrics.record_admission(&self.admission.stats());
    }
}

/// Composition of ingest, sanitization, admission, supervision and cleanup
pub struct JobPipeline {
    config: GovernorConfig,
    sanitizer: CommandSanitizer,
    tools: ToolCommands,
    scratch: Arc<ScratchLifecycle>,
    ingest: IngestGate,
    admission: AdmissionController,
    supervisor: ProcessSupervisor,
    probe: Arc<dyn MemoryProbe>,
    metrics: Arc<GovernorMetrics>,
}

impl JobPipeline {
    /// Validate `config` and wire every component from it
    pub fn new(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        let validation = validator::validate_config(&config)?;
        for warning in &validation.warnings {
            warn!("Config warning: {}", warning);
        }

        let metrics = Arc::new(GovernorMetrics::new());
        let scratch = Arc::new(ScratchLifecycle::new(
            &config.scratch_root,
            config.scratch_ttl(),
            Arc::clone(&metrics),
        )?);
        let sanitizer = CommandSanitizer::from_config(&config)?;
        let tools = ToolCommands::from_config(&config)?;
        let ingest = IngestGate::from_config(&config, Arc::clone(&scratch));
        let admission = AdmissionController::from_config(&config, Arc::clone(&probe));
        let supervisor = ProcessSupervisor::from_config(&config, Arc::clone(&probe));

        Ok(Self {
            config,
            sanitizer,
            tools,
            scratch,
            ingest,
            admission,
            supervisor,
            probe,
            metrics,
        })
    }

    /// Pipeline reading host memory from procfs
    pub fn with_host_memory(config: GovernorConfig) -> Result<Self> {
        let probe = Arc::new(MemoryMonitor::new(config.warning_threshold_bytes));
        Self::new(config, probe)
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn scratch(&self) -> &ScratchLifecycle {
        &self.scratch
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn metrics(&self) -> &GovernorMetrics {
        &self.metrics
    }

    pub fn start_background_sweep(&self) {
        self.scratch.start_sweeper(self.config.sweep_interval());
    }

    /// Run one job end to end. On success the outputs stay in scratch until
    /// `complete_handoff`; on failure nothing the job created survives.
    pub fn submit<R: Read>(
        &self,
        submission: &JobSubmission,
        source: R,
        cancel: &CancelToken,
    ) -> Result<JobOutcome> {
        let job_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        self.metrics.jobs_submitted.inc();
        info!("Job {} submitted ({})", job_id, submission.kind);

        // Held until scratch is released so the next job never overlaps this one's files
        let mut lease: Option<SlotLease<'_>> = None;
        let result = self.execute(&job_id, submission, source, cancel, started, &mut lease);

        let disposition = match result {
            Ok(_) => JobDisposition::Succeeded,
            Err(_) => JobDisposition::Failed,
        };
        self.scratch.release(&job_id, disposition);
        drop(lease);

        self.metrics.record_job(&result);
        if let Ok(outcome) = &result {
            self.metrics.record_processing(outcome);
        }
        self.refresh_memory_metrics();

        match &result {
            Ok(outcome) => info!(
                "Job {} finished in {:?} with {} output(s)",
                job_id,
                outcome.processing_time,
                outcome.outputs.len()
            ),
            Err(e) => warn!("Job {} failed [{}]: {}", job_id, e.code(), e),
        }
        result
    }

    /// The caller has consumed the outputs of `job_id`
    pub fn complete_handoff(&self, job_id: &str) -> CleanupReport {
        self.scratch.complete_handoff(job_id)
    }

    /// Mirror a fresh memory sample into the gauges; unreadable samples are skipped
    pub fn refresh_memory_metrics(&self) {
        match self.probe.sample() {
            Ok(snapshot) => self.metrics.record_memory(&snapshot),
            Err(e) => debug!("Memory gauges not refreshed: {}", e),
        }
    }

    fn execute<'a, R: Read>(
        &'a self,
        job_id: &str,
        submission: &JobSubmission,
        source: R,
        cancel: &CancelToken,
        started: Instant,
        lease: &mut Option<SlotLease<'a>>,
    ) -> Result<JobOutcome> {
        // Every rejection here happens before any file or process exists
        let format = self.sanitizer.validate_format(
            submission
                .output_format
                .as_deref()
                .unwrap_or(&self.config.default_format),
        )?;
        let engine = match submission.kind {
            JobKind::Separate => Some(self.sanitizer.validate_engine(
                submission
                    .engine
                    .as_deref()
                    .unwrap_or(&self.config.default_engine),
            )?),
            JobKind::Transcode => None,
        };
        let stems = self.sanitizer.validate_stems(&submission.stems[..])?;
        if let Some(declared) = submission.declared_size_bytes {
            if declared > self.config.max_upload_bytes {
                return Err(JobError::InputTooLarge {
                    limit: self.config.max_upload_bytes,
                    received: declared,
                });
            }
        }
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let ingested = self.ingest.stream_to_scratch(
            job_id,
            source,
            self.config.max_upload_bytes,
            submission.original_filename.as_deref(),
        )?;
        self.metrics.bytes_ingested.add(ingested.bytes_written);

        let job_dir = self.scratch.job_dir(job_id);
        let work_dir = job_dir.join("work");
        self.scratch.register_path(job_id, &work_dir, ArtifactKind::Work);
        fs::create_dir(&work_dir)?;
        fs::create_dir(job_dir.join("output"))?;

        let request = JobRequest::new(
            job_id,
            submission.kind,
            ingested.bytes_written,
            engine,
            format,
            stems,
            self.sanitizer.validate_path(ingested.path())?,
            self.sanitizer.validate_path(&work_dir)?,
        );

        let estimate = estimate_memory(request.kind(), request.declared_input_size_bytes());
        let slot = self.admission.acquire_with_cancel(
            job_id,
            estimate,
            self.config.admission_wait(),
            cancel,
        )?;
        self.metrics.admissions_granted.inc();
        *lease = Some(SlotLease {
            admission: &self.admission,
            metrics: &self.metrics,
            slot,
        });
        self.metrics.record_admission(&self.admission.stats());
        self.refresh_memory_metrics();

        // Past admission, a detached caller only stops the job if it asked to
        let run_cancel = if submission.preserve_output_on_detach {
            CancelToken::new()
        } else {
            cancel.clone()
        };
        let base = output_basename(submission.original_filename.as_deref());

        let (outputs, peak_rss_bytes) = match request.kind() {
            JobKind::Transcode => self.run_transcode(&request, base.as_deref(), &run_cancel)?,
            JobKind::Separate => self.run_separation(&request, base.as_deref(), &run_cancel)?,
        };

        Ok(JobOutcome {
            job_id: job_id.to_string(),
            kind: request.kind(),
            outputs,
            processing_time: started.elapsed(),
            peak_rss_bytes,
        })
    }

    fn output_dir(&self, job_id: &str) -> PathBuf {
        self.scratch.job_dir(job_id).join("output")
    }

    fn run_transcode(
        &self,
        request: &JobRequest,
        base: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<(BTreeMap<String, PathBuf>, u64)> {
        let job_id = request.job_id();
        let path = self.output_dir(job_id).join(format!(
            "{}.{}",
            base.unwrap_or("output"),
            request.output_format()
        ));
        self.scratch.register_path(job_id, &path, ArtifactKind::Output);
        let output = self.sanitizer.validate_output_path(&path)?;

        let spec = self.tools.for_request(request, &output)?;
        let result = self
            .supervisor
            .run_with_cancel(
                &spec,
                self.config.process_memory_ceiling_bytes,
                self.config.job_timeout(),
                cancel,
            )?
            .into_job_result()?;
        ensure_produced(output.as_path(), &result.stderr_excerpt)?;

        let outputs = BTreeMap::from([("audio".to_string(), output.as_path().to_path_buf())]);
        Ok((outputs, result.peak_rss_bytes))
    }

    fn run_separation(
        &self,
        request: &JobRequest,
        base: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<(BTreeMap<String, PathBuf>, u64)> {
        let job_id = request.job_id();
        let work_dir = request.scratch_output_dir();
        let spec = self.tools.for_request(request, work_dir)?;
        let result = self
            .supervisor
            .run_with_cancel(
                &spec,
                self.config.process_memory_ceiling_bytes,
                self.config.job_timeout(),
                cancel,
            )?
            .into_job_result()?;
        let mut peak = result.peak_rss_bytes;

        let stems_dir = find_stems_dir(work_dir.as_path(), STEM_SEARCH_DEPTH).ok_or_else(|| {
            JobError::ProcessingFailed {
                exit_code: Some(0),
                signal: None,
                stderr_excerpt: format!(
                    "separated stems directory not found. {}",
                    result.stderr_excerpt
                ),
            }
        })?;
        let produced = collect_stems(&stems_dir)?;

        let wanted: Vec<Stem> = if request.stem_selection().is_empty() {
            Stem::ALL.to_vec()
        } else {
            request.stem_selection().to_vec()
        };
        let format = request.output_format();
        let mut outputs = BTreeMap::new();
        let mut last_error = None;

        for stem in wanted {
            let source = match produced.get(&stem) {
                Some(path) => path,
                None => {
                    warn!("Engine produced no {} stem for job {}", stem, job_id);
                    continue;
                }
            };
            let name = match base {
                Some(base) => format!("{} - {}.{}", base, stem, format),
                None => format!("{}.{}", stem, format),
            };
            let dest_path = self.output_dir(job_id).join(name);
            self.scratch.register_path(job_id, &dest_path, ArtifactKind::Output);
            let dest = self.sanitizer.validate_output_path(&dest_path)?;

            if format.as_str() == "wav" {
                let source = self.sanitizer.validate_path(source)?;
                fs::copy(source.as_path(), dest.as_path())?;
            } else {
                let input = self.sanitizer.validate_path(source)?;
                let spec = self.tools.transcode(&input, format, &dest);
                let converted = self
                    .supervisor
                    .run_with_cancel(
                        &spec,
                        self.config.process_memory_ceiling_bytes,
                        self.config.transcode_timeout(),
                        cancel,
                    )?
                    .into_job_result()
                    .and_then(|r| ensure_produced(dest.as_path(), &r.stderr_excerpt).map(|_| r));
                match converted {
                    Ok(r) => peak = peak.max(r.peak_rss_bytes),
                    Err(JobError::Cancelled) => return Err(JobError::Cancelled),
                    Err(e) => {
                        warn!("Conversion of {} stem for job {} failed: {}", stem, job_id, e);
                        self.scratch.discard(job_id, dest.as_path());
                        last_error = Some(e);
                        continue;
                    }
                }
            }
            outputs.insert(stem.as_str().to_string(), dest.as_path().to_path_buf());
        }

        if outputs.is_empty() {
            return Err(last_error.unwrap_or_else(|| JobError::ProcessingFailed {
                exit_code: Some(0),
                signal: None,
                stderr_excerpt: "no requested stem files were produced".to_string(),
            }));
        }
        Ok((outputs, peak))
    }
}

fn ensure_produced(path: &Path, stderr_excerpt: &str) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(JobError::ProcessingFailed {
            exit_code: Some(0),
            signal: None,
            stderr_excerpt: format!("tool produced no output file. {}", stderr_excerpt),
        }),
    }
}

/// Client filename reduced to a safe display base (no extension, no directories)
fn output_basename(original: Option<&str>) -> Option<String> {
    let stem = Path::new(original?).file_stem()?.to_str()?;
    let cleaned: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .take(MAX_BASENAME_CHARS)
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn wav_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("wav"))
                .count()
        })
        .unwrap_or(0)
}

/// First directory at or below `dir` holding at least two `.wav` files.
/// Symlinked directories are not followed.
fn find_stems_dir(dir: &Path, depth: usize) -> Option<PathBuf> {
    if wav_count(dir) >= 2 {
        return Some(dir.to_path_buf());
    }
    if depth == 0 {
        return None;
    }
    let mut subdirs: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    subdirs.sort();
    subdirs
        .iter()
        .find_map(|sub| find_stems_dir(sub, depth - 1))
}

fn collect_stems(dir: &Path) -> Result<BTreeMap<Stem, PathBuf>> {
    let mut stems = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_wav = path.extension().and_then(|x| x.to_str()) == Some("wav");
        if !entry.file_type()?.is_file() || !is_wav {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()).and_then(Stem::parse) {
            stems.insert(stem, path);
        }
    }
    Ok(stems)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_strips_unsafe_characters() {
        assert_eq!(output_basename(Some("My Song.mp3")).as_deref(), Some("My Song"));
        assert_eq!(output_basename(Some("../../etc/passwd")).as_deref(), Some("passwd"));
        assert_eq!(output_basename(Some("$(reboot);.wav")).as_deref(), Some("reboot"));
        assert_eq!(output_basename(Some("...")), None);
        assert_eq!(output_basename(None), None);
    }

    #[test]
    fn stems_dir_is_found_below_engine_layout() {
        let root = std::env::temp_dir().join(format!("stembox-stems-{}", Uuid::new_v4()));
        let track = root.join("htdemucs/input");
        fs::create_dir_all(&track).unwrap();
        fs::write(root.join("htdemucs/log.wav"), b"RIFF").unwrap();
        for stem in ["vocals", "drums", "bass", "other", "no_vocals"] {
            fs::write(track.join(format!("{}.wav", stem)), b"RIFF").unwrap();
        }

        let found = find_stems_dir(&root, STEM_SEARCH_DEPTH).unwrap();
        assert_eq!(found, track);
        let stems = collect_stems(&found).unwrap();
        assert_eq!(stems.len(), 4);
        assert!(stems.contains_key(&Stem::Vocals));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn missing_stems_dir_is_none() {
        let root = std::env::temp_dir().join(format!("stembox-stems-{}", Uuid::new_v4()));
        fs::create_dir_all(root.join("empty")).unwrap();
        assert!(find_stems_dir(&root, STEM_SEARCH_DEPTH).is_none());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn submission_builder() {
        let submission = JobSubmission::separate()
            .with_engine("htdemucs_ft")
            .with_stems(["vocals", "bass"])
            .with_filename("a.mp3")
            .preserve_on_detach();
        assert_eq!(submission.kind, JobKind::Separate);
        assert_eq!(submission.stems, vec!["vocals", "bass"]);
        assert!(submission.preserve_output_on_detach);
        assert_eq!(JobSubmission::transcode("flac").output_format.as_deref(), Some("flac"));
    }
}
