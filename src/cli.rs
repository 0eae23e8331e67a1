use crate::config::settings::GovernorConfig;
use crate::config::types::{JobError, JobOutcome};
use crate::config::validator;
use crate::core::cancel::CancelToken;
use crate::core::pipeline::{JobPipeline, JobSubmission};
use crate::kernel::memory::MemoryMonitor;
use crate::kernel::signal::ShutdownSignal;
use crate::safety::scratch::ScratchLifecycle;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split an audio file into stems
    Separate {
        /// Audio file to separate
        #[arg(long)]
        input: PathBuf,
        /// Separation model name (must be whitelisted)
        #[arg(long)]
        engine: Option<String>,
        /// Output format for the stems
        #[arg(long)]
        format: Option<String>,
        /// Comma-separated stems to keep (default: all)
        #[arg(long, value_delimiter = ',')]
        stems: Vec<String>,
        /// Where finished stems are copied
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// Finish the job even if interrupted
        #[arg(long)]
        preserve_on_interrupt: bool,
    },
    /// Convert an audio file to another format
    Transcode {
        /// Audio file to convert
        #[arg(long)]
        input: PathBuf,
        /// Target format (must be whitelisted)
        #[arg(long)]
        format: String,
        /// Where the converted file is copied
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
    },
    /// Run one sweep pass over the scratch root
    Sweep,
    /// Print current memory readings as JSON
    Memory,
    /// Validate the configuration and print warnings
    CheckConfig,
}

fn load_config(path: Option<&Path>) -> Result<GovernorConfig> {
    let mut config = match path {
        Some(path) => GovernorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GovernorConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

/// Cancel `token` once a termination signal arrives
fn watch_shutdown(shutdown: ShutdownSignal, token: CancelToken) {
    std::thread::spawn(move || loop {
        if shutdown.shutdown_requested() {
            warn!("Signal {} received, cancelling job", shutdown.received());
            token.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    });
}

pub fn run() -> Result<()> {
    // Initialize structured logging (RUST_LOG)
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Separate {
            input,
            engine,
            format,
            stems,
            output_dir,
            preserve_on_interrupt,
        } => {
            let mut submission = JobSubmission::separate().with_stems(stems);
            if let Some(engine) = engine {
                submission = submission.with_engine(engine);
            }
            if let Some(format) = format {
                submission = submission.with_format(format);
            }
            if preserve_on_interrupt {
                submission = submission.preserve_on_detach();
            }
            run_job(config, submission, &input, &output_dir)
        }
        Commands::Transcode {
            input,
            format,
            output_dir,
        } => run_job(config, JobSubmission::transcode(format), &input, &output_dir),
        Commands::Sweep => {
            let metrics = Arc::new(crate::observability::metrics::GovernorMetrics::new());
            let scratch =
                ScratchLifecycle::new(&config.scratch_root, config.scratch_ttl(), metrics)?;
            let report = scratch.sweep_once();
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Memory => {
            let monitor = MemoryMonitor::new(config.warning_threshold_bytes);
            let snapshot = monitor.sample()?;
            let json_result = serde_json::json!({
                "snapshot": snapshot,
                "available_budget_bytes": snapshot.available_budget(config.memory_ceiling_bytes),
                "above_warning": monitor.is_above_warning(&snapshot),
            });
            println!("{}", serde_json::to_string_pretty(&json_result)?);
            Ok(())
        }
        Commands::CheckConfig => {
            match validator::validate_config(&config) {
                Ok(result) => {
                    let json_result = serde_json::json!({
                        "valid": result.valid,
                        "warnings": result.warnings,
                    });
                    println!("{}", serde_json::to_string_pretty(&json_result)?);
                    Ok(())
                }
                Err(e) => {
                    let json_result = serde_json::json!({
                        "valid": false,
                        "error": e.to_string(),
                    });
                    println!("{}", serde_json::to_string_pretty(&json_result)?);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn run_job(
    config: GovernorConfig,
    submission: JobSubmission,
    input: &Path,
    output_dir: &Path,
) -> Result<()> {
    let shutdown = ShutdownSignal::install().map_err(|e| anyhow::anyhow!(e))?;
    let cancel = CancelToken::new();
    watch_shutdown(shutdown, cancel.clone());

    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let declared = file.metadata()?.len();
    let submission = match input.file_name().and_then(|n| n.to_str()) {
        Some(name) => submission.with_filename(name),
        None => submission,
    }
    .with_declared_size(declared);

    let pipeline = JobPipeline::with_host_memory(config)?;
    match pipeline.submit(&submission, BufReader::new(file), &cancel) {
        Ok(outcome) => {
            let delivered = deliver(&outcome, output_dir);
            let cleanup = pipeline.complete_handoff(&outcome.job_id);
            if !cleanup.errors.is_empty() {
                warn!("Handoff cleanup for job {} reported {:?}", outcome.job_id, cleanup.errors);
            }
            let delivered = delivered?;
            let json_result = serde_json::json!({
                "success": true,
                "job_id": outcome.job_id,
                "kind": outcome.kind,
                "outputs": delivered,
                "processing_time_ms": outcome.processing_time.as_millis() as u64,
                "peak_rss_bytes": outcome.peak_rss_bytes,
            });
            println!("{}", serde_json::to_string_pretty(&json_result)?);
            Ok(())
        }
        Err(e) => {
            emit_failure(&e)?;
            std::process::exit(1);
        }
    }
}

/// Copy outputs out of scratch before the handoff removes them
fn deliver(
    outcome: &JobOutcome,
    output_dir: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let mut delivered = serde_json::Map::new();
    for (name, path) in &outcome.outputs {
        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("output {} has no file name", path.display()))?;
        let dest = output_dir.join(file_name);
        std::fs::copy(path, &dest)
            .with_context(|| format!("copying {} to {}", path.display(), dest.display()))?;
        info!("Delivered {} -> {}", name, dest.display());
        delivered.insert(name.clone(), serde_json::Value::String(dest.display().to_string()));
    }
    Ok(delivered)
}

fn emit_failure(error: &JobError) -> Result<()> {
    let json_result = serde_json::json!({
        "success": false,
        "reason": error.code(),
        "error": error.to_string(),
        "retryable": error.is_retryable(),
    });
    println!("{}", serde_json::to_string_pretty(&json_result)?);
    Ok(())
}
