// Governor metrics
//
// Counters, gauges and histograms for job outcomes, processing time, memory
// readings, admission decisions, ingest volume and scratch cleanup. Owned by
// the pipeline and shared by Arc; there is no process-global registry.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::admission::AdmissionStats;
use crate::config::types::{JobError, JobKind, JobOutcome, MemorySnapshot};

/// Upper bounds in seconds; separation runs take minutes
const PROCESSING_BUCKETS: [f64; 11] = [
    1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0,
];

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct HistogramBucket {
    pub le: f64,
    pub count: AtomicU64,
}

/// Cumulative histogram of durations
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_bounds(bounds: &[f64]) -> Self {
        Self {
            buckets: bounds
                .iter()
                .map(|&le| HistogramBucket {
                    le,
                    count: AtomicU64::new(0),
                })
                .collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < f64::EPSILON)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn export(&self, output: &mut String, name: &str, labels: &str) {
        let sep = if labels.is_empty() { "" } else { "," };
        for bucket in &self.buckets {
            let _ = writeln!(
                output,
                "{}_bucket{{{}{}le=\"{}\"}} {}",
                name,
                labels,
                sep,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(
            output,
            "{}_bucket{{{}{}le=\"+Inf\"}} {}",
            name,
            labels,
            sep,
            self.count()
        );
        let braces = |labels: &str| {
            if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels)
            }
        };
        let _ = writeln!(output, "{}_sum{} {}", name, braces(labels), self.sum_seconds());
        let _ = writeln!(output, "{}_count{} {}", name, braces(labels), self.count());
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::with_bounds(&PROCESSING_BUCKETS)
    }
}

#[derive(Debug, Default)]
pub struct GovernorMetrics {
    pub jobs_submitted: Counter,
    pub jobs_succeeded: Counter,
    pub jobs_rejected: Counter,
    pub jobs_failed: Counter,
    pub jobs_memory_exceeded: Counter,
    pub jobs_timed_out: Counter,
    pub jobs_cancelled: Counter,

    /// Wall time of successful jobs, per kind
    pub transcode_seconds: Histogram,
    pub separate_seconds: Histogram,

    pub system_memory_total_bytes: Gauge,
    pub system_memory_available_bytes: Gauge,
    pub process_rss_bytes: Gauge,
    /// Peak child tree RSS of the most recent finished job
    pub peak_child_rss_bytes: Gauge,

    pub admissions_granted: Counter,
    pub admissions_rejected: Counter,
    pub active_slots: Gauge,
    pub reserved_memory_bytes: Gauge,
    pub waiting_jobs: Gauge,

    pub bytes_ingested: Counter,

    pub cleanup_success: Counter,
    pub cleanup_failure: Counter,
    pub sweep_removed: Counter,
}

impl GovernorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a finished job by outcome
    pub fn record_job(&self, result: &Result<JobOutcome, JobError>) {
        match result {
            Ok(_) => self.jobs_succeeded.inc(),
            Err(e) if e.is_validation() => self.jobs_rejected.inc(),
            Err(JobError::MemoryExceeded { .. }) => self.jobs_memory_exceeded.inc(),
            Err(JobError::Timeout(_)) => self.jobs_timed_out.inc(),
            Err(JobError::Cancelled) => self.jobs_cancelled.inc(),
            Err(JobError::CapacityUnavailable(_)) | Err(JobError::MemoryUnknown(_)) => {
                self.admissions_rejected.inc()
            }
            Err(_) => self.jobs_failed.inc(),
        }
    }

    pub fn processing_histogram(&self, kind: JobKind) -> &Histogram {
        match kind {
            JobKind::Transcode => &self.transcode_seconds,
            JobKind::Separate => &self.separate_seconds,
        }
    }

    /// Record a successful job's wall time and child peak
    pub fn record_processing(&self, outcome: &JobOutcome) {
        self.processing_histogram(outcome.kind)
            .observe(outcome.processing_time);
        self.peak_child_rss_bytes.set(outcome.peak_rss_bytes);
    }

    pub fn record_memory(&self, snapshot: &MemorySnapshot) {
        self.system_memory_total_bytes.set(snapshot.total_bytes);
        self.system_memory_available_bytes
            .set(snapshot.available_bytes);
        self.process_rss_bytes.set(snapshot.process_rss_bytes);
    }

    /// Mirror the admission controller's current state into gauges
    pub fn record_admission(&self, stats: &AdmissionStats) {
        self.active_slots.set(stats.open_slots as u64);
        self.reserved_memory_bytes.set(stats.reserved_bytes);
        self.waiting_jobs.set(stats.waiting as u64);
    }

    pub fn record_cleanup(&self, removed: usize, failed: usize) {
        self.cleanup_success.add(removed as u64);
        self.cleanup_failure.add(failed as u64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        family(&mut output, "stembox_jobs_submitted_total", "counter", "Jobs submitted");
        sample(&mut output, "stembox_jobs_submitted_total", "", self.jobs_submitted.get());

        family(&mut output, "stembox_jobs_total", "counter", "Finished jobs by outcome");
        for (outcome, counter) in [
            ("succeeded", &self.jobs_succeeded),
            ("rejected", &self.jobs_rejected),
            ("failed", &self.jobs_failed),
            ("memory_exceeded", &self.jobs_memory_exceeded),
            ("timeout", &self.jobs_timed_out),
            ("cancelled", &self.jobs_cancelled),
        ] {
            sample(
                &mut output,
                "stembox_jobs_total",
                &format!("outcome=\"{}\"", outcome),
                counter.get(),
            );
        }

        family(
            &mut output,
            "stembox_processing_duration_seconds",
            "histogram",
            "Processing duration of successful jobs",
        );
        for kind in [JobKind::Transcode, JobKind::Separate] {
            self.processing_histogram(kind).export(
                &mut output,
                "stembox_processing_duration_seconds",
                &format!("kind=\"{}\"", kind),
            );
        }

        family(&mut output, "stembox_memory_bytes", "gauge", "Memory readings by type");
        for (kind, gauge) in [
            ("system_total", &self.system_memory_total_bytes),
            ("system_available", &self.system_memory_available_bytes),
            ("process", &self.process_rss_bytes),
            ("peak_child", &self.peak_child_rss_bytes),
        ] {
            sample(
                &mut output,
                "stembox_memory_bytes",
                &format!("type=\"{}\"", kind),
                gauge.get(),
            );
        }

        family(&mut output, "stembox_admissions_total", "counter", "Admission decisions");
        sample(
            &mut output,
            "stembox_admissions_total",
            "decision=\"granted\"",
            self.admissions_granted.get(),
        );
        sample(
            &mut output,
            "stembox_admissions_total",
            "decision=\"rejected\"",
            self.admissions_rejected.get(),
        );

        family(&mut output, "stembox_active_slots", "gauge", "Open operation slots");
        sample(&mut output, "stembox_active_slots", "", self.active_slots.get());
        family(
            &mut output,
            "stembox_reserved_memory_bytes",
            "gauge",
            "Memory reserved by open slots",
        );
        sample(
            &mut output,
            "stembox_reserved_memory_bytes",
            "",
            self.reserved_memory_bytes.get(),
        );
        family(&mut output, "stembox_waiting_jobs", "gauge", "Jobs waiting for a slot");
        sample(&mut output, "stembox_waiting_jobs", "", self.waiting_jobs.get());

        family(&mut output, "stembox_ingested_bytes_total", "counter", "Bytes streamed to scratch");
        sample(&mut output, "stembox_ingested_bytes_total", "", self.bytes_ingested.get());

        family(&mut output, "stembox_cleanup_total", "counter", "Scratch cleanup outcomes");
        sample(
            &mut output,
            "stembox_cleanup_total",
            "outcome=\"success\"",
            self.cleanup_success.get(),
        );
        sample(
            &mut output,
            "stembox_cleanup_total",
            "outcome=\"failure\"",
            self.cleanup_failure.get(),
        );
        family(
            &mut output,
            "stembox_sweep_removed_total",
            "counter",
            "Entries removed by the sweep",
        );
        sample(&mut output, "stembox_sweep_removed_total", "", self.sweep_removed.get());

        output
    }
}

fn family(output: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
}

fn sample(output: &mut String, name: &str, labels: &str, value: u64) {
    if labels.is_empty() {
        let _ = writeln!(output, "{} {}", name, value);
    } else {
        let _ = writeln!(output, "{}{{{}}} {}", name, labels, value);
    }
}
