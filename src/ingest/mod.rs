//! Streaming ingestion
//!
//! Uploads are copied to scratch in fixed-size chunks under a hard byte
//! ceiling; the payload is never held whole in memory. The scratch file is
//! registered before it is created so a crash mid-stream leaves nothing the
//! sweep cannot find.

pub mod sniff;

use crate::config::settings::GovernorConfig;
use crate::config::types::{ArtifactKind, JobError, Result};
use crate::safety::scratch::ScratchLifecycle;
use log::{debug, warn};
use serde::Serialize;
use sniff::AudioContainer;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct IngestedInput {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub container: AudioContainer,
}

impl IngestedInput {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub struct IngestGate {
    chunk_bytes: usize,
    verify_headers: bool,
    scratch: Arc<ScratchLifecycle>,
}

impl IngestGate {
    pub fn new(chunk_bytes: usize, verify_headers: bool, scratch: Arc<ScratchLifecycle>) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(1),
            verify_headers,
            scratch,
        }
    }

    pub fn from_config(config: &GovernorConfig, scratch: Arc<ScratchLifecycle>) -> Self {
        Self::new(config.ingest_chunk_bytes, config.verify_audio_headers, scratch)
    }

    /// Stream `source` into `<scratch_root>/<job_id>/input.<ext>`.
    ///
    /// Fails `InputTooLarge` as soon as the running total passes `max_bytes`,
    /// `EmptyInput` on a zero-byte stream and `InvalidAudio` when the header is
    /// not a known container. The partial file is gone before any error returns.
    pub fn stream_to_scratch<R: Read>(
        &self,
        job_id: &str,
        source: R,
        max_bytes: u64,
        original_filename: Option<&str>,
    ) -> Result<IngestedInput> {
        let dir = self.scratch.prepare_job_dir(job_id)?;
        let path = dir.join(format!("input.{}", sniff::safe_extension(original_filename)));
        self.scratch.register_path(job_id, &path, ArtifactKind::Input);

        match self.copy_bounded(&path, source, max_bytes) {
            Ok(ingested) => {
                debug!(
                    "Ingested {} bytes ({:?}) for job {}",
                    ingested.bytes_written, ingested.container, job_id
                );
                Ok(ingested)
            }
            Err(e) => {
                warn!("Ingest for job {} failed: {}", job_id, e);
                self.scratch.discard(job_id, &path);
                Err(e)
            }
        }
    }

    fn copy_bounded<R: Read>(
        &self,
        path: &Path,
        mut source: R,
        max_bytes: u64,
    ) -> Result<IngestedInput> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let mut buf = vec![0u8; self.chunk_bytes];
        let mut header: Vec<u8> = Vec::with_capacity(sniff::HEADER_LEN);
        let mut container = None;
        let mut total: u64 = 0;

        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            total += n as u64;
            if total > max_bytes {
                return Err(JobError::InputTooLarge {
                    limit: max_bytes,
                    received: total,
                });
            }

            if container.is_none() && header.len() < sniff::HEADER_LEN {
                let take = (sniff::HEADER_LEN - header.len()).min(n);
                header.extend_from_slice(&buf[..take]);
                if header.len() == sniff::HEADER_LEN {
                    container = Some(self.classify(&header)?);
                }
            }

            file.write_all(&buf[..n])?;
        }

        if total == 0 {
            return Err(JobError::EmptyInput);
        }
        let container = match container {
            Some(c) => c,
            None => self.classify(&header)?,
        };

        file.flush()?;
        Ok(IngestedInput {
            path: path.to_path_buf(),
            bytes_written: total,
            container,
        })
    }

    fn classify(&self, header: &[u8]) -> Result<AudioContainer> {
        if !self.verify_headers {
            return Ok(AudioContainer::Unchecked);
        }
        sniff::sniff(header).ok_or(JobError::InvalidAudio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::GovernorMetrics;
    use std::io::{self, Cursor};
    use std::time::Duration;

    /// Reader that counts how much has been pulled from it
    struct CountingReader<R> {
        inner: R,
        consumed: u64,
    }

    impl<R: Read> Read for CountingReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.inner.read(buf)?;
            self.consumed += n as u64;
            Ok(n)
        }
    }

    struct FailingReader {
        sent: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.sent {
                self.sent = true;
                buf[..4].copy_from_slice(b"RIFF");
                return Ok(4);
            }
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away"))
        }
    }

    fn gate(chunk: usize) -> (IngestGate, Arc<ScratchLifecycle>) {
        let root = std::env::temp_dir().join(format!("stembox-ingest-{}", uuid::Uuid::new_v4()));
        let metrics = Arc::new(GovernorMetrics::new());
        let scratch =
            Arc::new(ScratchLifecycle::new(root, Duration::from_secs(60), metrics).unwrap());
        (IngestGate::new(chunk, true, Arc::clone(&scratch)), scratch)
    }

    fn wav(len: usize) -> Vec<u8> {
        let mut data = b"RIFF\x00\x00\x00\x00WAVEfmt ".to_vec();
        data.resize(len, 7);
        data
    }

    #[test]
    fn streams_payload_to_scratch() {
        let (gate, scratch) = gate(8192);
        let payload = wav(50_000);
        let ingested = gate
            .stream_to_scratch("job1", Cursor::new(payload.clone()), 100_000, Some("song.wav"))
            .unwrap();

        assert_eq!(ingested.bytes_written, 50_000);
        assert_eq!(ingested.container, AudioContainer::Wave);
        assert!(ingested.path().ends_with("job1/input.wav"));
        assert_eq!(std::fs::read(ingested.path()).unwrap(), payload);
        assert_eq!(scratch.artifacts_for("job1").len(), 1);
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn oversize_stops_early_and_removes_partial() {
        let (gate, scratch) = gate(1024);
        let mut reader = CountingReader {
            inner: Cursor::new(wav(1_000_000)),
            consumed: 0,
        };
        let err = gate
            .stream_to_scratch("job2", &mut reader, 10_000, Some("big.wav"))
            .unwrap_err();

        assert!(matches!(err, JobError::InputTooLarge { limit: 10_000, .. }));
        assert!(reader.consumed <= 10_000 + 1024);
        assert!(!scratch.job_dir("job2").join("input.wav").exists());
        assert!(scratch.artifacts_for("job2").is_empty());
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn exact_limit_is_accepted() {
        let (gate, scratch) = gate(4096);
        let ingested = gate
            .stream_to_scratch("job3", Cursor::new(wav(10_000)), 10_000, None)
            .unwrap();
        assert_eq!(ingested.bytes_written, 10_000);
        assert!(ingested.path().ends_with("input.bin"));
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn empty_stream_is_rejected() {
        let (gate, scratch) = gate(4096);
        let err = gate
            .stream_to_scratch("job4", Cursor::new(Vec::new()), 10_000, Some("a.mp3"))
            .unwrap_err();
        assert!(matches!(err, JobError::EmptyInput));
        assert!(!scratch.job_dir("job4").join("input.mp3").exists());
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn non_audio_is_rejected() {
        let (gate, scratch) = gate(4096);
        let script = Cursor::new(b"#!/bin/sh\necho pwned\n".to_vec());
        let err = gate
            .stream_to_scratch("job5", script, 10_000, Some("a.mp3"))
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidAudio));
        assert!(!scratch.job_dir("job5").join("input.mp3").exists());
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn tiny_chunks_still_sniff_header() {
        let (gate, scratch) = gate(3);
        let flac = Cursor::new(b"fLaC\x00\x00\x00\x22rest-of-file".to_vec());
        let ingested = gate
            .stream_to_scratch("job6", flac, 1_000, Some("x.flac"))
            .unwrap();
        assert_eq!(ingested.container, AudioContainer::Flac);
        let _ = std::fs::remove_dir_all(scratch.root());
    }

    #[test]
    fn reader_failure_surfaces_as_io() {
        let (gate, scratch) = gate(4096);
        let err = gate
            .stream_to_scratch("job7", FailingReader { sent: false }, 10_000, Some("a.wav"))
            .unwrap_err();
        assert!(matches!(err, JobError::Io(_)));
        assert!(!scratch.job_dir("job7").join("input.wav").exists());
        let _ = std::fs::remove_dir_all(scratch.root());
    }
}
