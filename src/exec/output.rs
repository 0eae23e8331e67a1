//! Bounded stream collection for child diagnostics
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// Keeps only the last `limit` bytes written to it
#[derive(Debug, Clone)]
pub struct TailBuffer {
    data: VecDeque<u8>,
    limit: usize,
    total_bytes: u64,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(limit.min(READ_CHUNK)),
            limit,
            total_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;
        let keep = &chunk[chunk.len().saturating_sub(self.limit)..];
        let overflow = (self.data.len() + keep.len()).saturating_sub(self.limit);
        self.data.drain(..overflow);
        self.data.extend(keep);
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn truncated(&self) -> bool {
        self.total_bytes > self.data.len() as u64
    }

    /// Lossy UTF-8 tail, prefixed with a marker when earlier output was dropped
    pub fn excerpt(&self) -> String {
        let (front, back) = self.data.as_slices();
        let mut bytes = Vec::with_capacity(self.data.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        let text = String::from_utf8_lossy(&bytes);
        let text = text.trim();
        if self.truncated() {
            format!(
                "[{} earlier bytes omitted] {}",
                self.total_bytes - self.data.len() as u64,
                text
            )
        } else {
            text.to_string()
        }
    }
}

/// Tail of a child stream gathered on a reader thread. The buffer is shared
/// so a partial excerpt stays available when the stream never reaches EOF,
/// which happens when an escaped descendant inherits the write end.
pub struct TailCollector {
    tail: Arc<Mutex<TailBuffer>>,
    done: Receiver<()>,
}

impl TailCollector {
    /// Drain `stream` on its own thread until EOF, keeping the tail
    pub fn spawn<R>(mut stream: R, limit: usize) -> Self
    where
        R: Read + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(TailBuffer::new(limit)));
        let (finished, done) = bounded::<()>(1);
        let shared = Arc::clone(&tail);
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => shared
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(&buf[..n]),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = finished.send(());
        });
        Self { tail, done }
    }

    /// Wait at most `timeout` for EOF. Returns what was gathered and whether
    /// the stream closed; on `false` the reader thread is left detached.
    pub fn finish(self, timeout: Duration) -> (TailBuffer, bool) {
        let closed = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        let tail = self
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        (tail, closed)
    }
}
