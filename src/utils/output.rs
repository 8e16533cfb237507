/// Bounded output collection
///
/// Child stdout/stderr are drained on reader threads. Everything past the cap
/// is read and discarded so a chatty program never blocks on a full pipe, and
/// the capture records how many bytes the stream produced in total.
use crate::config::types::CapturedOutput;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Size-capped byte accumulator
#[derive(Debug, Clone)]
pub struct BoundedCapture {
    limit: usize,
    data: Vec<u8>,
    total: u64,
}

impl BoundedCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            data: self.data.clone(),
            truncated: self.is_truncated(),
            total_bytes: self.total,
        }
    }

    pub fn finish(self) -> CapturedOutput {
        let truncated = self.is_truncated();
        CapturedOutput {
            data: self.data,
            truncated,
            total_bytes: self.total,
        }
    }
}

/// Cap an in-memory buffer the same way a stream capture would
pub fn capture_bytes(bytes: &[u8], limit: usize) -> CapturedOutput {
    let mut capture = BoundedCapture::new(limit);
    capture.push(bytes);
    capture.finish()
}

/// Cut text to at most `max_bytes`, backing off to a char boundary.
/// Returns the kept text and whether anything was cut.
pub fn truncate_text(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

struct StreamReader {
    buffer: Arc<Mutex<BoundedCapture>>,
    done: Receiver<()>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(mut stream: R, limit: usize) -> Self {
        let buffer = Arc::new(Mutex::new(BoundedCapture::new(limit)));
        let (tx, done) = bounded(1);
        let shared = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut capture) = shared.lock() {
                            capture.push(&chunk[..n]);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("output reader stopped: {}", e);
                        break;
                    }
                }
            }
            let _ = tx.send(());
        });
        Self { buffer, done }
    }

    /// Wait until the stream reaches EOF or the deadline passes. Returns the
    /// capture and whether EOF was seen.
    fn collect(self, deadline: Instant) -> (CapturedOutput, bool) {
        let wait = deadline.saturating_duration_since(Instant::now());
        let closed = match self.done.recv_timeout(wait) {
            Ok(()) => true,
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };
        let output = match self.buffer.lock() {
            Ok(capture) => capture.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        };
        (output, closed)
    }
}

/// Collected stdout/stderr of one process
#[derive(Debug, Clone, Default)]
pub struct OutputResult {
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// A stream was still open after the process exited: some descendant
    /// outlived it while holding the pipe.
    pub streams_left_open: bool,
}

/// Output collector for a spawned child
pub struct OutputCollector {
    stdout: Option<StreamReader>,
    stderr: Option<StreamReader>,
}

impl OutputCollector {
    /// Start draining the given streams, each capped at `limit` bytes
    pub fn start<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        Self {
            stdout: stdout.map(|s| StreamReader::spawn(s, limit)),
            stderr: stderr.map(|s| StreamReader::spawn(s, limit)),
        }
    }

    /// Gather both captures, waiting at most `grace` for the pipes to close
    pub fn finish(self, grace: Duration) -> OutputResult {
        let deadline = Instant::now() + grace;
        let mut result = OutputResult::default();
        if let Some(reader) = self.stdout {
            let (out, closed) = reader.collect(deadline);
            result.stdout = out;
            result.streams_left_open |= !closed;
        }
        if let Some(reader) = self.stderr {
            let (out, closed) = reader.collect(deadline);
            result.stderr = out;
            result.streams_left_open |= !closed;
        }
        result
    }
}
