//! Bounded capture of a child's stdout/stderr

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Keeps the most recent lines written by a process
///
/// Older lines are discarded once `capacity` is reached; the number of
/// discarded lines is reported in [`LogBuffer::render`].
pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    lines: VecDeque<String>,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, line: String) {
        let mut inner = self.lock();
        if inner.lines.len() == self.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line);
    }

    /// Captured lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.iter().cloned().collect()
    }

    /// Lines discarded because the buffer was full
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    /// Captured output as one string, ready to attach to an error
    pub fn render(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        if inner.dropped > 0 {
            out.push_str(&format!("... {} earlier lines dropped\n", inner.dropped));
        }
        for line in &inner.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// Copy lines from `reader` into `buffer` until EOF
///
/// Each line is prefixed with `label` (`stdout` or `stderr`).
pub fn capture<R>(reader: R, label: &'static str, buffer: Arc<LogBuffer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => buffer.push(format!("[{}] {}", label, line)),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stream = label, "Stopped reading process output: {}", e);
                    break;
                }
            }
        }
    })
}
