//! Per-instance log capture.
//!
//! Each supervised instance gets a fixed-capacity ring buffer of recent
//! output lines. The sink is constructed explicitly and shared via `Arc`;
//! there is no global instance, so tests stay isolated.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use gamectl_core::now_ms;
use serde::{Deserialize, Serialize};

/// Default ring capacity per instance.
const DEFAULT_CAPACITY: usize = 1000;

/// One captured output line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// The line content, without trailing newline.
    pub line: String,
}

impl LogLine {
    fn new(line: String) -> Self {
        Self {
            timestamp: now_ms(),
            line,
        }
    }
}

/// Ring buffer of recent lines for one instance.
#[derive(Debug)]
struct RingBuffer {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, entry: LogLine) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(entry);
    }
}

/// Log sink holding one rotating buffer per instance, keyed by instance ID.
pub struct LogSink {
    buffers: RwLock<HashMap<String, RingBuffer>>,
    capacity: usize,
}

impl LogSink {
    /// Create a sink with the default per-instance capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a sink with an explicit per-instance capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Append a line to an instance's buffer, rotating out the oldest line
    /// at capacity. Sync so the stdout/stderr reader tasks can call it
    /// without holding the line across an await.
    pub fn push(&self, instance_id: &str, line: &str) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(instance_id.to_string())
            .or_insert_with(|| RingBuffer::new(self.capacity))
            .push(LogLine::new(line.to_string()));
    }

    /// Last `n` lines for an instance, oldest first.
    #[must_use]
    pub fn tail(&self, instance_id: &str, n: usize) -> Vec<LogLine> {
        let buffers = self.buffers.read().unwrap_or_else(|e| e.into_inner());
        buffers.get(instance_id).map_or_else(Vec::new, |buf| {
            let skip = buf.lines.len().saturating_sub(n);
            buf.lines.iter().skip(skip).cloned().collect()
        })
    }

    /// Drop an instance's buffer.
    pub fn clear(&self, instance_id: &str) {
        let mut buffers = self.buffers.write().unwrap_or_else(|e| e.into_inner());
        buffers.remove(instance_id);
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}
