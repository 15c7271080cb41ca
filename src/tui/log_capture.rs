//! Tracing output capture for TUI mode.
//!
//! While the alternate screen is active, log lines go into a shared ring
//! buffer instead of stderr. The debug pane drains it.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Lines kept before the oldest is dropped.
const CAPACITY: usize = 500;

/// Shared ring buffer of log lines.
#[derive(Clone, Default)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        // A poisoned lock must not take logging down with it.
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() >= CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Take every buffered line, oldest first.
    pub fn drain(&self) -> Vec<String> {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.drain(..).collect()
    }
}

/// Per-event writer. Splits on newlines and pushes whole lines.
pub struct LineWriter {
    buffer: LogBuffer,
    partial: Vec<u8>,
}

impl LineWriter {
    fn push_complete_lines(&mut self) {
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.buffer
                .push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.partial.extend_from_slice(buf);
        self.push_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.buffer.push(String::from_utf8_lossy(&rest).into_owned());
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            buffer: self.clone(),
            partial: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let buf = LogBuffer::new();
        for i in 0..CAPACITY + 20 {
            buf.push(format!("line {}", i));
        }
        let lines = buf.drain();
        assert_eq!(lines.len(), CAPACITY);
        assert_eq!(lines[0], "line 20");
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn test_writer_splits_lines_and_flushes_rest_on_drop() {
        let buf = LogBuffer::new();
        {
            let mut writer = buf.make_writer();
            write!(writer, "INFO joined c1\nDEBUG emit ").unwrap();
            assert_eq!(buf.drain(), vec!["INFO joined c1"]);
            write!(writer, "typing").unwrap();
        }
        assert_eq!(buf.drain(), vec!["DEBUG emit typing"]);
    }
}
