//! Supervised-child subsystem: lifecycle state, stderr capture, the stdio
//! JSON-RPC multiplexer, SSE stream sessions, and the health monitor.

pub mod monitor;
pub mod mux;
pub mod sse;
pub mod supervisor;

use std::collections::VecDeque;

/// Lifecycle state of a supervised child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Error,
    Restarting,
}

impl ServerState {
    /// Value exported on the `fluidmcp_server_status` gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            ServerState::Stopped => 0.0,
            ServerState::Starting => 1.0,
            ServerState::Running => 2.0,
            ServerState::Error => 3.0,
            ServerState::Restarting => 4.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Error => "error",
            ServerState::Restarting => "restarting",
        }
    }
}

/// Rolling buffer for per-child stderr output, for diagnostics.
///
/// Lines are scanned for configured markers (e.g. "cuda out of memory") as
/// they arrive, so a marker is remembered even after its line scrolls out.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    marker_seen: bool,
}

impl StderrBuffer {
    /// Create a new stderr buffer with the given line capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
            marker_seen: false,
        }
    }

    /// Push a new stderr line, evicting the oldest if at capacity, and scan
    /// it for the configured markers (case-insensitive substring match).
    pub fn push(&mut self, line: String, markers: &[String]) {
        if !self.marker_seen {
            let lowered = line.to_lowercase();
            if markers.iter().any(|m| lowered.contains(&m.to_lowercase())) {
                self.marker_seen = true;
            }
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Whether any configured marker has ever matched.
    pub fn marker_seen(&self) -> bool {
        self.marker_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_gauge_values() {
        assert_eq!(ServerState::Stopped.gauge_value(), 0.0);
        assert_eq!(ServerState::Starting.gauge_value(), 1.0);
        assert_eq!(ServerState::Running.gauge_value(), 2.0);
        assert_eq!(ServerState::Error.gauge_value(), 3.0);
        assert_eq!(ServerState::Restarting.gauge_value(), 4.0);
    }

    #[test]
    fn test_stderr_buffer_capacity() {
        let mut buf = StderrBuffer::new(3);
        let markers = vec![];
        buf.push("line1".to_string(), &markers);
        buf.push("line2".to_string(), &markers);
        buf.push("line3".to_string(), &markers);
        buf.push("line4".to_string(), &markers); // evicts "line1"
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.tail(10), vec!["line2", "line3", "line4"]);
    }

    #[test]
    fn test_stderr_tail_subset() {
        let mut buf = StderrBuffer::new(10);
        for i in 0..5 {
            buf.push(format!("line{i}"), &[]);
        }
        assert_eq!(buf.tail(2), vec!["line3", "line4"]);
    }

    #[test]
    fn test_marker_scan_case_insensitive() {
        let markers = vec!["CUDA out of memory".to_string()];
        let mut buf = StderrBuffer::new(2);
        buf.push("loading weights".to_string(), &markers);
        assert!(!buf.marker_seen());
        buf.push("RuntimeError: cuda OUT OF MEMORY on device 0".to_string(), &markers);
        assert!(buf.marker_seen());
        // Marker memory survives the line scrolling out of the ring.
        buf.push("a".to_string(), &markers);
        buf.push("b".to_string(), &markers);
        assert!(buf.marker_seen());
    }
}
