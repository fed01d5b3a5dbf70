//! Output handling for supervised processes.
//!
//! This module classifies child output lines (`HealthClassifier`), keeps a
//! bounded tail of recent output per service (`LogBuffer`) and sanitizes text
//! before it is matched or shown.

use std::collections::VecDeque;

use strip_ansi_escapes::strip;

/// Substrings that mean the child cannot serve requests.
pub const DEFAULT_CRITICAL_PATTERNS: [&str; 2] = ["EADDRINUSE", "address already in use"];

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Standard Output.
    Stdout,
    /// Standard Error.
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    /// Log level the line is reported with; anything on stderr is an error.
    pub fn level(self) -> &'static str {
        match self {
            StreamKind::Stdout => "info",
            StreamKind::Stderr => "error",
        }
    }
}

/// A single line of log output from a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// The content of the log line.
    pub text: String,
    /// The stream it originated from (stdout/stderr).
    pub stream: StreamKind,
}

/// A fixed-capacity ring buffer for storing `LogLine`s.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    max_lines: usize,
    lines: VecDeque<LogLine>,
}

impl LogBuffer {
    /// Creates a new `LogBuffer` with the specified maximum capacity.
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            lines: VecDeque::with_capacity(max_lines.min(1024)),
        }
    }

    /// Adds a line to the buffer.
    ///
    /// Returns `true` if an old line was dropped to make room.
    pub fn push(&mut self, line: LogLine) -> bool {
        let mut dropped = false;
        self.lines.push_back(line);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            dropped = true;
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Returns an iterator over the lines in the buffer.
    pub fn iter(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter()
    }
}

/// Removes ANSI escape codes. Invalid UTF-8 sequences are replaced.
pub fn sanitize_text(text: &str) -> String {
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}

/// What a single output line says about the health of the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    /// The success marker: the service is up.
    Ready,
    /// A fatal condition; carries the matched pattern.
    Critical(String),
    /// Error-level output that does not by itself stop the service.
    Error,
    /// Ordinary output.
    Info,
}

/// Maps output lines to health signals, so the detection strings can change
/// without touching the supervisor.
pub trait HealthClassifier: Send + Sync {
    fn classify(&self, stream: StreamKind, line: &str) -> LineClass;
}

/// Exact-substring classifier: one success marker on stdout plus a fixed set
/// of critical patterns on either stream.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    success_marker: String,
    critical_patterns: Vec<String>,
}

impl MarkerClassifier {
    pub fn new(success_marker: impl Into<String>) -> Self {
        Self {
            success_marker: success_marker.into(),
            critical_patterns: DEFAULT_CRITICAL_PATTERNS
                .iter()
                .map(|pattern| pattern.to_string())
                .collect(),
        }
    }

    pub fn with_critical_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

impl HealthClassifier for MarkerClassifier {
    fn classify(&self, stream: StreamKind, line: &str) -> LineClass {
        let text = sanitize_text(line);
        if let Some(pattern) = self
            .critical_patterns
            .iter()
            .find(|pattern| text.contains(pattern.as_str()))
        {
            return LineClass::Critical(pattern.clone());
        }
        match stream {
            StreamKind::Stdout if text.contains(&self.success_marker) => LineClass::Ready,
            StreamKind::Stdout => LineClass::Info,
            StreamKind::Stderr => LineClass::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_drops_oldest() {
        let mut buffer = LogBuffer::new(2);
        for text in ["a", "b"] {
            buffer.push(LogLine {
                text: text.into(),
                stream: StreamKind::Stdout,
            });
        }
        let dropped = buffer.push(LogLine {
            text: "c".into(),
            stream: StreamKind::Stderr,
        });
        assert!(dropped);
        let lines = buffer.iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(lines, vec!["b", "c"]);
    }

    #[test]
    fn classifies_marker_and_critical_lines() {
        let classifier = MarkerClassifier::new("Ready in");
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "\u{1b}[32m✓\u{1b}[39m Ready in 812ms"),
            LineClass::Ready
        );
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "Error: listen EADDRINUSE: :::3002"),
            LineClass::Critical("EADDRINUSE".to_string())
        );
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "bind: address already in use"),
            LineClass::Critical("address already in use".to_string())
        );
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "Ready in 10ms"),
            LineClass::Error
        );
        assert_eq!(classifier.classify(StreamKind::Stdout, "compiling"), LineClass::Info);
    }

    #[test]
    fn custom_critical_patterns_replace_defaults() {
        let classifier = MarkerClassifier::new("up").with_critical_patterns(["panic"]);
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "EADDRINUSE"),
            LineClass::Info
        );
        assert_eq!(
            classifier.classify(StreamKind::Stdout, "thread panicked"),
            LineClass::Critical("panic".to_string())
        );
        assert_eq!(classifier.classify(StreamKind::Stdout, "up"), LineClass::Ready);
    }
}
