//! Fetch progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable; `loom fetch`
//! prints its summary JSON on stdout.

use std::io::Write;

use threadloom_core::fetch::{FetchProgressEvent, FetchProgressReporter, NoProgress};

/// Human-friendly progress on stderr: "fetch github  processing  12 / 1,000 threads".
pub struct StderrProgress;

impl FetchProgressReporter for StderrProgress {
    fn report(&self, event: FetchProgressEvent) {
        let line = match &event {
            FetchProgressEvent::Searching { source, query } => {
                format!("fetch {}  searching  {}\n", source, query)
            }
            FetchProgressEvent::Found { source, count } => {
                format!("fetch {}  found {} matches\n", source, format_number(*count as u64))
            }
            FetchProgressEvent::Processing { source, n, total } => format!(
                "fetch {}  processing  {} / {} threads\n",
                source,
                format_number(*n as u64),
                format_number(*total as u64)
            ),
            FetchProgressEvent::Stopped { source, reason } => {
                format!("fetch {}  stopped: {}\n", source, reason)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl FetchProgressReporter for JsonProgress {
    fn report(&self, event: FetchProgressEvent) {
        let obj = match &event {
            FetchProgressEvent::Searching { source, query } => serde_json::json!({
                "event": "progress",
                "source": source.as_str(),
                "phase": "searching",
                "query": query
            }),
            FetchProgressEvent::Found { source, count } => serde_json::json!({
                "event": "progress",
                "source": source.as_str(),
                "phase": "found",
                "total": count
            }),
            FetchProgressEvent::Processing { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source.as_str(),
                "phase": "processing",
                "n": n,
                "total": total
            }),
            FetchProgressEvent::Stopped { source, reason } => serde_json::json!({
                "event": "stopped",
                "source": source.as_str(),
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn FetchProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
