//! Archive and conversion progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts, and
//! is independent of `tracing` output: logs explain, progress counts.

use std::io::Write;

/// Phase of a run, as shown in JSON output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Listing channels and users. Total unknown.
    Listing,
    /// Streaming logical units from the API.
    Archiving,
    /// Re-emitting channels into another format.
    Converting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Listing => "listing",
            Phase::Archiving => "archiving",
            Phase::Converting => "converting",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Listing { what: &'static str },
    /// One unit finished; `n` of `total` done.
    UnitDone {
        phase: Phase,
        unit: String,
        messages: u64,
        n: u64,
        total: u64,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress: `archiving  C0123  12 / 40 units  (318 messages)`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Listing { what } => format!("listing {}...\n", what),
            ProgressEvent::UnitDone {
                phase,
                unit,
                messages,
                n,
                total,
            } => format!(
                "{}  {}  {} / {} units  ({} messages)\n",
                phase.as_str(),
                unit,
                format_number(*n),
                format_number(*total),
                format_number(*messages)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Listing { what } => serde_json::json!({
                "event": "progress",
                "phase": Phase::Listing.as_str(),
                "what": what,
            }),
            ProgressEvent::UnitDone {
                phase,
                unit,
                messages,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": phase.as_str(),
                "unit": unit,
                "messages": messages,
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human, or JSON.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
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

    #[test]
    fn phase_names() {
        assert_eq!(Phase::Archiving.as_str(), "archiving");
        assert_eq!(Phase::Converting.as_str(), "converting");
    }
}
