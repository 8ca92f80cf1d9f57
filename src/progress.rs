//! Merge progress reporting.
//!
//! Long snapshots emit a progress event every `merge.progress_every`
//! records. Reporting is advisory: it never influences what is written.
//! Human and JSON reporters write to **stderr** so stdout stays parseable;
//! the collector uses [`TracingProgress`] so events land in the server log.

use std::io::Write;

/// A single progress event for one snapshot merge.
#[derive(Clone, Debug)]
pub enum MergeProgressEvent {
    /// `n` of `total` records attempted so far.
    Merging {
        snapshot: String,
        n: u64,
        total: u64,
    },
    /// The batch committed.
    Committed {
        snapshot: String,
        inserted: u64,
        skipped: u64,
    },
}

pub trait MergeProgressReporter: Send + Sync {
    fn report(&self, event: MergeProgressEvent);
}

/// Human-friendly progress on stderr: "merge home.db  1,234 / 5,000 records".
pub struct StderrProgress;

impl MergeProgressReporter for StderrProgress {
    fn report(&self, event: MergeProgressEvent) {
        let line = match &event {
            MergeProgressEvent::Merging { snapshot, n, total } => format!(
                "\rmerge {}  {} / {} records",
                snapshot,
                format_number(*n),
                format_number(*total)
            ),
            MergeProgressEvent::Committed {
                snapshot,
                inserted,
                skipped,
            } => format!(
                "\rmerge {}  committed  {} new, {} already known\n",
                snapshot,
                format_number(*inserted),
                format_number(*skipped)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl MergeProgressReporter for JsonProgress {
    fn report(&self, event: MergeProgressEvent) {
        let obj = match &event {
            MergeProgressEvent::Merging { snapshot, n, total } => serde_json::json!({
                "event": "progress",
                "snapshot": snapshot,
                "phase": "merging",
                "n": n,
                "total": total
            }),
            MergeProgressEvent::Committed {
                snapshot,
                inserted,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "snapshot": snapshot,
                "phase": "committed",
                "inserted": inserted,
                "skipped": skipped
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// Routes events into the `tracing` log.
pub struct TracingProgress;

impl MergeProgressReporter for TracingProgress {
    fn report(&self, event: MergeProgressEvent) {
        match event {
            MergeProgressEvent::Merging { snapshot, n, total } => {
                tracing::debug!(%snapshot, n, total, "merging");
            }
            MergeProgressEvent::Committed {
                snapshot,
                inserted,
                skipped,
            } => {
                tracing::info!(%snapshot, inserted, skipped, "merge committed");
            }
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl MergeProgressReporter for NoProgress {
    fn report(&self, _event: MergeProgressEvent) {}
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

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
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

    pub fn reporter(&self) -> Box<dyn MergeProgressReporter> {
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
