//! Output formatters for emitted events.
//!
//! Supports human-readable (with colors) and NDJSON formats.

use std::io::{self, Write};

use chrono::{DateTime, Utc};

use crate::dedup::WindowReport;
use crate::models::{DedupEvent, JsonEvent};

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[96m";
const YELLOW: &str = "\x1b[93m";
const RED: &str = "\x1b[91m";

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Newline-delimited JSON, the event exactly as received (default)
    #[default]
    Ndjson,
    /// Human-readable terminal output
    Human,
}

impl std::str::FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ndjson" => Ok(Self::Ndjson),
            "human" => Ok(Self::Human),
            _ => Err(format!("unknown format: {s} (expected: ndjson, human)")),
        }
    }
}

/// Render one event as a single output line (no trailing newline).
#[must_use]
pub fn render(event: &JsonEvent, format: Format) -> String {
    match format {
        Format::Ndjson => event.value().to_string(),
        Format::Human => render_human(event),
    }
}

fn render_human(event: &JsonEvent) -> String {
    let time = event
        .timestamp_ms()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map_or_else(|| "unknown".into(), |t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string());
    let key = event
        .dedup_key()
        .map_or_else(|_| "?".into(), |k| k.to_string());

    format!("{DIM}{time} UTC{RESET} │ {CYAN}{BOLD}{key}{RESET} │ {}", event.value())
}

/// Write rendered lines, one per line.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_lines<W: Write>(writer: &mut W, lines: &[String]) -> io::Result<()> {
    for line in lines {
        writeln!(writer, "{line}")?;
    }
    Ok(())
}

/// Write a window summary in human-readable form.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_report<W: Write>(writer: &mut W, report: &WindowReport) -> io::Result<()> {
    let window = report
        .window
        .map_or_else(|| "-".into(), |w| w.to_string());
    let s = &report.stats;
    let mut pending = String::new();
    if s.awaiting > 0 {
        pending.push_str(&format!(" │ {YELLOW}{} awaiting{RESET}", s.awaiting));
    }
    if !report.stalled.is_empty() {
        pending.push_str(&format!(" │ {RED}{} unreadable{RESET}", report.stalled.len()));
    }

    writeln!(
        writer,
        "{BOLD}window {window}{RESET} │ {} in │ {} out │ {} dupes │ {} late │ \
         {} malformed │ {DIM}{} resident{RESET}{pending}",
        s.processed,
        s.emitted,
        s.duplicates,
        s.late,
        s.malformed,
        report.buckets.resident
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::dedup::DedupStats;
    use crate::manager::ManagerStats;
    use crate::models::KeySpec;

    fn event() -> JsonEvent {
        let spec = Arc::new(KeySpec::new(vec!["id".into()], "ts").unwrap());
        JsonEvent::new(json!({"id": "abc", "ts": 1_000}), spec)
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("ndjson".parse::<Format>().unwrap(), Format::Ndjson);
        assert_eq!("HUMAN".parse::<Format>().unwrap(), Format::Human);
        assert!("json".parse::<Format>().is_err());
    }

    #[test]
    fn test_ndjson_is_the_event_verbatim() {
        let line = render(&event(), Format::Ndjson);
        let back: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(back, json!({"id": "abc", "ts": 1_000}));
    }

    #[test]
    fn test_human_shows_time_and_key() {
        let line = render(&event(), Format::Human);
        assert!(line.contains("1970-01-01 00:00:01.000 UTC"));
        assert!(line.contains("abc"));
    }

    #[test]
    fn test_report_flags_unreadable_buckets() {
        let report = WindowReport {
            window: Some(3),
            stats: DedupStats {
                processed: 4,
                awaiting: 2,
                ..Default::default()
            },
            buckets: ManagerStats::default(),
            stalled: vec![7],
        };
        let mut buf = Vec::new();
        write_report(&mut buf, &report).unwrap();

        let line = String::from_utf8(buf).unwrap();
        assert!(line.contains("window 3"));
        assert!(line.contains("2 awaiting"));
        assert!(line.contains("1 unreadable"));
    }

    #[test]
    fn test_write_lines() {
        let mut buf = Vec::new();
        write_lines(&mut buf, &["a".into(), "b".into()]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "a\nb\n");
    }
}
