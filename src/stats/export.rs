//! Semicolon-delimited CSV export of recorded samples and per-host summaries.

use std::borrow::Cow;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Local;
use thiserror::Error;

use super::history::Sample;
use super::StatsSnapshot;
use crate::probe::Target;

/// Export error types.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to write export: {0}")]
    Io(#[from] std::io::Error),
    #[error("there is no data to export")]
    Empty,
}

/// One row of a multi-target summary.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub target: Target,
    pub status: String,
    pub snapshot: StatsSnapshot,
}

/// Write `Timestamp;Latency (ms)` rows, `Failed` for lost probes.
pub fn write_history_csv<W: Write>(mut writer: W, samples: &[Sample]) -> Result<(), ExportError> {
    writeln!(writer, "Timestamp;Latency (ms)")?;
    for sample in samples {
        let time = sample.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
        match sample.latency_ms {
            Some(ms) => writeln!(writer, "{};{:.1}", time, ms)?,
            None => writeln!(writer, "{};Failed", time)?,
        }
    }
    writer.flush()?;
    Ok(())
}

/// Write `Host;Status;Latency (ms);Loss (%)` rows using the last latency.
pub fn write_summary_csv<W: Write>(mut writer: W, rows: &[SummaryRow]) -> Result<(), ExportError> {
    writeln!(writer, "Host;Status;Latency (ms);Loss (%)")?;
    for row in rows {
        let latency = row
            .snapshot
            .last_ms
            .map_or_else(|| "-".to_string(), |ms| format!("{:.2}", ms));
        writeln!(
            writer,
            "{};{};{};{:.1}",
            field(row.target.as_str()),
            field(&row.status),
            latency,
            row.snapshot.loss_pct
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a sample history to `path`, refusing to create an empty file.
pub fn export_history<P: AsRef<Path>>(path: P, samples: &[Sample]) -> Result<(), ExportError> {
    if samples.is_empty() {
        return Err(ExportError::Empty);
    }
    let file = File::create(path)?;
    write_history_csv(BufWriter::new(file), samples)
}

/// Write a multi-target summary to `path`.
pub fn export_summary<P: AsRef<Path>>(path: P, rows: &[SummaryRow]) -> Result<(), ExportError> {
    if rows.is_empty() {
        return Err(ExportError::Empty);
    }
    let file = File::create(path)?;
    write_summary_csv(BufWriter::new(file), rows)
}

/// Quote a field that would break the row.
fn field(value: &str) -> Cow<'_, str> {
    if value.contains([';', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn snapshot(last_ms: Option<f64>, loss_pct: f64) -> StatsSnapshot {
        StatsSnapshot {
            sent: 2,
            received: 1,
            loss_pct,
            min_ms: last_ms,
            max_ms: last_ms,
            mean_ms: last_ms,
            last_ms,
            p50_ms: last_ms,
            p95_ms: last_ms,
        }
    }

    #[test]
    fn test_history_csv() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        let samples = vec![
            Sample {
                timestamp: ts,
                seq: 1,
                latency_ms: None,
            },
            Sample {
                timestamp: ts,
                seq: 2,
                latency_ms: Some(23.44),
            },
        ];

        let mut out = Vec::new();
        write_history_csv(&mut out, &samples).unwrap();
        let text = String::from_utf8(out).unwrap();

        let local = ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        let expected = format!("Timestamp;Latency (ms)\n{local};Failed\n{local};23.4\n");
        assert_eq!(text, expected);
    }

    #[test]
    fn test_summary_csv() {
        let rows = vec![
            SummaryRow {
                target: Target::from("10.0.0.1"),
                status: "Success".into(),
                snapshot: snapshot(Some(12.345), 50.0),
            },
            SummaryRow {
                target: Target::from("odd;name"),
                status: "Host not found".into(),
                snapshot: snapshot(None, 100.0),
            },
        ];

        let mut out = Vec::new();
        write_summary_csv(&mut out, &rows).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Host;Status;Latency (ms);Loss (%)");
        assert_eq!(lines[1], "10.0.0.1;Success;12.35;50.0");
        assert_eq!(lines[2], "\"odd;name\";Host not found;-;100.0");
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ping_data.csv");

        assert!(matches!(export_history(&path, &[]), Err(ExportError::Empty)));
        assert!(!path.exists());

        let samples = vec![Sample {
            timestamp: Utc::now(),
            seq: 1,
            latency_ms: Some(1.0),
        }];
        export_history(&path, &samples).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Timestamp;Latency (ms)\n"));
        assert!(text.trim_end().ends_with(";1.0"));
    }
}
