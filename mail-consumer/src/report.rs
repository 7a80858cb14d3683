//! Delivery latency report built from the consumer's own log output.
//!
//! Every successful delivery logs
//! `Topic: <topic> | Consumer: <index> | Created: <ms> | Sent: <ms>`.
//! The report groups those lines by topic and consumer and appends one CSV
//! row per group, tagged with a report id kept in a small JSON state file.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const LINE_PATTERN: &str = r"Topic:\s*(?P<topic>[^|]+)\s*\|\s*Consumer:\s*(?P<consumer>[^|]+)\s*\|\s*Created:\s*(?P<created>\d+)\s*\|\s*Sent:\s*(?P<sent>\d+)";

pub const CSV_HEADER: [&str; 6] = [
    "report_id",
    "topic",
    "consumer",
    "total_mails",
    "average_execution_time_(ms)",
    "max_execution_time_(ms)",
];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid state file {path}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write report: {0}")]
    Csv(#[from] csv::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Latency samples (sent - created, in ms) per topic and consumer.
#[derive(Debug, Default)]
pub struct LatencyReport {
    samples: BTreeMap<(String, String), Vec<i64>>,
}

#[derive(Debug, PartialEq, Serialize)]
pub struct ReportRow {
    pub report_id: u64,
    pub topic: String,
    pub consumer: String,
    pub total_mails: usize,
    pub average_ms: String,
    pub max_ms: i64,
}

impl LatencyReport {
    pub fn from_reader<R: BufRead>(reader: R) -> io::Result<Self> {
        let pattern = Regex::new(LINE_PATTERN).map_err(io::Error::other)?;
        let mut report = Self::default();

        for line in reader.lines() {
            let line = line?;
            let Some(captures) = pattern.captures(&line) else {
                continue;
            };
            // \d+ can still overflow, such a line is not a sample
            let (Ok(created), Ok(sent)) = (
                captures["created"].parse::<i64>(),
                captures["sent"].parse::<i64>(),
            ) else {
                continue;
            };
            report
                .samples
                .entry((
                    captures["topic"].trim().to_owned(),
                    captures["consumer"].trim().to_owned(),
                ))
                .or_default()
                .push(sent - created);
        }

        Ok(report)
    }

    pub fn from_file(path: &Path) -> Result<Self, ReportError> {
        let file = fs::File::open(path).map_err(io_error(path))?;
        Self::from_reader(BufReader::new(file)).map_err(io_error(path))
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rows(&self, report_id: u64) -> Vec<ReportRow> {
        self.samples
            .iter()
            .map(|((topic, consumer), times)| {
                let total = times.len();
                let average = times.iter().sum::<i64>() as f64 / total as f64;
                ReportRow {
                    report_id,
                    topic: topic.clone(),
                    consumer: consumer.clone(),
                    total_mails: total,
                    average_ms: format!("{average:.2}"),
                    max_ms: times.iter().copied().max().unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Append this report's rows to `path`, writing the header first when
    /// the file is missing or empty. Returns the number of rows written.
    pub fn append_csv(&self, path: &Path, report_id: u64) -> Result<usize, ReportError> {
        let has_content = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error(path))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if !has_content {
            writer.write_record(CSV_HEADER)?;
        }

        let rows = self.rows(report_id);
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(io_error(path))?;

        Ok(rows.len())
    }
}

/// Persistent counter handing out report ids. Unknown keys in the file are kept.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReportState {
    #[serde(default)]
    pub report_count: u64,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

impl ReportState {
    /// A missing file is a fresh state starting at 0.
    pub fn load(path: &Path) -> Result<Self, ReportError> {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map_err(|source| ReportError::State {
                path: path.to_owned(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(io_error(path)(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ReportError> {
        let content = serde_json::to_string_pretty(self).map_err(|source| ReportError::State {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, content).map_err(io_error(path))
    }

    /// Take the current count as the id and store the next one.
    pub fn next_report_id(path: &Path) -> Result<u64, ReportError> {
        let mut state = Self::load(path)?;
        let report_id = state.report_count;
        state.report_count += 1;
        state.save(path)?;
        Ok(report_id)
    }
}

/// Parse `input`, then allocate a report id and append the rows to `output`.
/// The state is left untouched when the input cannot be read.
pub fn run(input: &Path, output: &Path, state: &Path) -> Result<(u64, usize), ReportError> {
    let report = LatencyReport::from_file(input)?;
    let report_id = ReportState::next_report_id(state)?;
    let rows = report.append_csv(output, report_id)?;
    Ok((report_id, rows))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempfile::TempDir;

    use super::*;

    const LOG: &str = "\
2026-10-19T10:00:00.000Z  INFO consumer{topic=high-priority-mails group=g index=0}: mail_consumer::delivery: Topic: high-priority-mails | Consumer: 0 | Created: 1000 | Sent: 1100
2026-10-19T10:00:00.001Z  WARN consumer{topic=high-priority-mails group=g index=0}: Skipping malformed message: required field to is missing
Topic: high-priority-mails | Consumer: 0 | Created: 2000 | Sent: 2300
Topic: low-priority-mails | Consumer: 3 | Created: 5000 | Sent: 5001
Topic: low-priority-mails | Consumer: 3 | Created: abc | Sent: 5001
";

    #[test]
    fn groups_samples_by_topic_and_consumer() {
        let report = LatencyReport::from_reader(Cursor::new(LOG)).unwrap();

        let rows = report.rows(4);
        assert_eq!(
            rows,
            vec![
                ReportRow {
                    report_id: 4,
                    topic: "high-priority-mails".to_owned(),
                    consumer: "0".to_owned(),
                    total_mails: 2,
                    average_ms: "200.00".to_owned(),
                    max_ms: 300,
                },
                ReportRow {
                    report_id: 4,
                    topic: "low-priority-mails".to_owned(),
                    consumer: "3".to_owned(),
                    total_mails: 1,
                    average_ms: "1.00".to_owned(),
                    max_ms: 1,
                },
            ]
        );
    }

    #[test]
    fn header_is_written_once() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("log_report.csv");
        let report = LatencyReport::from_reader(Cursor::new(LOG)).unwrap();

        assert_eq!(report.append_csv(&output, 0).unwrap(), 2);
        assert_eq!(report.append_csv(&output, 1).unwrap(), 2);

        let content = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[0],
            "report_id,topic,consumer,total_mails,average_execution_time_(ms),max_execution_time_(ms)"
        );
        assert_eq!(lines[1], "0,high-priority-mails,0,2,200.00,300");
        assert_eq!(lines[4], "1,low-priority-mails,3,1,1.00,1");
    }

    #[test]
    fn empty_output_file_gets_a_header() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("log_report.csv");
        fs::write(&output, "").unwrap();

        let report = LatencyReport::from_reader(Cursor::new(LOG)).unwrap();
        report.append_csv(&output, 0).unwrap();

        let content = fs::read_to_string(&output).unwrap();
        assert!(content.starts_with("report_id,"));
    }

    #[test]
    fn report_ids_advance_and_keep_other_keys() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state.json");

        assert_eq!(ReportState::next_report_id(&state).unwrap(), 0);
        assert_eq!(ReportState::next_report_id(&state).unwrap(), 1);

        fs::write(&state, r#"{"report_count": 7, "owner": "ops"}"#).unwrap();
        assert_eq!(ReportState::next_report_id(&state).unwrap(), 7);

        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&state).unwrap()).unwrap();
        assert_eq!(saved["report_count"], 8);
        assert_eq!(saved["owner"], "ops");
    }

    #[test]
    fn missing_input_leaves_state_alone() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state.json");
        let output = dir.path().join("log_report.csv");
        fs::write(&state, r#"{"report_count": 3}"#).unwrap();

        let err = run(&dir.path().join("missing.log"), &output, &state).unwrap_err();

        assert!(matches!(err, ReportError::Io { .. }));
        assert_eq!(ReportState::load(&state).unwrap().report_count, 3);
        assert!(!output.exists());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state.json");
        fs::write(&state, "not json").unwrap();

        assert!(matches!(
            ReportState::load(&state),
            Err(ReportError::State { .. })
        ));
    }
}
