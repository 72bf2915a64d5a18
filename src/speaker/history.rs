//! Speech history and reporting.
//!
//! Stores one JSON line per finished utterance in
//! `<dir>/{date}-speech.jsonl`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::controller::{Source, UtteranceState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub timestamp: String,
    pub submitted_at: String,
    pub utterance: u64,
    pub source: Source,
    pub chars: usize,
    pub state: UtteranceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub playback_ms: i64,
    pub voice: Option<String>,
    pub rate: u32,
}

/// Append-only daily history files under one directory.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    dir: PathBuf,
}

impl HistoryLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file(&self, date: &str) -> PathBuf {
        let date = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };
        self.dir.join(format!("{date}-speech.jsonl"))
    }

    /// Append a record to today's file. Failures are logged, never raised.
    pub fn append(&self, record: &SpeechRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!("Failed to create speech history dir: {e}");
            return;
        }

        let path = self.file("today");
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Failed to open speech history file: {e}");
                return;
            }
        };

        match serde_json::to_string(record) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!("Failed to write speech history record: {e}");
                }
            }
            Err(e) => warn!("Failed to serialize speech record: {e}"),
        }
    }

    pub fn load(&self, date: &str) -> Vec<SpeechRecord> {
        let contents = match fs::read_to_string(self.file(date)) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping malformed history line: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dates with history, newest first.
    pub fn dates(&self) -> Vec<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };

        let mut dates: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix("-speech.jsonl").map(str::to_string)
            })
            .collect();
        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Markdown summary of one day.
    pub fn report(&self, date: &str) -> String {
        let records = self.load(date);
        let display_date = if date == "today" {
            Local::now().format("%Y-%m-%d").to_string()
        } else {
            date.to_string()
        };

        if records.is_empty() {
            return format!("# Speech Report - {display_date}\n\nNo utterances recorded.");
        }

        let total = records.len();
        let count = |state: UtteranceState| records.iter().filter(|r| r.state == state).count();
        let completed: Vec<&SpeechRecord> = records
            .iter()
            .filter(|r| r.state == UtteranceState::Completed)
            .collect();
        let avg_playback = if completed.is_empty() {
            0.0
        } else {
            completed.iter().map(|r| r.playback_ms as f64).sum::<f64>() / completed.len() as f64
        };
        let total_chars: usize = records.iter().map(|r| r.chars).sum();

        let mut sources: BTreeMap<String, usize> = BTreeMap::new();
        for r in &records {
            let name = serde_json::to_value(r.source)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *sources.entry(name).or_insert(0) += 1;
        }

        let mut report = format!(
            "# Speech Report - {display_date}\n\n\
            ## Summary\n\
            - Utterances: {total}\n\
            - Completed: {}\n\
            - Cancelled: {}\n\
            - Failed: {}\n\
            - Characters: {total_chars}\n\
            - Avg playback (completed): {avg_playback:.0}ms\n\n\
            ## Sources\n",
            count(UtteranceState::Completed),
            count(UtteranceState::Cancelled),
            count(UtteranceState::Failed),
        );
        for (source, n) in &sources {
            report.push_str(&format!("- {source}: {n}\n"));
        }

        let failures: Vec<&SpeechRecord> = records
            .iter()
            .filter(|r| r.state == UtteranceState::Failed)
            .collect();
        if !failures.is_empty() {
            report.push_str("\n## Failures\n");
            for r in failures {
                let time = r.timestamp.get(11..19).unwrap_or(&r.timestamp);
                report.push_str(&format!(
                    "- {time} u{}: {}\n",
                    r.utterance,
                    r.detail.as_deref().unwrap_or("unknown error")
                ));
            }
        }

        report
    }
}
