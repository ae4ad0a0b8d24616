//! Append-only outcome log, one JSON record per line.
//!
//! Appends flush immediately so a crash never loses a finished attempt, and
//! records are never rewritten — resume across process restarts depends on
//! that.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::TerminalCause;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub scenario_id: String,
    /// 1-based attempt number; strictly increasing per scenario id.
    pub attempt: u32,
    pub cause: TerminalCause,
    pub frames: u64,
    pub sim_seconds: f64,
    #[serde(with = "duration_serde")]
    pub wall_time: Duration,
    pub recording: Option<PathBuf>,
    /// Tick retries consumed inside the attempt.
    pub retries_used: u32,
    pub recorded_at: String,
}

impl OutcomeRecord {
    #[must_use]
    pub fn now(scenario_id: &str, attempt: u32, cause: TerminalCause) -> Self {
        Self {
            scenario_id: scenario_id.to_string(),
            attempt,
            cause,
            frames: 0,
            sim_seconds: 0.0,
            wall_time: Duration::ZERO,
            recording: None,
            retries_used: 0,
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

pub struct OutcomeStore {
    path: PathBuf,
    file: File,
    by_scenario: HashMap<String, Vec<OutcomeRecord>>,
}

impl OutcomeStore {
    /// Opens (creating if absent) and replays the existing log. Damaged
    /// lines are warned about and skipped rather than aborting the batch,
    /// matching how a half-written trailing line after a crash should
    /// behave.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut by_scenario: HashMap<String, Vec<OutcomeRecord>> = HashMap::new();
        if path.exists() {
            let reader = BufReader::new(
                File::open(path).with_context(|| format!("opening {}", path.display()))?,
            );
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OutcomeRecord>(&line) {
                    Ok(record) => by_scenario
                        .entry(record.scenario_id.clone())
                        .or_default()
                        .push(record),
                    Err(e) => warn!(
                        "skipping unreadable outcome line {} in {}: {e}",
                        lineno + 1,
                        path.display()
                    ),
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {} for append", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            by_scenario,
        })
    }

    pub fn append(&mut self, record: &OutcomeRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", self.path.display()))?;
        self.file.flush()?;
        self.by_scenario
            .entry(record.scenario_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    /// True when any persisted attempt for this scenario succeeded.
    #[must_use]
    pub fn has_success(&self, scenario_id: &str) -> bool {
        self.by_scenario
            .get(scenario_id)
            .is_some_and(|records| records.iter().any(|r| r.cause.is_success()))
    }

    /// Next 1-based attempt number for this scenario.
    #[must_use]
    pub fn next_attempt(&self, scenario_id: &str) -> u32 {
        self.by_scenario
            .get(scenario_id)
            .and_then(|records| records.iter().map(|r| r.attempt).max())
            .map_or(1, |n| n + 1)
    }

    #[must_use]
    pub fn total_records(&self) -> usize {
        self.by_scenario.values().map(Vec::len).sum()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u128::deserialize(deserializer)?;
        Ok(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
    }
}
