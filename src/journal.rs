//! Append-only JSON-lines risk journal.
//!
//! Records mode transitions, cap-recovery episodes and arbitration outcomes.
//! Replaying the file recovers the episode that was open when the process
//! stopped.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::config::now_ts;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{CapRecoveryEpisode, ExposureSnapshot, Intent, OperatingMode};
use crate::report::{ArbitrationTracker, CapRecoveryTracker, RegimeTransitionLogger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation")]
pub enum JournalEntry {
    #[serde(rename = "mode_transition")]
    ModeTransition {
        ts: u64,
        from: OperatingMode,
        to: OperatingMode,
        reason: String,
        gross_pct: f64,
        equity: f64,
    },
    #[serde(rename = "cap_recovery_open")]
    CapRecoveryOpen { ts: u64, episode: CapRecoveryEpisode },
    #[serde(rename = "cap_recovery_close")]
    CapRecoveryClose {
        ts: u64,
        episode_id: String,
        peak_gross_pct: f64,
        closed_gross_pct: f64,
        duration_secs: u64,
    },
    #[serde(rename = "arbitration")]
    Arbitration {
        ts: u64,
        mode: String,
        gross_pct: f64,
        input: usize,
        output: usize,
        #[serde(default)]
        dropped: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryState {
    pub open_episode: Option<CapRecoveryEpisode>,
    pub last_mode: Option<OperatingMode>,
    pub transitions: usize,
    pub episodes_closed: usize,
    pub arbitrations: usize,
    pub skipped_lines: usize,
}

#[derive(Debug)]
pub struct Journal {
    file: Mutex<File>,
    path: String,
}

impl Journal {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_string(),
        })
    }

    pub fn append_entry(&self, entry: &JournalEntry) -> std::io::Result<()> {
        let line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
        let mut file = self
            .file
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "journal lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }

    pub fn replay(path: &str) -> std::io::Result<Vec<String>> {
        if !Path::new(path).exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(reader.lines().map_while(Result::ok).collect())
    }

    pub fn recover(path: &str) -> std::io::Result<RecoveryState> {
        let mut state = RecoveryState::default();
        for line in Self::replay(path)? {
            if line.trim().is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<JournalEntry>(&line) {
                Ok(e) => e,
                Err(_) => {
                    state.skipped_lines += 1;
                    continue;
                }
            };
            match entry {
                JournalEntry::ModeTransition { to, .. } => {
                    state.transitions += 1;
                    state.last_mode = Some(to);
                }
                JournalEntry::CapRecoveryOpen { episode, .. } => {
                    state.open_episode = Some(episode);
                }
                JournalEntry::CapRecoveryClose { episode_id, .. } => {
                    state.episodes_closed += 1;
                    if state
                        .open_episode
                        .as_ref()
                        .map(|e| e.episode_id == episode_id)
                        .unwrap_or(false)
                    {
                        state.open_episode = None;
                    }
                }
                JournalEntry::Arbitration { .. } => state.arbitrations += 1,
            }
        }
        Ok(state)
    }

    fn write_or_warn(&self, entry: JournalEntry) {
        if let Err(e) = self.append_entry(&entry) {
            log(
                Level::Warn,
                Domain::System,
                "journal_write_failed",
                obj(&[("path", v_str(&self.path)), ("error", v_str(&e.to_string()))]),
            );
        }
    }
}

impl RegimeTransitionLogger for Journal {
    fn record_transition(
        &self,
        from: OperatingMode,
        to: OperatingMode,
        reason: &str,
        exposure: &ExposureSnapshot,
    ) {
        self.write_or_warn(JournalEntry::ModeTransition {
            ts: now_ts(),
            from,
            to,
            reason: reason.to_string(),
            gross_pct: exposure.gross_exposure_pct,
            equity: exposure.equity,
        });
    }
}

impl CapRecoveryTracker for Journal {
    fn episode_opened(&self, episode: &CapRecoveryEpisode) {
        self.write_or_warn(JournalEntry::CapRecoveryOpen {
            ts: now_ts(),
            episode: episode.clone(),
        });
    }

    fn episode_closed(&self, episode: &CapRecoveryEpisode, gross_pct: f64) {
        let ts = now_ts();
        self.write_or_warn(JournalEntry::CapRecoveryClose {
            ts,
            episode_id: episode.episode_id.clone(),
            peak_gross_pct: episode.peak_gross_pct,
            closed_gross_pct: gross_pct,
            duration_secs: ts.saturating_sub(episode.opened_ts),
        });
    }

    fn recovered_episode(&self) -> Option<CapRecoveryEpisode> {
        Self::recover(&self.path).ok().and_then(|s| s.open_episode)
    }
}

impl ArbitrationTracker for Journal {
    fn log_arbitration(&self, input: &[Intent], output: &[Intent], gross_pct: f64, mode: &str) {
        let dropped = input
            .iter()
            .filter(|i| !output.contains(i))
            .map(|i| format!("{}:{}:{}", i.intent_type.as_str(), i.symbol, i.action.as_str()))
            .collect();
        self.write_or_warn(JournalEntry::Arbitration {
            ts: now_ts(),
            mode: mode.to_string(),
            gross_pct,
            input: input.len(),
            output: output.len(),
            dropped,
        });
    }
}
