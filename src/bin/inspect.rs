//! Dump the engine's mirrored state.
//!
//! Usage:
//!   riskbrain-inspect [--all] [--journal]
//!
//! Reads STATE_DB_PATH (and JOURNAL_PATH with --journal) the same way the
//! engine does and prints one JSON document to stdout.

use anyhow::Result;
use serde_json::{json, Map, Value};

use riskbrain::config::Config;
use riskbrain::engine::{DECISION_KEY, EXPOSURE_KEY, SESSION_KEY};
use riskbrain::journal::Journal;
use riskbrain::storage::SqliteStateStore;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let all = args.iter().any(|a| a == "--all");
    let with_journal = args.iter().any(|a| a == "--journal");

    let cfg = Config::from_env();
    let store = SqliteStateStore::new(&cfg.state_db_path)?;
    store.init()?;

    let keys: Vec<String> = if all {
        store.keys()?
    } else {
        [DECISION_KEY, EXPOSURE_KEY, SESSION_KEY]
            .iter()
            .map(|k| k.to_string())
            .collect()
    };

    let mut state = Map::new();
    for key in keys {
        let entry = match store.get_with_ts(&key)? {
            Some((value, updated_ts)) => json!({ "value": value, "updated_ts": updated_ts }),
            None => Value::Null,
        };
        state.insert(key, entry);
    }

    let mut out = json!({
        "state_db": cfg.state_db_path,
        "state": state,
    });

    if with_journal {
        let recovery = Journal::recover(&cfg.journal_path)?;
        out["journal"] = json!({
            "path": cfg.journal_path,
            "last_mode": recovery.last_mode.map(|m| m.as_str()),
            "transitions": recovery.transitions,
            "episodes_closed": recovery.episodes_closed,
            "arbitrations": recovery.arbitrations,
            "open_episode": recovery.open_episode,
            "skipped_lines": recovery.skipped_lines,
        });
    }

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
