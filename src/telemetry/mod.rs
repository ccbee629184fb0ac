//! Decision telemetry: one append-only JSONL line per signal/profit
//! decision at `<logs>/decisions.log` (spec §6). Grounded on the same
//! write idiom `StateManager::persist` uses for `state.json`, adapted from
//! write-temp-then-rename (whole-file, snapshot semantics) to append-only
//! (event-log semantics): each record is written and flushed as it occurs,
//! never rewritten.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize)]
pub struct DecisionInput {
    pub symbol: String,
    pub timeframe: String,
    pub action: String,
    pub original_confidence: f64,
    pub indicators: serde_json::Value,
    pub pattern_ids: Vec<String>,
    pub risk_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutput {
    pub decision: String,
    pub confidence: f64,
    pub reason_summary: String,
    pub pattern_quality: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionMeta {
    pub version: String,
    pub adapter_id: String,
    pub mode: String,
    pub module: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    #[serde(rename = "tsMs")]
    pub ts_ms: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "decisionId")]
    pub decision_id: String,
    pub input: DecisionInput,
    pub output: DecisionOutput,
    pub meta: DecisionMeta,
}

impl DecisionRecord {
    pub fn new(
        ts_ms: i64,
        decision_id: String,
        input: DecisionInput,
        output: DecisionOutput,
        meta: DecisionMeta,
    ) -> Self {
        Self { ts_ms, kind: "decision".to_string(), decision_id, input, output, meta }
    }
}

/// Outward notification payload for the orchestrator's half of the §6
/// dashboard wire shape (`StateManager`'s half is [`crate::state::
/// StateUpdateMessage`]). No transport is wired up — the dashboard is out
/// of scope — only the type, so a future consumer has a concrete payload
/// to construct against.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum BotUpdateMessage {
    #[serde(rename = "bot_update")]
    Status { symbol: String, is_trading: bool, timestamp: i64 },
    #[serde(rename = "trade_signal")]
    TradeSignal { symbol: String, decision: String, confidence: f64, timestamp: i64 },
}

/// Single-writer append-only JSONL sink. The internal `Mutex` mirrors
/// `StateManager`'s serialization point: concurrent callers from several
/// orchestrator tasks never interleave partial lines.
pub struct DecisionLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl DecisionLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating logs directory")?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening decision log at {path:?}"))?;
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn write(&self, record: &DecisionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("serializing decision record")?;
        line.push('\n');
        let mut file = self.file.lock().unwrap();
        file.write_all(line.as_bytes()).context("appending to decision log")?;
        file.flush().context("flushing decision log")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ts_ms: i64) -> DecisionRecord {
        DecisionRecord::new(
            ts_ms,
            format!("d-{ts_ms}"),
            DecisionInput {
                symbol: "BTC/USD".to_string(),
                timeframe: "1m".to_string(),
                action: "evaluate".to_string(),
                original_confidence: 42.0,
                indicators: serde_json::json!({"rsi": 28.0}),
                pattern_ids: vec!["p1".to_string()],
                risk_flags: Vec::new(),
            },
            DecisionOutput {
                decision: "BUY".to_string(),
                confidence: 55.0,
                reason_summary: "rsi_oversold".to_string(),
                pattern_quality: 0.7,
            },
            DecisionMeta {
                version: SCHEMA_VERSION.to_string(),
                adapter_id: "binance".to_string(),
                mode: "paper".to_string(),
                module: "signal_engine".to_string(),
            },
        )
    }

    #[test]
    fn appends_one_jsonl_line_per_record() {
        let mut path = std::env::temp_dir();
        path.push(format!("decisions-{}.log", uuid::Uuid::new_v4()));
        let log = DecisionLog::open(&path).unwrap();
        log.write(&record(1)).unwrap();
        log.write(&record(2)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["type"], "decision");
        assert_eq!(parsed["decisionId"], "d-1");
        assert_eq!(parsed["input"]["symbol"], "BTC/USD");
        assert_eq!(parsed["output"]["decision"], "BUY");
        assert_eq!(parsed["meta"]["version"], SCHEMA_VERSION);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bot_update_message_serializes_with_tagged_type() {
        let status = BotUpdateMessage::Status { symbol: "BTC/USD".to_string(), is_trading: true, timestamp: 1 };
        let value: serde_json::Value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["type"], "bot_update");
        assert_eq!(value["symbol"], "BTC/USD");

        let signal = BotUpdateMessage::TradeSignal {
            symbol: "BTC/USD".to_string(),
            decision: "BUY".to_string(),
            confidence: 72.0,
            timestamp: 2,
        };
        let value: serde_json::Value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["type"], "trade_signal");
        assert_eq!(value["decision"], "BUY");
    }

    #[test]
    fn reopening_the_same_path_appends_rather_than_truncates() {
        let mut path = std::env::temp_dir();
        path.push(format!("decisions-reopen-{}.log", uuid::Uuid::new_v4()));
        {
            let log = DecisionLog::open(&path).unwrap();
            log.write(&record(1)).unwrap();
        }
        {
            let log = DecisionLog::open(&path).unwrap();
            log.write(&record(2)).unwrap();
        }
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        std::fs::remove_file(&path).ok();
    }
}
