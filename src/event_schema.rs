//! Row model for decoded game results and the query input/output types.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

pub const SECONDS_PER_DAY: i64 = 86_400;

/// UTC calendar day identifier for a unix timestamp.
pub fn day_index(ts: i64) -> i64 {
    ts.div_euclid(SECONDS_PER_DAY)
}

/// Unix timestamp of the first second of a UTC day index.
pub fn day_start(day: i64) -> i64 {
    day * SECONDS_PER_DAY
}

/// Which contract deployment produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Generation {
    Legacy,
    Current,
}

/// One decoded game result. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRow {
    pub block_number: u64,
    pub transaction_hash: String,
    #[serde(default)]
    pub log_index: Option<u64>,
    pub game_number: u64,
    pub game_id: String,
    /// Free-text start time as emitted by the contract, not guaranteed
    /// parseable.
    pub started_at: String,
    pub winner: String,
    pub loser: String,
    pub winner_class: String,
    pub loser_class: String,
    pub game_length: String,
    pub end_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub generation: Generation,
}

impl GameRow {
    /// Deduplication identity across merges. Prefers transaction + log
    /// index; falls back to the game id, then to transaction + block.
    pub fn stable_key(&self) -> String {
        match self.log_index {
            Some(index) => format!("{}:{}", self.transaction_hash, index),
            None if !self.game_id.is_empty() => self.game_id.clone(),
            None => format!("{}:{}", self.transaction_hash, self.block_number),
        }
    }

    pub fn started_at_ts(&self) -> Option<i64> {
        parse_started_at(&self.started_at)
    }
}

/// Parse the free-text start time into unix seconds. The contract never
/// enforced a format, so several shapes are observed on chain.
pub fn parse_started_at(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc().timestamp());
        }
    }
    // A few early games carry bare unix seconds.
    trimmed.parse::<i64>().ok().filter(|ts| *ts > 0)
}

/// Result ordering: parsed start time descending, rows with a parseable time
/// before rows without one, block number descending as fallback. The final
/// stable-key comparison only breaks exact ties so the order is
/// deterministic regardless of input order.
pub fn row_ordering(a: &GameRow, b: &GameRow) -> Ordering {
    let primary = match (a.started_at_ts(), b.started_at_ts()) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| b.block_number.cmp(&a.block_number)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.block_number.cmp(&a.block_number),
    };
    primary.then_with(|| a.stable_key().cmp(&b.stable_key()))
}

/// Drop duplicate rows by stable key, keeping the first occurrence.
pub fn dedup_rows(rows: Vec<GameRow>) -> Vec<GameRow> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter(|row| seen.insert(row.stable_key()))
        .collect()
}

/// One cached UTC-day bucket: the resolved block span and its decoded rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayEntry {
    pub from_block: u64,
    pub to_block: u64,
    pub rows: Vec<GameRow>,
    pub last_update: i64,
}

impl DayEntry {
    pub fn has_generation(&self, generation: Generation) -> bool {
        self.rows.iter().any(|row| row.generation == generation)
    }
}

/// Per-class win/loss record, recomputed from rows rather than mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub wins: u64,
    pub losses: u64,
    pub total: u64,
}

pub type AggregateByClass = BTreeMap<String, ClassRecord>;

/// Derive the per-class aggregate for a set of rows.
pub fn aggregate_rows(rows: &[GameRow]) -> AggregateByClass {
    let mut aggregate = AggregateByClass::new();
    for row in rows {
        if !row.winner_class.is_empty() {
            let record = aggregate.entry(row.winner_class.clone()).or_default();
            record.wins += 1;
            record.total += 1;
        }
        if !row.loser_class.is_empty() {
            let record = aggregate.entry(row.loser_class.clone()).or_default();
            record.losses += 1;
            record.total += 1;
        }
    }
    aggregate
}

/// Query input as received from the presentation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(default)]
    pub start_ts: Option<i64>,
    #[serde(default)]
    pub end_ts: Option<i64>,
    /// Administrative path: rebuild one UTC day unconditionally.
    #[serde(default)]
    pub rebuild_day: Option<i64>,
    #[serde(default)]
    pub want_aggregate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<GameRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_by_class: Option<AggregateByClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryOutput {
    pub fn success(rows: Vec<GameRow>, want_aggregate: bool) -> Self {
        let aggregate_by_class = want_aggregate.then(|| aggregate_rows(&rows));
        Self {
            ok: true,
            rows: Some(rows),
            aggregate_by_class,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            rows: None,
            aggregate_by_class: None,
            error: Some(message.into()),
        }
    }
}
