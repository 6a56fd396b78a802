//! Decoding of raw result-event logs into [`GameRow`]s.
//!
//! Two fixed event shapes exist across the contract migration: the legacy
//! deployment emits 9 fields, the current one 11 (adds a game type and a
//! metadata blob). All fields live in the log's `data` segment as one
//! ABI-encoded `uint256` followed by dynamic strings. A malformed log
//! decodes to `None` and is dropped; it never aborts the surrounding fetch.

use crate::event_schema::{GameRow, Generation};
use crate::logs::RawLog;
use crate::metrics::Metrics;
use tracing::debug;

const WORD: usize = 32;

/// Field counts per generation: game number plus 8 or 10 strings.
const LEGACY_FIELDS: usize = 9;
const CURRENT_FIELDS: usize = 11;

/// Parse a `0x`-prefixed (or bare) hex quantity into a u64.
pub fn parse_hex_u64(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Decode one raw log with the schema of the given generation.
pub fn decode(log: &RawLog, generation: Generation) -> Option<GameRow> {
    let hex_data = log.data.trim();
    let data = hex::decode(hex_data.strip_prefix("0x").unwrap_or(hex_data)).ok()?;

    let fields = match generation {
        Generation::Legacy => LEGACY_FIELDS,
        Generation::Current => CURRENT_FIELDS,
    };
    if data.len() < fields * WORD {
        return None;
    }

    let game_number = read_u64_word(&data, 0)?;
    let mut strings = Vec::with_capacity(fields - 1);
    for slot in 1..fields {
        strings.push(read_string(&data, slot)?);
    }

    let (game_type, metadata) = match generation {
        Generation::Legacy => (None, None),
        Generation::Current => (Some(strings[8].clone()), Some(strings[9].clone())),
    };

    Some(GameRow {
        block_number: log.block_number_u64().unwrap_or_default(),
        transaction_hash: log.transaction_hash.to_lowercase(),
        log_index: log.log_index_u64(),
        game_number,
        game_id: strings[0].clone(),
        started_at: strings[1].clone(),
        winner: normalize_player(&strings[2]),
        loser: normalize_player(&strings[3]),
        winner_class: strings[4].clone(),
        loser_class: strings[5].clone(),
        game_length: strings[6].clone(),
        end_reason: strings[7].clone(),
        game_type,
        metadata,
        generation,
    })
}

/// Decode a batch, silently dropping malformed logs.
pub fn decode_all(logs: &[RawLog], generation: Generation) -> Vec<GameRow> {
    let mut rows = Vec::with_capacity(logs.len());
    for log in logs {
        match decode(log, generation) {
            Some(row) => {
                Metrics::row_decoded();
                rows.push(row);
            }
            None => {
                Metrics::decode_failure();
                debug!(
                    "dropping undecodable log tx={} index={:?}",
                    log.transaction_hash, log.log_index
                );
            }
        }
    }
    rows
}

/// Strip the per-session discriminator suffix from a player name.
pub fn normalize_player(name: &str) -> String {
    name.split('#').next().unwrap_or_default().trim().to_string()
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * WORD..(index + 1) * WORD)
}

/// Read a word as u64, rejecting values that do not fit.
fn read_u64_word(data: &[u8], index: usize) -> Option<u64> {
    let w = word(data, index)?;
    if w[..WORD - 8].iter().any(|b| *b != 0) {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&w[WORD - 8..]);
    Some(u64::from_be_bytes(bytes))
}

/// Follow the offset stored at `slot` to a length-prefixed string.
fn read_string(data: &[u8], slot: usize) -> Option<String> {
    let offset = read_u64_word(data, slot)? as usize;
    if offset % WORD != 0 || offset + WORD > data.len() {
        return None;
    }
    let length = read_u64_word(data, offset / WORD)? as usize;
    let start = offset + WORD;
    let bytes = data.get(start..start.checked_add(length)?)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}
