//! Scripted chain transport and fixture builders shared across unit tests.

use crate::event_schema::{GameRow, Generation};
use crate::logs::RawLog;
use crate::rpc::{RpcClientError, RpcRequest, RpcResponse, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An in-memory chain with one timestamp per block and a fixed log set,
/// standing in for the RPC endpoint.
pub struct MockChain {
    first_block: u64,
    timestamps: Vec<i64>,
    logs: Mutex<Vec<(String, String, RawLog)>>,
    get_logs_calls: Mutex<Vec<(u64, u64)>>,
    fail_next_logs: AtomicBool,
    duplicate_logs: AtomicBool,
    fail_all: AtomicBool,
}

impl MockChain {
    /// Blocks `first_block..` with the given timestamps.
    pub fn linear(first_block: u64, timestamps: &[i64]) -> Arc<Self> {
        Arc::new(Self {
            first_block,
            timestamps: timestamps.to_vec(),
            logs: Mutex::new(Vec::new()),
            get_logs_calls: Mutex::new(Vec::new()),
            fail_next_logs: AtomicBool::new(false),
            duplicate_logs: AtomicBool::new(false),
            fail_all: AtomicBool::new(false),
        })
    }

    pub fn add_log(&self, address: &str, topic: &str, mut log: RawLog) {
        log.address = address.to_lowercase();
        log.topics = vec![topic.to_lowercase()];
        self.logs
            .lock()
            .push((address.to_lowercase(), topic.to_lowercase(), log));
    }

    /// Ranges each `eth_getLogs` call covered, in call order.
    pub fn get_logs_calls(&self) -> Vec<(u64, u64)> {
        self.get_logs_calls.lock().clone()
    }

    /// Make the next `eth_getLogs` call fail with a protocol error.
    pub fn fail_next_get_logs(&self) {
        self.fail_next_logs.store(true, Ordering::SeqCst);
    }

    /// Report every matching log twice, as providers do for overlapping or
    /// retried sub-range queries.
    pub fn duplicate_logs(&self) {
        self.duplicate_logs.store(true, Ordering::SeqCst);
    }

    /// Fail every call, as if the endpoint were down.
    pub fn fail_all_calls(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    fn last_block(&self) -> u64 {
        self.first_block + self.timestamps.len() as u64 - 1
    }

    fn block_result(&self, number: u64) -> Result<Value, RpcClientError> {
        if number < self.first_block || number > self.last_block() {
            return Ok(Value::Null);
        }
        let timestamp = self.timestamps[(number - self.first_block) as usize];
        Ok(json!({
            "number": format!("0x{:x}", number),
            "timestamp": format!("0x{:x}", timestamp),
        }))
    }
}

#[async_trait]
impl Transport for MockChain {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcClientError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(RpcClientError::Protocol {
                code: -32000,
                message: "scripted endpoint failure".to_string(),
            });
        }

        match method {
            "eth_getBlockByNumber" => {
                let tag = params
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcClientError::Malformed("missing block tag".into()))?;
                let number = match tag {
                    "earliest" => self.first_block,
                    "latest" => self.last_block(),
                    hex => crate::decode::parse_hex_u64(hex).ok_or_else(|| {
                        RpcClientError::Malformed(format!("bad block tag {}", hex))
                    })?,
                };
                self.block_result(number)
            }
            "eth_getLogs" => {
                let filter = params
                    .first()
                    .ok_or_else(|| RpcClientError::Malformed("missing filter".into()))?;
                let from = filter
                    .get("fromBlock")
                    .and_then(Value::as_str)
                    .and_then(crate::decode::parse_hex_u64)
                    .unwrap_or(0);
                let to = filter
                    .get("toBlock")
                    .and_then(Value::as_str)
                    .and_then(crate::decode::parse_hex_u64)
                    .unwrap_or(u64::MAX);
                let address = filter
                    .get("address")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase();
                let topic = filter
                    .get("topics")
                    .and_then(|topics| topics.get(0))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_lowercase();

                self.get_logs_calls.lock().push((from, to));
                if self.fail_next_logs.swap(false, Ordering::SeqCst) {
                    return Err(RpcClientError::Protocol {
                        code: -32005,
                        message: "query returned more than 10000 results".to_string(),
                    });
                }

                let mut matching = Vec::new();
                for (log_address, log_topic, log) in self.logs.lock().iter() {
                    let block = log.block_number_u64().unwrap_or(0);
                    if *log_address == address
                        && *log_topic == topic
                        && block >= from
                        && block <= to
                    {
                        matching.push(log.clone());
                        if self.duplicate_logs.load(Ordering::SeqCst) {
                            matching.push(log.clone());
                        }
                    }
                }
                serde_json::to_value(matching)
                    .map_err(|e| RpcClientError::Malformed(e.to_string()))
            }
            other => Err(RpcClientError::Malformed(format!(
                "unscripted method {}",
                other
            ))),
        }
    }

    async fn call_batch(
        &self,
        requests: Vec<RpcRequest>,
    ) -> Result<Vec<RpcResponse>, RpcClientError> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            let result = self.call(&request.method, request.params).await?;
            responses.push(RpcResponse {
                jsonrpc: "2.0".to_string(),
                result: Some(result),
                error: None,
                id: request.id,
            });
        }
        Ok(responses)
    }
}

/// Raw log fixture with hex-encoded block number and log index.
pub fn raw_log(tx: &str, log_index: Option<u64>, block: u64, data: &str) -> RawLog {
    RawLog {
        address: "0xfeed".to_string(),
        topics: vec!["0xt0".to_string()],
        data: data.to_string(),
        block_number: Some(format!("0x{:x}", block)),
        transaction_hash: tx.to_string(),
        log_index: log_index.map(|index| format!("0x{:x}", index)),
    }
}

/// Deterministic row fixture: content is a pure function of the arguments,
/// so equal stable keys always carry equal content.
pub fn sample_row(tx: &str, log_index: Option<u64>, block_number: u64) -> GameRow {
    GameRow {
        block_number,
        transaction_hash: tx.to_lowercase(),
        log_index,
        game_number: block_number,
        game_id: format!("game-{}-{}", tx.to_lowercase(), log_index.unwrap_or(0)),
        started_at: String::new(),
        winner: "ash".to_string(),
        loser: "veil".to_string(),
        winner_class: String::new(),
        loser_class: String::new(),
        game_length: "10:00".to_string(),
        end_reason: "knockout".to_string(),
        game_type: None,
        metadata: None,
        generation: Generation::Current,
    }
}

/// ABI-encode one `uint256` followed by dynamic strings, the layout of the
/// result event's data segment.
pub fn encode_event_data(game_number: u64, strings: &[&str]) -> String {
    let head_words = 1 + strings.len();
    let mut head = Vec::new();
    let mut tail = Vec::new();

    head.extend_from_slice(&word_u64(game_number));
    for s in strings {
        let offset = head_words * 32 + tail.len();
        head.extend_from_slice(&word_u64(offset as u64));
        tail.extend_from_slice(&word_u64(s.len() as u64));
        let mut bytes = s.as_bytes().to_vec();
        bytes.resize(bytes.len().div_ceil(32) * 32, 0);
        tail.extend_from_slice(&bytes);
    }

    format!("0x{}{}", hex::encode(head), hex::encode(tail))
}

fn word_u64(value: u64) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[24..].copy_from_slice(&value.to_be_bytes());
    word
}
