//! Timestamp-to-block resolution.
//!
//! The chain RPC only answers "get block by number", so mapping a target
//! timestamp to a block is a binary search bounded by the chain's earliest
//! and latest block. Bounds are fetched once per top-level query and
//! threaded through every resolution call.

use crate::decode::parse_hex_u64;
use crate::rpc::{RpcRequest, Transport};
use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub number: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockBounds {
    pub earliest: Block,
    pub latest: Block,
}

pub struct BlockTimeResolver {
    transport: Arc<dyn Transport>,
}

impl BlockTimeResolver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn block_by_tag(&self, tag: &str) -> Result<Block> {
        let result = self
            .transport
            .call("eth_getBlockByNumber", vec![json!(tag), json!(false)])
            .await
            .with_context(|| format!("eth_getBlockByNumber({})", tag))?;
        parse_block(&result).with_context(|| format!("parsing block {}", tag))
    }

    pub async fn block_by_number(&self, number: u64) -> Result<Block> {
        self.block_by_tag(&format!("0x{:x}", number)).await
    }

    /// Fetch the chain's earliest and latest block in one batched call.
    pub async fn bounds(&self) -> Result<BlockBounds> {
        let requests = vec![
            RpcRequest::with_id("eth_getBlockByNumber", vec![json!("earliest"), json!(false)], 1),
            RpcRequest::with_id("eth_getBlockByNumber", vec![json!("latest"), json!(false)], 2),
        ];
        let responses = self
            .transport
            .call_batch(requests)
            .await
            .context("fetching chain bounds")?;

        let block_at = |index: usize| -> Result<Block> {
            let result = responses
                .get(index)
                .and_then(|response| response.result.as_ref())
                .ok_or_else(|| anyhow!("bounds batch missing response {}", index))?;
            parse_block(result)
        };
        Ok(BlockBounds {
            earliest: block_at(0)?,
            latest: block_at(1)?,
        })
    }

    /// Smallest block number whose timestamp is >= `target_ts`, clamped to
    /// the bounds at both ends.
    pub async fn find_at_or_after(&self, target_ts: i64, bounds: &BlockBounds) -> Result<u64> {
        if target_ts <= bounds.earliest.timestamp {
            return Ok(bounds.earliest.number);
        }
        if target_ts > bounds.latest.timestamp {
            return Ok(bounds.latest.number);
        }

        let mut lo = bounds.earliest.number;
        let mut hi = bounds.latest.number;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let block = self.block_by_number(mid).await?;
            if block.timestamp >= target_ts {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Largest block number whose timestamp is <= `target_ts`, clamped to
    /// the bounds at both ends.
    pub async fn find_at_or_before(&self, target_ts: i64, bounds: &BlockBounds) -> Result<u64> {
        if target_ts < bounds.earliest.timestamp {
            return Ok(bounds.earliest.number);
        }
        if target_ts >= bounds.latest.timestamp {
            return Ok(bounds.latest.number);
        }

        let mut lo = bounds.earliest.number;
        let mut hi = bounds.latest.number;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            let block = self.block_by_number(mid).await?;
            if block.timestamp <= target_ts {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }
        Ok(lo)
    }
}

fn parse_block(result: &Value) -> Result<Block> {
    if result.is_null() {
        return Err(anyhow!("block not found"));
    }
    let number = result
        .get("number")
        .and_then(Value::as_str)
        .and_then(parse_hex_u64)
        .ok_or_else(|| anyhow!("block result missing number"))?;
    let timestamp = result
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_hex_u64)
        .ok_or_else(|| anyhow!("block result missing timestamp"))?;
    Ok(Block {
        number,
        timestamp: timestamp as i64,
    })
}
