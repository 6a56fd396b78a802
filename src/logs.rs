//! Chunked, deduplicated log retrieval.
//!
//! Large block ranges are a known trigger for provider-side limits, so a
//! failed single-shot query falls back to contiguous bounded sub-ranges
//! fetched in small concurrent batches with a pause in between. Providers
//! may also return duplicate entries for overlapping or retried sub-range
//! queries, so both paths deduplicate by transaction hash + log index.

use crate::decode::parse_hex_u64;
use crate::rpc::Transport;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One log record as returned by `eth_getLogs`. Transient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber", default)]
    pub block_number: Option<String>,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    #[serde(rename = "logIndex", default)]
    pub log_index: Option<String>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Option<u64> {
        self.block_number.as_deref().and_then(parse_hex_u64)
    }

    pub fn log_index_u64(&self) -> Option<u64> {
        self.log_index.as_deref().and_then(parse_hex_u64)
    }

    fn dedup_key(&self) -> (String, String) {
        let secondary = self
            .log_index
            .clone()
            .or_else(|| self.block_number.clone())
            .unwrap_or_default();
        (self.transaction_hash.to_lowercase(), secondary)
    }
}

pub struct LogFetcher {
    transport: Arc<dyn Transport>,
    /// Provider-imposed maximum block span for one `eth_getLogs` call.
    max_span: u64,
    concurrency: usize,
    batch_pause: Duration,
}

impl LogFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_span: u64,
        concurrency: usize,
        batch_pause: Duration,
    ) -> Self {
        Self {
            transport,
            max_span: max_span.max(1),
            concurrency: concurrency.max(1),
            batch_pause,
        }
    }

    /// Fetch all logs for a contract + topic over a block range, chunking
    /// when the span exceeds the provider maximum.
    pub async fn fetch_range(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
        topic: &str,
    ) -> Result<Vec<RawLog>> {
        if from_block > to_block {
            return Ok(Vec::new());
        }

        let span = to_block - from_block + 1;
        if span <= self.max_span {
            match self.fetch_once(from_block, to_block, address, topic).await {
                Ok(logs) => return Ok(dedup_logs(logs)),
                Err(e) => {
                    warn!(
                        "single-shot getLogs for {}..{} failed, falling back to chunked: {:#}",
                        from_block, to_block, e
                    );
                }
            }
        }

        self.fetch_chunked(from_block, to_block, address, topic).await
    }

    async fn fetch_once(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
        topic: &str,
    ) -> Result<Vec<RawLog>> {
        let filter = json!({
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
            "address": address,
            "topics": [topic],
        });
        let result = self
            .transport
            .call("eth_getLogs", vec![filter])
            .await
            .with_context(|| format!("eth_getLogs {}..{}", from_block, to_block))?;
        let logs: Vec<RawLog> =
            serde_json::from_value(result).context("parsing eth_getLogs result")?;
        Ok(logs)
    }

    async fn fetch_chunked(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
        topic: &str,
    ) -> Result<Vec<RawLog>> {
        let ranges = sub_ranges(from_block, to_block, self.max_span);
        debug!(
            "chunked getLogs {}..{} in {} sub-ranges",
            from_block,
            to_block,
            ranges.len()
        );

        let mut all = Vec::new();
        let mut batches = ranges.chunks(self.concurrency).peekable();
        while let Some(batch) = batches.next() {
            let results = futures::future::try_join_all(
                batch
                    .iter()
                    .map(|(start, end)| self.fetch_once(*start, *end, address, topic)),
            )
            .await?;
            for logs in results {
                all.extend(logs);
            }
            // Pause between batches to respect provider rate limits.
            if batches.peek().is_some() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        Ok(dedup_logs(all))
    }
}

/// Contiguous sub-ranges of at most `max_span` blocks covering the range.
fn sub_ranges(from_block: u64, to_block: u64, max_span: u64) -> Vec<(u64, u64)> {
    let mut ranges = Vec::new();
    let mut start = from_block;
    while start <= to_block {
        let end = to_block.min(start + max_span - 1);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

fn dedup_logs(logs: Vec<RawLog>) -> Vec<RawLog> {
    let mut seen = HashSet::with_capacity(logs.len());
    logs.into_iter()
        .filter(|log| seen.insert(log.dedup_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{raw_log, MockChain};

    #[test]
    fn test_sub_ranges_are_contiguous_and_bounded() {
        assert_eq!(sub_ranges(0, 9, 4), vec![(0, 3), (4, 7), (8, 9)]);
        assert_eq!(sub_ranges(5, 5, 100), vec![(5, 5)]);
        assert_eq!(sub_ranges(10, 5, 4), Vec::<(u64, u64)>::new());
    }

    #[test]
    fn test_dedup_logs_by_tx_and_index() {
        let a = raw_log("0xAA", Some(0), 10, "0x");
        let a_same = raw_log("0xaa", Some(0), 10, "0x");
        let b = raw_log("0xaa", Some(1), 10, "0x");
        assert_eq!(dedup_logs(vec![a, a_same, b]).len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_range_single_shot() {
        let chain = MockChain::linear(0, &[100; 50]);
        chain.add_log("0xfeed", "0xt0", raw_log("0xaa", Some(0), 10, "0x"));
        chain.add_log("0xfeed", "0xt0", raw_log("0xaa", Some(1), 12, "0x"));

        let fetcher = LogFetcher::new(
            chain.clone() as Arc<dyn Transport>,
            100,
            2,
            Duration::from_millis(0),
        );
        let logs = fetcher.fetch_range(0, 49, "0xfeed", "0xt0").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(chain.get_logs_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_range_chunks_and_dedups() {
        let chain = MockChain::linear(0, &[100; 50]);
        // The same log is visible from two sub-ranges; the provider reports
        // it twice, the fetcher must not.
        chain.add_log("0xfeed", "0xt0", raw_log("0xaa", Some(0), 9, "0x"));
        chain.add_log("0xfeed", "0xt0", raw_log("0xbb", Some(0), 35, "0x"));
        chain.duplicate_logs();

        let fetcher = LogFetcher::new(
            chain.clone() as Arc<dyn Transport>,
            10,
            2,
            Duration::from_millis(0),
        );
        let logs = fetcher.fetch_range(0, 49, "0xfeed", "0xt0").await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(chain.get_logs_calls().len(), 5);
    }

    #[tokio::test]
    async fn test_single_shot_failure_falls_back_to_chunked() {
        let chain = MockChain::linear(0, &[100; 50]);
        chain.add_log("0xfeed", "0xt0", raw_log("0xaa", Some(0), 20, "0x"));
        // Provider rejects the first range query outright.
        chain.fail_next_get_logs();

        let fetcher = LogFetcher::new(
            chain.clone() as Arc<dyn Transport>,
            100,
            2,
            Duration::from_millis(0),
        );
        let logs = fetcher.fetch_range(0, 49, "0xfeed", "0xt0").await.unwrap();
        assert_eq!(logs.len(), 1);
        // One failed single-shot call plus the chunked retry.
        assert!(chain.get_logs_calls().len() >= 2);
    }
}
