//! Range assembly: the orchestration over resolver, fetcher, decoder, and
//! cache.
//!
//! A query window is partitioned into UTC-day buckets. Each day belongs to
//! exactly one contract generation, decided by whether its UTC start falls
//! before the migration cutover. Historical buckets are immutable once
//! cached; the bucket for "today" is only ever extended past its last
//! covered block. Post-cutover queries additionally re-fetch a live tail
//! directly, so freshness never depends on cache state. Concurrent queries
//! may duplicate remote work; correctness relies on the idempotent stable-key
//! deduplication applied at every merge point, not on exclusion.

use crate::blocktime::{BlockBounds, BlockTimeResolver};
use crate::cache::{merge_entries, CacheNamespace, DayCache, DurableStore, NullStore, RedisStore};
use crate::config::Config;
use crate::decode::decode_all;
use crate::event_schema::{
    day_index, day_start, dedup_rows, row_ordering, DayEntry, GameRow, Generation, QueryInput,
    QueryOutput,
};
use crate::logs::LogFetcher;
use crate::metrics::Metrics;
use crate::rpc::{HttpTransport, Transport};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct Engine {
    config: Config,
    resolver: BlockTimeResolver,
    fetcher: LogFetcher,
    cache: DayCache,
    legacy_ns: CacheNamespace,
    current_ns: CacheNamespace,
}

impl Engine {
    /// Build the production engine: HTTP transport plus the configured
    /// durable tier (or none). An unreachable durable store disables that
    /// tier instead of failing startup.
    pub async fn from_config(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(
            HttpTransport::new(&config.rpc_url, config.rpc_timeout(), config.retry_policy())
                .context("building RPC transport")?,
        );

        let durable: Arc<dyn DurableStore> = match &config.redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    warn!("durable store unreachable, tier disabled: {:#}", e);
                    Arc::new(NullStore)
                }
            },
            None => Arc::new(NullStore),
        };

        Ok(Self::with_parts(config, transport, durable))
    }

    /// Assembly seam: tests inject a scripted transport and an in-memory
    /// durable tier.
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn Transport>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        let resolver = BlockTimeResolver::new(transport.clone());
        let fetcher = LogFetcher::new(
            transport,
            config.max_block_span,
            config.log_concurrency,
            config.batch_pause(),
        );
        let cache = DayCache::new(durable, config.memory_cache_days);
        let legacy_ns = CacheNamespace::new(&config.legacy_contract, &config.legacy_topic);
        let current_ns = CacheNamespace::new(&config.current_contract, &config.current_topic);

        Self {
            config,
            resolver,
            fetcher,
            cache,
            legacy_ns,
            current_ns,
        }
    }

    /// Top-level query handler. Never raises past this boundary: every
    /// failure becomes `ok: false` with a message.
    pub async fn handle_query(&self, input: QueryInput) -> QueryOutput {
        Metrics::query();

        if let Some(day) = input.rebuild_day {
            return match self.rebuild_day(day).await {
                Ok(entry) => {
                    info!("rebuilt day {} ({} rows)", day, entry.rows.len());
                    QueryOutput::success(entry.rows, input.want_aggregate)
                }
                Err(e) => {
                    Metrics::query_failure();
                    error!("day {} rebuild failed: {:#}", day, e);
                    QueryOutput::failure(format!("rebuild of day {} failed: {:#}", day, e))
                }
            };
        }

        match self.range(input.start_ts, input.end_ts).await {
            Ok(rows) => QueryOutput::success(rows, input.want_aggregate),
            Err(e) => {
                Metrics::query_failure();
                error!("range query failed: {:#}", e);
                QueryOutput::failure(format!("query failed: {:#}", e))
            }
        }
    }

    /// Assemble all rows in `[start_ts, end_ts]`, defaulting to the chain's
    /// earliest/latest timestamps when a bound is omitted.
    pub async fn range(&self, start_ts: Option<i64>, end_ts: Option<i64>) -> Result<Vec<GameRow>> {
        let bounds = self.resolver.bounds().await.context("resolving bounds")?;
        let start = start_ts.unwrap_or(bounds.earliest.timestamp);
        let end = end_ts.unwrap_or(bounds.latest.timestamp);
        if start > end {
            return Ok(Vec::new());
        }

        let today = day_index(bounds.latest.timestamp);
        let days: Vec<i64> = (day_index(start)..=day_index(end)).collect();
        debug!(
            "range query [{}, {}] spanning {} day buckets (today={})",
            start,
            end,
            days.len(),
            today
        );

        // Fill day buckets in bounded concurrent batches. A failed bucket
        // degrades to a gap, which self-heals on the next query.
        let mut rows: Vec<GameRow> = Vec::new();
        for batch in days.chunks(self.config.day_concurrency.max(1)) {
            let results = futures::future::join_all(
                batch.iter().map(|day| self.day_rows(*day, today, &bounds)),
            )
            .await;
            for (day, result) in batch.iter().zip(results) {
                match result {
                    Ok(day_rows) => rows.extend(day_rows),
                    Err(e) => warn!("day {} bucket failed, continuing: {:#}", day, e),
                }
            }
        }

        // Live tail: whenever the window reaches post-cutover territory,
        // re-fetch from the cutover (or the query start) through yesterday
        // directly, so freshness never depends on cache state.
        if end >= self.config.cutover_ts {
            let tail_start = start.max(self.config.cutover_ts);
            let tail_end = end.min(day_start(today) - 1);
            if tail_start <= tail_end {
                match self
                    .fetch_window_direct(tail_start, tail_end, Generation::Current, &bounds)
                    .await
                {
                    Ok(tail_rows) => rows.extend(tail_rows),
                    Err(e) => warn!("live tail fetch failed, continuing: {:#}", e),
                }
            }
        }

        // Today is never assumed complete: one more direct fetch bounded to
        // the query window's slice of today.
        if day_index(end) >= today {
            let top_start = start.max(day_start(today));
            let generation = self.generation_for_day(today);
            match self
                .fetch_window_direct(top_start, end, generation, &bounds)
                .await
            {
                Ok(today_rows) => rows.extend(today_rows),
                Err(e) => warn!("today top-up fetch failed, continuing: {:#}", e),
            }
        }

        let mut rows = dedup_rows(rows);
        rows.sort_by(row_ordering);
        rows.retain(|row| match row.started_at_ts() {
            Some(ts) => ts >= start && ts <= end,
            // Rows without a parseable start time pass unconditionally.
            None => true,
        });

        // Defensive final pass; merges above already deduplicate.
        Ok(dedup_rows(rows))
    }

    /// Administrative path: rebuild one day unconditionally, bypassing all
    /// cache reads, and persist the result.
    pub async fn rebuild_day(&self, day: i64) -> Result<DayEntry> {
        let bounds = self.resolver.bounds().await.context("resolving bounds")?;
        let generation = self.generation_for_day(day);
        let entry = self.build_day(day, generation, &bounds).await?;
        self.cache
            .put(self.namespace_for(generation), day, &entry, None)
            .await;
        Ok(entry)
    }

    /// Resolve one day bucket's rows per the per-generation cache protocol.
    async fn day_rows(&self, day: i64, today: i64, bounds: &BlockBounds) -> Result<Vec<GameRow>> {
        let generation = self.generation_for_day(day);

        if day >= today {
            // The entry for today only ever grows via extension.
            let existing = self
                .cache
                .get(
                    self.namespace_for(generation),
                    day,
                    generation == Generation::Legacy,
                )
                .await;
            let entry = match existing {
                Some(existing) => {
                    self.extend_today(existing, bounds.latest.timestamp, generation, bounds)
                        .await?
                }
                None => self.build_day(day, generation, bounds).await?,
            };
            self.cache
                .put(self.namespace_for(generation), day, &entry, None)
                .await;
            return Ok(entry.rows);
        }

        match generation {
            Generation::Legacy => {
                // Strictly historical legacy days are immutable once cached.
                if let Some(entry) = self.cache.get(&self.legacy_ns, day, true).await {
                    return Ok(entry.rows);
                }
                let entry = self.build_day(day, Generation::Legacy, bounds).await?;
                self.cache.put(&self.legacy_ns, day, &entry, None).await;
                Ok(entry.rows)
            }
            Generation::Current => {
                // A cached post-cutover day only counts if it actually holds
                // current-generation rows; otherwise fetch fresh.
                if let Some(entry) = self.cache.get(&self.current_ns, day, false).await {
                    if entry.has_generation(Generation::Current) {
                        return Ok(entry.rows);
                    }
                }
                let entry = self.build_day(day, Generation::Current, bounds).await?;
                // Empty days are cached briefly so a quiet day does not
                // trigger a fresh fetch on every query, while a transient
                // provider gap still heals once the TTL lapses.
                let ttl = entry.rows.is_empty().then(|| self.config.empty_day_ttl());
                self.cache.put(&self.current_ns, day, &entry, ttl).await;
                Ok(entry.rows)
            }
        }
    }

    /// Build a day bucket from source: resolve its block span, fetch, and
    /// decode.
    async fn build_day(
        &self,
        day: i64,
        generation: Generation,
        bounds: &BlockBounds,
    ) -> Result<DayEntry> {
        let day_end_ts = (day_start(day + 1) - 1).min(bounds.latest.timestamp);
        let from_block = self
            .resolver
            .find_at_or_after(day_start(day), bounds)
            .await?;
        let to_block = self.resolver.find_at_or_before(day_end_ts, bounds).await?;

        let rows = self
            .fetch_span(from_block, to_block, generation)
            .await
            .with_context(|| format!("building day {}", day))?;

        Metrics::day_built();
        debug!(
            "built day {} ({:?}): blocks {}..{}, {} rows",
            day,
            generation,
            from_block,
            to_block,
            rows.len()
        );

        Ok(DayEntry {
            from_block,
            to_block: to_block.max(from_block),
            rows,
            last_update: Utc::now().timestamp(),
        })
    }

    /// Extend an existing "today" bucket up to `new_end_ts`. Only the block
    /// range strictly past the entry's `to_block` is fetched; calling again
    /// with an already-covered end is a no-op.
    async fn extend_today(
        &self,
        existing: DayEntry,
        new_end_ts: i64,
        generation: Generation,
        bounds: &BlockBounds,
    ) -> Result<DayEntry> {
        let end_block = self.resolver.find_at_or_before(new_end_ts, bounds).await?;
        if end_block <= existing.to_block {
            return Ok(existing);
        }

        let new_rows = self
            .fetch_span(existing.to_block + 1, end_block, generation)
            .await
            .context("extending today's bucket")?;

        let fetched = DayEntry {
            from_block: existing.from_block,
            to_block: end_block,
            rows: new_rows,
            last_update: Utc::now().timestamp(),
        };
        Ok(merge_entries(&existing, &fetched))
    }

    /// Direct fetch of a timestamp window, bypassing the cache entirely.
    async fn fetch_window_direct(
        &self,
        start_ts: i64,
        end_ts: i64,
        generation: Generation,
        bounds: &BlockBounds,
    ) -> Result<Vec<GameRow>> {
        let from_block = self.resolver.find_at_or_after(start_ts, bounds).await?;
        let to_block = self.resolver.find_at_or_before(end_ts, bounds).await?;
        self.fetch_span(from_block, to_block, generation).await
    }

    async fn fetch_span(
        &self,
        from_block: u64,
        to_block: u64,
        generation: Generation,
    ) -> Result<Vec<GameRow>> {
        if to_block < from_block {
            return Ok(Vec::new());
        }
        let (address, topic) = self.contract_for(generation);
        let logs = self
            .fetcher
            .fetch_range(from_block, to_block, address, topic)
            .await?;
        Ok(decode_all(&logs, generation))
    }

    /// A day's generation is decided solely by whether its UTC start falls
    /// before or at/after the cutover instant.
    fn generation_for_day(&self, day: i64) -> Generation {
        if day_start(day) >= self.config.cutover_ts {
            Generation::Current
        } else {
            Generation::Legacy
        }
    }

    fn namespace_for(&self, generation: Generation) -> &CacheNamespace {
        match generation {
            Generation::Legacy => &self.legacy_ns,
            Generation::Current => &self.current_ns,
        }
    }

    fn contract_for(&self, generation: Generation) -> (&str, &str) {
        match generation {
            Generation::Legacy => (&self.config.legacy_contract, &self.config.legacy_topic),
            Generation::Current => (&self.config.current_contract, &self.config.current_topic),
        }
    }
}
