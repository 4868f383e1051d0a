//! # Traffic Buffer (spec §4.6)
//!
//! Sharded accumulation (`rule_id mod SHARD_COUNT`) of inbound `traffic`
//! reports, flushed into the traffic cache on a fixed interval and once
//! more on `stop()`. A shard is never locked while the flush awaits the
//! cache — the map is swapped out under the lock and iterated afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::cache::{TrafficCache, TrafficDelta};
use crate::domain::EntityId;
use crate::limits::LimitEnforcer;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct TrafficEntry {
    upload: u64,
    download: u64,
    retry_count: u32,
}

struct Shard {
    entries: Mutex<HashMap<EntityId, TrafficEntry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn add(&self, rule_id: EntityId, upload: u64, download: u64) {
        let mut guard = self.entries.lock().await;
        let entry = guard.entry(rule_id).or_default();
        entry.upload += upload;
        entry.download += download;
    }

    /// Swaps the live map out for an empty one, minimizing lock hold time.
    async fn take(&self) -> HashMap<EntityId, TrafficEntry> {
        let mut guard = self.entries.lock().await;
        std::mem::take(&mut *guard)
    }

    /// Re-merges surviving entries (after a failed flush) with whatever
    /// accrued on the live map while the flush was in flight.
    async fn merge_back(&self, survivors: HashMap<EntityId, TrafficEntry>) {
        let mut guard = self.entries.lock().await;
        for (rule_id, survivor) in survivors {
            guard
                .entry(rule_id)
                .and_modify(|live| {
                    live.upload += survivor.upload;
                    live.download += survivor.download;
                    live.retry_count = live.retry_count.max(survivor.retry_count);
                })
                .or_insert(survivor);
        }
    }
}

fn shard_index(rule_id: EntityId) -> usize {
    (rule_id % SHARD_COUNT as u64) as usize
}

pub struct TrafficBuffer {
    shards: Vec<Shard>,
    cache: Arc<dyn TrafficCache>,
    limits: Option<Arc<LimitEnforcer>>,
    flush_interval: Duration,
    flush_batch_cap: usize,
    flush_max_retry: u32,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TrafficBuffer {
    pub fn new(
        cache: Arc<dyn TrafficCache>,
        limits: Option<Arc<LimitEnforcer>>,
        flush_interval: Duration,
        flush_batch_cap: usize,
        flush_max_retry: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::new()).collect(),
            cache,
            limits,
            flush_interval,
            flush_batch_cap,
            flush_max_retry,
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// `AddTraffic`: a no-op for an all-zero delta.
    pub async fn add_traffic(&self, rule_id: EntityId, upload: u64, download: u64) {
        if upload == 0 && download == 0 {
            return;
        }
        self.shards[shard_index(rule_id)].add(rule_id, upload, download).await;
    }

    /// Flushes every shard once, batching entries up to `flush_batch_cap`
    /// per cache call. Never panics or propagates a cache error upward —
    /// failures are logged and either retried next cycle or dropped past
    /// the retry ceiling.
    pub async fn flush(&self) {
        for shard in &self.shards {
            let snapshot = shard.take().await;
            if snapshot.is_empty() {
                continue;
            }

            let mut batch = Vec::with_capacity(self.flush_batch_cap.min(snapshot.len()));
            let mut entries: Vec<(EntityId, TrafficEntry)> = snapshot.into_iter().collect();
            let mut survivors = HashMap::new();

            while !entries.is_empty() {
                let take_now = entries.len().min(self.flush_batch_cap);
                batch.clear();
                for (rule_id, entry) in entries.drain(..take_now) {
                    batch.push((rule_id, entry));
                }

                let deltas: Vec<TrafficDelta> = batch
                    .iter()
                    .map(|(rule_id, entry)| TrafficDelta {
                        rule_id: *rule_id,
                        upload: entry.upload,
                        download: entry.download,
                    })
                    .collect();

                match self.cache.batch_increment(&deltas).await {
                    Ok(()) => {
                        if let Some(limits) = &self.limits {
                            for (rule_id, entry) in &batch {
                                limits.on_traffic_update(*rule_id, entry.upload, entry.download).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, batch_size = batch.len(), "traffic batch increment failed, will retry");
                        for (rule_id, mut entry) in batch.drain(..) {
                            entry.retry_count += 1;
                            if entry.retry_count >= self.flush_max_retry {
                                error!(rule_id, retry_count = entry.retry_count, "dropping traffic entry past retry ceiling");
                                continue;
                            }
                            survivors.insert(rule_id, entry);
                        }
                    }
                }
            }

            if !survivors.is_empty() {
                shard.merge_back(survivors).await;
            }
        }
    }

    /// Spawns the periodic flusher. Idempotent: a second call while
    /// already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut stop_guard = self.stop_tx.lock().await;
        if stop_guard.is_some() {
            return;
        }
        let (tx, mut rx) = mpsc::channel(1);
        *stop_guard = Some(tx);
        drop(stop_guard);

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.flush_interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.flush().await,
                    _ = rx.recv() => break,
                }
            }
        });
        *self.handle.lock().await = Some(handle);
    }

    /// Signals the flusher, waits for it to exit, then performs one final
    /// flush so nothing accrued after the last tick is lost.
    pub async fn stop(self: &Arc<Self>) {
        let tx = self.stop_tx.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryTrafficCache;

    #[tokio::test]
    async fn add_traffic_skips_all_zero_deltas() {
        let cache = Arc::new(InMemoryTrafficCache::new());
        let buffer = TrafficBuffer::new(cache.clone(), None, Duration::from_secs(60), 500, 10);
        buffer.add_traffic(1, 0, 0).await;
        buffer.flush().await;
        assert_eq!(cache.rule_totals(1), (0, 0));
    }

    #[tokio::test]
    async fn flush_sums_multiple_adds_into_one_cache_increment() {
        let cache = Arc::new(InMemoryTrafficCache::new());
        let buffer = TrafficBuffer::new(cache.clone(), None, Duration::from_secs(60), 500, 10);
        buffer.add_traffic(1, 100, 50).await;
        buffer.add_traffic(1, 20, 5).await;
        buffer.add_traffic(17, 1, 1).await; // shares shard 1 with rule 1 (17 % 16 == 1)
        buffer.flush().await;
        assert_eq!(cache.rule_totals(1), (120, 55));
        assert_eq!(cache.rule_totals(17), (1, 1));
    }

    #[tokio::test]
    async fn flush_is_a_no_op_on_an_empty_shard() {
        let cache = Arc::new(InMemoryTrafficCache::new());
        let buffer = TrafficBuffer::new(cache, None, Duration::from_secs(60), 500, 10);
        buffer.flush().await; // must not panic with nothing queued
    }

    #[tokio::test]
    async fn start_then_stop_runs_a_final_flush() {
        let cache = Arc::new(InMemoryTrafficCache::new());
        let buffer = TrafficBuffer::new(cache.clone(), None, Duration::from_millis(50), 500, 10);
        buffer.add_traffic(3, 10, 10).await;
        buffer.start().await;
        buffer.stop().await;
        assert_eq!(cache.rule_totals(3), (10, 10));
    }
}
