//! 事件存储（EventStore）
//!
//! - 追加：每次 `append_events` 写入一条持久化快照，失败时回滚本批次的缓存元数据并上抛；
//! - 元数据：LRU 有界缓存，驱逐不影响持久化记录；
//! - 已处理标记：ack 成功后追加标记快照，缓存未命中时以持久化标记为准；
//! - 回放：惰性、可重启、有限的批次流，每次调用从头扫描。
//!
use crate::config::EventStoreConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::Event;
use crate::resilience::CircuitBreaker;
use crate::store::{EventMetadata, EventPersistor, Snapshot};
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt, stream};
use lru::LruCache;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

type MetadataCache = Arc<Mutex<LruCache<String, EventMetadata>>>;

/// 回放选项
#[derive(Debug, Clone, bon::Builder)]
pub struct ReplayOptions {
    /// 截止时间（含）
    pub to: Option<DateTime<Utc>>,
    /// 只回放尚未标记已处理的事件
    #[builder(default)]
    pub only_unprocessed: bool,
    #[builder(default = 100)]
    pub batch_size: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStoreStats {
    pub stream_id: String,
    pub sequence_number: u64,
    pub total_stored_events: usize,
    /// 缓存内尚未处理的事件数（缓存之外的事件不计入）
    pub unprocessed_events: usize,
    pub cached_entries: usize,
    pub cache_capacity: usize,
    pub oldest_event: Option<DateTime<Utc>>,
    pub newest_event: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Bounds {
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
}

impl Bounds {
    fn observe(&mut self, ts: DateTime<Utc>) {
        self.oldest = Some(self.oldest.map_or(ts, |o| o.min(ts)));
        self.newest = Some(self.newest.map_or(ts, |n| n.max(ts)));
    }
}

pub struct EventStore {
    xc_id: String,
    persistor: Arc<dyn EventPersistor>,
    breaker: Option<Arc<CircuitBreaker>>,
    config: EventStoreConfig,
    cache: MetadataCache,
    /// 串行化追加、标记与裁剪，保证序号与快照写入顺序一致
    append_lock: tokio::sync::Mutex<()>,
    sequence: AtomicU64,
    stored: AtomicUsize,
    bounds: Mutex<Bounds>,
}

impl EventStore {
    pub fn new(
        xc_id: impl Into<String>,
        persistor: Arc<dyn EventPersistor>,
        config: EventStoreConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.max_cache_size()).unwrap_or(NonZeroUsize::MIN);
        Self {
            xc_id: xc_id.into(),
            persistor,
            breaker: None,
            config,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
            append_lock: tokio::sync::Mutex::new(()),
            sequence: AtomicU64::new(0),
            stored: AtomicUsize::new(0),
            bounds: Mutex::new(Bounds::default()),
        }
    }

    /// 持久化写入经由该熔断器
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn xc_id(&self) -> &str {
        &self.xc_id
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, EventMetadata>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bounds(&self) -> MutexGuard<'_, Bounds> {
        self.bounds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, snapshot: &Snapshot) -> RuntimeResult<()> {
        match &self.breaker {
            Some(breaker) => breaker.call(|| self.persistor.append(snapshot)).await,
            None => self.persistor.append(snapshot).await,
        }
    }

    /// 追加一批事件
    ///
    /// 关闭回放或空输入时为空操作。持久化失败时本批次的缓存条目恢复原值（或移除），
    /// 调用方可以原样重试。
    pub async fn append_events(&self, events: &[Event]) -> RuntimeResult<()> {
        if !self.config.enable_replay || events.is_empty() {
            return Ok(());
        }
        let _guard = self.append_lock.lock().await;

        let previous: Vec<(String, Option<EventMetadata>)> = {
            let mut cache = self.cache();
            events
                .iter()
                .map(|event| {
                    let id = event.id().to_string();
                    let prev = cache.put(id.clone(), EventMetadata::for_event(event));
                    (id, prev)
                })
                .collect()
        };

        let next = self.sequence_number() + events.len() as u64;
        let snapshot = Snapshot::for_events(&self.xc_id, next, events.to_vec());
        if let Err(err) = self.persist(&snapshot).await {
            let mut cache = self.cache();
            for (id, prev) in previous.into_iter().rev() {
                match prev {
                    Some(meta) => {
                        cache.put(id, meta);
                    }
                    None => {
                        cache.pop(&id);
                    }
                }
            }
            warn!(stream = %self.xc_id, count = events.len(), error = %err, "append rolled back");
            return Err(err);
        }

        self.sequence.store(next, Ordering::Release);
        self.stored.fetch_add(events.len(), Ordering::AcqRel);
        let mut bounds = self.bounds();
        for event in events {
            bounds.observe(event.timestamp());
        }
        debug!(stream = %self.xc_id, sequence = next, count = events.len(), "events appended");
        Ok(())
    }

    /// 标记事件已处理：更新缓存中的条目，并追加一条持久化标记快照
    pub async fn mark_events_processed(&self, ids: &[String]) -> RuntimeResult<()> {
        if !self.config.enable_replay || ids.is_empty() {
            return Ok(());
        }
        let _guard = self.append_lock.lock().await;

        let now = Utc::now();
        let previous: Vec<(String, bool, Option<DateTime<Utc>>)> = {
            let mut cache = self.cache();
            ids.iter()
                .filter_map(|id| {
                    let meta = cache.get_mut(id)?;
                    let prev = (id.clone(), meta.processed, meta.last_processed_at);
                    meta.processed = true;
                    meta.last_processed_at = Some(now);
                    Some(prev)
                })
                .collect()
        };

        let snapshot = Snapshot::processed_marks(&self.xc_id, self.sequence_number(), ids.to_vec());
        if let Err(err) = self.persist(&snapshot).await {
            let mut cache = self.cache();
            for (id, processed, last) in previous {
                if let Some(meta) = cache.peek_mut(&id) {
                    meta.processed = processed;
                    meta.last_processed_at = last;
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// 记录一次投递尝试（仅缓存内条目）
    pub fn record_attempt(&self, event_id: &str) {
        if let Some(meta) = self.cache().get_mut(event_id) {
            meta.processing_attempts += 1;
        }
    }

    /// 查询缓存中的元数据（会刷新 LRU 位置）
    pub fn metadata(&self, event_id: &str) -> Option<EventMetadata> {
        self.cache().get(event_id).cloned()
    }

    /// 从 `from` 起回放事件批次
    ///
    /// 返回的流惰性拉取快照：先按快照追加时间跳过整条快照，再逐事件过滤，
    /// 满 `batch_size` 即产出一批，末尾产出不足一批的剩余事件；
    /// 累计达到 `max_stored_events` 时提前结束。丢弃流即释放底层游标。
    pub fn replay_from_timestamp(
        &self,
        from: DateTime<Utc>,
        options: ReplayOptions,
    ) -> BoxStream<'static, RuntimeResult<Vec<Event>>> {
        let cursor = ReplayCursor {
            persistor: self.persistor.clone(),
            xc_id: self.xc_id.clone(),
            cache: self.cache.clone(),
            snapshots: None,
            pending: VecDeque::new(),
            durable_processed: None,
            from,
            to: options.to,
            only_unprocessed: options.only_unprocessed,
            batch_size: options.batch_size.max(1),
            remaining: self.config.max_stored_events,
            done: false,
        };

        stream::unfold(cursor, |mut cursor| async move {
            match cursor.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), cursor)),
                Ok(None) => None,
                Err(err) => {
                    cursor.done = true;
                    Some((Err(err), cursor))
                }
            }
        })
        .boxed()
    }

    pub fn get_stats(&self) -> EventStoreStats {
        let (cached_entries, cache_capacity, unprocessed_events) = {
            let cache = self.cache();
            let unprocessed = cache.iter().filter(|(_, m)| !m.processed).count();
            (cache.len(), cache.cap().get(), unprocessed)
        };
        let bounds = *self.bounds();
        EventStoreStats {
            stream_id: self.xc_id.clone(),
            sequence_number: self.sequence_number(),
            total_stored_events: self.stored.load(Ordering::Acquire),
            unprocessed_events,
            cached_entries,
            cache_capacity,
            oldest_event: bounds.oldest,
            newest_event: bounds.newest,
        }
    }

    /// 删除追加时间早于 `now - older_than` 的快照，返回删除的事件数
    pub async fn cleanup(&self, older_than: Duration) -> RuntimeResult<usize> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|err| RuntimeError::invalid_config(format!("cleanup age: {err}")))?;
        let cutoff = Utc::now() - age;

        let removed = {
            let _guard = self.append_lock.lock().await;
            self.persistor.prune(&self.xc_id, cutoff).await?
        };

        {
            let mut cache = self.cache();
            let stale: Vec<String> = cache
                .iter()
                .filter(|(_, m)| m.timestamp < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                cache.pop(&id);
            }
        }

        if removed > 0 {
            self.restore_position().await?;
        }
        debug!(stream = %self.xc_id, removed, "store cleanup");
        Ok(removed)
    }

    /// 扫描持久化流，恢复序号、存量与时间边界，返回恢复后的序号
    ///
    /// 用于进程重启后重新打开同一条流。
    pub async fn restore_position(&self) -> RuntimeResult<u64> {
        let _guard = self.append_lock.lock().await;
        let mut snapshots = self.persistor.load(&self.xc_id).await;
        let mut sequence = 0;
        let mut stored = 0;
        let mut bounds = Bounds::default();
        while let Some(snapshot) = snapshots.try_next().await? {
            sequence = sequence.max(snapshot.state().sequence_number);
            stored += snapshot.events().len();
            for event in snapshot.events() {
                bounds.observe(event.timestamp());
            }
        }

        let sequence = sequence.max(self.sequence_number());
        self.sequence.store(sequence, Ordering::Release);
        self.stored.store(stored, Ordering::Release);
        *self.bounds() = bounds;
        debug!(stream = %self.xc_id, sequence, stored, "store position restored");
        Ok(sequence)
    }
}

/// 回放游标：持有当前快照中尚未消费的事件
struct ReplayCursor {
    persistor: Arc<dyn EventPersistor>,
    xc_id: String,
    cache: MetadataCache,
    snapshots: Option<BoxStream<'static, RuntimeResult<Snapshot>>>,
    pending: VecDeque<Event>,
    /// 持久化的已处理集合，首次缓存未命中时才加载
    durable_processed: Option<HashSet<String>>,
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
    only_unprocessed: bool,
    batch_size: usize,
    remaining: usize,
    done: bool,
}

impl ReplayCursor {
    async fn next_batch(&mut self) -> RuntimeResult<Option<Vec<Event>>> {
        let mut batch = Vec::new();
        while !self.done {
            if self.remaining == 0 {
                self.done = true;
                break;
            }

            if let Some(event) = self.pending.pop_front() {
                if self.accepts(&event).await? {
                    batch.push(event);
                    self.remaining -= 1;
                    if batch.len() == self.batch_size {
                        return Ok(Some(batch));
                    }
                }
                continue;
            }

            if self.snapshots.is_none() {
                self.snapshots = Some(self.persistor.load(&self.xc_id).await);
            }
            let Some(snapshots) = self.snapshots.as_mut() else {
                break;
            };
            match snapshots.try_next().await? {
                Some(snapshot) => {
                    if !snapshot.verify() {
                        warn!(stream = %self.xc_id, hash = snapshot.hash(), "snapshot fingerprint mismatch");
                    }
                    if snapshot.xc_id() != self.xc_id {
                        continue;
                    }
                    // 事件时间可由生产者指定，按批内最新事件判断整条快照能否跳过
                    let newest = snapshot.events().iter().map(Event::timestamp).max();
                    if newest.is_none_or(|ts| ts < self.from) {
                        continue;
                    }
                    self.pending.extend(snapshot.into_events());
                }
                None => self.done = true,
            }
        }

        self.snapshots = None;
        Ok((!batch.is_empty()).then_some(batch))
    }

    async fn accepts(&mut self, event: &Event) -> RuntimeResult<bool> {
        let ts = event.timestamp();
        if ts < self.from || self.to.is_some_and(|to| ts > to) {
            return Ok(false);
        }
        if !self.only_unprocessed {
            return Ok(true);
        }
        Ok(!self.is_processed(event.id()).await?)
    }

    async fn is_processed(&mut self, id: &str) -> RuntimeResult<bool> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|m| m.processed);
        if let Some(processed) = cached {
            return Ok(processed);
        }

        if self.durable_processed.is_none() {
            let mut marks = HashSet::new();
            let mut snapshots = self.persistor.load(&self.xc_id).await;
            while let Some(snapshot) = snapshots.try_next().await? {
                marks.extend(snapshot.state().processed.iter().cloned());
            }
            self.durable_processed = Some(marks);
        }
        Ok(self
            .durable_processed
            .as_ref()
            .is_some_and(|marks| marks.contains(id)))
    }
}
