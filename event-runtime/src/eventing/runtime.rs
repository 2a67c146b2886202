//! 运行时（Runtime）
//!
//! 组合根：持有一个优先级队列、一个投递管理器、一个事件存储与熔断器注册表，
//! 对外提供 emit / process / ack / replay / stats / cleanup。
//! - `process()`：反复“出队一批 + 投递”直至队列排空且没有进行中的投递；
//! - `start()`：持续模式，被 emit、重试入队或空闲轮询唤醒，返回可关闭的 `RuntimeHandle`；
//! - `recover()`：进程重启后从持久化流恢复序号，并重新入队尚未处理的事件。
//!
use super::delivery::{AckHandle, DeliveryFailure, DeliveryManager, DeliveryStats};
use super::handler::{EventHandler, FnHandler};
use crate::config::{PersistorType, RuntimeConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::{CORRELATION_ID_KEY, EmitOptions, Event, TENANT_ID_KEY};
use crate::queue::PriorityQueue;
use crate::resilience::{CircuitBreakerRegistry, CircuitBreakerStats};
use crate::store::{EventPersistor, EventStore, EventStoreStats, MemoryPersistor, ReplayOptions};
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::stream::FuturesUnordered;
use futures_util::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

/// 事件存储写入所经过的熔断器名称
pub const EVENT_STORE_CIRCUIT: &str = "event-store";

/// 一次 `process()` 的增量统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub dispatched: u64,
    pub processed: u64,
    pub acked: u64,
    pub failed: u64,
    pub retried: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub max_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub stream_id: String,
    pub emitted: u64,
    /// 因队列已满被拒绝的事件数
    pub rejected: u64,
    pub running: bool,
    pub stopped: bool,
    pub started_at: DateTime<Utc>,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub queue: QueueStats,
    pub delivery: DeliveryStats,
    pub runtime: RuntimeInfo,
    pub store: Option<EventStoreStats>,
    pub circuit_breakers: Vec<CircuitBreakerStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub dropped_events: usize,
    pub abandoned_acks: usize,
    pub disposed_circuits: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub struct Runtime {
    config: RuntimeConfig,
    xc_id: String,
    queue: Arc<Mutex<PriorityQueue>>,
    delivery: DeliveryManager,
    store: Option<Arc<EventStore>>,
    breakers: Arc<CircuitBreakerRegistry>,
    emitted: AtomicU64,
    rejected: AtomicU64,
    started_at: DateTime<Utc>,
    uptime: Instant,
    /// 同一时刻只允许一个调度循环
    processing: tokio::sync::Mutex<()>,
    wake: Arc<Notify>,
    running: AtomicBool,
    stopped: AtomicBool,
}

#[bon::bon]
impl Runtime {
    /// 构造运行时
    ///
    /// 未指定 `persistor` 时按 `eventStoreConfig.persistorType` 创建；
    /// 未指定 `breakers` 时以 `circuitBreaker` 配置新建注册表。
    #[builder]
    pub fn new(
        #[builder(default)] config: RuntimeConfig,
        persistor: Option<Arc<dyn EventPersistor>>,
        breakers: Option<Arc<CircuitBreakerRegistry>>,
    ) -> RuntimeResult<Self> {
        config.validate()?;

        let xc_id = config
            .event_store_config
            .stream_id
            .clone()
            .unwrap_or_else(|| format!("xc-{}", Uuid::new_v4()));
        let breakers = breakers
            .unwrap_or_else(|| Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())));

        let store = if config.enable_event_store {
            let persistor = match persistor {
                Some(persistor) => persistor,
                None => default_persistor(&config)?,
            };
            let store = EventStore::new(&xc_id, persistor, config.event_store_config.clone())
                .with_breaker(breakers.get_or_create(EVENT_STORE_CIRCUIT));
            Some(Arc::new(store))
        } else {
            None
        };

        let queue = Arc::new(Mutex::new(PriorityQueue::new(config.queue_size)));
        let wake = Arc::new(Notify::new());
        let delivery = DeliveryManager::new(&config, queue.clone(), store.clone(), wake.clone());

        info!(
            stream = %xc_id,
            queue_size = config.queue_size,
            acks = config.enable_acks,
            event_store = config.enable_event_store,
            "runtime created"
        );

        Ok(Self {
            config,
            xc_id,
            queue,
            delivery,
            store,
            breakers,
            emitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            started_at: Utc::now(),
            uptime: Instant::now(),
            processing: tokio::sync::Mutex::new(()),
            wake,
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }
}

fn default_persistor(config: &RuntimeConfig) -> RuntimeResult<Arc<dyn EventPersistor>> {
    match config.event_store_config.persistor_type {
        PersistorType::Memory => Ok(Arc::new(MemoryPersistor::new())),
        #[cfg(feature = "file-persistor")]
        PersistorType::File => {
            let dir = config.event_store_config.path.clone().ok_or_else(|| {
                RuntimeError::invalid_config("eventStoreConfig.path is required for file persistor")
            })?;
            Ok(Arc::new(crate::store::FilePersistor::new(dir)))
        }
        #[cfg(not(feature = "file-persistor"))]
        PersistorType::File => Err(RuntimeError::invalid_config(
            "file persistor requires the `file-persistor` feature",
        )),
    }
}

impl Runtime {
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 持久化流 ID
    pub fn xc_id(&self) -> &str {
        &self.xc_id
    }

    pub fn store(&self) -> Option<&Arc<EventStore>> {
        self.store.as_ref()
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.queue).size()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> RuntimeResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RuntimeError::Stopped);
        }
        Ok(())
    }

    /// 注册闭包处理器
    pub fn on<F, Fut>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_handler(Arc::new(FnHandler::new(event_type, handler)));
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.delivery.register_handler(handler);
    }

    /// 构造事件并入队，返回是否被接受
    pub async fn emit(
        &self,
        event_type: impl Into<String>,
        data: Value,
        options: EmitOptions,
    ) -> RuntimeResult<bool> {
        let EmitOptions {
            priority,
            correlation_id,
            tenant_id,
            thread_id,
        } = options;
        let mut event = Event::builder()
            .event_type(event_type)
            .data(data)
            .maybe_thread_id(thread_id)
            .build();
        if let Some(correlation_id) = correlation_id {
            event.insert_metadata(CORRELATION_ID_KEY, correlation_id);
        }
        if let Some(tenant_id) = tenant_id {
            event.insert_metadata(TENANT_ID_KEY, tenant_id);
        }
        self.enqueue(event, priority).await
    }

    /// 入队一个已构造的事件
    ///
    /// 队列已满时返回 `Ok(false)`，事件不写入存储；
    /// 存储写入失败时返回错误，事件不入队。
    pub async fn enqueue(&self, event: Event, priority: i32) -> RuntimeResult<bool> {
        self.ensure_open()?;
        {
            let queue = lock(&self.queue);
            if queue.size() >= queue.max_depth() {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_id = event.id(),
                    max_depth = queue.max_depth(),
                    "queue full, event rejected"
                );
                return Ok(false);
            }
        }

        if let Some(store) = &self.store {
            store.append_events(std::slice::from_ref(&event)).await?;
        }

        let event_id = event.id().to_string();
        if !lock(&self.queue).enqueue(event, priority) {
            // 写入存储后队列才被占满：事件留在持久化流中，可由 recover 取回
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event_id, priority, "event emitted");
        self.wake.notify_one();
        Ok(true)
    }

    /// 排空队列：反复出队一批并投递，直至队列为空且没有进行中的投递
    pub async fn process(&self) -> RuntimeResult<ProcessSummary> {
        self.ensure_open()?;
        let _guard = self.processing.lock().await;

        let before = self.delivery.stats();
        let started = Instant::now();
        let span = if self.config.enable_observability {
            info_span!("runtime.process", stream = %self.xc_id)
        } else {
            Span::none()
        };
        self.drain().instrument(span).await;
        let after = self.delivery.stats();

        let summary = ProcessSummary {
            dispatched: after.dispatched - before.dispatched,
            processed: after.processed - before.processed,
            acked: after.acked - before.acked,
            failed: after.failed - before.failed,
            retried: after.retried - before.retried,
            elapsed_ms: millis(started.elapsed()),
        };
        if summary.dispatched > 0 {
            debug!(
                dispatched = summary.dispatched,
                processed = summary.processed,
                failed = summary.failed,
                elapsed_ms = summary.elapsed_ms,
                "process cycle finished"
            );
        }
        Ok(summary)
    }

    /// `process()` 并附带一份完整统计
    pub async fn process_with_stats(&self) -> RuntimeResult<(ProcessSummary, RuntimeStats)> {
        let summary = self.process().await?;
        Ok((summary, self.stats()))
    }

    async fn drain(&self) {
        let batch_size = self.config.batch_size;
        let mut in_flight: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
        loop {
            // 进行中的投递不超过一批，饱和的事件类型在准入处等待
            let room = batch_size.saturating_sub(in_flight.len());
            let batch = if room > 0 {
                lock(&self.queue).dequeue_batch(room)
            } else {
                Vec::new()
            };

            if batch.is_empty() {
                match in_flight.next().await {
                    Some(Ok(())) => continue,
                    Some(Err(err)) => {
                        error!(error = %err, "delivery task aborted");
                        continue;
                    }
                    None => break,
                }
            }
            for entry in batch {
                in_flight.push(self.delivery.dispatch(entry));
            }
        }
    }

    /// 确认事件；迟到或未知的 ack 返回 `Ok(false)`
    pub async fn ack(&self, event_id: &str) -> RuntimeResult<bool> {
        self.delivery.ack(event_id).await
    }

    /// 否认事件，立即进入重试
    pub fn nack(&self, event_id: &str, reason: &str) -> bool {
        self.delivery.nack(event_id, reason)
    }

    /// 供处理器内部使用的 ack 句柄
    pub fn ack_handle(&self) -> AckHandle {
        self.delivery.ack_handle()
    }

    /// 回放事件；未启用事件存储时返回空流
    pub fn replay_events(
        &self,
        from: DateTime<Utc>,
        options: ReplayOptions,
    ) -> BoxStream<'static, RuntimeResult<Vec<Event>>> {
        match &self.store {
            Some(store) => store.replay_from_timestamp(from, options),
            None => stream::empty().boxed(),
        }
    }

    /// 崩溃恢复：恢复存储序号，并把 `from` 之后尚未处理的事件重新入队
    ///
    /// 原优先级不在持久化记录中，恢复的事件以优先级 0 入队。返回入队数量。
    pub async fn recover(&self, from: DateTime<Utc>) -> RuntimeResult<usize> {
        self.ensure_open()?;
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let sequence = store.restore_position().await?;

        let options = ReplayOptions::builder()
            .only_unprocessed(true)
            .batch_size(self.config.batch_size)
            .build();
        let mut batches = store.replay_from_timestamp(from, options);
        let mut restored = 0;
        'replay: while let Some(batch) = batches.try_next().await? {
            let mut queue = lock(&self.queue);
            for event in batch {
                if !queue.enqueue(event, 0) {
                    warn!(restored, "queue full, recovery truncated");
                    break 'replay;
                }
                restored += 1;
            }
        }

        if restored > 0 {
            self.wake.notify_one();
        }
        info!(stream = %self.xc_id, sequence, restored, "runtime recovered");
        Ok(restored)
    }

    pub fn recent_failures(&self) -> Vec<DeliveryFailure> {
        self.delivery.recent_failures()
    }

    pub fn stats(&self) -> RuntimeStats {
        let queue = {
            let queue = lock(&self.queue);
            QueueStats {
                size: queue.size(),
                max_depth: queue.max_depth(),
            }
        };
        RuntimeStats {
            queue,
            delivery: self.delivery.stats(),
            runtime: RuntimeInfo {
                stream_id: self.xc_id.clone(),
                emitted: self.emitted.load(Ordering::Relaxed),
                rejected: self.rejected.load(Ordering::Relaxed),
                running: self.is_running(),
                stopped: self.stopped.load(Ordering::Acquire),
                started_at: self.started_at,
                uptime_ms: millis(self.uptime.elapsed()),
            },
            store: self.store.as_ref().map(|s| s.get_stats()),
            circuit_breakers: self.breakers.stats(),
        }
    }

    /// 持续模式：启动调度循环，返回可用于关闭/等待的句柄
    pub fn start(self: &Arc<Self>) -> RuntimeHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_loop(token.clone()));
        RuntimeHandle {
            token,
            tasks: vec![task],
        }
    }

    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.running.store(true, Ordering::Release);
        info!(stream = %self.xc_id, "runtime loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = token.cancelled() => break,
                result = self.process() => match result {
                    Ok(_) => {}
                    Err(RuntimeError::Stopped) => break,
                    Err(err) => error!(error = %err, "process cycle failed"),
                },
            }
        }

        self.running.store(false, Ordering::Release);
        info!(stream = %self.xc_id, "runtime loop stopped");
    }

    /// 停止接收新工作：清空队列、放弃待确认投递并释放所有熔断器
    ///
    /// 已在执行的处理器不会被中断；之后的 emit/process 返回 `RuntimeError::Stopped`。
    pub fn cleanup(&self) -> CleanupReport {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
        let report = CleanupReport {
            dropped_events: lock(&self.queue).clear(),
            abandoned_acks: self.delivery.clear(),
            disposed_circuits: self.breakers.dispose_all(),
        };
        info!(
            stream = %self.xc_id,
            dropped = report.dropped_events,
            abandoned = report.abandoned_acks,
            circuits = report.disposed_circuits,
            "runtime cleaned up"
        );
        report
    }
}

/// 运行句柄：用于优雅关闭与等待调度循环结束
pub struct RuntimeHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
