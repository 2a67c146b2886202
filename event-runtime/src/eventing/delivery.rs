//! 投递管理（DeliveryManager）
//!
//! 单个事件的状态机：`dispatched → {acked | timed-out}`。
//! - 投递：按事件类型申请并发槽位，调用匹配的处理器，启动 ack 截止计时；
//! - ack：取消计时、释放槽位、移出待确认表，并在事件存储中标记已处理；
//! - 超时或处理失败：释放槽位，尝试次数加一，未超过 `max_retries` 时按原优先级重新入队，
//!   否则记为失败（上报，不致命）。
//!
//! 关闭 ack 时为“发后即忘”：处理器成功返回即视为已处理，不做超时跟踪。
//! 迟到的 ack（事件已超时重投或已失败）按空操作处理。
//!
use super::handler::{EventHandler, HandlerRegistry};
use crate::concurrency::{ConcurrencyAdmission, ConcurrencyPermit};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::event::Event;
use crate::queue::{PriorityQueue, QueueEntry};
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

/// 最近失败记录的保留条数
const FAILURE_LOG_CAPACITY: usize = 100;

/// 开启可观测性时以 info 级别输出逐事件记录，否则为 debug
macro_rules! delivery_event {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+)
        } else {
            tracing::debug!($($arg)+)
        }
    };
}

/// 一次最终失败的投递
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub event_id: String,
    pub event_type: String,
    /// 总投递次数（含首次）
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStats {
    pub pending_acks: usize,
    pub in_flight: usize,
    pub dispatched: u64,
    pub processed: u64,
    pub acked: u64,
    pub retried: u64,
    pub failed: u64,
    /// 没有任何处理器订阅的事件
    pub unrouted: u64,
}

enum AckPhase {
    /// 已投递，等待 ack；持有计时任务与并发槽位
    Dispatched {
        timer: AbortHandle,
        _permit: ConcurrencyPermit,
    },
    /// 已超时或失败，等待重新投递
    Requeued,
}

/// 进行中的投递跟踪
struct PendingAck {
    entry: QueueEntry,
    attempt: u32,
    deadline: DateTime<Utc>,
    correlation_id: Option<String>,
    phase: AckPhase,
}

impl PendingAck {
    fn is_dispatched(&self, attempt: u32) -> bool {
        self.attempt == attempt && matches!(self.phase, AckPhase::Dispatched { .. })
    }

    /// 取消计时并释放槽位
    fn settle(&mut self) {
        if let AckPhase::Dispatched { timer, .. } =
            std::mem::replace(&mut self.phase, AckPhase::Requeued)
        {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    processed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    unrouted: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DeliveryShared {
    enable_acks: bool,
    ack_timeout: Duration,
    max_retries: u32,
    max_concurrent: usize,
    queue_timeout: Duration,
    verbose: bool,
    queue: Arc<Mutex<PriorityQueue>>,
    admission: ConcurrencyAdmission,
    handlers: RwLock<HandlerRegistry>,
    store: Option<Arc<EventStore>>,
    pending: Mutex<HashMap<String, PendingAck>>,
    counters: Counters,
    failures: Mutex<VecDeque<DeliveryFailure>>,
    wake: Arc<Notify>,
}

#[derive(Clone)]
pub struct DeliveryManager {
    shared: Arc<DeliveryShared>,
}

impl DeliveryManager {
    pub fn new(
        config: &RuntimeConfig,
        queue: Arc<Mutex<PriorityQueue>>,
        store: Option<Arc<EventStore>>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            shared: Arc::new(DeliveryShared {
                enable_acks: config.enable_acks,
                ack_timeout: config.ack_timeout(),
                max_retries: config.max_retries,
                max_concurrent: config.queue_config.max_concurrent,
                queue_timeout: config.queue_config.queue_timeout(),
                verbose: config.enable_observability,
                queue,
                admission: ConcurrencyAdmission::new(),
                handlers: RwLock::new(HandlerRegistry::default()),
                store,
                pending: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                failures: Mutex::new(VecDeque::with_capacity(FAILURE_LOG_CAPACITY)),
                wake,
            }),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.handler_name(), "handler registered");
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(handler);
    }

    /// 投递一个出队条目
    ///
    /// 并发槽位的登记在本调用内同步完成，因此同一事件类型的处理顺序与投递顺序一致。
    /// 返回的任务在处理器返回后结束（ack 模式下不等待 ack）。
    pub fn dispatch(&self, entry: QueueEntry) -> JoinHandle<()> {
        let permit = self.shared.admission.acquire(
            entry.event().event_type(),
            self.shared.max_concurrent,
            self.shared.queue_timeout,
        );
        self.shared.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.deliver(entry, permit).await })
    }

    /// 确认事件处理完成
    ///
    /// 返回 `false` 表示没有等待中的投递（迟到或未知的 ack）。
    /// 标记存储失败时返回错误，待确认状态保持不变，可再次 ack。
    pub async fn ack(&self, event_id: &str) -> RuntimeResult<bool> {
        self.shared.ack(event_id).await
    }

    /// 主动否认：立即按失败处理而不等待超时
    pub fn nack(&self, event_id: &str, reason: &str) -> bool {
        self.shared.expire(event_id, None, reason)
    }

    pub fn ack_handle(&self) -> AckHandle {
        AckHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// 当前等待 ack 的事件数（含等待重新投递的）
    pub fn pending_acks(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// 某事件当前的尝试次数（首次为 0）
    pub fn pending_attempt(&self, event_id: &str) -> Option<u32> {
        lock(&self.shared.pending).get(event_id).map(|p| p.attempt)
    }

    pub fn stats(&self) -> DeliveryStats {
        let c = &self.shared.counters;
        DeliveryStats {
            pending_acks: self.pending_acks(),
            in_flight: self.shared.admission.total_active(),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            unrouted: c.unrouted.load(Ordering::Relaxed),
        }
    }

    /// 最近的失败记录，按时间先后
    pub fn recent_failures(&self) -> Vec<DeliveryFailure> {
        lock(&self.shared.failures).iter().cloned().collect()
    }

    /// 放弃所有待确认投递：取消计时并释放槽位，返回放弃的数量
    pub fn clear(&self) -> usize {
        let drained: Vec<PendingAck> = lock(&self.shared.pending)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        let count = drained.len();
        for mut pending in drained {
            pending.settle();
        }
        count
    }
}

impl DeliveryShared {
    async fn deliver(
        self: Arc<Self>,
        entry: QueueEntry,
        permit: impl Future<Output = RuntimeResult<ConcurrencyPermit>>,
    ) {
        let permit = match permit.await {
            Ok(permit) => permit,
            Err(err) => {
                debug!(event_id = entry.event().id(), error = %err, "admission rejected");
                self.retry_or_fail(entry, err.to_string());
                return;
            }
        };

        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(entry.event().event_type());
        if handlers.is_empty() {
            drop(permit);
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            debug!(
                event_id = entry.event().id(),
                event_type = entry.event().event_type(),
                "no handler for event"
            );
            return;
        }

        if let Some(store) = &self.store {
            store.record_attempt(entry.event().id());
        }
        delivery_event!(
            self.verbose,
            event_id = entry.event().id(),
            event_type = entry.event().event_type(),
            attempt = entry.attempt(),
            correlation_id = entry.event().correlation_id(),
            "event dispatched"
        );

        if self.enable_acks {
            let id = entry.event().id().to_string();
            let attempt = entry.attempt();
            let event = entry.event().clone();
            self.track(entry, permit);
            if let Err(err) = invoke(&handlers, &event).await {
                self.expire(&id, Some(attempt), &err.to_string());
            }
        } else {
            let outcome = invoke(&handlers, entry.event()).await;
            drop(permit);
            match outcome {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => self.retry_or_fail(entry, err.to_string()),
            }
        }
    }

    /// 登记待确认并启动 ack 截止计时
    fn track(self: &Arc<Self>, entry: QueueEntry, permit: ConcurrencyPermit) {
        let id = entry.event().id().to_string();
        let attempt = entry.attempt();
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        let correlation_id = entry.event().correlation_id().map(str::to_string);

        // 持锁启动计时任务，保证超时回调一定看到本条登记
        let mut pending = lock(&self.pending);
        let timer = {
            let shared: Weak<Self> = Arc::downgrade(self);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if let Some(shared) = shared.upgrade() {
                    shared.expire(&id, Some(attempt), "ack timeout");
                }
            })
            .abort_handle()
        };
        let tracked = PendingAck {
            entry,
            attempt,
            deadline: Utc::now()
                + chrono::Duration::from_std(self.ack_timeout).unwrap_or(chrono::Duration::MAX),
            correlation_id,
            phase: AckPhase::Dispatched {
                timer,
                _permit: permit,
            },
        };
        if let Some(mut stale) = pending.insert(id, tracked) {
            stale.settle();
        }
    }

    async fn ack(&self, event_id: &str) -> RuntimeResult<bool> {
        let attempt = match lock(&self.pending).get(event_id) {
            Some(p) if p.is_dispatched(p.attempt) => p.attempt,
            _ => {
                debug!(event_id, "late or unknown ack ignored");
                return Ok(false);
            }
        };

        if let Some(store) = &self.store {
            store.mark_events_processed(&[event_id.to_string()]).await?;
        }

        let settled = {
            let mut pending = lock(&self.pending);
            match pending.get(event_id) {
                Some(p) if p.is_dispatched(attempt) => pending.remove(event_id),
                _ => None,
            }
        };
        let Some(mut settled) = settled else {
            // 标记期间已超时重投：按至少一次语义仍会再次投递
            debug!(event_id, "ack raced with timeout");
            return Ok(false);
        };
        settled.settle();

        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        delivery_event!(
            self.verbose,
            event_id,
            attempt,
            correlation_id = settled.correlation_id.as_deref(),
            deadline = %settled.deadline,
            "event acked"
        );
        Ok(true)
    }

    /// 结束一次等待中的投递（超时或失败）并进入重试
    ///
    /// `attempt` 为 `Some` 时只处理该次投递，迟到的回调不影响后续重投。
    fn expire(&self, event_id: &str, attempt: Option<u32>, reason: &str) -> bool {
        let entry = {
            let mut pending = lock(&self.pending);
            let Some(p) = pending.get_mut(event_id) else {
                return false;
            };
            if !p.is_dispatched(attempt.unwrap_or(p.attempt)) {
                return false;
            }
            p.settle();
            p.entry.clone()
        };
        debug!(event_id, attempt = entry.attempt(), reason, "delivery expired");
        self.retry_or_fail(entry, reason.to_string());
        true
    }

    fn retry_or_fail(&self, entry: QueueEntry, reason: String) {
        let next = entry.attempt() + 1;
        let id = entry.event().id().to_string();
        if next <= self.max_retries {
            let retry = entry.clone().retry(next);
            if let Some(p) = lock(&self.pending).get_mut(&id) {
                p.attempt = next;
                p.entry = retry.clone();
            }
            if lock(&self.queue).requeue(retry) {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                delivery_event!(self.verbose, event_id = %id, attempt = next, reason = %reason, "event requeued");
                self.wake.notify_one();
                return;
            }
            self.fail(entry.into_event(), next, format!("{reason}; requeue rejected: queue full"));
            return;
        }
        self.fail(entry.into_event(), next, reason);
    }

    fn fail(&self, event: Event, attempts: u32, reason: String) {
        lock(&self.pending).remove(event.id());
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        warn!(
            event_id = event.id(),
            event_type = event.event_type(),
            attempts,
            reason = %reason,
            "event delivery failed"
        );

        let mut failures = lock(&self.failures);
        if failures.len() == FAILURE_LOG_CAPACITY {
            failures.pop_front();
        }
        failures.push_back(DeliveryFailure {
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            attempts,
            reason,
            failed_at: Utc::now(),
        });
    }
}

/// 并发调用所有处理器，彼此独立；返回第一个失败
async fn invoke(handlers: &[Arc<dyn EventHandler>], event: &Event) -> RuntimeResult<()> {
    let results = join_all(handlers.iter().map(|h| async move {
        match AssertUnwindSafe(h.handle(event)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(RuntimeError::EventHandler {
                handler: h.handler_name().to_string(),
                reason: format!("{err:#}"),
            }),
            Err(_) => Err(RuntimeError::EventHandler {
                handler: h.handler_name().to_string(),
                reason: "handler panicked".to_string(),
            }),
        }
    }))
    .await;
    results.into_iter().collect()
}

/// 可克隆的 ack 句柄，供处理器在自身逻辑内确认事件
///
/// 不持有运行时所有权；运行时释放后 ack 返回 `RuntimeError::Stopped`。
#[derive(Clone)]
pub struct AckHandle {
    shared: Weak<DeliveryShared>,
}

impl AckHandle {
    pub async fn ack(&self, event_id: &str) -> RuntimeResult<bool> {
        let shared = self.shared.upgrade().ok_or(RuntimeError::Stopped)?;
        shared.ack(event_id).await
    }

    pub fn nack(&self, event_id: &str, reason: &str) -> RuntimeResult<bool> {
        let shared = self.shared.upgrade().ok_or(RuntimeError::Stopped)?;
        Ok(shared.expire(event_id, None, reason))
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckHandle").finish_non_exhaustive()
    }
}
