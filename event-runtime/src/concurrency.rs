//! 并发准入（ConcurrencyAdmission）
//!
//! 按键计数的信号量，带 FIFO 等待队列与等待超时：
//! - 活跃数未达上限时立即授予槽位；
//! - 饱和且超时为 0 时立即以 `CONCURRENCY_DROP` 拒绝；
//! - 否则登记一个等待者，超时后以 `CONCURRENCY_TIMEOUT` 失败；
//! - 释放槽位时直接移交给该键队首的等待者，活跃数不回落，避免惊群式重新争抢。
//!
//! 槽位以 RAII 形式的 `ConcurrencyPermit` 持有，drop 即释放。
//!
use crate::error::{RuntimeError, RuntimeResult};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Default)]
struct KeySlots {
    active: usize,
    waiters: VecDeque<Waiter>,
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct Shared {
    slots: DashMap<String, KeySlots>,
    next_waiter: AtomicU64,
}

impl Shared {
    /// 释放一个槽位：优先移交给仍在等待的队首等待者
    fn release(&self, key: &str) {
        {
            let Some(mut slots) = self.slots.get_mut(key) else {
                return;
            };
            while let Some(waiter) = slots.waiters.pop_front() {
                // 接收端已关闭说明等待者已放弃，继续尝试下一个
                if waiter.grant.send(()).is_ok() {
                    return;
                }
            }
            slots.active = slots.active.saturating_sub(1);
        }
        self.slots
            .remove_if(key, |_, s| s.active == 0 && s.waiters.is_empty());
    }

    /// 从等待队列移除（已被移交或不存在时为空操作）
    fn cancel_waiter(&self, key: &str, id: u64) {
        {
            let Some(mut slots) = self.slots.get_mut(key) else {
                return;
            };
            if let Some(pos) = slots.waiters.iter().position(|w| w.id == id) {
                slots.waiters.remove(pos);
            }
        }
        self.slots
            .remove_if(key, |_, s| s.active == 0 && s.waiters.is_empty());
    }
}

enum Registration {
    Granted,
    Dropped,
    Queued(WaitGuard),
}

/// 等待者守卫：持有接收端，在超时或 future 被丢弃时撤销登记；
/// 若槽位已经移交到本接收端则代为释放，保证槽位不泄漏也不重复释放。
struct WaitGuard {
    shared: Arc<Shared>,
    key: String,
    id: u64,
    grant: oneshot::Receiver<()>,
    armed: bool,
}

impl WaitGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }

    /// 撤销等待并关闭接收端；返回 `true` 表示槽位在撤销前已经移交给本等待者
    fn settle(&mut self) -> bool {
        self.armed = false;
        self.shared.cancel_waiter(&self.key, self.id);
        self.grant.close();
        self.grant.try_recv().is_ok()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.armed && self.settle() {
            self.shared.release(&self.key);
        }
    }
}

/// 已授予的并发槽位，drop 时释放
pub struct ConcurrencyPermit {
    shared: Arc<Shared>,
    key: String,
}

impl ConcurrencyPermit {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.shared.release(&self.key);
    }
}

#[derive(Clone, Default)]
pub struct ConcurrencyAdmission {
    shared: Arc<Shared>,
}

impl ConcurrencyAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    /// 申请 `key` 的一个槽位
    ///
    /// 登记在调用时同步完成，因此同一键的授予顺序与调用顺序一致；
    /// 返回的 future 只负责等待授予或超时。
    pub fn acquire(
        &self,
        key: &str,
        max_concurrent: usize,
        queue_timeout: Duration,
    ) -> impl Future<Output = RuntimeResult<ConcurrencyPermit>> + Send + 'static {
        let registration = self.register(key, max_concurrent, queue_timeout);
        let shared = self.shared.clone();
        let key = key.to_string();

        async move {
            match registration {
                Registration::Granted => Ok(ConcurrencyPermit { shared, key }),
                Registration::Dropped => Err(RuntimeError::ConcurrencyDrop {
                    key,
                    max_concurrent,
                }),
                Registration::Queued(mut guard) => {
                    let granted = match tokio::time::timeout(queue_timeout, &mut guard.grant).await
                    {
                        Ok(Ok(())) => {
                            guard.disarm();
                            true
                        }
                        // 超时或发送端被清理：以接收端是否已收到移交为准
                        Ok(Err(_)) | Err(_) => guard.settle(),
                    };
                    if granted {
                        Ok(ConcurrencyPermit { shared, key })
                    } else {
                        debug!(key = %key, "concurrency wait timed out");
                        Err(RuntimeError::ConcurrencyTimeout {
                            key,
                            timeout_ms: u64::try_from(queue_timeout.as_millis())
                                .unwrap_or(u64::MAX),
                        })
                    }
                }
            }
        }
    }

    fn register(&self, key: &str, max_concurrent: usize, queue_timeout: Duration) -> Registration {
        let registration = {
            let mut slots = self.shared.slots.entry(key.to_string()).or_default();
            if slots.active < max_concurrent {
                slots.active += 1;
                Registration::Granted
            } else if queue_timeout.is_zero() {
                Registration::Dropped
            } else {
                let id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                slots.waiters.push_back(Waiter { id, grant: tx });
                Registration::Queued(WaitGuard {
                    shared: self.shared.clone(),
                    key: key.to_string(),
                    id,
                    grant: rx,
                    armed: true,
                })
            }
        };

        if matches!(registration, Registration::Dropped) {
            self.shared
                .slots
                .remove_if(key, |_, s| s.active == 0 && s.waiters.is_empty());
        }
        registration
    }

    /// 当前键的活跃槽位数
    pub fn active(&self, key: &str) -> usize {
        self.shared.slots.get(key).map(|s| s.active).unwrap_or(0)
    }

    /// 当前键排队等待的数量
    pub fn waiting(&self, key: &str) -> usize {
        self.shared
            .slots
            .get(key)
            .map(|s| s.waiters.len())
            .unwrap_or(0)
    }

    /// 所有键的活跃槽位总数
    pub fn total_active(&self) -> usize {
        self.shared.slots.iter().map(|s| s.active).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn grants_immediately_below_limit() {
        let admission = ConcurrencyAdmission::new();
        let a = admission.acquire("k", 2, WAIT).await.unwrap();
        let b = admission.acquire("k", 2, WAIT).await.unwrap();
        assert_eq!(admission.active("k"), 2);
        assert_eq!(a.key(), "k");
        drop(a);
        drop(b);
        assert_eq!(admission.active("k"), 0);
    }

    #[tokio::test]
    async fn zero_timeout_drops_when_saturated() {
        let admission = ConcurrencyAdmission::new();
        let _held = admission.acquire("k", 1, Duration::ZERO).await.unwrap();
        let err = admission
            .acquire("k", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONCURRENCY_DROP");
        // 其他键不受影响
        assert!(admission.acquire("other", 1, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn queued_waiter_times_out() {
        let admission = ConcurrencyAdmission::new();
        let _held = admission.acquire("k", 1, WAIT).await.unwrap();
        let err = admission
            .acquire("k", 1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONCURRENCY_TIMEOUT");
        assert_eq!(admission.waiting("k"), 0);
        assert_eq!(admission.active("k"), 1);
    }

    #[tokio::test]
    async fn release_hands_slot_to_head_waiter_in_fifo_order() {
        let admission = ConcurrencyAdmission::new();
        let held = admission.acquire("k", 1, WAIT).await.unwrap();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for i in 0..3 {
            // 登记在 acquire 调用时完成，spawn 顺序不影响授予顺序
            let fut = admission.acquire("k", 1, WAIT);
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let permit = fut.await.unwrap();
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(permit);
            }));
        }
        assert_eq!(admission.waiting("k"), 3);
        drop(held);
        // 移交而非归零
        assert_eq!(admission.active("k"), 1);

        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(admission.active("k"), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_leak_slot() {
        let admission = ConcurrencyAdmission::new();
        let held = admission.acquire("k", 1, WAIT).await.unwrap();
        let abandoned = admission.acquire("k", 1, WAIT);
        let next = admission.acquire("k", 1, WAIT);
        drop(abandoned);
        drop(held);
        let permit = next.await.unwrap();
        assert_eq!(admission.active("k"), 1);
        drop(permit);
        assert_eq!(admission.active("k"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn peak_never_exceeds_limit() {
        let admission = ConcurrencyAdmission::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let fut = admission.acquire("k", 3, WAIT);
            let current = current.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = fut.await.unwrap();
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(admission.total_active(), 0);
    }

    fn queued(admission: &ConcurrencyAdmission, max_concurrent: usize) -> WaitGuard {
        match admission.register("k", max_concurrent, WAIT) {
            Registration::Queued(guard) => guard,
            _ => panic!("expected a queued waiter"),
        }
    }

    #[tokio::test]
    async fn slot_handed_over_while_timing_out_is_kept() {
        let admission = ConcurrencyAdmission::new();
        let held = admission.acquire("k", 1, WAIT).await.unwrap();
        let mut guard = queued(&admission, 1);

        // 持有者恰好在等待者超时与撤销之间释放
        drop(held);
        assert!(guard.settle());
        assert_eq!(admission.active("k"), 1);
        assert_eq!(admission.waiting("k"), 0);

        drop(ConcurrencyPermit {
            shared: admission.shared.clone(),
            key: "k".into(),
        });
        assert_eq!(admission.active("k"), 0);
    }

    #[tokio::test]
    async fn release_after_cancelled_wait_is_not_handed_over() {
        let admission = ConcurrencyAdmission::new();
        let held = admission.acquire("k", 1, WAIT).await.unwrap();
        let mut guard = queued(&admission, 1);

        assert!(!guard.settle());
        drop(held);
        assert_eq!(admission.active("k"), 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_returns_handed_over_slot_exactly_once() {
        let admission = ConcurrencyAdmission::new();
        let a = admission.acquire("k", 2, WAIT).await.unwrap();
        let b = admission.acquire("k", 2, WAIT).await.unwrap();
        let guard = queued(&admission, 2);

        // a 的槽位移交给等待者，等待者随后被丢弃
        drop(a);
        assert_eq!(admission.active("k"), 2);
        drop(guard);
        assert_eq!(admission.active("k"), 1);

        drop(b);
        assert_eq!(admission.active("k"), 0);
    }
}
