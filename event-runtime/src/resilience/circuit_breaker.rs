//! 熔断器（CircuitBreaker）
//!
//! 三态故障隔离：closed → open → half-open → closed。
//! 仅连接类故障（见 `RuntimeError::is_connection_failure`）计入滚动窗口，
//! 被包装操作的业务错误按“下游可达”记为成功。
//!
//! 打开状态的重置计时在每次访问时按 `opened_at + reset_timeout` 惰性判断，
//! 不需要额外的定时任务。
//!
use crate::config::CircuitBreakerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub window_size: usize,
    pub window_failures: usize,
    pub rejected: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// 最近 `volume_threshold` 次调用结果，`true` 表示失败
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials: usize,
    rejected: u64,
    last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.volume_threshold),
                opened_at: None,
                trials: 0,
                rejected: 0,
                last_failure_time: None,
            }),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前状态（已到期的 open 会在此处转入 half-open）
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// 通过熔断器执行 `op`
    ///
    /// 打开状态下直接返回 `RuntimeError::CircuitOpen`，不调用 `op`。
    pub async fn call<T, F, Fut>(&self, op: F) -> RuntimeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        self.try_admit()?;
        let result = op().await;
        match &result {
            Err(err) if err.is_connection_failure() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    fn try_admit(&self) -> RuntimeResult<()> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if inner.trials < self.config.half_open_requests => {
                inner.trials += 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                // 超出试探配额：回到 open 并重新计时
                self.trip(&mut inner);
                inner.rejected += 1;
                Err(self.open_error())
            }
            CircuitState::Open => {
                inner.rejected += 1;
                Err(self.open_error())
            }
        }
    }

    fn open_error(&self) -> RuntimeError {
        RuntimeError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let due = inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.reset_timeout());
        if due {
            inner.state = CircuitState::HalfOpen;
            inner.trials = 0;
            info!(circuit = %self.name, "circuit half-open");
        }
    }

    pub(crate) fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.window.clear();
                inner.trials = 0;
                inner.opened_at = None;
                info!(circuit = %self.name, "circuit closed");
            }
            CircuitState::Closed => self.push_outcome(&mut inner, false),
            CircuitState::Open => {}
        }
    }

    pub(crate) fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::HalfOpen => self.trip(&mut inner),
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                if self.should_trip(&inner) {
                    self.trip(&mut inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.window.len() >= self.config.volume_threshold {
            inner.window.pop_front();
        }
        inner.window.push_back(failed);
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        let total = inner.window.len();
        if total < self.config.volume_threshold {
            return false;
        }
        let failures = inner.window.iter().filter(|f| **f).count();
        failures * 100 >= usize::from(self.config.error_threshold_percentage) * total
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.trials = 0;
        warn!(
            circuit = %self.name,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "circuit opened"
        );
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            window_size: inner.window.len(),
            window_failures: inner.window.iter().filter(|f| **f).count(),
            rejected: inner.rejected,
            last_failure_time: inner.last_failure_time,
        }
    }
}
