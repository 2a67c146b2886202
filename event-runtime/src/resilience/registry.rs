//! 熔断器注册表
//!
//! 按名称管理熔断器实例，同名调用方共享同一个状态机。
//! 由运行时组合根显式构造并持有，不使用进程级全局单例。
//!
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerStats};
use crate::config::CircuitBreakerConfig;
use crate::error::{RuntimeError, RuntimeResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::debug;

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// 以指定配置创建；同名已存在时报错
    pub fn create(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> RuntimeResult<Arc<CircuitBreaker>> {
        config.validate()?;
        match self.breakers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RuntimeError::CircuitExists {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                debug!(circuit = name, "circuit breaker created");
                Ok(slot.insert(Arc::new(CircuitBreaker::new(name, config))).clone())
            }
        }
    }

    /// 获取同名熔断器，不存在时以默认配置创建
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// 移除熔断器；已取得 `Arc` 的调用方继续持有旧实例直至释放
    pub fn dispose(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }

    pub fn dispose_all(&self) -> usize {
        let count = self.breakers.len();
        self.breakers.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
