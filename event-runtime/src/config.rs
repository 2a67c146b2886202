//! 运行时配置
//!
//! 字段名与外部配置面保持一致（camelCase），可直接从 JSON 反序列化；
//! 所有超时均有显式默认值，不存在无界等待。
//!
use crate::error::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 运行时配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// 待处理队列最大深度，0 表示拒绝一切入队
    pub queue_size: usize,
    /// 每次出队的批大小
    pub batch_size: usize,
    /// 是否启用显式 ack；关闭后 handler 返回即视为成功
    pub enable_acks: bool,
    /// ack 超时（毫秒）
    #[serde(rename = "ackTimeout")]
    pub ack_timeout_ms: u64,
    /// 超时/失败后的最大重试次数
    pub max_retries: u32,
    /// 是否启用事件存储
    pub enable_event_store: bool,
    pub event_store_config: EventStoreConfig,
    pub queue_config: QueueConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    /// 是否输出逐事件的 info 级追踪记录
    pub enable_observability: bool,
    /// 持续模式下的空闲轮询间隔（毫秒）
    #[serde(rename = "pollInterval")]
    pub poll_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 100,
            enable_acks: true,
            ack_timeout_ms: 30_000,
            max_retries: 3,
            enable_event_store: true,
            event_store_config: EventStoreConfig::default(),
            queue_config: QueueConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            enable_observability: false,
            poll_interval_ms: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> RuntimeResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> RuntimeResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.batch_size == 0 {
            return Err(RuntimeError::invalid_config("batchSize must be > 0"));
        }
        if self.queue_config.max_concurrent == 0 {
            return Err(RuntimeError::invalid_config(
                "queueConfig.maxConcurrent must be > 0",
            ));
        }
        if self.enable_acks && self.ack_timeout_ms == 0 {
            return Err(RuntimeError::invalid_config(
                "ackTimeout must be > 0 when acks are enabled",
            ));
        }
        self.event_store_config.validate()?;
        self.circuit_breaker.validate()?;
        Ok(())
    }
}

/// 持久化后端类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistorType {
    #[default]
    Memory,
    File,
}

/// 事件存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventStoreConfig {
    pub persistor_type: PersistorType,
    /// 文件持久化目录（`persistorType = "file"` 时必填）
    pub path: Option<PathBuf>,
    /// 固定流 ID，便于进程重启后重新打开同一条持久化流；缺省时每个实例随机生成
    pub stream_id: Option<String>,
    /// 单次回放最多返回的事件数，同时决定元数据缓存容量
    pub max_stored_events: usize,
    /// 关闭后 `append_events` 为空操作
    pub enable_replay: bool,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            persistor_type: PersistorType::Memory,
            path: None,
            stream_id: None,
            max_stored_events: 100_000,
            enable_replay: true,
        }
    }
}

/// 元数据缓存容量上限
pub const MAX_CACHE_SIZE: usize = 10_000;

impl EventStoreConfig {
    /// 缓存容量：`max_stored_events` 的 10%，上限 `MAX_CACHE_SIZE`，至少为 1
    pub fn max_cache_size(&self) -> usize {
        (self.max_stored_events / 10).clamp(1, MAX_CACHE_SIZE)
    }

    fn validate(&self) -> RuntimeResult<()> {
        if self.max_stored_events == 0 {
            return Err(RuntimeError::invalid_config(
                "eventStoreConfig.maxStoredEvents must be > 0",
            ));
        }
        if self.persistor_type == PersistorType::File && self.path.is_none() {
            return Err(RuntimeError::invalid_config(
                "eventStoreConfig.path is required for the file persistor",
            ));
        }
        Ok(())
    }
}

/// 并发准入配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueConfig {
    /// 同一路由键（事件类型）允许的最大在途处理数
    pub max_concurrent: usize,
    /// 排队等待并发槽位的超时（毫秒），0 表示饱和时直接丢弃
    #[serde(rename = "queueTimeout")]
    pub queue_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            queue_timeout_ms: 30_000,
        }
    }
}

impl QueueConfig {
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// 熔断器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// 滚动窗口大小；窗口填满后才评估失败率
    pub volume_threshold: usize,
    /// 失败率阈值（百分比）
    pub error_threshold_percentage: u8,
    /// 打开状态持续多久后进入半开（毫秒）
    #[serde(rename = "resetTimeout")]
    pub reset_timeout_ms: u64,
    /// 半开状态允许的试探调用数
    pub half_open_requests: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            error_threshold_percentage: 50,
            reset_timeout_ms: 30_000,
            half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.volume_threshold == 0 {
            return Err(RuntimeError::invalid_config(
                "circuitBreaker.volumeThreshold must be > 0",
            ));
        }
        if self.error_threshold_percentage > 100 {
            return Err(RuntimeError::invalid_config(
                "circuitBreaker.errorThresholdPercentage must be <= 100",
            ));
        }
        if self.half_open_requests == 0 {
            return Err(RuntimeError::invalid_config(
                "circuitBreaker.halfOpenRequests must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_option_names_load_from_json() {
        let config = RuntimeConfig::from_json_str(
            r#"{
                "queueSize": 5,
                "batchSize": 2,
                "enableAcks": false,
                "ackTimeout": 50,
                "maxRetries": 2,
                "enableEventStore": true,
                "eventStoreConfig": { "persistorType": "memory", "maxStoredEvents": 1000 },
                "queueConfig": { "maxConcurrent": 3, "queueTimeout": 0 },
                "enableObservability": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.queue_size, 5);
        assert_eq!(config.batch_size, 2);
        assert!(!config.enable_acks);
        assert_eq!(config.ack_timeout(), Duration::from_millis(50));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.event_store_config.max_cache_size(), 100);
        assert_eq!(config.queue_config.max_concurrent, 3);
        assert_eq!(config.queue_config.queue_timeout(), Duration::ZERO);
        assert!(config.enable_observability);
        // 未给出的字段回落到默认值
        assert_eq!(config.circuit_breaker, CircuitBreakerConfig::default());
    }

    #[test]
    fn cache_size_is_a_capped_tenth() {
        let mut store = EventStoreConfig::default();
        assert_eq!(store.max_cache_size(), MAX_CACHE_SIZE);
        store.max_stored_events = 5;
        assert_eq!(store.max_cache_size(), 1);
        store.max_stored_events = 10_000_000;
        assert_eq!(store.max_cache_size(), MAX_CACHE_SIZE);
    }

    #[test]
    fn validation_rejects_inconsistent_settings() {
        let err = RuntimeConfig::from_json_str(r#"{ "batchSize": 0 }"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIG");

        let err = RuntimeConfig::from_json_str(r#"{ "queueConfig": { "maxConcurrent": 0 } }"#)
            .unwrap_err();
        assert!(err.to_string().contains("maxConcurrent"));

        let err =
            RuntimeConfig::from_json_str(r#"{ "eventStoreConfig": { "persistorType": "file" } }"#)
                .unwrap_err();
        assert!(err.to_string().contains("path"));

        let err = RuntimeConfig::from_json_str(
            r#"{ "circuitBreaker": { "errorThresholdPercentage": 101 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfig { .. }));
    }
}
