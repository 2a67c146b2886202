//! 运行时统一错误定义
//!
//! 覆盖准入控制、熔断、投递、持久化与配置五类错误，
//! 并提供稳定错误码与分类方法，便于调用方区分“预期拒绝”与真正的故障。
//!
use std::io::ErrorKind;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RuntimeError {
    // --- 准入控制 ---
    #[error("concurrency drop: key={key}, max_concurrent={max_concurrent}")]
    ConcurrencyDrop { key: String, max_concurrent: usize },
    #[error("concurrency timeout: key={key}, timeout_ms={timeout_ms}")]
    ConcurrencyTimeout { key: String, timeout_ms: u64 },

    // --- 熔断 ---
    #[error("circuit open: name={name}")]
    CircuitOpen { name: String },
    #[error("circuit already exists: name={name}")]
    CircuitExists { name: String },
    #[error("connection error: {reason}")]
    Connection { reason: String },

    // --- 投递 ---
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },

    // --- 持久化 ---
    #[error("persistence error: {reason}")]
    Persistence { reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    // --- 配置与生命周期 ---
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("runtime stopped")]
    Stopped,
}

impl RuntimeError {
    pub fn persistence(reason: impl Into<String>) -> Self {
        Self::Persistence {
            reason: reason.into(),
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// 稳定错误码（大写蛇形），用于日志与调用方分支
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConcurrencyDrop { .. } => "CONCURRENCY_DROP",
            Self::ConcurrencyTimeout { .. } => "CONCURRENCY_TIMEOUT",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::CircuitExists { .. } => "CIRCUIT_EXISTS",
            Self::Connection { .. } => "CONNECTION",
            Self::EventHandler { .. } => "EVENT_HANDLER",
            Self::Persistence { .. } => "PERSISTENCE",
            Self::Serde { .. } => "SERDE",
            Self::Io { .. } => "IO",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Stopped => "STOPPED",
        }
    }

    /// 准入拒绝：预期内、非致命
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyDrop { .. } | Self::ConcurrencyTimeout { .. }
        )
    }

    /// 熔断快速失败
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// 连接类故障：只有这类错误计入熔断统计，业务错误不触发熔断
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Io { source } => matches!(
                source.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// 统一 Result 类型别名
pub type RuntimeResult<T> = Result<T, RuntimeError>;
