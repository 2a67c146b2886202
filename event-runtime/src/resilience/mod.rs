//! 下游保护（resilience）
//!
//! - `CircuitBreaker`：三态熔断器，只统计连接类故障；
//! - `CircuitBreakerRegistry`：按名称共享熔断器，生命周期由运行时显式管理。
//!
mod circuit_breaker;
mod registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use registry::CircuitBreakerRegistry;
