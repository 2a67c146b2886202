//! 进程内事件运行时（event-runtime）
//!
//! 在不依赖外部消息中间件或数据库的前提下，提供：
//! - 有界优先级队列（`queue`）：按优先级降序、同优先级 FIFO 出队，满则拒绝；
//! - 按键并发准入（`concurrency`）：FIFO 等待队列、等待超时与槽位直接移交；
//! - 三态熔断器与注册表（`resilience`）；
//! - 事件存储（`store`）：可插拔持久化、LRU 元数据缓存、惰性可重启回放；
//! - 投递与运行时（`eventing`）：ack/超时/有界重试的至少一次投递。
//!
//! 典型用法：
//! 1. 以 `Runtime::builder()` 构造运行时，按需提供配置与持久化实现；
//! 2. 通过 `on` 或 `register_handler` 注册处理器；
//! 3. `emit` 事件后调用 `process()` 排空队列，或以 `start()` 进入持续模式；
//! 4. 进程重启后以 `recover()` 重新入队尚未处理的事件。
//!
pub mod concurrency;
pub mod config;
pub mod error;
pub mod event;
pub mod eventing;
pub mod queue;
pub mod resilience;
pub mod store;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
pub use event::{EmitOptions, Event};
pub use eventing::{AckHandle, EventHandler, HandledEventType, Runtime, RuntimeHandle};
pub use store::ReplayOptions;
