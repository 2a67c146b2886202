//! 事件子系统（eventing）
//!
//! 提供事件处理与调度的运行时：
//! - `EventHandler`：对事件进行消费处理，按类型或通配注册；
//! - `DeliveryManager`：并发准入、ack 跟踪、超时重试与失败上报；
//! - `Runtime`：组合队列、投递与存储，对外提供 emit / process / ack / replay。
//!
pub mod delivery;
pub mod handler;
pub mod runtime;

pub use delivery::{AckHandle, DeliveryFailure, DeliveryManager, DeliveryStats};
pub use handler::{EventHandler, HandledEventType, HandlerRegistry};
pub use runtime::{
    CleanupReport, EVENT_STORE_CIRCUIT, ProcessSummary, QueueStats, Runtime, RuntimeHandle,
    RuntimeInfo, RuntimeStats,
};
