//! 事件存储（store）
//!
//! - `Snapshot`：持久化记录，追加后不可变；
//! - `EventPersistor`：可插拔的持久化适配器（内存 / 文件 / 外部存储）；
//! - `EventStore`：追加、已处理标记、LRU 元数据缓存与惰性回放。
//!
mod event_store;
#[cfg(feature = "file-persistor")]
mod file;
mod memory;
mod persistor;
mod snapshot;

pub use event_store::{EventStore, EventStoreStats, ReplayOptions};
#[cfg(feature = "file-persistor")]
pub use file::FilePersistor;
pub use memory::MemoryPersistor;
pub use persistor::EventPersistor;
pub use snapshot::{EventMetadata, Snapshot, SnapshotState};
