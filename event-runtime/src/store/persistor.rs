//! 持久化适配器协议
//!
//! 运行时只依赖“追加 + 按流惰性读取”两项能力，后端可以是内存、文件或外部存储，
//! 只要读取顺序与追加顺序一致即可。
//!
use crate::error::RuntimeResult;
use crate::store::Snapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use std::sync::Arc;

#[async_trait]
pub trait EventPersistor: Send + Sync {
    /// 追加一条快照
    async fn append(&self, snapshot: &Snapshot) -> RuntimeResult<()>;

    /// 返回 'static 生命周期的快照流，按追加顺序产出；丢弃流即释放底层游标
    async fn load(&self, stream_id: &str) -> BoxStream<'static, RuntimeResult<Snapshot>>;

    /// 删除追加时间早于 `before` 的快照，返回被删除的事件数
    async fn prune(&self, _stream_id: &str, _before: DateTime<Utc>) -> RuntimeResult<usize> {
        Ok(0)
    }
}

#[async_trait]
impl<T> EventPersistor for Arc<T>
where
    T: EventPersistor + ?Sized,
{
    async fn append(&self, snapshot: &Snapshot) -> RuntimeResult<()> {
        (**self).append(snapshot).await
    }

    async fn load(&self, stream_id: &str) -> BoxStream<'static, RuntimeResult<Snapshot>> {
        (**self).load(stream_id).await
    }

    async fn prune(&self, stream_id: &str, before: DateTime<Utc>) -> RuntimeResult<usize> {
        (**self).prune(stream_id, before).await
    }
}
