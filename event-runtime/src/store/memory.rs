//! 内存版持久化（MemoryPersistor）
//!
//! 进程内保存各流的快照序列，满足 `EventPersistor` 协议；
//! 典型用途：默认配置、测试与本地开发。进程退出即丢失。
//!
use crate::error::RuntimeResult;
use crate::store::{EventPersistor, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};

#[derive(Default)]
pub struct MemoryPersistor {
    streams: DashMap<String, Vec<Snapshot>>,
}

impl MemoryPersistor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定流当前保存的快照数
    pub fn snapshot_count(&self, stream_id: &str) -> usize {
        self.streams.get(stream_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl EventPersistor for MemoryPersistor {
    async fn append(&self, snapshot: &Snapshot) -> RuntimeResult<()> {
        self.streams
            .entry(snapshot.xc_id().to_string())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load(&self, stream_id: &str) -> BoxStream<'static, RuntimeResult<Snapshot>> {
        // 拷贝当前视图，读取期间的新追加不影响本次遍历
        let snapshots = self
            .streams
            .get(stream_id)
            .map(|s| s.clone())
            .unwrap_or_default();
        stream::iter(snapshots.into_iter().map(Ok)).boxed()
    }

    async fn prune(&self, stream_id: &str, before: DateTime<Utc>) -> RuntimeResult<usize> {
        let Some(mut snapshots) = self.streams.get_mut(stream_id) else {
            return Ok(0);
        };
        let mut removed = 0;
        snapshots.retain(|s| {
            let keep = s.ts() >= before;
            if !keep {
                removed += s.events().len();
            }
            keep
        });
        Ok(removed)
    }
}
