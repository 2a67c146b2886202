//! 持久化快照（Snapshot）
//!
//! 每次 `append_events` 写入一条，写入后不可变，仅在回放时读回。
//! 除事件批次外，ack 成功后还会写入一条不含事件的“已处理标记”快照，
//! 使已处理位不依赖易失的内存缓存。
//!
use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 事件元数据（缓存与快照共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub event_id: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub processed: bool,
    pub processing_attempts: u32,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl EventMetadata {
    pub fn for_event(event: &Event) -> Self {
        Self {
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
            timestamp: event.timestamp(),
            processed: false,
            processing_attempts: 0,
            last_processed_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotState {
    /// 写入该快照后的全局序号
    pub sequence_number: u64,
    #[serde(default)]
    pub event_metadata: Vec<EventMetadata>,
    /// 本快照标记为已处理的事件 ID
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// 流 ID，每个运行时实例一条
    xc_id: String,
    ts: DateTime<Utc>,
    events: Vec<Event>,
    state: SnapshotState,
    /// 批次内容的 SHA-256 指纹（顺序敏感，十六进制）
    hash: String,
}

impl Snapshot {
    fn new(xc_id: &str, events: Vec<Event>, state: SnapshotState) -> Self {
        let hash = fingerprint(&events, &state.processed);
        Self {
            xc_id: xc_id.to_string(),
            ts: Utc::now(),
            events,
            state,
            hash,
        }
    }

    /// 事件批次快照
    pub fn for_events(xc_id: &str, sequence_number: u64, events: Vec<Event>) -> Self {
        let event_metadata = events.iter().map(EventMetadata::for_event).collect();
        let state = SnapshotState {
            sequence_number,
            event_metadata,
            processed: Vec::new(),
        };
        Self::new(xc_id, events, state)
    }

    /// 已处理标记快照（不含事件）
    pub fn processed_marks(xc_id: &str, sequence_number: u64, ids: Vec<String>) -> Self {
        let state = SnapshotState {
            sequence_number,
            event_metadata: Vec::new(),
            processed: ids,
        };
        Self::new(xc_id, Vec::new(), state)
    }

    pub fn xc_id(&self) -> &str {
        &self.xc_id
    }

    pub fn ts(&self) -> DateTime<Utc> {
        self.ts
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn state(&self) -> &SnapshotState {
        &self.state
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// 重新计算指纹并与记录值比对
    pub fn verify(&self) -> bool {
        fingerprint(&self.events, &self.state.processed) == self.hash
    }
}

fn fingerprint(events: &[Event], processed: &[String]) -> String {
    let mut hasher = Sha256::new();
    for event in events {
        update_field(&mut hasher, event.id().as_bytes());
        update_field(&mut hasher, event.event_type().as_bytes());
        hasher.update(event.timestamp().timestamp_micros().to_be_bytes());
        update_field(&mut hasher, event.data().to_string().as_bytes());
    }
    hasher.update((processed.len() as u64).to_be_bytes());
    for id in processed {
        update_field(&mut hasher, id.as_bytes());
    }
    to_hex(&hasher.finalize())
}

/// 长度前缀，避免相邻字段拼接产生歧义
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}
