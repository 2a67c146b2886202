//! 事件模型（Event）
//!
//! 运行时处理的最小工作单元：不可变 ID、路由用的类型标签、
//! 消费方自定义的负载，以及携带 `correlationId`/`tenantId` 的开放元数据。
//!
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CORRELATION_ID_KEY: &str = "correlationId";
pub const TENANT_ID_KEY: &str = "tenantId";

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// 事件唯一标识符，运行时实例生命周期内全局唯一
    #[builder(into, default = Uuid::new_v4().to_string())]
    id: String,
    /// 事件类型，同时作为路由键与并发准入键
    #[serde(rename = "type")]
    #[builder(into)]
    event_type: String,
    /// 事件负载
    #[builder(default)]
    data: Value,
    /// 事件创建时间
    #[builder(default = Utc::now())]
    timestamp: DateTime<Utc>,
    /// 会话/线程分组
    #[builder(into)]
    thread_id: Option<String>,
    /// 开放键值元数据
    #[builder(default)]
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self::builder().event_type(event_type).data(data).build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(CORRELATION_ID_KEY).and_then(Value::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata.get(TENANT_ID_KEY).and_then(Value::as_str)
    }

    pub(crate) fn insert_metadata(&mut self, key: &str, value: impl Into<Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

/// `emit` 的可选参数
#[derive(Debug, Clone, Default, Builder)]
pub struct EmitOptions {
    /// 优先级，数值越大越先处理
    #[builder(default)]
    pub priority: i32,
    #[builder(into)]
    pub correlation_id: Option<String>,
    #[builder(into)]
    pub tenant_id: Option<String>,
    #[builder(into)]
    pub thread_id: Option<String>,
}

impl EmitOptions {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}
