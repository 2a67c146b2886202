//! 事件处理器（EventHandler）
//!
//! 定义消费某类/多类/全部事件的处理逻辑与元信息（名称、订阅类型），
//! 以及按事件类型路由的处理器注册表。
//!
use crate::event::Event;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 事件处理器：处理某一类型的事件
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// 处理器名称（用于失败记录与日志）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理事件
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// 闭包适配器：`Runtime::on(event_type, fn)` 注册的处理器
pub(crate) struct FnHandler<F> {
    name: String,
    event_type: String,
    f: F,
}

impl<F> FnHandler<F> {
    pub(crate) fn new(event_type: impl Into<String>, f: F) -> Self {
        let event_type = event_type.into();
        Self {
            name: format!("on:{event_type}"),
            event_type,
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn handler_name(&self) -> &str {
        &self.name
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::One(self.event_type.clone())
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.f)(event.clone()).await
    }
}

/// 处理器注册表：按事件类型索引，`All` 处理器接收所有类型
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    all: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        let mut registry = Self::default();
        for h in handlers {
            registry.register(h);
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        match handler.handled_event_type() {
            HandledEventType::All => self.all.push(handler),
            HandledEventType::One(t) => {
                self.by_type.entry(t).or_default().push(handler);
            }
            HandledEventType::Many(ts) => {
                for t in ts {
                    self.by_type.entry(t).or_default().push(handler.clone());
                }
            }
        }
    }

    /// 匹配某事件类型的处理器：先按类型注册的，后通配的
    pub fn matching(&self, event_type: &str) -> Vec<Arc<dyn EventHandler>> {
        let mut merged: Vec<Arc<dyn EventHandler>> = Vec::new();
        if let Some(list) = self.by_type.get(event_type) {
            merged.extend(list.iter().cloned());
        }
        merged.extend(self.all.iter().cloned());
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.all.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.by_type.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry")
            .field("types", &types)
            .field("wildcard", &self.all.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Named {
        name: &'static str,
        types: HandledEventType,
    }

    #[async_trait]
    impl EventHandler for Named {
        fn handler_name(&self) -> &str {
            self.name
        }
        fn handled_event_type(&self) -> HandledEventType {
            self.types.clone()
        }
        async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn named(name: &'static str, types: HandledEventType) -> Arc<dyn EventHandler> {
        Arc::new(Named { name, types })
    }

    #[test]
    fn matching_merges_typed_then_wildcard() {
        let registry = HandlerRegistry::new(vec![
            named("audit", HandledEventType::All),
            named("orders", HandledEventType::One("order.created".into())),
            named(
                "billing",
                HandledEventType::Many(vec!["order.created".into(), "order.paid".into()]),
            ),
        ]);

        let names = |t: &str| -> Vec<String> {
            registry
                .matching(t)
                .iter()
                .map(|h| h.handler_name().to_string())
                .collect()
        };
        assert_eq!(names("order.created"), vec!["orders", "billing", "audit"]);
        assert_eq!(names("order.paid"), vec!["billing", "audit"]);
        assert_eq!(names("unknown"), vec!["audit"]);
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let registry = HandlerRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.matching("any").is_empty());
    }

    #[tokio::test]
    async fn closure_handler_receives_event() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = FnHandler::new("ping", move |event: Event| {
            let counter = counter.clone();
            async move {
                anyhow::ensure!(event.event_type() == "ping", "unexpected type");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert_eq!(handler.handler_name(), "on:ping");
        assert_eq!(
            handler.handled_event_type(),
            HandledEventType::One("ping".into())
        );
        handler.handle(&Event::new("ping", json!({}))).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
