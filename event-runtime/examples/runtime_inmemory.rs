/// 事件运行时（内存版）示例
/// 展示 emit（优先级）-> process（并发准入 + ack）-> 统计 -> 回放未处理事件 的闭环
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_runtime::config::QueueConfig;
use event_runtime::{
    AckHandle, EmitOptions, Event, EventHandler, HandledEventType, ReplayOptions, Runtime,
    RuntimeConfig,
};
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// 示例处理器
// ============================================================================

/// 审计处理器：接收所有事件，只打印不确认
struct AuditHandler;

#[async_trait]
impl EventHandler for AuditHandler {
    fn handler_name(&self) -> &str {
        "audit"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::All
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        println!("  [audit] type={} id={}", event.event_type(), event.id());
        Ok(())
    }
}

/// 订单处理器：金额为负时否认，否则确认
struct OrderHandler {
    acks: AckHandle,
}

#[async_trait]
impl EventHandler for OrderHandler {
    fn handler_name(&self) -> &str {
        "orders"
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::Many(vec!["order.created".into(), "order.paid".into()])
    }

    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let amount = event.data()["amount"].as_i64().unwrap_or_default();
        if amount < 0 {
            self.acks.nack(event.id(), "negative amount")?;
            return Ok(());
        }
        println!("  [orders] type={} amount={}", event.event_type(), amount);
        self.acks.ack(event.id()).await?;
        Ok(())
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    println!("=== 事件运行时（内存版）示例 ===\n");

    let runtime = Arc::new(
        Runtime::builder()
            .config(RuntimeConfig {
                max_retries: 1,
                queue_config: QueueConfig {
                    max_concurrent: 2,
                    ..QueueConfig::default()
                },
                ..RuntimeConfig::default()
            })
            .build()?,
    );

    runtime.register_handler(Arc::new(AuditHandler));
    runtime.register_handler(Arc::new(OrderHandler {
        acks: runtime.ack_handle(),
    }));
    let acks = runtime.ack_handle();
    runtime.on("user.signed_up", move |event: Event| {
        let acks = acks.clone();
        async move {
            println!("  [closure] welcome {}", event.data()["name"]);
            acks.ack(event.id()).await?;
            anyhow::Ok(())
        }
    });

    // 优先级越大越先处理，同优先级按发出顺序
    runtime
        .emit("order.created", json!({ "amount": 120 }), EmitOptions::with_priority(1))
        .await?;
    runtime
        .emit("order.paid", json!({ "amount": 120 }), EmitOptions::with_priority(5))
        .await?;
    runtime
        .emit(
            "user.signed_up",
            json!({ "name": "ada" }),
            EmitOptions::builder().priority(3).correlation_id("signup-1").build(),
        )
        .await?;
    runtime
        .emit("order.created", json!({ "amount": -5 }), EmitOptions::default())
        .await?;
    println!("✅ 已发出 4 个事件，队列长度 {}\n", runtime.queue_size());

    let summary = runtime.process().await?;
    println!("\n✅ 处理完成: {}", serde_json::to_string(&summary)?);

    for failure in runtime.recent_failures() {
        println!(
            "❌ 失败: type={} attempts={} reason={}",
            failure.event_type, failure.attempts, failure.reason
        );
    }

    // 失败的事件不会被标记为已处理，仍可从存储回放
    let batches: Vec<Vec<Event>> = runtime
        .replay_events(
            DateTime::<Utc>::MIN_UTC,
            ReplayOptions::builder().only_unprocessed(true).build(),
        )
        .try_collect()
        .await?;
    let unprocessed: usize = batches.iter().map(Vec::len).sum();
    println!("🔁 未处理事件: {unprocessed}");

    println!("\n📊 统计:\n{}", serde_json::to_string_pretty(&runtime.stats())?);

    let report = runtime.cleanup();
    println!("\n✅ 已清理: {}", serde_json::to_string(&report)?);
    Ok(())
}
