use anyhow::Result as AnyResult;
use event_runtime::{EmitOptions, Event, Runtime, RuntimeConfig};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// 第一个参数为 JSON 配置文件路径，缺省使用默认配置
fn load_config() -> AnyResult<RuntimeConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(RuntimeConfig::load(path)?),
        None => Ok(RuntimeConfig {
            enable_observability: true,
            ..RuntimeConfig::default()
        }),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> AnyResult<()> {
    init_tracing();
    let config = load_config()?;
    let runtime = Arc::new(Runtime::builder().config(config).build()?);

    let shipped = Arc::new(AtomicUsize::new(0));
    let acks = runtime.ack_handle();
    {
        let shipped = shipped.clone();
        runtime.on("order.shipped", move |event: Event| {
            let (acks, shipped) = (acks.clone(), shipped.clone());
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                shipped.fetch_add(1, Ordering::SeqCst);
                acks.ack(event.id()).await?;
                anyhow::Ok(())
            }
        });
    }
    let acks = runtime.ack_handle();
    runtime.on("order.cancelled", move |event: Event| {
        let acks = acks.clone();
        async move {
            acks.nack(event.id(), "cancellation service unavailable")?;
            anyhow::Ok(())
        }
    });

    // 持续模式：后台循环按通知或轮询间隔处理
    let handle = runtime.start();
    for n in 0..50 {
        let priority = if n % 10 == 0 { 5 } else { 0 };
        runtime
            .emit(
                "order.shipped",
                json!({ "order": n }),
                EmitOptions::builder()
                    .priority(priority)
                    .correlation_id(format!("order-{n}"))
                    .build(),
            )
            .await?;
    }
    runtime
        .emit("order.cancelled", json!({ "order": 99 }), EmitOptions::default())
        .await?;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let stats = runtime.stats();
            if stats.queue.size == 0 && stats.delivery.pending_acks == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    handle.shutdown();
    handle.join().await;

    info!(shipped = shipped.load(Ordering::SeqCst), "orders shipped");
    for failure in runtime.recent_failures() {
        info!(
            event_id = %failure.event_id,
            attempts = failure.attempts,
            reason = %failure.reason,
            "delivery failed"
        );
    }
    println!("{}", serde_json::to_string_pretty(&runtime.stats())?);

    let report = runtime.cleanup();
    info!(
        dropped = report.dropped_events,
        abandoned = report.abandoned_acks,
        circuits = report.disposed_circuits,
        "runtime cleaned up"
    );
    Ok(())
}
