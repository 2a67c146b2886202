use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use event_runtime::config::{CircuitBreakerConfig, QueueConfig};
use event_runtime::error::RuntimeError;
use event_runtime::queue::PriorityQueue;
use event_runtime::resilience::CircuitState;
use event_runtime::{EmitOptions, Event, ReplayOptions, Runtime, RuntimeConfig};
use futures_util::TryStreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn runtime(config: RuntimeConfig) -> AnyResult<Arc<Runtime>> {
    Ok(Arc::new(Runtime::builder().config(config).build()?))
}

/// 处理器内部 ack 自身事件
fn ack_on_handle(rt: &Arc<Runtime>, event_type: &str, handled: Arc<AtomicUsize>) {
    let acks = rt.ack_handle();
    rt.on(event_type, move |event: Event| {
        let acks = acks.clone();
        let handled = handled.clone();
        async move {
            handled.fetch_add(1, Ordering::SeqCst);
            acks.ack(event.id()).await?;
            anyhow::Ok(())
        }
    });
}

async fn replayed_count(rt: &Runtime, only_unprocessed: bool) -> AnyResult<usize> {
    let options = ReplayOptions::builder()
        .only_unprocessed(only_unprocessed)
        .build();
    let batches: Vec<Vec<Event>> = rt
        .replay_events(DateTime::<Utc>::MIN_UTC, options)
        .try_collect()
        .await?;
    Ok(batches.iter().map(Vec::len).sum())
}

#[tokio::test(flavor = "multi_thread")]
async fn drain_dispatches_in_priority_then_fifo_order() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig {
        enable_acks: false,
        queue_config: QueueConfig {
            max_concurrent: 1,
            ..QueueConfig::default()
        },
        ..RuntimeConfig::default()
    })?;
    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = order.clone();
    rt.on("job", move |event: Event| {
        let seen = seen.clone();
        async move {
            let label = event.data()["label"].as_str().unwrap_or_default().to_string();
            seen.lock().unwrap().push(label);
            anyhow::Ok(())
        }
    });

    let plan = [
        ("low-1", 1),
        ("high-1", 3),
        ("mid-1", 2),
        ("high-2", 3),
        ("low-2", 1),
        ("mid-2", 2),
    ];
    for (label, priority) in plan {
        let accepted = rt
            .emit("job", json!({ "label": label }), EmitOptions::with_priority(priority))
            .await?;
        assert!(accepted);
    }

    let summary = rt.process().await?;
    assert_eq!(summary.processed, 6);
    assert_eq!(
        *order.lock().unwrap(),
        vec!["high-1", "high-2", "mid-1", "mid-2", "low-1", "low-2"]
    );
    Ok(())
}

#[tokio::test]
async fn zero_depth_queue_rejects_every_event() -> AnyResult<()> {
    let mut queue = PriorityQueue::new(0);
    for n in 0..5 {
        assert!(!queue.enqueue(Event::new("t", json!({ "n": n })), n));
    }
    assert_eq!(queue.size(), 0);

    let rt = runtime(RuntimeConfig {
        queue_size: 0,
        ..RuntimeConfig::default()
    })?;
    assert!(!rt.emit("t", json!({}), EmitOptions::default()).await?);
    assert_eq!(rt.queue_size(), 0);
    assert_eq!(rt.stats().runtime.rejected, 1);
    Ok(())
}

#[test]
fn twenty_five_events_drain_in_three_batches() {
    let mut queue = PriorityQueue::new(100);
    for n in 0..25 {
        assert!(queue.enqueue(Event::new("t", json!({ "n": n })), 0));
    }

    let mut sizes = Vec::new();
    let mut remaining = vec![queue.size()];
    while !queue.is_empty() {
        sizes.push(queue.dequeue_batch(10).len());
        remaining.push(queue.size());
    }
    assert_eq!(sizes, vec![10, 10, 5]);
    assert_eq!(remaining, vec![25, 15, 5, 0]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unacked_event_is_redelivered_until_retries_run_out() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig {
        ack_timeout_ms: 50,
        max_retries: 2,
        poll_interval_ms: 10,
        ..RuntimeConfig::default()
    })?;
    let deliveries = Arc::new(AtomicUsize::new(0));
    let seen = deliveries.clone();
    rt.on("silent", move |_event: Event| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        }
    });

    rt.emit("silent", json!({}), EmitOptions::default()).await?;
    rt.process().await?;
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    let stats = rt.stats();
    assert!(stats.delivery.pending_acks >= 1);
    assert_eq!(stats.delivery.retried, 1);
    assert_eq!(stats.queue.size, 1);

    // 持续模式接手剩余的重试
    let handle = rt.start();
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        while rt.stats().delivery.failed == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    handle.shutdown();
    handle.join().await;

    let stats = rt.stats();
    assert_eq!(deliveries.load(Ordering::SeqCst), 3);
    assert_eq!(stats.delivery.failed, 1);
    assert_eq!(stats.delivery.pending_acks, 0);
    let failures = rt.recent_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn in_flight_handlers_never_exceed_max_concurrent() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig {
        queue_config: QueueConfig {
            max_concurrent: 3,
            ..QueueConfig::default()
        },
        ..RuntimeConfig::default()
    })?;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let acks = rt.ack_handle();
    {
        let (active, peak) = (active.clone(), peak.clone());
        rt.on("slow", move |event: Event| {
            let (active, peak, acks) = (active.clone(), peak.clone(), acks.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(40)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                acks.ack(event.id()).await?;
                anyhow::Ok(())
            }
        });
    }

    for _ in 0..10 {
        rt.emit("slow", json!({}), EmitOptions::default()).await?;
    }
    let summary = rt.process().await?;

    assert_eq!(summary.processed, 10);
    assert_eq!(summary.acked, 10);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2);
    assert_eq!(rt.stats().delivery.in_flight, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn acked_events_are_excluded_from_unprocessed_replay() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig::default())?;
    ack_on_handle(&rt, "order", Arc::new(AtomicUsize::new(0)));
    for n in 0..5 {
        rt.emit("order", json!({ "n": n }), EmitOptions::default()).await?;
    }
    let summary = rt.process().await?;
    assert_eq!(summary.acked, 5);

    assert_eq!(replayed_count(&rt, true).await?, 0);
    assert_eq!(replayed_count(&rt, false).await?, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn events_without_acks_stay_unprocessed_in_replay() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig {
        enable_acks: false,
        ..RuntimeConfig::default()
    })?;
    rt.on("order", |_event: Event| async { anyhow::Ok(()) });
    for n in 0..5 {
        rt.emit("order", json!({ "n": n }), EmitOptions::default()).await?;
    }
    let summary = rt.process().await?;
    assert_eq!(summary.processed, 5);
    assert_eq!(summary.acked, 0);

    assert_eq!(replayed_count(&rt, true).await?, 5);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn ten_thousand_events_are_processed_and_acked() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig::default())?;
    let handled = Arc::new(AtomicUsize::new(0));
    ack_on_handle(&rt, "bulk", handled.clone());

    for n in 0..10_000 {
        assert!(rt.emit("bulk", json!({ "n": n }), EmitOptions::default()).await?);
    }
    let summary = rt.process().await?;

    assert_eq!(summary.processed, 10_000);
    assert_eq!(summary.acked, 10_000);
    assert_eq!(summary.failed, 0);
    assert_eq!(handled.load(Ordering::SeqCst), 10_000);
    let stats = rt.stats();
    assert_eq!(stats.queue.size, 0);
    assert_eq!(stats.delivery.pending_acks, 0);
    Ok(())
}

#[tokio::test]
async fn circuit_breaker_opens_rejects_and_recovers() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig::default())?;
    let breaker = rt.circuit_breakers().create(
        "payments",
        CircuitBreakerConfig {
            volume_threshold: 4,
            error_threshold_percentage: 50,
            reset_timeout_ms: 50,
            half_open_requests: 1,
        },
    )?;
    let calls = Arc::new(AtomicUsize::new(0));

    for n in 0..4 {
        let calls = calls.clone();
        let result = breaker
            .call(|| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if n % 2 == 0 {
                    Err(RuntimeError::connection("connection refused"))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(result.is_err(), n % 2 == 0);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let before = calls.load(Ordering::SeqCst);
    let rejected = breaker
        .call(|| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
    assert!(rejected.is_err_and(|err| err.is_circuit_open()));
    assert_eq!(calls.load(Ordering::SeqCst), before);

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    breaker.call(|| async { Ok(()) }).await?;

    let stats = breaker.stats();
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.window_size, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn nacked_event_fails_without_waiting_for_timeout() -> AnyResult<()> {
    let rt = runtime(RuntimeConfig {
        ack_timeout_ms: 60_000,
        max_retries: 0,
        ..RuntimeConfig::default()
    })?;
    let acks = rt.ack_handle();
    rt.on("invoice", move |event: Event| {
        let acks = acks.clone();
        async move {
            acks.nack(event.id(), "rejected by validator")?;
            anyhow::Ok(())
        }
    });

    rt.emit("invoice", json!({ "total": -1 }), EmitOptions::default()).await?;
    let summary = rt.process().await?;
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.acked, 0);

    let failures = rt.recent_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].event_type, "invoice");
    assert_eq!(failures[0].attempts, 1);
    assert!(failures[0].reason.contains("rejected by validator"));
    assert_eq!(rt.stats().delivery.pending_acks, 0);
    assert!(!rt.nack(&failures[0].event_id, "late"));
    Ok(())
}
