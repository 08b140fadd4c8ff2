//! Motion queue ordering, backpressure and failure handling.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use common::RecordingTransport;
use printloop_core::config::{Backpressure, QueueConfig};
use printloop_core::error::LiveError;
use printloop_core::motion::{MotionKind, Source};
use printloop_core::queue::MotionQueue;
use printloop_core::session::{Session, SessionEvent};
use printloop_core::transport::TransportError;
use printloop_core::value::Value;

fn axis(name: &str, v: f64) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    params.insert(name.to_string(), Value::Number(v));
    params
}

fn config() -> QueueConfig {
    QueueConfig {
        wait_for_motion: false,
        ..QueueConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cross_source_order_matches_enqueue_order() {
    let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(1)));
    let (queue, drain) = MotionQueue::spawn(&config(), transport.clone(), Session::ephemeral());

    let mut producers = Vec::new();
    for (source, axis_name) in [
        (Source::Main, "x"),
        (Source::Task("a".into()), "y"),
        (Source::Task("b".into()), "z"),
    ] {
        let queue = queue.clone();
        producers.push(tokio::spawn(async move {
            let mut tickets = Vec::new();
            for i in 1..=20 {
                let ticket = queue
                    .enqueue(MotionKind::Move, axis(axis_name, i as f64), source.clone())
                    .await
                    .unwrap();
                tickets.push((ticket.id, format!("G0 {}{}", axis_name.to_uppercase(), i)));
                tokio::task::yield_now().await;
            }
            tickets
        }));
    }

    let mut expected = Vec::new();
    for producer in producers {
        expected.extend(producer.await.unwrap());
    }
    expected.sort_by_key(|(id, _)| *id);
    queue.flush().await.unwrap();

    let ids: Vec<u64> = expected.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, (1..=60).collect::<Vec<u64>>());
    let lines: Vec<String> = expected.into_iter().map(|(_, line)| line).collect();
    assert_eq!(transport.sent(), lines);
    drain.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_fails_command_and_queue_advances() {
    let transport = Arc::new(RecordingTransport::new().hanging_on("X2"));
    let config = QueueConfig {
        ack_timeout_ms: 100,
        ..config()
    };
    let session = Session::ephemeral();
    let (queue, drain) = MotionQueue::spawn(&config, transport.clone(), session.clone());

    let first = queue.enqueue(MotionKind::Move, axis("x", 1.0), Source::Main).await.unwrap();
    let stuck = queue.enqueue(MotionKind::Move, axis("x", 2.0), Source::Main).await.unwrap();
    let last = queue.enqueue(MotionKind::Move, axis("x", 3.0), Source::Main).await.unwrap();

    let start = Instant::now();
    assert!(first.completion().await.is_ok());
    let err = stuck.completion().await.unwrap_err();
    assert!(matches!(err, LiveError::TransportTimeout { id: 2, timeout_ms: 100 }));
    assert!(last.completion().await.is_ok());
    assert!(start.elapsed() >= Duration::from_millis(100));

    assert_eq!(transport.sent(), vec!["G0 X1", "G0 X2", "G0 X3"]);
    let failed: Vec<u64> = session
        .events()
        .await
        .iter()
        .filter_map(|r| match r.event {
            SessionEvent::CommandFailed { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec![2]);
    drain.shutdown().await;
}

#[tokio::test]
async fn test_transport_failure_is_delivered_to_enqueuer() {
    let transport = Arc::new(RecordingTransport::new().failing_on("M999"));
    let (queue, drain) = MotionQueue::spawn(&config(), transport.clone(), Session::ephemeral());

    let mut raw = BTreeMap::new();
    raw.insert("code".to_string(), Value::from("M999"));
    let bad = queue.enqueue(MotionKind::RawGcode, raw, Source::Task("reset".into())).await.unwrap();
    let good = queue.enqueue(MotionKind::Move, axis("z", 5.0), Source::Main).await.unwrap();

    match bad.completion().await {
        Err(LiveError::TransportFailure { id, source: TransportError::Device(message) }) => {
            assert_eq!(id, 1);
            assert!(message.contains("M999"));
        }
        other => panic!("expected transport failure, got {:?}", other),
    }
    assert_eq!(good.completion().await.unwrap().id, 2);
    drain.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_block_backpressure_suspends_enqueuer() {
    let transport = Arc::new(RecordingTransport::new().with_delay(Duration::from_millis(1000)));
    let config = QueueConfig {
        capacity: 2,
        ..config()
    };
    let (queue, drain) = MotionQueue::spawn(&config, transport.clone(), Session::ephemeral());

    let start = Instant::now();
    let mut returned_at = Vec::new();
    for i in 1..=4 {
        queue.enqueue(MotionKind::Move, axis("x", i as f64), Source::Main).await.unwrap();
        returned_at.push(start.elapsed());
    }

    assert!(returned_at[2] < Duration::from_millis(1000));
    assert!(returned_at[3] >= Duration::from_millis(1000));
    queue.flush().await.unwrap();
    assert_eq!(transport.sent().len(), 4);
    drain.shutdown().await;
}

#[tokio::test]
async fn test_fail_fast_rejects_when_full() {
    let config = QueueConfig {
        capacity: 1,
        backpressure: Backpressure::FailFast,
        ..config()
    };
    // Nothing drains, so the single slot stays taken.
    let (queue, _drain) = MotionQueue::new(&config, Session::ephemeral());

    queue.enqueue(MotionKind::Move, axis("x", 1.0), Source::Main).await.unwrap();
    let err = queue
        .enqueue(MotionKind::Move, axis("x", 2.0), Source::Task("zbump".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, LiveError::QueueFull { capacity: 1 }));
}
