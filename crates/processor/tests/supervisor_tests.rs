//! Loop supervision and the health endpoint over running loops

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::{build_loop, keyed, wait_for_condition, EventLog, Harness, MemoryBroker, TOPIC};
use relay_config::ReadinessQuorum;
use relay_processor::{health, LoopExit, ReadinessAggregator, Supervisor};
use relay_types::Record;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower::ServiceExt;

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_every_loop() {
    let mut supervisor = Supervisor::new(Duration::from_secs(10));
    let mut logs = Vec::new();
    for _ in 0..2 {
        let log = EventLog::default();
        let broker = MemoryBroker::new(log.clone()).with_batch(vec![keyed(1, "a")]);
        supervisor.spawn(build_loop(Harness::default(), broker, log.clone()).consumer_loop);
        logs.push(log);
    }
    let handles = supervisor.handles();

    let (tx, rx) = oneshot::channel::<()>();
    let run = tokio::spawn(supervisor.run_until(async {
        let _ = rx.await;
    }));

    assert!(
        wait_for_condition(
            || logs.iter().all(|log| log.commits().len() == 1),
            Duration::from_secs(30)
        )
        .await
    );
    tx.send(()).unwrap();

    let exits = run.await.unwrap();
    assert_eq!(exits.len(), 2);
    assert!(exits.iter().all(|(_, exit)| exit.is_clean()));
    assert!(handles.iter().all(|h| !h.is_running()));
}

#[tokio::test(start_paused = true)]
async fn test_stragglers_are_aborted_after_grace_period() {
    let log = EventLog::default();
    let broker = MemoryBroker::new(log.clone()).with_batch(vec![keyed(1, "a")]);
    let built = build_loop(
        Harness {
            target_latency: Duration::from_secs(600),
            ..Default::default()
        },
        broker,
        log.clone(),
    );

    let mut supervisor = Supervisor::new(Duration::from_millis(500));
    supervisor.spawn(built.consumer_loop);

    let exits = supervisor
        .run_until(tokio::time::sleep(Duration::from_secs(1)))
        .await;

    assert_eq!(exits.len(), 1);
    assert!(matches!(exits[0].1, LoopExit::Aborted));
    assert!(log.commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_loop_does_not_stop_others() {
    let failing_log = EventLog::default();
    let down = Record::new(TOPIC, 0, 1).with_value("down");
    let failing = MemoryBroker::new(failing_log.clone()).with_batch(vec![down]);

    let healthy_log = EventLog::default();
    let healthy = MemoryBroker::new(healthy_log.clone())
        .with_empty_polls(5)
        .with_batch(vec![keyed(7, "a")]);

    let mut supervisor = Supervisor::new(Duration::from_secs(5));
    supervisor.spawn(build_loop(Harness::default(), failing, failing_log).consumer_loop);
    let survivor =
        supervisor.spawn(build_loop(Harness::default(), healthy, healthy_log.clone()).consumer_loop);

    let (tx, rx) = oneshot::channel::<()>();
    let run = tokio::spawn(supervisor.run_until(async {
        let _ = rx.await;
    }));

    assert!(wait_for_condition(|| healthy_log.commits().len() == 1, Duration::from_secs(30)).await);
    assert!(survivor.is_running());
    tx.send(()).unwrap();

    let exits = run.await.unwrap();
    assert!(matches!(exits[0].1, LoopExit::TargetUnavailable(_)));
    assert!(exits[1].1.is_clean());
}

#[tokio::test(start_paused = true)]
async fn test_is_alive_reports_ready_loop() {
    let log = EventLog::default();
    let broker = MemoryBroker::new(log.clone());
    let built = build_loop(Harness::default(), broker, log);
    let handle = built.consumer_loop.handle();
    let metrics = built.metrics.clone();
    let readiness = Arc::new(ReadinessAggregator::new(
        vec![handle.clone()],
        None,
        ReadinessQuorum::All,
        metrics.clone(),
    ));
    let app = health::router(readiness, metrics, true);

    let response = app
        .clone()
        .oneshot(Request::get("/isAlive").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let task = tokio::spawn(built.consumer_loop.run());
    assert!(wait_for_condition(|| handle.is_ready(), Duration::from_secs(30)).await);

    let response = app
        .clone()
        .oneshot(Request::get("/isAlive").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"true");

    let response = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("relay_ready_loops 1"));

    handle.stop();
    task.await.unwrap();
}
