//! End-to-end lifecycle scenarios through the manager: cold start, idle
//! eviction, start failure and concurrency admission.

use std::sync::Arc;
use std::time::Duration;

use clara_core::{Config, ProxyError};
use clara_runtime::{AdmissionMode, LogMux, Manager, ProcessState};
use tokio::time::{Instant, sleep, timeout};

fn manager_from(yaml: &str) -> Arc<Manager> {
    let config = Config::from_yaml(yaml).unwrap();
    Manager::new(config, Arc::new(LogMux::new()))
}

#[tokio::test]
async fn cold_start_brings_model_up_on_first_request() {
    let manager = manager_from(
        r#"
startPort: 24500
healthCheckTimeout: 10
models:
  m1:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#,
    );

    let process = manager.find_process("m1").await.unwrap();
    assert_eq!(process.state(), ProcessState::Stopped);

    let ticket = manager.acquire("m1", AdmissionMode::Queue).await.unwrap();
    assert_eq!(process.state(), ProcessState::Ready);
    assert!(ticket.upstream().starts_with("http://127.0.0.1:2"));
    drop(ticket);

    manager.shutdown_all().await;
}

#[tokio::test]
async fn idle_model_is_evicted_after_ttl() {
    let manager = manager_from(
        r#"
startPort: 24520
stopTimeout: 5
models:
  m1:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
    ttl: 1
"#,
    );

    let ticket = manager.acquire("m1", AdmissionMode::Queue).await.unwrap();
    drop(ticket);
    let process = manager.find_process("m1").await.unwrap();
    assert_eq!(process.state(), ProcessState::Ready);

    // Eviction must land within ttl + stopTimeout.
    timeout(Duration::from_secs(7), async {
        while process.state() != ProcessState::Stopped {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("idle model was not evicted in time");

    manager.shutdown_all().await;
}

#[tokio::test]
async fn failed_start_surfaces_unavailable_with_error() {
    let manager = manager_from(
        r#"
startPort: 24540
healthCheckTimeout: 3
models:
  broken:
    cmdTemplate: "/nonexistent/llama-server-for-test -m none --port ${PORT}"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
"#,
    );

    let err = manager
        .acquire("broken", AdmissionMode::Queue)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Unavailable { .. }));

    let process = manager.find_process("broken").await.unwrap();
    assert_eq!(process.state(), ProcessState::Failed);
    assert!(process.last_error().is_some());

    manager.shutdown_all().await;
}

#[tokio::test]
async fn health_probe_timeout_fails_the_start() {
    // The subprocess runs but never serves HTTP, so the probe times out
    // and the start is recorded as failed.
    let manager = manager_from(
        r#"
startPort: 24560
healthCheckTimeout: 2
stopTimeout: 2
models:
  mute:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: /health
"#,
    );

    let started = Instant::now();
    let err = manager
        .acquire("mute", AdmissionMode::Queue)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Unavailable { .. }));
    // The probe loop burns most of its budget before giving up.
    assert!(started.elapsed() >= Duration::from_secs(1));

    let process = manager.find_process("mute").await.unwrap();
    assert_eq!(process.state(), ProcessState::Failed);
    assert!(
        process
            .last_error()
            .unwrap()
            .contains("no healthy response")
    );

    manager.shutdown_all().await;
}

#[tokio::test]
async fn queued_admission_is_fifo_and_blocking() {
    let manager = manager_from(
        r#"
startPort: 24580
models:
  m1:
    cmdTemplate: "sleep 30"
    proxyURL: "http://127.0.0.1:${PORT}"
    checkEndpoint: none
    concurrencyLimit: 1
"#,
    );

    let first = manager.acquire("m1", AdmissionMode::Queue).await.unwrap();

    // The second request parks until the first slot frees.
    let second = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.acquire("m1", AdmissionMode::Queue).await })
    };
    sleep(Duration::from_millis(200)).await;
    assert!(!second.is_finished());

    drop(first);
    let ticket = timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ticket.model(), "m1");
    drop(ticket);

    manager.shutdown_all().await;
}
