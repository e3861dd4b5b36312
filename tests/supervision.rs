//! Supervisor stop and restart semantics with real `/bin/sh` children

use std::sync::{Arc, Mutex};
use std::time::Duration;

use iprov_core::events::StopCause;
use iprov_daemon::{BackoffPolicy, ProcessHandle, ProcessSpec, ProcessTable};

const WAIT: Duration = Duration::from_secs(5);

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        first: Duration::from_millis(20),
        max: Duration::from_millis(80),
        factor: 2.0,
        healthy: Duration::from_secs(10),
    }
}

fn sleeper(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "/bin/sh")
        .args(["-c", "exec sleep 30"])
        .backoff(policy())
}

async fn terminated(handle: &ProcessHandle) {
    tokio::time::timeout(WAIT, handle.wait_terminated())
        .await
        .expect("process should terminate");
}

fn kill(pid: u32) {
    let status = std::process::Command::new("kill")
        .args(["-KILL", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_external_kill_restarts_until_stopped() {
    let registry = Arc::new(ProcessTable::new());
    let causes = Arc::new(Mutex::new(Vec::new()));
    let sink = causes.clone();

    let handle = sleeper("victim")
        .on_stop(move |info| sink.lock().unwrap().push(info.cause))
        .start(registry.clone())
        .unwrap();

    let first = handle.wait_running().await.unwrap();
    kill(first);

    let second = tokio::time::timeout(WAIT, async {
        loop {
            match handle.pid() {
                Some(pid) if pid != first => break pid,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("killed process was not restarted");
    assert_ne!(first, second);

    handle.stop();
    terminated(&handle).await;

    // Well past the largest backoff delay
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(handle.is_terminated());
    assert_eq!(handle.pid(), None);
    assert_eq!(
        *causes.lock().unwrap(),
        vec![StopCause::Signaled, StopCause::Stopped]
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_stop_during_backoff_prevents_restart() {
    let registry = Arc::new(ProcessTable::new());
    let handle = ProcessSpec::new("flapper", "/bin/sh")
        .args(["-c", "exec sleep 30"])
        .backoff(BackoffPolicy {
            first: Duration::from_millis(400),
            max: Duration::from_secs(1),
            ..policy()
        })
        .start(registry.clone())
        .unwrap();

    let pid = handle.wait_running().await.unwrap();
    kill(pid);

    // Now waiting out the backoff delay
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.stop();
    terminated(&handle).await;

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(handle.is_terminated());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_stop_all_ends_every_supervisor() {
    let registry = Arc::new(ProcessTable::new());
    let handles: Vec<ProcessHandle> = ["tunnel_AAA", "wda_AAA", "syslog_AAA"]
        .into_iter()
        .map(|name| sleeper(name).start(registry.clone()).unwrap())
        .collect();
    for handle in &handles {
        handle.wait_running().await.unwrap();
    }
    assert_eq!(registry.len(), 3);

    registry.begin_shutdown();
    tokio::time::timeout(WAIT, registry.stop_all()).await.unwrap();

    assert!(registry.is_empty());
    assert!(handles.iter().all(ProcessHandle::is_terminated));
    assert!(sleeper("late").start(registry.clone()).is_err());
}
