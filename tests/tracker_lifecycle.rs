//! End-to-end device lifecycle through the tracker, using the scripted bridge

use std::sync::Arc;
use std::time::Duration;

use iprov_app::test_utils::RecordingControlFloor;
use iprov_app::{DeviceContext, DeviceTracker, Settings, TrackerHandle};
use iprov_daemon::test_utils::FakeBridge;
use iprov_daemon::{FatalReporter, ProcessTable};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

struct Provider {
    handle: TrackerHandle,
    bridge: Arc<FakeBridge>,
    cf: Arc<RecordingControlFloor>,
    registry: Arc<ProcessTable>,
    task: JoinHandle<()>,
}

fn start(range: &str) -> Provider {
    let mut settings = Settings::default();
    settings.ports.range = range.to_string();
    settings.stream.connect_retries = 1;
    settings.stream.retry_delay_ms = 10;

    let registry = Arc::new(ProcessTable::new());
    let bridge = Arc::new(FakeBridge::new(registry.clone()));
    let cf = Arc::new(RecordingControlFloor::new());
    let (fatal, _fatal_rx) = FatalReporter::channel();
    let ctx = Arc::new(DeviceContext::new(Arc::new(settings), cf.clone(), fatal));

    let mut tracker = DeviceTracker::new(bridge.clone(), ctx, registry.clone()).unwrap();
    tracker.start_detection().unwrap();
    Provider {
        handle: tracker.handle(),
        bridge,
        cf,
        registry,
        task: tracker.spawn(),
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_connect_disconnect_reconnect_keeps_device() {
    let p = start("18400-18499");

    p.handle.connect("AAA", "Bench");
    assert!(p.cf.wait_for(2, WAIT).await);
    assert_eq!(&p.cf.variants()[..2], &["exists", "info"]);

    let devices = p.handle.devices().await;
    assert_eq!(devices.len(), 1);
    assert!(devices[0].connected);
    let ports = devices[0].ports;
    assert_eq!(ports.all(), vec![18400, 18401, 18402]);

    // Let the session come up before tearing it down
    assert!(p.cf.wait_for_variant("wdaStarted", WAIT).await);

    p.handle.disconnect("AAA");
    let devices = p.handle.devices().await;
    assert!(!devices[0].connected);
    assert_eq!(devices[0].ports, ports);

    p.handle.connect("AAA", "Bench");
    let devices = p.handle.devices().await;
    assert_eq!(devices.len(), 1);
    assert!(devices[0].connected);
    assert_eq!(devices[0].ports, ports);

    let bridge = p.bridge.clone();
    wait_until(move || bridge.count("tunnel AAA") == 2).await;

    assert_eq!(p.cf.count("exists"), 1);
    assert_eq!(p.cf.count("info"), 1);
    assert_eq!(p.bridge.count("info AAA"), 1);

    p.handle.shutdown().await;
    p.task.await.unwrap();
    assert!(p.registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_notifies_every_device() {
    let p = start("18500-18599");
    let udids = ["AAA", "BBB", "CCC"];

    for udid in udids {
        p.handle.connect(udid, "Bench");
    }
    for udid in udids {
        let cf = p.cf.clone();
        wait_until(move || cf.count_for("info", udid) == 1).await;
    }

    let devices = p.handle.devices().await;
    let mut ports: Vec<u16> = devices.iter().flat_map(|d| d.ports.all()).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 9);
    assert!(!p.registry.is_empty());

    p.handle.shutdown().await;
    p.task.await.unwrap();

    assert_eq!(p.cf.count("provisionStopped"), udids.len());
    for udid in udids {
        assert_eq!(p.cf.count_for("provisionStopped", udid), 1);
    }
    assert!(p.registry.is_empty());
}

#[tokio::test]
async fn test_connects_after_shutdown_are_ignored() {
    let p = start("18600-18699");
    p.handle.shutdown().await;
    p.task.await.unwrap();

    p.handle.connect("LATE", "Bench");
    assert!(p.handle.devices().await.is_empty());
    assert!(p.cf.notifications().is_empty());
    assert_eq!(p.bridge.count("tunnel"), 0);
}
