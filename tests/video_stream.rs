//! Video pipeline against a fake video app over real TCP sockets

use std::sync::{Arc, Mutex};
use std::time::Duration;

use iprov_core::events::{DeviceEvent, FirstFrame};
use iprov_daemon::test_utils::{frame_message, FakeVideoApp};
use iprov_daemon::{AppStream, AppStreamHandle, ChannelConsumer, FrameHandler, StreamConfig, VideoFrame};
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

struct Pipeline {
    app: FakeVideoApp,
    handle: AppStreamHandle,
    events: mpsc::Receiver<DeviceEvent>,
    frames: mpsc::Receiver<VideoFrame>,
    firsts: Arc<Mutex<Vec<FirstFrame>>>,
}

async fn pipeline() -> Pipeline {
    let app = FakeVideoApp::start().await;
    let config = StreamConfig {
        retry_delay: Duration::from_millis(20),
        ping_interval: Duration::from_millis(200),
        recv_timeout: Duration::from_millis(100),
        ..StreamConfig::new(app.video_addr.port(), app.control_addr.port())
    };

    let (events_tx, events) = mpsc::channel(16);
    let firsts = Arc::new(Mutex::new(Vec::new()));
    let sink = firsts.clone();
    let handler = FrameHandler::new("AAA", events_tx)
        .with_first_frame_sink(move |frame| sink.lock().unwrap().push(frame.clone()));

    let handle = AppStream::spawn("AAA", config, handler);
    let (frames_tx, frames) = mpsc::channel(8);
    handle.set_consumer(ChannelConsumer::new(frames_tx));

    Pipeline {
        app,
        handle,
        events,
        frames,
        firsts,
    }
}

async fn wait_for_starts(app: &FakeVideoApp, n: usize) {
    tokio::time::timeout(WAIT, async {
        while app.actions().iter().filter(|a| *a == "start").count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("video app never saw start");
}

async fn next_event(events: &mut mpsc::Receiver<DeviceEvent>) -> DeviceEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no device event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_header_and_payload_forwarded_when_enabled() {
    let mut p = pipeline().await;
    p.handle.enable_forwarding();
    // One start on connect, one for enabling
    wait_for_starts(&p.app, 2).await;

    p.app.push(frame_message(r#"{"dw":100,"dh":200}"#, 500));

    let frame = tokio::time::timeout(WAIT, p.frames.recv())
        .await
        .expect("no frame forwarded")
        .unwrap();
    assert_eq!(frame.payload.len(), 500);
    assert_eq!(frame.header, r#"{"dw":100,"dh":200}"#);
    assert_eq!(
        next_event(&mut p.events).await,
        DeviceEvent::StreamUp {
            width: 100,
            height: 200
        }
    );
    assert_eq!(*p.firsts.lock().unwrap(), vec![FirstFrame::new("AAA", 100, 200)]);

    // Continuation frames carry no header
    p.app.push(vec![7u8; 64]);
    let frame = tokio::time::timeout(WAIT, p.frames.recv()).await.unwrap().unwrap();
    assert!(frame.header.is_empty());
    assert_eq!(frame.payload.len(), 64);

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_discarding_still_announces_dimensions() {
    let mut p = pipeline().await;
    wait_for_starts(&p.app, 1).await;

    p.app.push(frame_message(r#"{"dw":320,"dh":640}"#, 100));
    assert_eq!(
        next_event(&mut p.events).await,
        DeviceEvent::StreamUp {
            width: 320,
            height: 640
        }
    );
    p.app.push(frame_message(r#"{"dw":320,"dh":640}"#, 100));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.frames.try_recv().is_err());
    assert_eq!(p.firsts.lock().unwrap().len(), 1);

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_noframes_is_not_forwarded() {
    let mut p = pipeline().await;
    p.handle.enable_forwarding();
    wait_for_starts(&p.app, 2).await;

    p.app.push(r#"{"msg":"noframes"}"#.as_bytes().to_vec());
    assert_eq!(next_event(&mut p.events).await, DeviceEvent::NoFrames);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.frames.try_recv().is_err());

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_disable_forwarding_stops_frames() {
    let mut p = pipeline().await;
    p.handle.enable_forwarding();
    wait_for_starts(&p.app, 2).await;

    p.app.push(frame_message(r#"{"dw":100,"dh":200}"#, 50));
    tokio::time::timeout(WAIT, p.frames.recv()).await.unwrap().unwrap();

    p.handle.disable_forwarding();
    tokio::time::timeout(WAIT, async {
        while !p.app.actions().iter().any(|a| a == "stop") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    p.app.push(frame_message(r#"{"dw":100,"dh":200}"#, 50));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(p.frames.try_recv().is_err());

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_new_consumer_requests_one_frame() {
    let p = pipeline().await;
    tokio::time::timeout(WAIT, async {
        while !p.app.actions().iter().any(|a| a == "oneframe") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer attach did not ask for a frame");

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_data_reconnect_restarts_broadcast() {
    let mut p = pipeline().await;
    p.handle.enable_forwarding();
    wait_for_starts(&p.app, 2).await;

    p.app.push(frame_message(r#"{"dw":100,"dh":200}"#, 50));
    tokio::time::timeout(WAIT, p.frames.recv()).await.unwrap().unwrap();
    assert!(matches!(next_event(&mut p.events).await, DeviceEvent::StreamUp { .. }));

    p.app.drop_data();
    assert_eq!(next_event(&mut p.events).await, DeviceEvent::StreamDown);
    wait_for_starts(&p.app, 3).await;

    p.app.push(frame_message(r#"{"dw":100,"dh":200}"#, 50));
    tokio::time::timeout(WAIT, p.frames.recv())
        .await
        .expect("no frame after data reconnect")
        .unwrap();
    assert!(matches!(next_event(&mut p.events).await, DeviceEvent::StreamUp { .. }));

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_control_loss_reports_app_and_restarts_broadcast() {
    let mut p = pipeline().await;
    wait_for_starts(&p.app, 1).await;

    p.app.drop_control();
    assert_eq!(next_event(&mut p.events).await, DeviceEvent::VideoAppLost);
    wait_for_starts(&p.app, 2).await;

    tokio::time::timeout(WAIT, p.handle.shutdown()).await.unwrap();
}
