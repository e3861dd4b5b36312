//! Per-device lifecycle
//!
//! A [`Device`] is created once per identifier and lives until provider
//! shutdown. Its worker task serializes connect, disconnect and teardown
//! requests, so one device's operations never interleave while different
//! devices provision in parallel. Each connected period runs a
//! [`DeviceSession`]: tunnels, the automation agent, the syslog monitor, an
//! optional backup video server, the video stream, and the event loop that
//! reacts to [`DeviceEvent`]s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::automation::AutomationClient;
use crate::config::Settings;
use crate::control_floor::{ControlFloor, Notification};
use iprov_core::events::DeviceEvent;
use iprov_core::prelude::*;
use iprov_core::types::{DeviceInfo, IosVersion, LogItem, PortSet, ScreenSize, TunnelPair};
use iprov_daemon::{
    AgentHooks, AppStream, AppStreamHandle, BridgeDevice, FatalReporter, FrameHandler,
    ProcessHandle, VideoServer,
};

/// Device attributes fetched on first connect
pub const INFO_KEYS: &[&str] = &[
    "DeviceName",
    "EthernetAddress",
    "ModelNumber",
    "HardwareModel",
    "PhoneNumber",
    "ProductType",
    "ProductVersion",
    "UniqueDeviceID",
    "InternationalCircuitCardIdentity",
    "InternationalMobileEquipmentIdentity",
    "InternationalMobileSubscriberIdentity",
];

/// Gestalt keys used for screen dimensions
pub const GESTALT_KEYS: &[&str] = &[
    "AvailableDisplayZoomSizes",
    "main-screen-width",
    "main-screen-height",
];

const EVENT_QUEUE: usize = 64;

/// Where a device is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Attached; session not yet started
    Connected,
    /// Agent launched, not yet serving
    AutomationStarting,
    AutomationReady,
    /// Video frames flowing
    Streaming,
    Disconnected,
}

/// Everything a device needs from the provider
pub struct DeviceContext<C> {
    pub settings: Arc<Settings>,
    pub control_floor: Arc<C>,
    pub fatal: FatalReporter,
    pub http: reqwest::Client,
}

impl<C> DeviceContext<C> {
    pub fn new(settings: Arc<Settings>, control_floor: Arc<C>, fatal: FatalReporter) -> Self {
        Self {
            settings,
            control_floor,
            fatal,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug)]
struct DeviceState {
    connected: bool,
    lifecycle: Lifecycle,
    provisioned: bool,
    info: DeviceInfo,
    version: Option<IosVersion>,
    screen: ScreenSize,
    stream_size: Option<(u32, u32)>,
    /// Event queue of the running session
    events: Option<mpsc::Sender<DeviceEvent>>,
    backup: Option<Arc<VideoServer>>,
}

enum DeviceCommand<D> {
    Connect(Arc<D>),
    Disconnect,
    /// Replace the session's video stream after the app was relaunched
    RestartStream,
    Teardown(oneshot::Sender<()>),
}

/// One physical unit
pub struct Device<D> {
    udid: String,
    name: String,
    ports: PortSet,
    state: Mutex<DeviceState>,
    commands: mpsc::UnboundedSender<DeviceCommand<D>>,
}

impl<D> std::fmt::Debug for Device<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("udid", &censor_udid(&self.udid))
            .field("name", &self.name)
            .field("ports", &self.ports)
            .finish()
    }
}

impl<D: BridgeDevice + Sync + 'static> Device<D> {
    /// Create the device and start its worker. The device starts
    /// disconnected; call [`Device::connect`] to provision it.
    pub fn spawn<C>(
        udid: impl Into<String>,
        name: impl Into<String>,
        ports: PortSet,
        ctx: Arc<DeviceContext<C>>,
    ) -> Arc<Self>
    where
        C: ControlFloor + Sync + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            udid: udid.into(),
            name: name.into(),
            ports,
            state: Mutex::new(DeviceState {
                connected: false,
                lifecycle: Lifecycle::Disconnected,
                provisioned: false,
                info: DeviceInfo::new(),
                version: None,
                screen: ScreenSize::default(),
                stream_size: None,
                events: None,
                backup: None,
            }),
            commands,
        });
        tokio::spawn(run_worker(device.clone(), ctx, rx));
        device
    }

    /// Mark connected and start (or resume) the session on `bridge`
    pub fn connect(&self, bridge: Arc<D>) {
        {
            let mut state = self.lock();
            state.connected = true;
            state.lifecycle = Lifecycle::Connected;
        }
        self.command(DeviceCommand::Connect(bridge));
    }

    /// Mark disconnected and stop the session; ports and info are kept
    pub fn disconnect(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.lifecycle = Lifecycle::Disconnected;
        }
        self.command(DeviceCommand::Disconnect);
    }

    /// Stop the session and the worker; resolves once both are gone
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        self.command(DeviceCommand::Teardown(tx));
        if rx.await.is_err() {
            debug!("Device {} worker already gone", censor_udid(&self.udid));
        }
    }

    fn command(&self, command: DeviceCommand<D>) {
        if self.commands.send(command).is_err() {
            debug!("Device {} worker has ended", censor_udid(&self.udid));
        }
    }
}

impl<D> Device<D> {
    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    pub fn is_provisioned(&self) -> bool {
        self.lock().provisioned
    }

    pub fn info(&self) -> DeviceInfo {
        self.lock().info.clone()
    }

    pub fn ios_version(&self) -> Option<IosVersion> {
        self.lock().version
    }

    pub fn screen(&self) -> ScreenSize {
        self.lock().screen
    }

    /// Dimensions of the last stream that came up
    pub fn stream_size(&self) -> Option<(u32, u32)> {
        self.lock().stream_size
    }

    /// Queue an event for the running session. False if none is running.
    pub fn send_event(&self, event: DeviceEvent) -> bool {
        let Some(events) = self.lock().events.clone() else {
            return false;
        };
        events.try_send(event).is_ok()
    }

    pub fn backup_video(&self) -> Option<Arc<VideoServer>> {
        self.lock().backup.clone()
    }

    /// Move to `lifecycle` unless the device has disconnected meanwhile.
    /// Returns the previous state.
    fn advance(&self, lifecycle: Lifecycle) -> Lifecycle {
        let mut state = self.lock();
        let previous = state.lifecycle;
        if state.connected {
            state.lifecycle = lifecycle;
        }
        previous
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────

async fn run_worker<D, C>(
    device: Arc<Device<D>>,
    ctx: Arc<DeviceContext<C>>,
    mut commands: mpsc::UnboundedReceiver<DeviceCommand<D>>,
) where
    D: BridgeDevice + Sync + 'static,
    C: ControlFloor + Sync + 'static,
{
    let id = censor_udid(&device.udid);
    let mut session: Option<DeviceSession> = None;

    while let Some(command) = commands.recv().await {
        match command {
            DeviceCommand::Connect(bridge) => {
                if !device.is_provisioned() {
                    provision(&device, bridge.as_ref(), &ctx).await;
                }
                if session.is_some() || !device.is_connected() {
                    continue;
                }
                match start_session(&device, &bridge, &ctx).await {
                    Ok(started) => session = Some(started),
                    Err(e) if e.is_fatal() => ctx.fatal.report(e),
                    Err(e) => error!("Device {} session failed to start: {}", id, e),
                }
            }
            DeviceCommand::Disconnect => {
                if let Some(running) = session.take() {
                    end_session(&device, running).await;
                }
            }
            DeviceCommand::RestartStream => {
                if let Some(running) = session.as_mut() {
                    running.restart_stream(&device, &ctx).await;
                }
            }
            DeviceCommand::Teardown(reply) => {
                if let Some(running) = session.take() {
                    end_session(&device, running).await;
                }
                let _ = reply.send(());
                break;
            }
        }
    }
    debug!("Device {} worker finished", id);
}

/// Fetch and cache device info and screen size, then announce the device
async fn provision<D, C>(device: &Device<D>, bridge: &D, ctx: &DeviceContext<C>)
where
    D: BridgeDevice + Sync,
    C: ControlFloor + Sync,
{
    let id = censor_udid(&device.udid);

    let info = bridge.info(INFO_KEYS).await;
    let version = info
        .get("ProductVersion")
        .and_then(|v| v.parse::<IosVersion>().ok());
    let gestalt = bridge.gestalt(GESTALT_KEYS).await;
    let screen = screen_size(&gestalt, ctx.settings.ui_size(&device.udid));

    debug!("Device {} info: {:?}", id, info);
    info!(
        "Device {} is {} iOS {}, screen {}x{} (click {}x{})",
        id,
        info.get("ProductType").map(String::as_str).unwrap_or("unknown"),
        version.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
        screen.width,
        screen.height,
        screen.click_width,
        screen.click_height,
    );

    {
        let mut state = device.lock();
        state.info = info.clone();
        state.version = version;
        state.screen = screen;
        state.provisioned = true;
    }

    let cf = &ctx.control_floor;
    cf.notify(Notification::Exists {
        udid: device.udid.clone(),
        size: screen,
    })
    .await;
    cf.notify(Notification::Info {
        udid: device.udid.clone(),
        info,
    })
    .await;
}

/// Screen and click dimensions from gestalt values
///
/// Click size comes from the configured override, then from the default
/// display zoom entry (`[_, width, _, height]`), then the raw screen size.
pub fn screen_size(gestalt: &HashMap<String, Value>, ui_size: Option<(u32, u32)>) -> ScreenSize {
    let dim = |key: &str| gestalt.get(key).and_then(value_u32);
    let zoom = gestalt
        .get("AvailableDisplayZoomSizes")
        .and_then(|z| z.get("default"))
        .and_then(Value::as_array);
    let zoom_at = |i: usize| zoom.and_then(|sizes| sizes.get(i)).and_then(value_u32);
    let zoomed = zoom_at(1).zip(zoom_at(3));

    let width = dim("main-screen-width").or(ui_size.map(|s| s.0)).unwrap_or(0);
    let height = dim("main-screen-height").or(ui_size.map(|s| s.1)).unwrap_or(0);
    let (click_width, click_height) = ui_size.or(zoomed).unwrap_or((width, height));

    ScreenSize {
        width,
        height,
        click_width,
        click_height,
    }
}

fn value_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────

/// Processes and tasks of one connected period
struct DeviceSession {
    events: mpsc::Sender<DeviceEvent>,
    event_loop: JoinHandle<()>,
    processes: HashMap<String, ProcessHandle>,
    stream: Option<AppStreamHandle>,
    backup: Option<Arc<VideoServer>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("processes", &self.processes.keys().collect::<Vec<_>>())
            .field("has_stream", &self.stream.is_some())
            .field("has_backup", &self.backup.is_some())
            .finish()
    }
}

impl DeviceSession {
    fn own(&mut self, handle: ProcessHandle) {
        self.processes.insert(handle.name().to_string(), handle);
    }

    async fn restart_stream<D, C>(&mut self, device: &Device<D>, ctx: &DeviceContext<C>) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown().await;
        }
        info!("Restarting video stream for {}", censor_udid(&device.udid));
        self.stream = Some(spawn_stream(device, ctx, &self.events));
    }

    /// Stop everything; the event loop sees the agent stop before `Stop`
    async fn close(self) {
        if let Some(stream) = self.stream {
            stream.shutdown().await;
        }

        let mut processes: Vec<ProcessHandle> = self.processes.into_values().collect();
        processes.extend(self.backup.as_ref().map(|b| b.process().clone()));
        for process in &processes {
            process.stop();
        }
        for process in &processes {
            process.wait_terminated().await;
        }

        if self.events.send(DeviceEvent::Stop).await.is_err() {
            debug!("Device event loop already ended");
        }
        if let Err(e) = self.event_loop.await {
            warn!("Device event loop ended abnormally: {}", e);
        }
    }
}

async fn start_session<D, C>(
    device: &Arc<Device<D>>,
    bridge: &Arc<D>,
    ctx: &Arc<DeviceContext<C>>,
) -> Result<DeviceSession>
where
    D: BridgeDevice + Sync + 'static,
    C: ControlFloor + Sync + 'static,
{
    let udid = device.udid.clone();
    let ports = device.ports;
    let kind = ctx.settings.agent_kind(&udid);
    info!("Starting session for {} ({} agent)", censor_udid(&udid), kind);

    let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
    let automation = AutomationClient::new(kind, ports.automation, ctx.http.clone());
    let event_loop = tokio::spawn(run_event_loop(
        device.clone(),
        bridge.clone(),
        ctx.clone(),
        automation,
        events_rx,
    ));

    let mut session = DeviceSession {
        events: events.clone(),
        event_loop,
        processes: HashMap::new(),
        stream: None,
        backup: None,
    };
    device.lock().events = Some(events.clone());

    match start_processes(device, bridge.as_ref(), ctx, &events, &mut session).await {
        Ok(()) => {
            device.lock().backup = session.backup.clone();
            Ok(session)
        }
        Err(e) => {
            end_session(device, session).await;
            Err(e)
        }
    }
}

async fn start_processes<D, C>(
    device: &Arc<Device<D>>,
    bridge: &D,
    ctx: &DeviceContext<C>,
    events: &mpsc::Sender<DeviceEvent>,
    session: &mut DeviceSession,
) -> Result<()>
where
    D: BridgeDevice + Sync + 'static,
{
    let udid = device.udid.as_str();
    let id = censor_udid(udid);
    let ports = device.ports;
    let settings = &ctx.settings;
    let kind = settings.agent_kind(udid);

    let mut pairs = vec![
        TunnelPair::new(ports.automation, kind.device_port()),
        TunnelPair::new(ports.video, settings.stream.video_device_port),
        TunnelPair::new(ports.video_control, settings.stream.control_device_port),
    ];
    if let (Some(local), Some(remote)) = (ports.video_log, settings.stream.log_device_port) {
        pairs.push(TunnelPair::new(local, remote));
    }
    for tunnel in bridge.tunnel(&pairs).await? {
        session.own(tunnel);
    }

    if let Some(path) = &settings.stream.app_path {
        if !bridge.install_app(path).await {
            warn!("Installing {:?} on {} did not complete", path, id);
        }
    }
    if let Some(bundle_id) = &settings.stream.app_bundle_id {
        if !bridge.launch_app(bundle_id).await {
            warn!("Launching {} on {} failed", bundle_id, id);
        }
    }

    device.advance(Lifecycle::AutomationStarting);
    let started = events.clone();
    let stopped = events.clone();
    let hooks = AgentHooks::new(
        move || {
            if started.try_send(DeviceEvent::AutomationStarted).is_err() {
                debug!("Automation start not queued");
            }
        },
        move |info| {
            debug!("{} stopped: {:?}", info.name, info.cause);
            if stopped.try_send(DeviceEvent::AutomationStopped).is_err() {
                debug!("Automation stop not queued");
            }
        },
    );
    session.own(bridge.launch_automation_agent(kind, ports.automation, hooks)?);

    let log_id = id.clone();
    session.own(bridge.new_syslog_monitor(Box::new(move |item: LogItem| {
        debug!("[{}] {}: {}", log_id, item.app, item.msg);
    }))?);

    if let Some(port) = ports.backup_video {
        let video_id = id.clone();
        let server = bridge.new_video_server(
            port,
            Box::new(move |info| debug!("Backup video for {} stopped: {:?}", video_id, info.cause)),
        )?;
        session.backup = Some(Arc::new(server));
    }

    session.stream = Some(spawn_stream(device, ctx, events));
    Ok(())
}

fn spawn_stream<D, C>(
    device: &Device<D>,
    ctx: &DeviceContext<C>,
    events: &mpsc::Sender<DeviceEvent>,
) -> AppStreamHandle {
    let handler = FrameHandler::new(device.udid.as_str(), events.clone());
    AppStream::spawn(
        device.udid.as_str(),
        ctx.settings.stream_config(&device.ports),
        handler,
    )
}

/// Bring the video app back after its control connection was lost: launch
/// it, reinstall when launching fails, then restart the stream
async fn relaunch_video_app<D, C>(device: Arc<Device<D>>, bridge: Arc<D>, ctx: Arc<DeviceContext<C>>)
where
    D: BridgeDevice + Sync + 'static,
    C: ControlFloor + Sync + 'static,
{
    let id = censor_udid(&device.udid);
    let stream = &ctx.settings.stream;
    let Some(bundle_id) = &stream.app_bundle_id else {
        debug!("No video app bundle id configured; not relaunching for {}", id);
        return;
    };

    info!("Relaunching video app {} on {}", bundle_id, id);
    let mut launched = bridge.launch_app(bundle_id).await;
    if !launched {
        if let Some(path) = &stream.app_path {
            warn!("Launching {} on {} failed; reinstalling from {:?}", bundle_id, id, path);
            launched = bridge.install_app(path).await && bridge.launch_app(bundle_id).await;
        }
    }
    if !launched {
        warn!("Video app {} on {} could not be relaunched", bundle_id, id);
        return;
    }
    device.command(DeviceCommand::RestartStream);
}

async fn end_session<D>(device: &Device<D>, session: DeviceSession) {
    info!("Ending session for {}", censor_udid(&device.udid));
    {
        let mut state = device.lock();
        state.events = None;
        state.backup = None;
    }
    session.close().await;
}

// ─────────────────────────────────────────────────────────
// Event loop
// ─────────────────────────────────────────────────────────

async fn run_event_loop<D, C>(
    device: Arc<Device<D>>,
    bridge: Arc<D>,
    ctx: Arc<DeviceContext<C>>,
    automation: AutomationClient,
    mut events: mpsc::Receiver<DeviceEvent>,
) where
    D: BridgeDevice + Sync + 'static,
    C: ControlFloor + Sync + 'static,
{
    let cf = ctx.control_floor.clone();
    let udid = device.udid.clone();
    let id = censor_udid(&udid);
    let kind = automation.kind();
    let automation = Arc::new(tokio::sync::Mutex::new(automation));
    let mut session_task: Option<JoinHandle<()>> = None;
    let mut relaunch: Option<JoinHandle<()>> = None;

    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::AutomationStarted => {
                info!("{} agent ready on {}", kind, id);
                device.advance(Lifecycle::AutomationReady);
                cf.notify(Notification::AgentStarted {
                    udid: udid.clone(),
                    kind,
                })
                .await;

                if let Some(task) = session_task.take() {
                    task.abort();
                }
                let client = automation.clone();
                let session_id = id.clone();
                session_task = Some(tokio::spawn(async move {
                    match client.lock().await.ensure_session().await {
                        Ok(sid) => debug!("{} automation session {}", session_id, sid),
                        Err(e) => warn!("No automation session for {}: {}", session_id, e),
                    }
                }));
            }
            DeviceEvent::AutomationStopped => {
                info!("{} agent stopped on {}", kind, id);
                device.advance(Lifecycle::AutomationStarting);
                if let Some(task) = session_task.take() {
                    task.abort();
                }
                automation.lock().await.reset();
                cf.notify(Notification::AgentStopped {
                    udid: udid.clone(),
                    kind,
                })
                .await;
            }
            DeviceEvent::StreamUp { width, height } => {
                device.lock().stream_size = Some((width, height));
                if device.advance(Lifecycle::Streaming) != Lifecycle::Streaming {
                    info!("Video up for {}: {}x{}", id, width, height);
                    cf.notify(Notification::VideoStarted { udid: udid.clone() })
                        .await;
                }
            }
            DeviceEvent::StreamDown => {
                info!("Video down for {}", id);
                if device.lifecycle() == Lifecycle::Streaming {
                    device.advance(Lifecycle::AutomationReady);
                    cf.notify(Notification::VideoStopped { udid: udid.clone() })
                        .await;
                }
            }
            DeviceEvent::NoFrames => debug!("Video app for {} has no frames", id),
            DeviceEvent::VideoAppLost => {
                if relaunch.as_ref().is_some_and(|task| !task.is_finished()) {
                    debug!("Video app relaunch for {} already running", id);
                    continue;
                }
                relaunch = Some(tokio::spawn(relaunch_video_app(
                    device.clone(),
                    bridge.clone(),
                    ctx.clone(),
                )));
            }
            DeviceEvent::Stop => break,
        }
    }

    for task in [session_task, relaunch].into_iter().flatten() {
        task.abort();
    }
    debug!("Event loop for {} finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingControlFloor;
    use iprov_daemon::test_utils::FakeBridge;
    use iprov_daemon::{Bridge, ProcessTable};
    use serde_json::json;
    use std::time::Duration;

    fn ports() -> PortSet {
        PortSet {
            automation: 18100,
            video: 18101,
            video_control: 18102,
            backup_video: None,
            video_log: None,
        }
    }

    fn context(cf: Arc<RecordingControlFloor>) -> Arc<DeviceContext<RecordingControlFloor>> {
        let mut settings = Settings::default();
        settings.stream.connect_retries = 1;
        settings.stream.retry_delay_ms = 10;
        let (fatal, _rx) = FatalReporter::channel();
        Arc::new(DeviceContext::new(Arc::new(settings), cf, fatal))
    }

    #[test]
    fn test_screen_size_from_zoom_table() {
        let gestalt = HashMap::from([
            ("main-screen-width".to_string(), json!(1170)),
            ("main-screen-height".to_string(), json!("2532")),
            (
                "AvailableDisplayZoomSizes".to_string(),
                json!({"default": [3, 390, 3, 844], "zoomed": [3, 320, 3, 693]}),
            ),
        ]);
        let size = screen_size(&gestalt, None);
        assert_eq!(
            size,
            ScreenSize {
                width: 1170,
                height: 2532,
                click_width: 390,
                click_height: 844
            }
        );
    }

    #[test]
    fn test_screen_size_override_wins() {
        let gestalt = HashMap::from([
            ("main-screen-width".to_string(), json!(750)),
            ("main-screen-height".to_string(), json!(1334)),
        ]);
        let size = screen_size(&gestalt, Some((375, 667)));
        assert_eq!((size.width, size.height), (750, 1334));
        assert_eq!((size.click_width, size.click_height), (375, 667));
    }

    #[test]
    fn test_screen_size_missing_everything() {
        assert_eq!(screen_size(&HashMap::new(), None), ScreenSize::default());
        let size = screen_size(&HashMap::new(), Some((320, 480)));
        assert_eq!((size.width, size.click_height), (320, 480));
    }

    #[tokio::test]
    async fn test_connect_provisions_and_announces() {
        let registry = Arc::new(ProcessTable::new());
        let bridge = FakeBridge::new(registry.clone());
        let cf = Arc::new(RecordingControlFloor::new());
        let device = Device::spawn("AAA", "Bench", ports(), context(cf.clone()));

        device.connect(bridge.attach("AAA", "Bench"));
        assert!(cf.wait_for(2, Duration::from_secs(5)).await);

        let sent = cf.variants();
        assert_eq!(&sent[..2], &["exists".to_string(), "info".to_string()]);
        assert_eq!(device.screen().width, 750);
        assert_eq!(device.ios_version().map(|v| v.major), Some(16));
        assert_eq!(device.info().get("DeviceName").map(String::as_str), Some("Bench"));

        device.teardown().await;
        assert!(registry.is_empty());
        assert!(!device.send_event(DeviceEvent::NoFrames));
    }

    #[tokio::test]
    async fn test_agent_start_notifies() {
        let registry = Arc::new(ProcessTable::new());
        let bridge = FakeBridge::new(registry.clone());
        let cf = Arc::new(RecordingControlFloor::new());
        let device = Device::spawn("BBB", "Bench", ports(), context(cf.clone()));

        device.connect(bridge.attach("BBB", "Bench"));
        assert!(cf.wait_for_variant("wdaStarted", Duration::from_secs(5)).await);
        assert_eq!(bridge.count("agent BBB WDA"), 1);

        device.teardown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stream_up_cached_once() {
        let registry = Arc::new(ProcessTable::new());
        let bridge = FakeBridge::new(registry.clone());
        let cf = Arc::new(RecordingControlFloor::new());
        let device = Device::spawn("CCC", "Bench", ports(), context(cf.clone()));

        device.connect(bridge.attach("CCC", "Bench"));
        assert!(cf.wait_for(2, Duration::from_secs(5)).await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !device.send_event(DeviceEvent::StreamUp {
                width: 100,
                height: 200,
            }) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        device.send_event(DeviceEvent::StreamUp {
            width: 100,
            height: 200,
        });

        assert!(cf.wait_for_variant("videoStarted", Duration::from_secs(5)).await);
        assert_eq!(device.stream_size(), Some((100, 200)));

        device.teardown().await;
        assert_eq!(cf.count("videoStarted"), 1);
    }

    #[tokio::test]
    async fn test_lost_video_app_is_relaunched() {
        let registry = Arc::new(ProcessTable::new());
        let bridge = FakeBridge::new(registry.clone());
        let cf = Arc::new(RecordingControlFloor::new());
        let mut settings = Settings::default();
        settings.stream.connect_retries = 1;
        settings.stream.retry_delay_ms = 10;
        settings.stream.app_bundle_id = Some("com.example.vidstream".to_string());
        let (fatal, _rx) = FatalReporter::channel();
        let ctx = Arc::new(DeviceContext::new(Arc::new(settings), cf.clone(), fatal));
        let device = Device::spawn("EEE", "Bench", ports(), ctx);

        device.connect(bridge.attach("EEE", "Bench"));
        assert!(cf.wait_for_variant("wdaStarted", Duration::from_secs(5)).await);
        assert_eq!(bridge.count("launch EEE com.example.vidstream"), 1);

        assert!(device.send_event(DeviceEvent::VideoAppLost));
        tokio::time::timeout(Duration::from_secs(5), async {
            while bridge.count("launch EEE") < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("video app was not relaunched");
        assert_eq!(bridge.count("install EEE"), 0);

        device.teardown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_provisioning() {
        let registry = Arc::new(ProcessTable::new());
        let bridge = FakeBridge::new(registry.clone());
        let cf = Arc::new(RecordingControlFloor::new());
        let device = Device::spawn("DDD", "Bench", ports(), context(cf.clone()));

        device.connect(bridge.attach("DDD", "Bench"));
        assert!(cf.wait_for_variant("wdaStarted", Duration::from_secs(5)).await);
        device.disconnect();
        assert!(!device.is_connected());
        assert_eq!(device.lifecycle(), Lifecycle::Disconnected);

        device.connect(bridge.attach("DDD", "Bench"));
        assert!(device.is_connected());
        device.teardown().await;

        assert_eq!(cf.count("exists"), 1);
        assert_eq!(bridge.count("info DDD"), 1);
        assert_eq!(bridge.count("tunnel DDD"), 2);
        assert!(registry.is_empty());
    }
}
