//! Test helpers for code built on the daemon crate
//!
//! Enabled by the `test-helpers` feature. Provides a scripted [`FakeBridge`]
//! whose supervised processes are harmless `/bin/sh` sleepers, and a
//! [`FakeVideoApp`] that plays the device side of the video protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};

use crate::bridge::{AgentHooks, Bridge, BridgeDevice, FrameFormat, LogHandler, VideoServer};
use crate::process::{ProcessHandle, ProcessRegistry, ProcessSpec, StopHook};
use crate::stream::sp::{PushSocket, RepSocket};
use iprov_core::events::BridgeEvent;
use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, BackendKind, DeviceInfo, LogItem, TunnelPair};

/// Shell used for every fake process
const SH: &str = "/bin/sh";

/// Operations performed on fake devices, in call order
pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(calls: &CallLog, call: String) {
    calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
}

fn sleeper(name: String) -> ProcessSpec {
    ProcessSpec::new(name, SH).args(["-c", "exec sleep 3600"])
}

// ─────────────────────────────────────────────────────────
// FakeBridge
// ─────────────────────────────────────────────────────────

/// Bridge answering from canned data
pub struct FakeBridge {
    registry: Arc<dyn ProcessRegistry>,
    devices: Mutex<HashMap<String, Arc<FakeDevice>>>,
    info: DeviceInfo,
    gestalt: HashMap<String, Value>,
    calls: CallLog,
    stuck_tunnels: bool,
}

impl FakeBridge {
    pub fn new(registry: Arc<dyn ProcessRegistry>) -> Self {
        let info = DeviceInfo::from([
            ("ProductVersion".to_string(), "16.4.1".to_string()),
            ("DeviceName".to_string(), "Bench".to_string()),
            ("ProductType".to_string(), "iPhone12,8".to_string()),
        ]);
        let gestalt = HashMap::from([
            ("main-screen-width".to_string(), Value::from(750)),
            ("main-screen-height".to_string(), Value::from(1334)),
        ]);
        Self {
            registry,
            devices: Mutex::new(HashMap::new()),
            info,
            gestalt,
            calls: CallLog::default(),
            stuck_tunnels: false,
        }
    }

    /// Tunnels start but never report ready; they fail once their process is stopped
    pub fn with_stuck_tunnels(mut self) -> Self {
        self.stuck_tunnels = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of recorded calls starting with `prefix`
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<FakeDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Bridge for FakeBridge {
    type Device = FakeDevice;

    fn kind(&self) -> BackendKind {
        BackendKind::IosIf
    }

    fn start_detection(&self, _events: mpsc::UnboundedSender<BridgeEvent>) -> Result<ProcessHandle> {
        sleeper("device_trigger".to_string()).start(self.registry.clone())
    }

    async fn list(&self) -> Vec<String> {
        self.devices().keys().cloned().collect()
    }

    fn attach(&self, udid: &str, _name: &str) -> Arc<FakeDevice> {
        self.devices()
            .entry(udid.to_string())
            .or_insert_with(|| {
                Arc::new(FakeDevice {
                    udid: udid.to_string(),
                    registry: self.registry.clone(),
                    info: self.info.clone(),
                    gestalt: self.gestalt.clone(),
                    calls: self.calls.clone(),
                    stuck_tunnels: self.stuck_tunnels,
                })
            })
            .clone()
    }

    fn detach(&self, udid: &str) -> Option<Arc<FakeDevice>> {
        self.devices().remove(udid)
    }

    fn device(&self, udid: &str) -> Option<Arc<FakeDevice>> {
        self.devices().get(udid).cloned()
    }
}

pub struct FakeDevice {
    udid: String,
    registry: Arc<dyn ProcessRegistry>,
    info: DeviceInfo,
    gestalt: HashMap<String, Value>,
    calls: CallLog,
    stuck_tunnels: bool,
}

impl FakeDevice {
    fn name(&self, what: &str) -> String {
        format!("{}_{}", what, self.udid)
    }
}

impl BridgeDevice for FakeDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn tunnel(&self, pairs: &[TunnelPair]) -> Result<Vec<ProcessHandle>> {
        record(&self.calls, format!("tunnel {}", self.udid));
        let handle = sleeper(self.name("tunnel")).start(self.registry.clone())?;
        handle.wait_running().await;
        if self.stuck_tunnels {
            handle.wait_terminated().await;
            return Err(Error::tunnel(format!("tunnel for {} stopped before ready", self.udid)));
        }
        debug!("Fake tunnels for {}: {:?}", self.udid, pairs);
        Ok(vec![handle])
    }

    async fn info(&self, keys: &[&str]) -> DeviceInfo {
        record(&self.calls, format!("info {}", self.udid));
        keys.iter()
            .filter_map(|k| self.info.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    async fn gestalt(&self, keys: &[&str]) -> HashMap<String, Value> {
        record(&self.calls, format!("gestalt {}", self.udid));
        keys.iter()
            .filter_map(|k| self.gestalt.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect()
    }

    async fn install_app(&self, path: &Path) -> bool {
        record(&self.calls, format!("install {} {}", self.udid, path.display()));
        true
    }

    async fn launch_app(&self, bundle_id: &str) -> bool {
        record(&self.calls, format!("launch {} {}", self.udid, bundle_id));
        true
    }

    fn launch_automation_agent(&self, kind: AgentKind, port: u16, hooks: AgentHooks) -> Result<ProcessHandle> {
        record(&self.calls, format!("agent {} {} {}", self.udid, kind, port));
        let AgentHooks {
            mut on_start,
            on_stop,
        } = hooks;
        ProcessSpec::new(self.name(kind.status_prefix()), SH)
            .args(["-c", "echo ready; exec sleep 3600"])
            .on_output(move |line| {
                if line.text() == "ready" {
                    on_start();
                }
            })
            .on_stop(on_stop)
            .start(self.registry.clone())
    }

    fn new_syslog_monitor(&self, mut on_item: LogHandler) -> Result<ProcessHandle> {
        record(&self.calls, format!("syslog {}", self.udid));
        ProcessSpec::new(self.name("syslog"), SH)
            .args(["-c", "echo booted; exec sleep 3600"])
            .on_output(move |line| {
                on_item(LogItem {
                    app: "SpringBoard".to_string(),
                    msg: line.text().to_string(),
                })
            })
            .start(self.registry.clone())
    }

    fn new_video_server(&self, port: u16, on_stop: StopHook) -> Result<VideoServer> {
        record(&self.calls, format!("video {} {}", self.udid, port));
        let handle = sleeper(self.name("backup_video"))
            .on_stop(on_stop)
            .start(self.registry.clone())?;
        Ok(VideoServer::new(
            handle,
            format!("http://127.0.0.1:{}", port),
            FrameFormat::Single,
            reqwest::Client::new(),
        ))
    }
}

// ─────────────────────────────────────────────────────────
// FakeVideoApp
// ─────────────────────────────────────────────────────────

/// Device side of the video protocol: a REP control socket answering `ok`
/// and a PUSH data socket sending whatever the test queues. Both listeners
/// accept again after a connection is dropped.
pub struct FakeVideoApp {
    pub video_addr: SocketAddr,
    pub control_addr: SocketAddr,
    actions: CallLog,
    data: mpsc::UnboundedSender<DataCommand>,
    kick_control: Arc<Notify>,
}

enum DataCommand {
    Send(Bytes),
    Disconnect,
}

impl FakeVideoApp {
    pub async fn start() -> Self {
        let video = TcpListener::bind("127.0.0.1:0").await.expect("bind video listener");
        let control = TcpListener::bind("127.0.0.1:0").await.expect("bind control listener");
        let video_addr = video.local_addr().expect("video addr");
        let control_addr = control.local_addr().expect("control addr");

        let actions = CallLog::default();
        let (data, mut data_rx) = mpsc::unbounded_channel::<DataCommand>();
        let kick_control = Arc::new(Notify::new());

        let seen = actions.clone();
        let kick = kick_control.clone();
        tokio::spawn(async move {
            while let Ok(mut rep) = RepSocket::accept(&control).await {
                loop {
                    tokio::select! {
                        _ = kick.notified() => break,
                        received = rep.recv() => {
                            let Ok((id, body)) = received else {
                                break;
                            };
                            let action = serde_json::from_slice::<Value>(&body)
                                .ok()
                                .and_then(|v| v.get("action").and_then(Value::as_str).map(str::to_string))
                                .unwrap_or_default();
                            if action != "ping" {
                                record(&seen, action);
                            }
                            if rep.reply(id, b"ok").await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Ok(mut push) = PushSocket::accept(&video).await {
                loop {
                    match data_rx.recv().await {
                        Some(DataCommand::Send(frame)) => {
                            if push.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Some(DataCommand::Disconnect) => break,
                        None => return,
                    }
                }
            }
        });

        Self {
            video_addr,
            control_addr,
            actions,
            data,
            kick_control,
        }
    }

    /// Queue a data message
    pub fn push(&self, msg: impl Into<Bytes>) {
        let _ = self.data.send(DataCommand::Send(msg.into()));
    }

    /// Close the current data connection and wait for the next one
    pub fn drop_data(&self) {
        let _ = self.data.send(DataCommand::Disconnect);
    }

    /// Close the current control connection and wait for the next one
    pub fn drop_control(&self) {
        self.kick_control.notify_one();
    }

    /// Control actions received so far, pings excluded
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// `header` immediately followed by `payload_len` bytes of payload
pub fn frame_message(header: &str, payload_len: usize) -> Bytes {
    let mut msg = header.as_bytes().to_vec();
    msg.extend((0..payload_len).map(|i| (i % 251) as u8));
    Bytes::from(msg)
}
