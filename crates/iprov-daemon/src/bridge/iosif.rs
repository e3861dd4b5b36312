//! `iosif` backend
//!
//! Device events come from `iosif detectloop` (JSON lines on stderr). WDA is
//! started through `xcodebuild test-without-building`, CFA through `tidevice`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    await_ready, capture, check_agent_output, parse_json, pick, pick_text, AgentHooks, Bridge,
    BridgeConfig, BridgeDevice, FatalReporter, FrameFormat, LogHandler, ReadySignal, Shared,
    VideoServer,
};
use crate::process::{ProcessHandle, ProcessRegistry, ProcessSpec, StopHook};
use crate::syslog::LogRecordDecoder;
use iprov_core::events::{BridgeEvent, OutputLine};
use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, BackendKind, DeviceInfo, TunnelPair};

const INSTALL_DONE_MARKER: &str = "Installing:100%";
const TUNNEL_READY_MARKER: &str = "Ready";
const VIDEO_READY_MARKER: &str = "listening";
const WDA_START_MARKER: &str = "Test Case '-[UITestingUITests testRunner]' started";
const CFA_START_MARKER: &str = "CFAgent start successfully";
/// Processes whose logs are followed
const SYSLOG_PROCS: [&str; 3] = ["SpringBoard(SpringBoard)", "SpringBoard(FrontBoard)", "dasd"];

/// One `detectloop` event line
#[derive(Debug, Deserialize)]
struct DetectEvent {
    #[serde(rename = "type")]
    kind: String,
    udid: String,
    #[serde(default)]
    name: String,
}

/// Parse a `detectloop` stderr line
pub fn parse_detect_line(line: &str) -> Option<BridgeEvent> {
    if !line.starts_with('{') {
        return None;
    }
    let event: DetectEvent = serde_json::from_str(line).ok()?;
    match event.kind.as_str() {
        "connect" => Some(BridgeEvent::Attached {
            udid: event.udid,
            name: event.name,
        }),
        "disconnect" => Some(BridgeEvent::Detached { udid: event.udid }),
        _ => None,
    }
}

/// Parse `iosif list -json`: one object per line, or a JSON array
pub fn parse_list(output: &str) -> Vec<String> {
    let trimmed = output.trim();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).unwrap_or_default()
    } else {
        trimmed
            .lines()
            .filter_map(|line| serde_json::from_str(line.trim().trim_end_matches(',')).ok())
            .collect()
    };
    values
        .iter()
        .filter_map(|v| v.get("udid").and_then(Value::as_str).map(str::to_string))
        .collect()
}

// ─────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────

pub struct IosIfBridge {
    shared: Shared,
    devices: Mutex<HashMap<String, Arc<IosIfDevice>>>,
}

impl IosIfBridge {
    pub fn new(config: BridgeConfig, registry: Arc<dyn ProcessRegistry>, fatal: FatalReporter) -> Self {
        Self {
            shared: Shared::new(config, registry, fatal),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn cli(&self) -> &Path {
        &self.shared.config.iosif_path
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<IosIfDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Bridge for IosIfBridge {
    type Device = IosIfDevice;

    fn kind(&self) -> BackendKind {
        BackendKind::IosIf
    }

    fn start_detection(&self, events: mpsc::UnboundedSender<BridgeEvent>) -> Result<ProcessHandle> {
        ProcessSpec::new("device_trigger", self.cli())
            .args(["detectloop"])
            .backoff(self.shared.config.backoff)
            .on_output(move |line| {
                if let OutputLine::Stderr(text) = &line {
                    if let Some(event) = parse_detect_line(text) {
                        let _ = events.send(event);
                    }
                }
            })
            .on_stop(|info| info!("Device detection stopped: {:?}", info.cause))
            .start(self.shared.registry.clone())
    }

    async fn list(&self) -> Vec<String> {
        let output = capture(self.cli(), &["list".into(), "-json".into()]).await;
        parse_list(&output)
    }

    fn attach(&self, udid: &str, name: &str) -> Arc<IosIfDevice> {
        self.devices()
            .entry(udid.to_string())
            .or_insert_with(|| {
                debug!("Creating iosif device {}", censor_udid(udid));
                Arc::new(IosIfDevice {
                    udid: udid.to_string(),
                    name: name.to_string(),
                    shared: self.shared.clone(),
                })
            })
            .clone()
    }

    fn detach(&self, udid: &str) -> Option<Arc<IosIfDevice>> {
        self.devices().remove(udid)
    }

    fn device(&self, udid: &str) -> Option<Arc<IosIfDevice>> {
        self.devices().get(udid).cloned()
    }
}

// ─────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────

pub struct IosIfDevice {
    udid: String,
    name: String,
    shared: Shared,
}

impl IosIfDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn cli(&self) -> &Path {
        &self.shared.config.iosif_path
    }

    fn spec(&self, name: &str, binary: &Path) -> ProcessSpec {
        ProcessSpec::new(format!("{}_{}", name, self.udid), binary).backoff(self.shared.config.backoff)
    }

    fn launch_wda(&self, port: u16, hooks: AgentHooks) -> Result<ProcessHandle> {
        let config = &self.shared.config;
        let AgentHooks {
            mut on_start,
            on_stop,
        } = hooks;
        let udid = self.udid.clone();
        let fatal = self.shared.fatal.clone();

        info!(
            "Starting WDA for {} (port {}) from {}",
            censor_udid(&udid),
            port,
            config.xctestrun.display()
        );

        self.spec("wda", &config.xcodebuild_path)
            .working_dir(&config.wda_dir)
            .args([
                "test-without-building".to_string(),
                "-xctestrun".to_string(),
                config.xctestrun.display().to_string(),
                "-destination".to_string(),
                format!("id={}", udid),
            ])
            .on_output(move |line| {
                let text = line.text();
                if !line.is_stderr() && text.starts_with(WDA_START_MARKER) {
                    info!("[WDA] started for {}", censor_udid(&udid));
                    on_start();
                } else {
                    check_agent_output(AgentKind::Wda, &udid, text, &fatal);
                }
            })
            .on_stop(on_stop)
            .start(self.shared.registry.clone())
    }

    fn launch_cfa(&self, port: u16, hooks: AgentHooks) -> Result<ProcessHandle> {
        let config = &self.shared.config;
        let AgentHooks {
            mut on_start,
            on_stop,
        } = hooks;
        let udid = self.udid.clone();
        let fatal = self.shared.fatal.clone();

        info!("Starting CFA for {} (port {}) via tidevice", censor_udid(&udid), port);

        self.spec("cfa", &config.tidevice_path)
            .args([
                "-u".to_string(),
                udid.clone(),
                "wdaproxy".to_string(),
                "-B".to_string(),
                config.cfa_bundle_id.clone(),
                "-p".to_string(),
                "0".to_string(),
            ])
            .on_output(move |line| {
                let text = line.text();
                if text.contains(CFA_START_MARKER) {
                    info!("[CFA] started for {}", censor_udid(&udid));
                    on_start();
                } else {
                    check_agent_output(AgentKind::Cfa, &udid, text, &fatal);
                }
            })
            .on_stop(on_stop)
            .start(self.shared.registry.clone())
    }
}

impl BridgeDevice for IosIfDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn tunnel(&self, pairs: &[TunnelPair]) -> Result<Vec<ProcessHandle>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut name = String::from("tunnel");
        for pair in pairs {
            name.push_str(&format!("_{}->{}", pair.from, pair.to));
        }
        let mut args = vec!["tunnel".to_string(), "-id".to_string(), self.udid.clone()];
        args.extend(pairs.iter().map(TunnelPair::to_string));

        let (mut ready, ready_rx) = ReadySignal::new();
        let handle = self
            .spec(&name, self.cli())
            .args(args)
            .on_output(move |line| {
                if !line.is_stderr() && line.text().contains(TUNNEL_READY_MARKER) {
                    ready.fire();
                }
            })
            .start(self.shared.registry.clone())?;

        await_ready(&handle, ready_rx).await?;
        debug!("Tunnels ready for {}: {:?}", censor_udid(&self.udid), pairs);
        Ok(vec![handle])
    }

    async fn info(&self, keys: &[&str]) -> DeviceInfo {
        let mut args = vec!["info".to_string(), "-json".to_string(), "-id".to_string(), self.udid.clone()];
        args.extend(keys.iter().map(|k| k.to_string()));
        let output = capture(self.cli(), &args).await;
        pick_text(&parse_json(&output, "info"), keys)
    }

    async fn gestalt(&self, keys: &[&str]) -> HashMap<String, Value> {
        let mut args = vec!["mg".to_string(), "-json".to_string(), "-id".to_string(), self.udid.clone()];
        args.extend(keys.iter().map(|k| k.to_string()));
        let output = capture(self.cli(), &args).await;
        pick(&parse_json(&output, "mg"), keys)
    }

    async fn install_app(&self, path: &Path) -> bool {
        let args = [
            "install".to_string(),
            "-id".to_string(),
            self.udid.clone(),
            "-path".to_string(),
            path.display().to_string(),
        ];
        capture(self.cli(), &args).await.contains(INSTALL_DONE_MARKER)
    }

    async fn launch_app(&self, bundle_id: &str) -> bool {
        let args = [
            "launch".to_string(),
            "-id".to_string(),
            self.udid.clone(),
            bundle_id.to_string(),
        ];
        let output = capture(self.cli(), &args).await;
        output.contains("Launched") || output.contains("\"pid\"")
    }

    fn launch_automation_agent(&self, kind: AgentKind, port: u16, hooks: AgentHooks) -> Result<ProcessHandle> {
        match kind {
            AgentKind::Wda => self.launch_wda(port, hooks),
            AgentKind::Cfa => self.launch_cfa(port, hooks),
        }
    }

    fn new_syslog_monitor(&self, mut on_item: LogHandler) -> Result<ProcessHandle> {
        let mut args = vec!["log".to_string(), "-id".to_string(), self.udid.clone()];
        for proc in SYSLOG_PROCS {
            args.push("proc".to_string());
            args.push(proc.to_string());
        }

        let mut decoder = LogRecordDecoder::new();
        self.spec("syslog", self.cli())
            .args(args)
            .on_output(move |line| {
                if let OutputLine::Stdout(text) = &line {
                    if let Some(item) = decoder.push_line(text) {
                        on_item(item);
                    }
                }
            })
            .start(self.shared.registry.clone())
    }

    fn new_video_server(&self, port: u16, on_stop: StopHook) -> Result<VideoServer> {
        let udid = self.udid.clone();
        let handle = self
            .spec("backup_video", self.cli())
            .args([
                "iserver".to_string(),
                "-port".to_string(),
                port.to_string(),
                "-id".to_string(),
                self.udid.clone(),
            ])
            .on_output(move |line| {
                if line.text().contains(VIDEO_READY_MARKER) {
                    info!("Backup video for {} listening on {}", censor_udid(&udid), port);
                }
            })
            .on_stop(on_stop)
            .start(self.shared.registry.clone())?;

        Ok(VideoServer::new(
            handle,
            format!("http://127.0.0.1:{}", port),
            FrameFormat::Single,
            self.shared.http.clone(),
        ))
    }
}
