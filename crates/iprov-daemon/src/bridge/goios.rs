//! `go-ios` backend

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures_util::future::try_join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    await_ready, capture, check_agent_output, parse_json, pick, pick_text, AgentHooks, Bridge,
    BridgeConfig, BridgeDevice, FatalReporter, FrameFormat, LogHandler, ReadySignal, Shared,
    VideoServer,
};
use crate::process::{ProcessHandle, ProcessRegistry, ProcessSpec, StopHook};
use crate::syslog::parse_plain_line;
use iprov_core::events::{BridgeEvent, OutputLine};
use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, BackendKind, DeviceInfo, LogItem, TunnelPair};

const INSTALL_DONE_MARKER: &str = "Installing:100%";
const LAUNCHED_MARKER: &str = "Process launched";
const FORWARD_READY_MARKER: &str = "Start";
const WDA_READY_MARKER: &str = "ServerURLHere";
const CFA_READY_MARKER: &str = "NNG Ready";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenMessage {
    message_type: String,
    #[serde(default)]
    properties: ListenProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListenProperties {
    #[serde(default)]
    serial_number: String,
}

/// Parse a `go-ios listen` line
pub fn parse_listen_line(line: &str) -> Option<BridgeEvent> {
    let msg: ListenMessage = serde_json::from_str(line.trim()).ok()?;
    let udid = msg.properties.serial_number;
    if udid.is_empty() {
        return None;
    }
    match msg.message_type.as_str() {
        // `listen` carries no device name
        "Attached" => Some(BridgeEvent::Attached {
            name: udid.clone(),
            udid,
        }),
        "Detached" => Some(BridgeEvent::Detached { udid }),
        _ => None,
    }
}

/// Parse `go-ios list`: `{"deviceList":["udid",...]}`
pub fn parse_list(output: &str) -> Vec<String> {
    parse_json(output, "list")
        .get("deviceList")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse a `go-ios syslog` line, either plain or wrapped in a JSON log entry
pub fn parse_syslog_line(line: &str) -> Option<LogItem> {
    if line.starts_with('{') {
        let entry: Value = serde_json::from_str(line).ok()?;
        return parse_plain_line(entry.get("msg")?.as_str()?);
    }
    parse_plain_line(line)
}

/// `com.facebook.WebDriverAgentRunner.xctrunner` → `WebDriverAgentRunner.xctest`
pub fn xctest_config(bundle_id: &str) -> String {
    let base = bundle_id.strip_suffix(".xctrunner").unwrap_or(bundle_id);
    let name = base.rsplit('.').next().unwrap_or(base);
    format!("{}.xctest", name)
}

// ─────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────

pub struct GoIosBridge {
    shared: Shared,
    devices: Mutex<HashMap<String, Arc<GoIosDevice>>>,
}

impl GoIosBridge {
    pub fn new(config: BridgeConfig, registry: Arc<dyn ProcessRegistry>, fatal: FatalReporter) -> Self {
        Self {
            shared: Shared::new(config, registry, fatal),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn cli(&self) -> &Path {
        &self.shared.config.goios_path
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<GoIosDevice>>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Bridge for GoIosBridge {
    type Device = GoIosDevice;

    fn kind(&self) -> BackendKind {
        BackendKind::GoIos
    }

    fn start_detection(&self, events: mpsc::UnboundedSender<BridgeEvent>) -> Result<ProcessHandle> {
        ProcessSpec::new("device_trigger", self.cli())
            .args(["listen"])
            .backoff(self.shared.config.backoff)
            .on_output(move |line| {
                if let Some(event) = parse_listen_line(line.text()) {
                    let _ = events.send(event);
                }
            })
            .on_stop(|info| info!("Device detection stopped: {:?}", info.cause))
            .start(self.shared.registry.clone())
    }

    async fn list(&self) -> Vec<String> {
        parse_list(&capture(self.cli(), &["list".into()]).await)
    }

    fn attach(&self, udid: &str, name: &str) -> Arc<GoIosDevice> {
        self.devices()
            .entry(udid.to_string())
            .or_insert_with(|| {
                debug!("Creating go-ios device {}", censor_udid(udid));
                Arc::new(GoIosDevice {
                    udid: udid.to_string(),
                    name: name.to_string(),
                    shared: self.shared.clone(),
                })
            })
            .clone()
    }

    fn detach(&self, udid: &str) -> Option<Arc<GoIosDevice>> {
        self.devices().remove(udid)
    }

    fn device(&self, udid: &str) -> Option<Arc<GoIosDevice>> {
        self.devices().get(udid).cloned()
    }
}

// ─────────────────────────────────────────────────────────
// Device
// ─────────────────────────────────────────────────────────

pub struct GoIosDevice {
    udid: String,
    name: String,
    shared: Shared,
}

impl GoIosDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn cli(&self) -> &Path {
        &self.shared.config.goios_path
    }

    fn spec(&self, name: &str) -> ProcessSpec {
        ProcessSpec::new(format!("{}_{}", name, self.udid), self.cli()).backoff(self.shared.config.backoff)
    }

    fn forward(&self, pair: TunnelPair) -> Result<(ProcessHandle, tokio::sync::oneshot::Receiver<()>)> {
        let (mut ready, ready_rx) = ReadySignal::new();
        let handle = self
            .spec(&format!("tunnel_{}->{}", pair.from, pair.to))
            .args([
                "forward".to_string(),
                "--udid".to_string(),
                self.udid.clone(),
                pair.from.to_string(),
                pair.to.to_string(),
            ])
            .on_output(move |line| {
                if line.is_stderr() && line.text().contains(FORWARD_READY_MARKER) {
                    ready.fire();
                }
            })
            .start(self.shared.registry.clone())?;
        Ok((handle, ready_rx))
    }
}

impl BridgeDevice for GoIosDevice {
    fn udid(&self) -> &str {
        &self.udid
    }

    async fn tunnel(&self, pairs: &[TunnelPair]) -> Result<Vec<ProcessHandle>> {
        let mut started = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match self.forward(*pair) {
                Ok(forward) => started.push(forward),
                Err(e) => {
                    started.iter().for_each(|(h, _)| h.stop());
                    return Err(e);
                }
            }
        }

        let (handles, ready): (Vec<ProcessHandle>, Vec<_>) = started.into_iter().unzip();
        let waits = handles.iter().zip(ready).map(|(h, rx)| await_ready(h, rx));
        if let Err(e) = try_join_all(waits).await {
            handles.iter().for_each(ProcessHandle::stop);
            return Err(e);
        }

        debug!("Forwards ready for {}: {:?}", censor_udid(&self.udid), pairs);
        Ok(handles)
    }

    async fn info(&self, keys: &[&str]) -> DeviceInfo {
        let args = ["info".to_string(), "--udid".to_string(), self.udid.clone()];
        pick_text(&parse_json(&capture(self.cli(), &args).await, "info"), keys)
    }

    async fn gestalt(&self, keys: &[&str]) -> HashMap<String, Value> {
        let mut args = vec!["mobilegestalt".to_string(), "--udid".to_string(), self.udid.clone()];
        args.extend(keys.iter().map(|k| k.to_string()));
        let root = parse_json(&capture(self.cli(), &args).await, "mobilegestalt");
        pick(&root["Diagnostics"]["MobileGestalt"], keys)
    }

    async fn install_app(&self, path: &Path) -> bool {
        let args = [
            "install".to_string(),
            "--path".to_string(),
            path.display().to_string(),
            "--udid".to_string(),
            self.udid.clone(),
        ];
        capture(self.cli(), &args).await.contains(INSTALL_DONE_MARKER)
    }

    async fn launch_app(&self, bundle_id: &str) -> bool {
        let args = [
            "launch".to_string(),
            bundle_id.to_string(),
            "--udid".to_string(),
            self.udid.clone(),
        ];
        capture(self.cli(), &args).await.contains(LAUNCHED_MARKER)
    }

    fn launch_automation_agent(&self, kind: AgentKind, port: u16, hooks: AgentHooks) -> Result<ProcessHandle> {
        let config = &self.shared.config;
        let (bundle_id, ready_marker) = match kind {
            AgentKind::Wda => (config.wda_bundle_id.clone(), WDA_READY_MARKER),
            AgentKind::Cfa => (config.cfa_bundle_id.clone(), CFA_READY_MARKER),
        };
        let AgentHooks {
            mut on_start,
            on_stop,
        } = hooks;
        let udid = self.udid.clone();
        let fatal = self.shared.fatal.clone();

        info!("Starting {} for {} (port {}) via runwda", kind, censor_udid(&udid), port);

        self.spec(kind.status_prefix())
            .args([
                "runwda".to_string(),
                "--bundleid".to_string(),
                bundle_id.clone(),
                "--testrunnerbundleid".to_string(),
                bundle_id.clone(),
                "--xctestconfig".to_string(),
                xctest_config(&bundle_id),
                "--udid".to_string(),
                udid.clone(),
            ])
            .on_output(move |line| {
                let text = line.text();
                if text.contains(ready_marker) {
                    info!("[{}] started for {}", kind, censor_udid(&udid));
                    on_start();
                } else {
                    check_agent_output(kind, &udid, text, &fatal);
                }
            })
            .on_stop(on_stop)
            .start(self.shared.registry.clone())
    }

    fn new_syslog_monitor(&self, mut on_item: LogHandler) -> Result<ProcessHandle> {
        self.spec("syslog")
            .args(["syslog".to_string(), "--udid".to_string(), self.udid.clone()])
            .on_output(move |line| {
                if let Some(item) = parse_syslog_line(line.text()) {
                    on_item(item);
                }
            })
            .start(self.shared.registry.clone())
    }

    fn new_video_server(&self, port: u16, on_stop: StopHook) -> Result<VideoServer> {
        let handle = self
            .spec("backup_video")
            .args([
                "screenshot".to_string(),
                "--stream".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--udid".to_string(),
                self.udid.clone(),
            ])
            .on_output(|line| {
                if let OutputLine::Stderr(text) = &line {
                    trace!("[screenshot] {}", text);
                }
            })
            .on_stop(on_stop)
            .start(self.shared.registry.clone())?;

        Ok(VideoServer::new(
            handle,
            format!("http://127.0.0.1:{}/", port),
            FrameFormat::Mjpeg,
            self.shared.http.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ProcessTable;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_listen_lines() {
        let attached =
            r#"{"MessageType":"Attached","DeviceID":3,"Properties":{"SerialNumber":"AAA","ConnectionType":"USB"}}"#;
        assert_eq!(
            parse_listen_line(attached),
            Some(BridgeEvent::Attached {
                udid: "AAA".into(),
                name: "AAA".into()
            })
        );
        let detached = r#"{"MessageType":"Detached","DeviceID":3,"Properties":{"SerialNumber":"AAA"}}"#;
        assert_eq!(
            parse_listen_line(detached),
            Some(BridgeEvent::Detached { udid: "AAA".into() })
        );
        assert_eq!(parse_listen_line(r#"{"MessageType":"Paired"}"#), None);
        assert_eq!(parse_listen_line("level=info msg=listening"), None);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list(r#"{"deviceList":["A","B"]}"#), vec!["A", "B"]);
        assert!(parse_list("").is_empty());
        assert!(parse_list(r#"{"other":1}"#).is_empty());
    }

    #[test]
    fn test_xctest_config_from_bundle_id() {
        assert_eq!(
            xctest_config("com.facebook.WebDriverAgentRunner.xctrunner"),
            "WebDriverAgentRunner.xctest"
        );
        assert_eq!(xctest_config("com.dryark.CFAgent.xctrunner"), "CFAgent.xctest");
    }

    #[test]
    fn test_parse_syslog_json_wrapped() {
        let line = r#"{"level":"info","msg":"Oct 18 10:01:02 iPhone dasd[90] <Notice>: tick"}"#;
        let item = parse_syslog_line(line).unwrap();
        assert_eq!(item.app, "dasd");
        assert_eq!(item.msg, "tick");
    }

    fn fake_cli(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("go-ios");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{}", body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn bridge_with(cli: std::path::PathBuf) -> (GoIosBridge, Arc<ProcessTable>) {
        let registry = Arc::new(ProcessTable::new());
        let (fatal, _rx) = FatalReporter::channel();
        let config = BridgeConfig {
            goios_path: cli,
            ..BridgeConfig::default()
        };
        (GoIosBridge::new(config, registry.clone(), fatal), registry)
    }

    #[tokio::test]
    async fn test_gestalt_reads_nested_section() {
        let dir = tempfile::tempdir().unwrap();
        let body = r#"echo '{"Diagnostics":{"MobileGestalt":{"main-screen-width":750,"Status":"Success"}}}'"#;
        let (bridge, _) = bridge_with(fake_cli(&dir, body));
        let dev = bridge.attach("AAA", "AAA");

        let values = dev.gestalt(&["main-screen-width", "main-screen-height"]).await;
        assert_eq!(values.len(), 1);
        assert_eq!(values["main-screen-width"], 750);
    }

    #[tokio::test]
    async fn test_forwards_awaited_together() {
        let dir = tempfile::tempdir().unwrap();
        let (bridge, registry) = bridge_with(fake_cli(&dir, "sleep 0.1; echo 'Start listening' 1>&2; exec sleep 30"));
        let dev = bridge.attach("AAA", "AAA");

        let handles = dev
            .tunnel(&[TunnelPair::new(8100, 8100), TunnelPair::new(9240, 9240)])
            .await
            .unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(registry.len(), 2);

        registry.stop_all().await;
    }

    /// Start `kind` against a CLI that prints `line`, expecting a fatal report
    async fn assert_agent_fatal(kind: AgentKind, line: &str) {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, &format!("echo '{}' 1>&2; exec sleep 30", line));
        let registry = Arc::new(ProcessTable::new());
        let (fatal, mut fatal_rx) = FatalReporter::channel();
        let config = BridgeConfig {
            goios_path: cli,
            ..BridgeConfig::default()
        };
        let bridge = GoIosBridge::new(config, registry.clone(), fatal);
        let dev = bridge.attach("AAA", "AAA");

        dev.launch_automation_agent(kind, 8100, AgentHooks::new(|| {}, |_| {}))
            .unwrap();
        let err = tokio::time::timeout(std::time::Duration::from_secs(2), fatal_rx.recv())
            .await
            .expect("agent failure was not reported")
            .unwrap();
        assert!(matches!(err, Error::AgentFatal { .. }));

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_wda_developer_disk_not_mounted_is_fatal() {
        assert_agent_fatal(AgentKind::Wda, "You have to mount the Developer disk image on your device").await;
    }

    #[tokio::test]
    async fn test_wda_unknown_bundle_is_fatal() {
        assert_agent_fatal(AgentKind::Wda, "runwda failed: No app matches com.facebook.WebDriverAgentRunner").await;
    }

    #[tokio::test]
    async fn test_cfa_unsupported_configuration_is_fatal() {
        assert_agent_fatal(AgentKind::Cfa, "the configuration is unsupported").await;
    }

    #[tokio::test]
    async fn test_cfa_developer_disk_not_mounted_is_fatal() {
        assert_agent_fatal(AgentKind::Cfa, "You have to mount the Developer disk image on your device").await;
    }
}
