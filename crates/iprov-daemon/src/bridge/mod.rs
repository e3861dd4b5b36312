//! Backend capability sets
//!
//! A [`Bridge`] discovers devices through one backend command-line tool and
//! hands out a [`BridgeDevice`] per attached unit. Orchestration code is
//! generic over the bridge and never looks at which backend is in use.
//!
//! ## Backends
//!
//! - [`iosif::IosIfBridge`]: the `iosif` tool, with WDA via `xcodebuild` and
//!   CFA via `tidevice`
//! - [`goios::GoIosBridge`]: the `go-ios` tool, agents via `runwda`

pub mod goios;
pub mod iosif;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::backoff::BackoffPolicy;
use crate::process::{ProcessHandle, ProcessRegistry, StopHook};
use iprov_core::events::{BridgeEvent, StopInfo};
use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, BackendKind, DeviceInfo, LogItem, TunnelPair};

/// Upper bound on one-shot backend invocations (`info`, `install`, ...)
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
/// Upper bound on waiting for a tunnel to report readiness
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on fetching one backup frame
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Larger MJPEG buffers without a complete image are abandoned
const MAX_FRAME_BUFFER: usize = 16 * 1024 * 1024;

// ─────────────────────────────────────────────────────────
// Configuration and shared plumbing
// ─────────────────────────────────────────────────────────

/// Paths and identifiers the backends need
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub iosif_path: PathBuf,
    pub goios_path: PathBuf,
    pub tidevice_path: PathBuf,
    pub xcodebuild_path: PathBuf,
    pub wda_bundle_id: String,
    pub cfa_bundle_id: String,
    /// `.xctestrun` file used by `xcodebuild test-without-building`
    pub xctestrun: PathBuf,
    /// Working directory for `xcodebuild`
    pub wda_dir: PathBuf,
    pub backoff: BackoffPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            iosif_path: PathBuf::from("bin/iosif"),
            goios_path: PathBuf::from("bin/go-ios"),
            tidevice_path: PathBuf::from("tidevice"),
            xcodebuild_path: PathBuf::from("xcodebuild"),
            wda_bundle_id: "com.facebook.WebDriverAgentRunner.xctrunner".to_string(),
            cfa_bundle_id: "com.dryark.CFAgent.xctrunner".to_string(),
            xctestrun: PathBuf::from("bin/wda/WebDriverAgentRunner.xctestrun"),
            wda_dir: PathBuf::from("bin/wda"),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Provider-wide channel for errors that must stop the provider
#[derive(Debug, Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<Error>,
}

impl FatalReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, err: Error) {
        error!("Fatal: {}", err);
        if self.tx.send(err).is_err() {
            warn!("Fatal error reported after shutdown began");
        }
    }
}

/// State shared by a bridge and all of its devices
#[derive(Clone)]
pub(crate) struct Shared {
    pub config: Arc<BridgeConfig>,
    pub registry: Arc<dyn ProcessRegistry>,
    pub fatal: FatalReporter,
    pub http: reqwest::Client,
}

impl Shared {
    pub fn new(config: BridgeConfig, registry: Arc<dyn ProcessRegistry>, fatal: FatalReporter) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            fatal,
            http: reqwest::Client::new(),
        }
    }
}

/// Callbacks for automation agent lifecycle
pub struct AgentHooks {
    /// Called each time the agent reports it is serving
    pub on_start: Box<dyn FnMut() + Send>,
    pub on_stop: StopHook,
}

impl AgentHooks {
    pub fn new(
        on_start: impl FnMut() + Send + 'static,
        on_stop: impl FnMut(&StopInfo) + Send + 'static,
    ) -> Self {
        Self {
            on_start: Box::new(on_start),
            on_stop: Box::new(on_stop),
        }
    }
}

/// Agent output that means the agent can never come up on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFailure {
    DiskImageNotMounted,
    NoAppMatches,
    UnsupportedConfiguration,
}

const AGENT_FAILURE_MARKERS: [(&str, AgentFailure); 3] = [
    ("have to mount the Developer disk image", AgentFailure::DiskImageNotMounted),
    ("No app matches", AgentFailure::NoAppMatches),
    ("configuration is unsupported", AgentFailure::UnsupportedConfiguration),
];

impl AgentFailure {
    pub fn detect(line: &str) -> Option<Self> {
        AGENT_FAILURE_MARKERS
            .iter()
            .find(|(marker, _)| line.contains(marker))
            .map(|(_, failure)| *failure)
    }

    fn describe(self) -> &'static str {
        match self {
            AgentFailure::DiskImageNotMounted => "developer disk image not mounted",
            AgentFailure::NoAppMatches => "agent bundle id not installed",
            AgentFailure::UnsupportedConfiguration => "unsupported test configuration",
        }
    }
}

/// Report `line` as provider-fatal when it carries an agent failure marker
pub(crate) fn check_agent_output(kind: AgentKind, udid: &str, line: &str, fatal: &FatalReporter) -> bool {
    let Some(failure) = AgentFailure::detect(line) else {
        return false;
    };
    fatal.report(Error::agent_fatal(format!(
        "{} cannot start on {}: {} ({})",
        kind,
        censor_udid(udid),
        failure.describe(),
        line.trim()
    )));
    true
}

/// Receives decoded syslog records
pub type LogHandler = Box<dyn FnMut(LogItem) + Send>;

// ─────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────

/// Device discovery for one backend
pub trait Bridge: Send + Sync + 'static {
    type Device: BridgeDevice + Sync + 'static;

    /// Backend identity, for logging
    fn kind(&self) -> BackendKind;

    /// Launch the backend's device-event listener under supervision
    fn start_detection(&self, events: mpsc::UnboundedSender<BridgeEvent>) -> Result<ProcessHandle>;

    /// Connected device identifiers; empty when the output is unusable
    fn list(&self) -> impl Future<Output = Vec<String>> + Send;

    /// Create (or return the existing) handle for `udid`
    fn attach(&self, udid: &str, name: &str) -> Arc<Self::Device>;

    fn detach(&self, udid: &str) -> Option<Arc<Self::Device>>;

    fn device(&self, udid: &str) -> Option<Arc<Self::Device>>;
}

/// Per-device operations offered by every backend
#[trait_variant::make(BridgeDevice: Send)]
pub trait LocalBridgeDevice {
    fn udid(&self) -> &str;

    /// Forward local ports to device ports; resolves once every forward is ready
    async fn tunnel(&self, pairs: &[TunnelPair]) -> Result<Vec<ProcessHandle>>;

    /// Device attributes; keys the backend did not answer are omitted
    async fn info(&self, keys: &[&str]) -> DeviceInfo;

    /// MobileGestalt values; keys the backend did not answer are omitted
    async fn gestalt(&self, keys: &[&str]) -> HashMap<String, Value>;

    async fn install_app(&self, path: &Path) -> bool;

    async fn launch_app(&self, bundle_id: &str) -> bool;

    fn launch_automation_agent(
        &self,
        kind: AgentKind,
        port: u16,
        hooks: AgentHooks,
    ) -> Result<ProcessHandle>;

    fn new_syslog_monitor(&self, on_item: LogHandler) -> Result<ProcessHandle>;

    fn new_video_server(&self, port: u16, on_stop: StopHook) -> Result<VideoServer>;
}

// ─────────────────────────────────────────────────────────
// Backup video
// ─────────────────────────────────────────────────────────

/// How a video server answers a frame request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Each GET returns one complete image
    Single,
    /// The response is an endless MJPEG stream
    Mjpeg,
}

/// A supervised backend process serving screen frames over HTTP
#[derive(Debug)]
pub struct VideoServer {
    process: ProcessHandle,
    url: String,
    format: FrameFormat,
    http: reqwest::Client,
}

impl VideoServer {
    pub fn new(process: ProcessHandle, url: impl Into<String>, format: FrameFormat, http: reqwest::Client) -> Self {
        Self {
            process,
            url: url.into(),
            format,
            http,
        }
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch one frame; empty on any failure
    pub async fn get_frame(&self) -> Bytes {
        match tokio::time::timeout(FRAME_TIMEOUT, self.fetch()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                debug!("Backup frame from {} failed: {}", self.url, e);
                Bytes::new()
            }
            Err(_) => {
                debug!("Backup frame from {} timed out", self.url);
                Bytes::new()
            }
        }
    }

    async fn fetch(&self) -> Result<Bytes> {
        let mut resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::http(format!("status {}", resp.status())));
        }

        match self.format {
            FrameFormat::Single => resp.bytes().await.map_err(|e| Error::http(e.to_string())),
            FrameFormat::Mjpeg => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = resp.chunk().await.map_err(|e| Error::http(e.to_string()))? {
                    buf.extend_from_slice(&chunk);
                    if let Some(jpeg) = extract_jpeg(&buf) {
                        return Ok(jpeg);
                    }
                    if buf.len() > MAX_FRAME_BUFFER {
                        break;
                    }
                }
                Err(Error::stream("no complete JPEG in MJPEG stream"))
            }
        }
    }
}

/// First complete JPEG (SOI `FFD8` through EOI `FFD9`) in `data`
pub fn extract_jpeg(data: &[u8]) -> Option<Bytes> {
    let start = data.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = data[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?
        + start
        + 2;
    Some(Bytes::copy_from_slice(&data[start..end + 2]))
}

// ─────────────────────────────────────────────────────────
// Helpers shared by the backends
// ─────────────────────────────────────────────────────────

/// Run a short-lived backend command and collect its stdout. Empty on
/// failure; backend failures surface as "unknown" results.
pub(crate) async fn capture(binary: &Path, args: &[String]) -> String {
    let mut cmd = Command::new(binary);
    cmd.args(args).kill_on_drop(true);

    trace!("Running {} {}", binary.display(), args.join(" "));
    match tokio::time::timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => String::from_utf8_lossy(&output.stdout).into_owned(),
        Ok(Err(e)) => {
            warn!("Failed to run {}: {}", binary.display(), e);
            String::new()
        }
        Err(_) => {
            warn!("{} {} timed out", binary.display(), args.first().map(String::as_str).unwrap_or(""));
            String::new()
        }
    }
}

/// Render a JSON value the way device info is cached: strings bare,
/// everything else as compact JSON
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pick `keys` out of a JSON object
pub(crate) fn pick(root: &Value, keys: &[&str]) -> HashMap<String, Value> {
    keys.iter()
        .filter_map(|key| root.get(*key).map(|v| ((*key).to_string(), v.clone())))
        .collect()
}

pub(crate) fn pick_text(root: &Value, keys: &[&str]) -> DeviceInfo {
    pick(root, keys)
        .into_iter()
        .map(|(k, v)| (k, value_text(&v)))
        .collect()
}

/// Parse backend JSON output; `Value::Null` when unparseable
pub(crate) fn parse_json(output: &str, what: &str) -> Value {
    match serde_json::from_str(output.trim()) {
        Ok(value) => value,
        Err(e) => {
            if !output.trim().is_empty() {
                warn!("Could not parse {} output: {}", what, e);
            }
            Value::Null
        }
    }
}

/// Readiness signal fired by an output handler the first time a marker shows up
pub(crate) struct ReadySignal {
    tx: Option<oneshot::Sender<()>>,
}

impl ReadySignal {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn fire(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Wait until `ready` fires; fails if the process ends first
pub(crate) async fn await_ready(handle: &ProcessHandle, ready: oneshot::Receiver<()>) -> Result<()> {
    let wait = async {
        tokio::select! {
            fired = ready => fired.map_err(|_| Error::tunnel(format!("'{}' ended before it was ready", handle.name()))),
            _ = handle.wait_terminated() => Err(Error::tunnel(format!("'{}' ended before it was ready", handle.name()))),
        }
    };
    match tokio::time::timeout(TUNNEL_READY_TIMEOUT, wait).await {
        Ok(result) => result,
        Err(_) => {
            handle.stop();
            Err(Error::tunnel(format!("'{}' never became ready", handle.name())))
        }
    }
}
