//! Configuration types for the provider
//!
//! Defines:
//! - `Settings` - Top-level `config.toml` contents
//! - One struct per section, each defaulting field by field
//! - `DeviceOverride` - Per-device `[[device]]` entries

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use iprov_core::types::{AgentKind, BackendKind};
use iprov_daemon::BackoffPolicy;

/// Provider settings (`config.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub ports: PortSettings,

    #[serde(default)]
    pub control_floor: ControlFloorSettings,

    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub stream: StreamSettings,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// When non-empty, only these device identifiers are provisioned
    #[serde(default)]
    pub id_list: Vec<String>,

    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceOverride>,
}

/// Backend selection and helper binary locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_iosif_path")]
    pub iosif_path: PathBuf,

    #[serde(default = "default_goios_path")]
    pub goios_path: PathBuf,

    #[serde(default = "default_tidevice_path")]
    pub tidevice_path: PathBuf,

    #[serde(default = "default_xcodebuild_path")]
    pub xcodebuild_path: PathBuf,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            iosif_path: default_iosif_path(),
            goios_path: default_goios_path(),
            tidevice_path: default_tidevice_path(),
            xcodebuild_path: default_xcodebuild_path(),
        }
    }
}

impl BridgeSettings {
    /// Binary of the selected backend
    pub fn backend_path(&self) -> &PathBuf {
        match self.backend {
            BackendKind::IosIf => &self.iosif_path,
            BackendKind::GoIos => &self.goios_path,
        }
    }
}

fn default_iosif_path() -> PathBuf {
    PathBuf::from("bin/iosif")
}

fn default_goios_path() -> PathBuf {
    PathBuf::from("bin/go-ios")
}

fn default_tidevice_path() -> PathBuf {
    PathBuf::from("tidevice")
}

fn default_xcodebuild_path() -> PathBuf {
    PathBuf::from("xcodebuild")
}

/// Host port pool
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortSettings {
    /// Inclusive range, `"min-max"`
    #[serde(default = "default_port_range")]
    pub range: String,

    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            range: default_port_range(),
            max_devices: default_max_devices(),
        }
    }
}

fn default_port_range() -> String {
    "8100-8200".to_string()
}

fn default_max_devices() -> usize {
    10
}

/// Remote controller ("control floor") connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControlFloorSettings {
    /// `host[:port]`
    #[serde(default = "default_cf_host")]
    pub host: String,

    #[serde(default)]
    pub https: bool,

    #[serde(default = "default_cf_username")]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Accept a self-signed certificate
    #[serde(default)]
    pub self_signed: bool,
}

impl Default for ControlFloorSettings {
    fn default() -> Self {
        Self {
            host: default_cf_host(),
            https: false,
            username: default_cf_username(),
            password: String::new(),
            self_signed: false,
        }
    }
}

impl ControlFloorSettings {
    pub fn base_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim_end_matches('/'))
    }
}

fn default_cf_host() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_cf_username() -> String {
    "first".to_string()
}

/// Automation agent selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentSettings {
    #[serde(default)]
    pub kind: AgentKind,

    #[serde(default = "default_wda_bundle_id")]
    pub wda_bundle_id: String,

    #[serde(default = "default_cfa_bundle_id")]
    pub cfa_bundle_id: String,

    #[serde(default = "default_xctestrun")]
    pub xctestrun: PathBuf,

    #[serde(default = "default_wda_dir")]
    pub wda_dir: PathBuf,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            kind: AgentKind::default(),
            wda_bundle_id: default_wda_bundle_id(),
            cfa_bundle_id: default_cfa_bundle_id(),
            xctestrun: default_xctestrun(),
            wda_dir: default_wda_dir(),
        }
    }
}

fn default_wda_bundle_id() -> String {
    "com.facebook.WebDriverAgentRunner.xctrunner".to_string()
}

fn default_cfa_bundle_id() -> String {
    "com.dryark.CFAgent.xctrunner".to_string()
}

fn default_xctestrun() -> PathBuf {
    PathBuf::from("bin/wda/WebDriverAgentRunner.xctestrun")
}

fn default_wda_dir() -> PathBuf {
    PathBuf::from("bin/wda")
}

/// On-device video app and its connections
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamSettings {
    /// Device-side port of the app's data socket
    #[serde(default = "default_video_device_port")]
    pub video_device_port: u16,

    /// Device-side port of the app's control socket
    #[serde(default = "default_control_device_port")]
    pub control_device_port: u16,

    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,

    /// Run a backend video server per device for backup frames
    #[serde(default)]
    pub backup_video: bool,

    /// Device-side port of the app's log socket; its lines are relayed when set
    #[serde(default)]
    pub log_device_port: Option<u16>,

    /// Installed before launch when set
    #[serde(default)]
    pub app_path: Option<PathBuf>,

    /// Launched before the stream connects, and again when the app is lost
    #[serde(default)]
    pub app_bundle_id: Option<String>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            video_device_port: default_video_device_port(),
            control_device_port: default_control_device_port(),
            connect_retries: default_connect_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            recv_timeout_ms: default_recv_timeout_ms(),
            backup_video: false,
            log_device_port: None,
            app_path: None,
            app_bundle_id: None,
        }
    }
}

fn default_video_device_port() -> u16 {
    8352
}

fn default_control_device_port() -> u16 {
    8353
}

fn default_connect_retries() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_ping_interval_ms() -> u64 {
    2000
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

/// Restart backoff for supervised processes
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_first_ms")]
    pub first_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Runs at least this long reset the failure count
    #[serde(default = "default_healthy_ms")]
    pub healthy_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            first_ms: default_first_ms(),
            factor: default_factor(),
            max_ms: default_max_ms(),
            healthy_ms: default_healthy_ms(),
        }
    }
}

impl SupervisorSettings {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_ms),
            max: Duration::from_millis(self.max_ms),
            factor: self.factor,
            healthy: Duration::from_millis(self.healthy_ms),
        }
    }
}

fn default_first_ms() -> u64 {
    1000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_ms() -> u64 {
    30_000
}

fn default_healthy_ms() -> u64 {
    10_000
}

/// `[[device]]` entry
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DeviceOverride {
    pub udid: String,

    /// Point size used for click coordinates
    #[serde(default)]
    pub ui_width: Option<u32>,

    #[serde(default)]
    pub ui_height: Option<u32>,

    #[serde(default)]
    pub agent: Option<AgentKind>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.bridge.backend, BackendKind::IosIf);
        assert_eq!(settings.ports.range, "8100-8200");
        assert_eq!(settings.agent.kind, AgentKind::Wda);
        assert!(!settings.stream.backup_video);
        assert!(settings.id_list.is_empty());
    }

    #[test]
    fn test_base_url() {
        let mut cf = ControlFloorSettings::default();
        assert_eq!(cf.base_url(), "http://127.0.0.1:8080");

        cf.https = true;
        cf.host = "floor.example.com/".to_string();
        assert_eq!(cf.base_url(), "https://floor.example.com");
    }

    #[test]
    fn test_supervisor_policy() {
        let policy = SupervisorSettings {
            first_ms: 500,
            factor: 3.0,
            max_ms: 9000,
            healthy_ms: 2000,
        }
        .policy();
        assert_eq!(policy.first, Duration::from_millis(500));
        assert_eq!(policy.max, Duration::from_secs(9));
        assert_eq!(policy.factor, 3.0);
        assert_eq!(policy.healthy, Duration::from_secs(2));
    }

    #[test]
    fn test_backend_path_follows_selection() {
        let mut bridge = BridgeSettings::default();
        assert_eq!(bridge.backend_path(), &PathBuf::from("bin/iosif"));
        bridge.backend = BackendKind::GoIos;
        assert_eq!(bridge.backend_path(), &PathBuf::from("bin/go-ios"));
    }
}
