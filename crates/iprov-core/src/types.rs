//! Core domain types shared by every provider crate

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key/value attributes answered by a backend (`info` or `gestalt` queries)
pub type DeviceInfo = HashMap<String, String>;

// ─────────────────────────────────────────────────────────
// Backends and agents
// ─────────────────────────────────────────────────────────

/// Backend command-line tool used to reach devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "iosif")]
    IosIf,
    #[serde(rename = "go-ios")]
    GoIos,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::IosIf => write!(f, "iosif"),
            BackendKind::GoIos => write!(f, "go-ios"),
        }
    }
}

/// On-device UI automation agent. Exactly one kind runs per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// WebDriverAgent, driven over HTTP
    #[default]
    Wda,
    /// ControlFloor agent, driven over an SP request socket
    Cfa,
}

impl AgentKind {
    /// Port the agent listens on inside the device
    pub fn device_port(self) -> u16 {
        match self {
            AgentKind::Wda => 8100,
            AgentKind::Cfa => 8101,
        }
    }

    /// Prefix used by control floor status variants (`wdaStarted`, `cfaStopped`, ...)
    pub fn status_prefix(self) -> &'static str {
        match self {
            AgentKind::Wda => "wda",
            AgentKind::Cfa => "cfa",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Wda => write!(f, "WDA"),
            AgentKind::Cfa => write!(f, "CFA"),
        }
    }
}

// ─────────────────────────────────────────────────────────
// Ports
// ─────────────────────────────────────────────────────────

/// A local→device TCP port forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelPair {
    /// Local port on the host
    pub from: u16,
    /// Port inside the device
    pub to: u16,
}

impl TunnelPair {
    pub fn new(from: u16, to: u16) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for TunnelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.from, self.to)
    }
}

/// Host ports allocated to a single device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub automation: u16,
    pub video: u16,
    pub video_control: u16,
    /// Present only when backup video is enabled
    pub backup_video: Option<u16>,
    /// Present only when the video app's log is relayed
    pub video_log: Option<u16>,
}

impl PortSet {
    /// All allocated ports, in allocation order
    pub fn all(&self) -> Vec<u16> {
        let mut ports = vec![self.automation, self.video, self.video_control];
        ports.extend(self.backup_video);
        ports.extend(self.video_log);
        ports
    }
}

// ─────────────────────────────────────────────────────────
// Device attributes
// ─────────────────────────────────────────────────────────

/// Parsed `ProductVersion` (e.g. "16.4.1")
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct IosVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

static VERSION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("Invalid version regex")
});

impl FromStr for IosVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let caps = VERSION_REGEX
            .captures(s.trim())
            .ok_or_else(|| Error::bridge(format!("unparseable version '{}'", s)))?;
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .unwrap_or(0)
        };
        Ok(Self {
            major: part(1),
            minor: part(2),
            patch: part(3),
        })
    }
}

impl fmt::Display for IosVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Screen geometry: native pixels plus the point size used for taps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
    pub click_width: u32,
    pub click_height: u32,
}

/// One decoded syslog record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub app: String,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serde_names() {
        let kind: BackendKind = serde_json::from_str("\"go-ios\"").unwrap();
        assert_eq!(kind, BackendKind::GoIos);
        assert_eq!(BackendKind::IosIf.to_string(), "iosif");
    }

    #[test]
    fn test_agent_device_ports() {
        assert_eq!(AgentKind::Wda.device_port(), 8100);
        assert_eq!(AgentKind::Cfa.device_port(), 8101);
        assert_eq!(AgentKind::Cfa.status_prefix(), "cfa");
    }

    #[test]
    fn test_port_set_all() {
        let ports = PortSet {
            automation: 8100,
            video: 8101,
            video_control: 8102,
            backup_video: None,
            video_log: None,
        };
        assert_eq!(ports.all(), vec![8100, 8101, 8102]);

        let with_backup = PortSet {
            backup_video: Some(8103),
            ..ports
        };
        assert_eq!(with_backup.all().len(), 4);

        let with_log = PortSet {
            video_log: Some(8104),
            ..with_backup
        };
        assert_eq!(with_log.all(), vec![8100, 8101, 8102, 8103, 8104]);
    }

    #[test]
    fn test_ios_version_parse() {
        let v: IosVersion = "16.4.1".parse().unwrap();
        assert_eq!(
            v,
            IosVersion {
                major: 16,
                minor: 4,
                patch: 1
            }
        );

        let v: IosVersion = "15.0".parse().unwrap();
        assert_eq!(v.patch, 0);
        assert_eq!(v.to_string(), "15.0.0");

        assert!("beta".parse::<IosVersion>().is_err());
    }

    #[test]
    fn test_ios_version_ordering() {
        let a: IosVersion = "14.8".parse().unwrap();
        let b: IosVersion = "15.0.2".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_tunnel_pair_display() {
        assert_eq!(TunnelPair::new(8100, 8100).to_string(), "8100:8100");
    }
}
