//! Settings loading and validation

use std::path::Path;
use std::time::Duration;

use iprov_core::prelude::*;
use iprov_core::types::{AgentKind, PortSet};
use iprov_daemon::{BridgeConfig, StreamConfig};

use super::types::{DeviceOverride, Settings};

/// Default settings file, relative to the working directory
pub const CONFIG_FILENAME: &str = "config.toml";

/// Load settings from `path`
///
/// A missing file yields defaults. A file that cannot be read, parsed or
/// validated is a fatal configuration error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        debug!("No config file at {:?}, using defaults", path);
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config_invalid(format!("Failed to read {:?}: {}", path, e)))?;
    let settings: Settings = toml::from_str(&content)
        .map_err(|e| Error::config_invalid(format!("Failed to parse {:?}: {}", path, e)))?;
    settings.validate()?;

    debug!("Loaded settings from {:?}", path);
    Ok(settings)
}

impl Settings {
    /// Host ports each device holds
    pub fn ports_per_device(&self) -> usize {
        if self.stream.backup_video {
            4
        } else {
            3
        }
    }

    /// Inclusive `(min, max)` of the port pool
    pub fn port_range(&self) -> Result<(u16, u16)> {
        let range = self.ports.range.trim();
        let (min, max) = range
            .split_once('-')
            .ok_or_else(|| Error::config_invalid(format!("port range '{}' is not min-max", range)))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u16>()
                .map_err(|_| Error::config_invalid(format!("invalid port '{}' in range '{}'", s, range)))
        };
        Ok((parse(min)?, parse(max)?))
    }

    pub fn validate(&self) -> Result<()> {
        let (min, max) = self.port_range()?;
        if min > max {
            return Err(Error::config_invalid(format!(
                "port range {}-{} is reversed",
                min, max
            )));
        }

        let available = usize::from(max - min) + 1;
        let needed = self.ports.max_devices * self.ports_per_device();
        if available < needed {
            return Err(Error::config_invalid(format!(
                "port range {}-{} holds {} ports; {} devices need {}",
                min, max, available, self.ports.max_devices, needed
            )));
        }

        let base = self.control_floor.base_url();
        match url::Url::parse(&base) {
            Ok(url) if url.host_str().is_some() => {}
            _ => {
                return Err(Error::config_invalid(format!(
                    "control floor host '{}' is not a valid address",
                    self.control_floor.host
                )))
            }
        }

        if self.supervisor.factor.is_nan() || self.supervisor.factor < 1.0 {
            return Err(Error::config_invalid(format!(
                "supervisor factor {} must be at least 1",
                self.supervisor.factor
            )));
        }

        if let Some(dup) = self
            .devices
            .iter()
            .enumerate()
            .find(|(i, d)| self.devices[..*i].iter().any(|o| o.udid == d.udid))
        {
            return Err(Error::config_invalid(format!(
                "device {} configured twice",
                dup.1.udid
            )));
        }

        Ok(())
    }

    /// Whether `udid` passes the identifier allow-list
    pub fn allows(&self, udid: &str) -> bool {
        self.id_list.is_empty() || self.id_list.iter().any(|id| id == udid)
    }

    pub fn device_override(&self, udid: &str) -> Option<&DeviceOverride> {
        self.devices.iter().find(|d| d.udid == udid)
    }

    /// Agent for `udid`, honoring per-device overrides
    pub fn agent_kind(&self, udid: &str) -> AgentKind {
        self.device_override(udid)
            .and_then(|d| d.agent)
            .unwrap_or(self.agent.kind)
    }

    /// Configured click size for `udid`, if both dimensions are set
    pub fn ui_size(&self, udid: &str) -> Option<(u32, u32)> {
        let device = self.device_override(udid)?;
        Some((device.ui_width?, device.ui_height?))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            iosif_path: self.bridge.iosif_path.clone(),
            goios_path: self.bridge.goios_path.clone(),
            tidevice_path: self.bridge.tidevice_path.clone(),
            xcodebuild_path: self.bridge.xcodebuild_path.clone(),
            wda_bundle_id: self.agent.wda_bundle_id.clone(),
            cfa_bundle_id: self.agent.cfa_bundle_id.clone(),
            xctestrun: self.agent.xctestrun.clone(),
            wda_dir: self.agent.wda_dir.clone(),
            backoff: self.supervisor.policy(),
        }
    }

    /// Stream connection settings for a device holding `ports`
    pub fn stream_config(&self, ports: &PortSet) -> StreamConfig {
        let mut config = StreamConfig::new(ports.video, ports.video_control);
        config.connect_retries = self.stream.connect_retries;
        config.retry_delay = Duration::from_millis(self.stream.retry_delay_ms);
        config.ping_interval = Duration::from_millis(self.stream.ping_interval_ms);
        config.recv_timeout = Duration::from_millis(self.stream.recv_timeout_ms);
        config.log_port = ports.video_log;
        config
    }
}
