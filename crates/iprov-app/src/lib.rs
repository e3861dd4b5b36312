//! # iprov-app - Device Orchestration
//!
//! Owns the provider's devices: configuration, host port allocation, the
//! per-device lifecycle, automation sessions and control-floor notifications.
//! Generic over the backend [`iprov_daemon::Bridge`], so nothing in here
//! branches on which command-line tool is in use.
//!
//! ## Public API
//!
//! ### Configuration (`config`)
//! - [`Settings`] - Provider settings loaded from TOML
//! - [`load_settings`] - Load and validate `config.toml`
//!
//! ### Devices
//! - [`DeviceTracker`], [`TrackerHandle`], [`TrackerEvent`] - Device registry and dispatcher
//! - [`DeviceStatus`] - Snapshot of one tracked device
//! - [`Device`], [`DeviceContext`], [`Lifecycle`] - One physical unit and its state
//! - [`PortPool`] - Host port allocation
//!
//! ### Controller
//! - [`ControlFloor`], [`HttpControlFloor`], [`Notification`] - Status notifications
//! - [`AutomationClient`] - WDA/CFA session creation

pub mod automation;
pub mod config;
pub mod control_floor;
pub mod device;
pub mod port_pool;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tracker;

pub use automation::AutomationClient;
pub use config::{load_settings, Settings, CONFIG_FILENAME};
pub use control_floor::{ControlFloor, HttpControlFloor, LocalControlFloor, Notification};
pub use device::{screen_size, Device, DeviceContext, Lifecycle};
pub use port_pool::PortPool;
pub use tracker::{DeviceStatus, DeviceTracker, TrackerEvent, TrackerHandle};
