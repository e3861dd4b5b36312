//! # iprov-core - Core Domain Types
//!
//! Foundation crate for the iOS device provider. Provides the error taxonomy,
//! logging setup, and the event and domain types shared by the daemon and app
//! crates.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, regex, tracing, dirs).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`BackendKind`] - Backend command-line tool (iosif, go-ios)
//! - [`AgentKind`] - UI automation agent (WDA, CFA)
//! - [`PortSet`], [`TunnelPair`] - Host port allocations and forwards
//! - [`DeviceInfo`], [`IosVersion`], [`ScreenSize`], [`LogItem`] - Device attributes
//!
//! ### Events (`events`)
//! - [`OutputLine`] - Tagged stdout/stderr line from a supervised process
//! - [`StopInfo`], [`StopCause`] - Why a supervised process ended
//! - [`DeviceEvent`] - Events consumed by a device's event loop
//! - [`BridgeEvent`] - Backend attach/detach notifications
//! - [`FirstFrame`] - First-frame notification line
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use iprov_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all provider crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use super::logging::censor_udid;
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result};
pub use events::{
    BridgeEvent, DeviceEvent, FirstFrame, OutputLine, StopCause, StopInfo, FIRST_FRAME_MARKER,
};
pub use logging::{censor_udid, Verbosity};
pub use types::{
    AgentKind, BackendKind, DeviceInfo, IosVersion, LogItem, PortSet, ScreenSize, TunnelPair,
};
