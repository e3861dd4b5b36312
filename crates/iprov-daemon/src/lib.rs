//! # iprov-daemon - Device Process Plumbing
//!
//! Supervises the external helper processes that talk to each device, wraps
//! the backend command-line tools behind one capability set, and carries the
//! video stream from the on-device video app.
//!
//! Depends on [`iprov_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Process Supervision
//! - [`ProcessSpec`] - Describe and start a supervised executable
//! - [`ProcessHandle`] - Stop/restart/observe a supervised process
//! - [`ProcessRegistry`], [`ProcessTable`] - Registry of every supervisor
//! - [`Backoff`], [`BackoffPolicy`] - Restart pacing
//!
//! ### Backends
//! - [`Bridge`], [`BridgeDevice`] - Device discovery and per-device operations
//! - [`IosIfBridge`], [`GoIosBridge`] - The two backend implementations
//! - [`VideoServer`] - Backup screen frames over HTTP
//! - [`FatalReporter`] - Provider-wide channel for fatal errors
//! - [`AgentFailure`] - Agent output that stops the provider
//!
//! ### Video Streaming
//! - [`AppStream`], [`AppStreamHandle`] - Per-device video session
//! - [`FrameHandler`], [`FrameConsumer`] - Frame demultiplexing and delivery
//! - [`stream::sp`] - Scalability-protocol sockets over TCP
//!
//! ### Syslog
//! - [`LogRecordDecoder`] - Reassembles framed syslog records

pub mod backoff;
pub mod bridge;
pub mod process;
pub mod registry;
pub mod stream;
pub mod syslog;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use backoff::{Backoff, BackoffPolicy};
pub use bridge::goios::GoIosBridge;
pub use bridge::iosif::IosIfBridge;
pub use bridge::{
    extract_jpeg, AgentFailure, AgentHooks, Bridge, BridgeConfig, BridgeDevice, FatalReporter, FrameFormat,
    LocalBridgeDevice, LogHandler, VideoServer,
};
pub use process::{
    resolve_binary, OutputHandler, ProcessHandle, ProcessRegistry, ProcessSpec, ProcessState,
    StopHook,
};
pub use registry::ProcessTable;
pub use stream::{
    AppStream, AppStreamHandle, ChannelConsumer, FrameConsumer, FrameHandler, SessionEnd,
    StreamConfig, StreamControl, VideoFrame,
};
pub use syslog::{parse_plain_line, LogRecordDecoder};
