//! Domain event definitions

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────
// Supervised process output
// ─────────────────────────────────────────────────────────

/// A single line produced by a supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }

    pub fn is_stderr(&self) -> bool {
        matches!(self, OutputLine::Stderr(_))
    }
}

/// Why a supervised process instance ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// `stop()` was requested; supervision ends
    Stopped,
    /// `restart()` was requested; a fresh instance follows
    Restart,
    /// The process exited on its own with a status code
    Exited(i32),
    /// The process was killed by a signal the supervisor did not send
    Signaled,
}

/// Passed to a supervisor's `on_stop` hook each time its process ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub cause: StopCause,
}

// ─────────────────────────────────────────────────────────
// Device and backend events
// ─────────────────────────────────────────────────────────

/// Events consumed by a device's event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    AutomationStarted,
    AutomationStopped,
    /// First frame dimensions received from the video stream
    StreamUp { width: u32, height: u32 },
    StreamDown,
    /// Video app reported it has nothing to send
    NoFrames,
    /// The video app's control socket went away; the app may have died
    VideoAppLost,
    Stop,
}

/// Attach/detach notifications reported by a backend's device listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Attached { udid: String, name: String },
    Detached { udid: String },
}

impl BridgeEvent {
    pub fn udid(&self) -> &str {
        match self {
            BridgeEvent::Attached { udid, .. } | BridgeEvent::Detached { udid } => udid,
        }
    }
}

// ─────────────────────────────────────────────────────────
// First-frame notification
// ─────────────────────────────────────────────────────────

/// Marker prefixing first-frame notification lines
pub const FIRST_FRAME_MARKER: &str = "FIRSTFRAME";

/// `{"type":"frame1","width":W,"height":H,"uuid":ID}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FirstFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub width: u32,
    pub height: u32,
    pub uuid: String,
}

impl FirstFrame {
    pub fn new(uuid: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: "frame1".to_string(),
            width,
            height,
            uuid: uuid.into(),
        }
    }

    /// Render the notification line, marker included
    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{}{}", FIRST_FRAME_MARKER, json)
    }

    /// Parse a notification line. Returns `None` for anything else.
    pub fn parse_line(line: &str) -> Option<Self> {
        let json = line.trim().strip_prefix(FIRST_FRAME_MARKER)?;
        let frame: FirstFrame = serde_json::from_str(json).ok()?;
        (frame.kind == "frame1").then_some(frame)
    }
}
