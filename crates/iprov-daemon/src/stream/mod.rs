//! Video streaming from the on-device video app
//!
//! - [`sp`]: scalability-protocol sockets over TCP
//! - [`frame`]: data message demultiplexing and the discard flag
//! - [`control`]: control connection with keep-alive pings
//! - [`app_stream`]: per-device session loop with reconnects

pub mod app_stream;
pub mod control;
pub mod frame;
pub mod sp;

pub use app_stream::{AppStream, AppStreamHandle, SessionEnd, StreamConfig, StreamControl};
pub use control::{ControlAction, ControlChannel};
pub use frame::{
    decode, ChannelConsumer, Decoded, FrameConsumer, FrameHandler, FrameHeader, Handled,
    VideoFrame, MIN_FRAME_PAYLOAD,
};
pub use sp::{PullSocket, PushSocket, RepSocket, ReqSocket};
