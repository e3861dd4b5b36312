//! Data-channel frame demultiplexing and backpressure
//!
//! A data message either starts with `{`, in which case a JSON header is
//! immediately followed by the payload, or is a raw frame with no header.
//! Headers with fewer than [`MIN_FRAME_PAYLOAD`] trailing bytes are control
//! messages; `{"msg":"noframes"}` is the only one acted on.

use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;

use iprov_core::events::{DeviceEvent, FirstFrame};
use iprov_core::prelude::*;

/// Headers followed by fewer bytes than this carry no frame
pub const MIN_FRAME_PAYLOAD: usize = 10;

/// Header fields the provider looks at; everything else is passed through
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FrameHeader {
    /// Device display width
    #[serde(default)]
    pub dw: Option<u32>,
    /// Device display height
    #[serde(default)]
    pub dh: Option<u32>,
    #[serde(default)]
    pub msg: Option<String>,
}

impl FrameHeader {
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.dw?, self.dh?))
    }
}

/// One decoded data message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Header-only message
    Control(FrameHeader),
    /// Frame payload, with its header when one was sent
    Frame {
        header: Option<FrameHeader>,
        header_text: String,
        payload: Bytes,
    },
}

/// Split a data message into header and payload
pub fn decode(msg: Bytes) -> Result<Decoded> {
    if msg.first() != Some(&b'{') {
        return Ok(Decoded::Frame {
            header: None,
            header_text: String::new(),
            payload: msg,
        });
    }

    let mut stream = serde_json::Deserializer::from_slice(&msg).into_iter::<FrameHeader>();
    let header = match stream.next() {
        Some(Ok(header)) => header,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(Error::stream("empty frame header")),
    };
    let split = stream.byte_offset();

    if msg.len() - split < MIN_FRAME_PAYLOAD {
        return Ok(Decoded::Control(header));
    }

    let header_text = String::from_utf8_lossy(&msg[..split]).into_owned();
    Ok(Decoded::Frame {
        header: Some(header),
        header_text,
        payload: msg.slice(split..),
    })
}

// ─────────────────────────────────────────────────────────
// Consumers
// ─────────────────────────────────────────────────────────

/// A frame handed to the consumer
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub seq: u64,
    /// Raw JSON header text; empty for raw frames
    pub header: String,
    pub payload: Bytes,
}

/// Sink for forwarded frames. An error switches the pipeline to discard mode.
pub trait FrameConsumer: Send {
    fn consume(&mut self, frame: VideoFrame) -> Result<()>;

    /// The video app reported it has nothing to send
    fn no_frames(&mut self) {}
}

/// Consumer forwarding into a bounded channel; a full or closed channel is
/// a rejection.
pub struct ChannelConsumer {
    tx: mpsc::Sender<VideoFrame>,
}

impl ChannelConsumer {
    pub fn new(tx: mpsc::Sender<VideoFrame>) -> Self {
        Self { tx }
    }
}

impl FrameConsumer for ChannelConsumer {
    fn consume(&mut self, frame: VideoFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::stream("frame consumer is backlogged"),
            mpsc::error::TrySendError::Closed(_) => Error::stream("frame consumer went away"),
        })
    }
}

// ─────────────────────────────────────────────────────────
// FrameHandler
// ─────────────────────────────────────────────────────────

/// What happened to one data message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Forwarded,
    Dropped,
    NoFrames,
    /// Header-only message other than `noframes`
    Control,
    /// The consumer refused the frame; discard mode is now on
    Rejected,
    Malformed,
}

/// Emits the first-frame notification line
pub type FirstFrameSink = Box<dyn FnMut(&FirstFrame) + Send>;

/// Per-device demultiplexer state.
///
/// While `discard` is set no consumer is ever called.
pub struct FrameHandler {
    udid: String,
    discard: bool,
    header_sent: bool,
    is_up: bool,
    frames: u64,
    consumer: Option<Box<dyn FrameConsumer>>,
    events: mpsc::Sender<DeviceEvent>,
    first_frame: FirstFrameSink,
}

impl FrameHandler {
    pub fn new(udid: impl Into<String>, events: mpsc::Sender<DeviceEvent>) -> Self {
        Self {
            udid: udid.into(),
            discard: true,
            header_sent: false,
            is_up: false,
            frames: 0,
            consumer: None,
            events,
            first_frame: Box::new(|frame| println!("{}", frame.to_line())),
        }
    }

    /// Replace where first-frame notifications go (stdout by default)
    pub fn with_first_frame_sink(mut self, sink: impl FnMut(&FirstFrame) + Send + 'static) -> Self {
        self.first_frame = Box::new(sink);
        self
    }

    pub fn set_discard(&mut self, discard: bool) {
        if self.discard != discard {
            debug!(
                "{} video frames for {}",
                if discard { "Discarding" } else { "Forwarding" },
                censor_udid(&self.udid)
            );
        }
        self.discard = discard;
    }

    pub fn is_discarding(&self) -> bool {
        self.discard
    }

    pub fn set_consumer(&mut self, consumer: Box<dyn FrameConsumer>) {
        self.consumer = Some(consumer);
    }

    pub fn clear_consumer(&mut self) {
        self.consumer = None;
    }

    pub fn has_consumer(&self) -> bool {
        self.consumer.is_some()
    }

    /// Frames forwarded so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// The data connection went away; the next dimensions re-announce the stream
    pub fn mark_down(&mut self) {
        if self.is_up {
            self.is_up = false;
            self.emit(DeviceEvent::StreamDown);
        }
    }

    /// The control connection went away; the device relaunches the app
    pub fn control_lost(&self) {
        self.emit(DeviceEvent::VideoAppLost);
    }

    pub fn handle(&mut self, msg: Bytes) -> Handled {
        if self.discard && self.header_sent {
            return Handled::Dropped;
        }

        let decoded = match decode(msg) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Malformed video message from {}: {}", censor_udid(&self.udid), e);
                return Handled::Malformed;
            }
        };

        let (header, header_text, payload) = match decoded {
            Decoded::Control(header) => {
                if header.msg.as_deref() == Some("noframes") {
                    debug!("Video app for {} has no frames", censor_udid(&self.udid));
                    self.emit(DeviceEvent::NoFrames);
                    if let Some(consumer) = self.consumer.as_mut() {
                        consumer.no_frames();
                    }
                    return Handled::NoFrames;
                }
                trace!("Video control message: {:?}", header);
                return Handled::Control;
            }
            Decoded::Frame {
                header,
                header_text,
                payload,
            } => (header, header_text, payload),
        };

        if let Some((width, height)) = header.as_ref().and_then(FrameHeader::dimensions) {
            self.announce(width, height);
        }

        if self.discard {
            return Handled::Dropped;
        }
        let Some(consumer) = self.consumer.as_mut() else {
            return Handled::Dropped;
        };

        let frame = VideoFrame {
            seq: self.frames,
            header: header_text,
            payload,
        };
        match consumer.consume(frame) {
            Ok(()) => {
                self.frames += 1;
                Handled::Forwarded
            }
            Err(e) => {
                warn!(
                    "Frame consumer for {} rejected frame: {}; discarding",
                    censor_udid(&self.udid),
                    e
                );
                self.discard = true;
                Handled::Rejected
            }
        }
    }

    fn announce(&mut self, width: u32, height: u32) {
        if !self.is_up {
            self.is_up = true;
            self.emit(DeviceEvent::StreamUp { width, height });
        }
        if !self.header_sent {
            self.header_sent = true;
            info!(
                "First frame from {}: {}x{}",
                censor_udid(&self.udid),
                width,
                height
            );
            (self.first_frame)(&FirstFrame::new(self.udid.clone(), width, height));
        }
    }

    fn emit(&self, event: DeviceEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Device event dropped for {}: {}", censor_udid(&self.udid), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default, Clone)]
    struct Recorder {
        frames: Arc<Mutex<Vec<VideoFrame>>>,
        no_frames: Arc<Mutex<u32>>,
        fail: Arc<Mutex<bool>>,
    }

    impl FrameConsumer for Recorder {
        fn consume(&mut self, frame: VideoFrame) -> Result<()> {
            if *self.fail.lock().unwrap() {
                return Err(Error::stream("sink closed"));
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        fn no_frames(&mut self) {
            *self.no_frames.lock().unwrap() += 1;
        }
    }

    fn frame_msg(header: &str, payload_len: usize) -> Bytes {
        let mut msg = header.as_bytes().to_vec();
        msg.extend((0..payload_len).map(|i| (i % 251) as u8));
        Bytes::from(msg)
    }

    fn handler() -> (FrameHandler, mpsc::Receiver<DeviceEvent>, Arc<Mutex<Vec<FirstFrame>>>) {
        let (tx, rx) = mpsc::channel(16);
        let firsts = Arc::new(Mutex::new(Vec::new()));
        let sink = firsts.clone();
        let handler = FrameHandler::new("AAA", tx)
            .with_first_frame_sink(move |f| sink.lock().unwrap().push(f.clone()));
        (handler, rx, firsts)
    }

    #[test]
    fn test_decode_header_and_payload() {
        let msg = frame_msg(r#"{"dw":100,"dh":200}"#, 500);
        match decode(msg).unwrap() {
            Decoded::Frame {
                header,
                header_text,
                payload,
            } => {
                assert_eq!(header.unwrap().dimensions(), Some((100, 200)));
                assert_eq!(header_text, r#"{"dw":100,"dh":200}"#);
                assert_eq!(payload.len(), 500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_raw_frame() {
        let msg = Bytes::from_static(b"\xff\xd8raw-jpeg-bytes");
        assert!(matches!(
            decode(msg).unwrap(),
            Decoded::Frame { header: None, .. }
        ));
    }

    #[test]
    fn test_decode_short_tail_is_control() {
        let msg = frame_msg(r#"{"msg":"noframes"}"#, 0);
        assert!(matches!(decode(msg).unwrap(), Decoded::Control(_)));
        let msg = frame_msg(r#"{"msg":"x"}"#, MIN_FRAME_PAYLOAD - 1);
        assert!(matches!(decode(msg).unwrap(), Decoded::Control(_)));
    }

    #[test]
    fn test_decode_rejects_broken_header() {
        assert!(decode(Bytes::from_static(b"{\"dw\":")).is_err());
    }

    #[test]
    fn test_round_trip_stream_up_then_forward() {
        let (mut handler, mut events, firsts) = handler();
        let consumer = Recorder::default();
        handler.set_consumer(Box::new(consumer.clone()));
        handler.set_discard(false);

        let result = handler.handle(frame_msg(r#"{"dw":100,"dh":200}"#, 500));

        assert_eq!(result, Handled::Forwarded);
        assert_eq!(
            events.try_recv().unwrap(),
            DeviceEvent::StreamUp {
                width: 100,
                height: 200
            }
        );
        assert_eq!(*firsts.lock().unwrap(), vec![FirstFrame::new("AAA", 100, 200)]);

        let frames = consumer.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, frame_msg("", 500));
    }

    #[test]
    fn test_noframes_never_forwarded() {
        let (mut handler, mut events, _) = handler();
        let consumer = Recorder::default();
        handler.set_consumer(Box::new(consumer.clone()));
        handler.set_discard(false);

        let result = handler.handle(frame_msg(r#"{"msg":"noframes"}"#, 0));

        assert_eq!(result, Handled::NoFrames);
        assert_eq!(*consumer.no_frames.lock().unwrap(), 1);
        assert!(consumer.frames.lock().unwrap().is_empty());
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::NoFrames);
    }

    #[test]
    fn test_discard_is_default_but_first_frame_still_announced() {
        let (mut handler, mut events, firsts) = handler();
        let consumer = Recorder::default();
        handler.set_consumer(Box::new(consumer.clone()));

        assert_eq!(
            handler.handle(frame_msg(r#"{"dw":10,"dh":20}"#, 64)),
            Handled::Dropped
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            DeviceEvent::StreamUp { .. }
        ));
        assert_eq!(firsts.lock().unwrap().len(), 1);

        // Once the header is out, discarded frames are not even parsed
        assert_eq!(
            handler.handle(Bytes::from_static(b"{broken")),
            Handled::Dropped
        );
        assert!(consumer.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forwarding_follows_last_toggle() {
        let (mut handler, _events, _) = handler();
        let consumer = Recorder::default();
        handler.set_consumer(Box::new(consumer.clone()));

        let toggles = [false, true, true, false, false, true, false];
        let mut expected = 0;
        for discard in toggles {
            handler.set_discard(discard);
            let result = handler.handle(frame_msg(r#"{"dw":1,"dh":1}"#, 32));
            if discard {
                assert_eq!(result, Handled::Dropped);
            } else {
                expected += 1;
                assert_eq!(result, Handled::Forwarded);
            }
        }
        assert_eq!(consumer.frames.lock().unwrap().len(), expected);
        assert_eq!(handler.frames(), expected as u64);
    }

    #[test]
    fn test_consumer_error_switches_to_discard() {
        let (mut handler, _events, _) = handler();
        let consumer = Recorder::default();
        handler.set_consumer(Box::new(consumer.clone()));
        handler.set_discard(false);

        *consumer.fail.lock().unwrap() = true;
        assert_eq!(handler.handle(frame_msg("", 32)), Handled::Rejected);
        assert!(handler.is_discarding());

        *consumer.fail.lock().unwrap() = false;
        assert_eq!(handler.handle(frame_msg("", 32)), Handled::Dropped);
        assert!(consumer.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn test_stream_down_then_up_again() {
        let (mut handler, mut events, firsts) = handler();
        handler.handle(frame_msg(r#"{"dw":5,"dh":6}"#, 32));
        handler.mark_down();
        handler.set_discard(false);
        handler.handle(frame_msg(r#"{"dw":5,"dh":6}"#, 32));

        assert!(matches!(events.try_recv().unwrap(), DeviceEvent::StreamUp { .. }));
        assert_eq!(events.try_recv().unwrap(), DeviceEvent::StreamDown);
        assert!(matches!(events.try_recv().unwrap(), DeviceEvent::StreamUp { .. }));
        // The first-frame line is only emitted once per pipeline
        assert_eq!(firsts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_channel_consumer_rejects_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let mut consumer = ChannelConsumer::new(tx);
        let frame = VideoFrame {
            seq: 0,
            header: String::new(),
            payload: Bytes::from_static(b"0123456789"),
        };
        assert!(consumer.consume(frame.clone()).is_ok());
        assert!(consumer.consume(frame).is_err());
    }
}
