//! Scalability-protocol sockets over TCP
//!
//! The on-device video app speaks the nanomsg SP wire format:
//!
//! - on connect each side sends an 8-byte header `00 'S' 'P' 00 <proto:u16> 00 00`
//!   and checks that the peer's protocol is the one it pairs with;
//! - every message is a 64-bit big-endian length followed by the body;
//! - REQ/REP bodies start with a 4-byte request id whose top bit is set.
//!
//! Only the socket types the provider needs are implemented: PULL and REQ for
//! the provider side, PUSH and REP for the device side (used by tests and
//! local tooling).

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

use iprov_core::prelude::*;

const HEADER_LEN: usize = 8;
const REQUEST_ID_LEN: usize = 4;
const REQUEST_ID_FLAG: u32 = 0x8000_0000;
/// Frames larger than this are treated as a protocol error
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// SP protocol identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Req,
    Rep,
    Push,
    Pull,
}

impl Protocol {
    pub fn id(self) -> u16 {
        match self {
            Protocol::Req => 0x30,
            Protocol::Rep => 0x31,
            Protocol::Push => 0x50,
            Protocol::Pull => 0x51,
        }
    }

    /// The protocol a socket of this kind must be connected to
    pub fn peer(self) -> Protocol {
        match self {
            Protocol::Req => Protocol::Rep,
            Protocol::Rep => Protocol::Req,
            Protocol::Push => Protocol::Pull,
            Protocol::Pull => Protocol::Push,
        }
    }

    fn header(self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.id().to_be_bytes();
        [0x00, b'S', b'P', 0x00, hi, lo, 0x00, 0x00]
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(8)
        .big_endian()
        .max_frame_length(MAX_MESSAGE_LEN)
        .new_codec()
}

/// Exchange SP headers on a fresh connection
async fn handshake<S>(stream: &mut S, proto: Protocol) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&proto.header()).await?;

    let mut peer = [0u8; HEADER_LEN];
    stream.read_exact(&mut peer).await?;

    if peer[..4] != [0x00, b'S', b'P', 0x00] {
        return Err(Error::protocol("peer did not send an SP header"));
    }
    let peer_id = u16::from_be_bytes([peer[4], peer[5]]);
    if peer_id != proto.peer().id() {
        return Err(Error::protocol(format!(
            "peer protocol 0x{:02x} cannot pair with 0x{:02x}",
            peer_id,
            proto.id()
        )));
    }
    Ok(())
}

async fn dial(addr: SocketAddr, proto: Protocol) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    handshake(&mut stream, proto).await?;
    Ok(stream)
}

async fn accept(listener: &TcpListener, proto: Protocol) -> Result<TcpStream> {
    let (mut stream, _) = listener.accept().await?;
    stream.set_nodelay(true)?;
    handshake(&mut stream, proto).await?;
    Ok(stream)
}

fn closed(what: &str) -> Error {
    Error::connection_lost(what)
}

// ─────────────────────────────────────────────────────────
// PULL / PUSH
// ─────────────────────────────────────────────────────────

/// Receiving end of a one-way pipeline
pub struct PullSocket {
    frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    // Held so the peer does not see a half-closed connection
    _write: OwnedWriteHalf,
}

impl PullSocket {
    pub async fn dial(addr: SocketAddr) -> Result<Self> {
        let (read, write) = dial(addr, Protocol::Pull).await?.into_split();
        Ok(Self {
            frames: FramedRead::new(read, codec()),
            _write: write,
        })
    }

    /// Receive one message. Cancel-safe: a partially read message stays
    /// buffered for the next call.
    pub async fn recv(&mut self) -> Result<Bytes> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => Err(e.into()),
            None => Err(closed("data")),
        }
    }
}

/// Sending end of a one-way pipeline
pub struct PushSocket {
    frames: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    _read: OwnedReadHalf,
}

impl PushSocket {
    /// Accept one PULL peer on `listener`
    pub async fn accept(listener: &TcpListener) -> Result<Self> {
        let (read, write) = accept(listener, Protocol::Push).await?.into_split();
        Ok(Self {
            frames: FramedWrite::new(write, codec()),
            _read: read,
        })
    }

    pub async fn send(&mut self, body: impl Into<Bytes>) -> Result<()> {
        self.frames.send(body.into()).await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// REQ / REP
// ─────────────────────────────────────────────────────────

/// Requesting end of a request/reply pair
pub struct ReqSocket {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    next_id: u32,
}

impl ReqSocket {
    pub async fn dial(addr: SocketAddr) -> Result<Self> {
        let stream = dial(addr, Protocol::Req).await?;
        Ok(Self {
            framed: Framed::new(stream, codec()),
            next_id: 1,
        })
    }

    /// Send `body` and wait for the matching reply
    pub async fn request(&mut self, body: &[u8]) -> Result<Bytes> {
        let id = self.next_id | REQUEST_ID_FLAG;
        self.next_id = (self.next_id + 1) & !REQUEST_ID_FLAG;

        let mut msg = BytesMut::with_capacity(REQUEST_ID_LEN + body.len());
        msg.put_u32(id);
        msg.put_slice(body);
        self.framed.send(msg.freeze()).await?;

        loop {
            let reply = match self.framed.next().await {
                Some(Ok(reply)) => reply,
                Some(Err(e)) => return Err(e.into()),
                None => return Err(closed("control")),
            };
            if reply.len() < REQUEST_ID_LEN {
                return Err(Error::protocol("reply shorter than request id"));
            }
            let reply_id = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
            if reply_id == id {
                return Ok(reply.freeze().slice(REQUEST_ID_LEN..));
            }
            trace!("Dropping stale reply 0x{:08x}", reply_id);
        }
    }
}

/// Replying end of a request/reply pair
pub struct RepSocket {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl RepSocket {
    /// Accept one REQ peer on `listener`
    pub async fn accept(listener: &TcpListener) -> Result<Self> {
        let stream = accept(listener, Protocol::Rep).await?;
        Ok(Self {
            framed: Framed::new(stream, codec()),
        })
    }

    /// Receive a request; returns its id and body
    pub async fn recv(&mut self) -> Result<(u32, Bytes)> {
        let msg = match self.framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(closed("control")),
        };
        if msg.len() < REQUEST_ID_LEN {
            return Err(Error::protocol("request shorter than request id"));
        }
        let id = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
        Ok((id, msg.freeze().slice(REQUEST_ID_LEN..)))
    }

    pub async fn reply(&mut self, id: u32, body: &[u8]) -> Result<()> {
        let mut msg = BytesMut::with_capacity(REQUEST_ID_LEN + body.len());
        msg.put_u32(id);
        msg.put_slice(body);
        self.framed.send(msg.freeze()).await?;
        Ok(())
    }
}
