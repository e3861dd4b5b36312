//! Control connection to the on-device video app

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

use super::sp::ReqSocket;
use iprov_core::prelude::*;

/// Upper bound on a single request/reply exchange
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Actions understood by the video app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Start,
    Stop,
    OneFrame,
    Ping,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Start => "start",
            ControlAction::Stop => "stop",
            ControlAction::OneFrame => "oneframe",
            ControlAction::Ping => "ping",
        }
    }

    pub fn body(self) -> Vec<u8> {
        json!({ "action": self.as_str() }).to_string().into_bytes()
    }
}

struct Request {
    action: ControlAction,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// A REQ connection owned by a background task that serializes requests and
/// pings the app periodically. Any failed exchange marks the channel lost.
///
/// Dropping the channel closes the connection.
pub struct ControlChannel {
    requests: mpsc::Sender<Request>,
    lost: watch::Receiver<bool>,
}

impl ControlChannel {
    pub async fn connect(addr: SocketAddr, ping_interval: Duration) -> Result<Self> {
        let socket = ReqSocket::dial(addr).await?;
        let (requests, rx) = mpsc::channel(16);
        let (lost_tx, lost) = watch::channel(false);

        tokio::spawn(run(socket, rx, lost_tx, ping_interval));

        Ok(Self { requests, lost })
    }

    pub async fn send(&self, action: ControlAction) -> Result<Bytes> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request { action, reply })
            .await
            .map_err(|_| Error::connection_lost("control"))?;
        rx.await.map_err(|_| Error::connection_lost("control"))?
    }

    /// Resolves once the connection is gone
    pub async fn lost(&self) {
        let mut lost = self.lost.clone();
        let _ = lost.wait_for(|l| *l).await;
    }

    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }
}

async fn exchange(socket: &mut ReqSocket, action: ControlAction) -> Result<Bytes> {
    tokio::time::timeout(REQUEST_TIMEOUT, socket.request(&action.body()))
        .await
        .map_err(|_| Error::stream(format!("no reply to '{}'", action.as_str())))?
}

async fn run(
    mut socket: ReqSocket,
    mut requests: mpsc::Receiver<Request>,
    lost: watch::Sender<bool>,
    ping_interval: Duration,
) {
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(Request { action, reply }) = request else {
                    trace!("Control channel dropped; closing");
                    break;
                };
                let result = exchange(&mut socket, action).await;
                let failed = result.is_err();
                if let Err(e) = &result {
                    warn!("Video control '{}' failed: {}", action.as_str(), e);
                }
                let _ = reply.send(result);
                if failed {
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = exchange(&mut socket, ControlAction::Ping).await {
                    warn!("Video control ping failed: {}", e);
                    break;
                }
            }
        }
    }

    lost.send_replace(true);
}
