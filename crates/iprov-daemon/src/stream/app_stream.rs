//! Per-device video session against the on-device video app
//!
//! [`AppStream::spawn`] runs a task that dials the control (REQ) and data
//! (PULL) connections and then loops over sessions, asking the app to start
//! broadcasting at the top of each one. Each session ends with a
//! [`SessionEnd`] code telling the task which connection to re-establish. A
//! lost control connection is also reported as [`DeviceEvent::VideoAppLost`]
//! so the device can relaunch the app.
//!
//! [`DeviceEvent::VideoAppLost`]: iprov_core::events::DeviceEvent::VideoAppLost

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::control::{ControlAction, ControlChannel};
use super::frame::{FrameConsumer, FrameHandler, Handled};
use super::sp::PullSocket;
use iprov_core::prelude::*;

/// Connection settings for one device's video app
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: IpAddr,
    /// Local port forwarded to the app's data socket
    pub video_port: u16,
    /// Local port forwarded to the app's control socket
    pub control_port: u16,
    /// Dial attempts before giving up on a connection
    pub connect_retries: u32,
    pub retry_delay: Duration,
    pub ping_interval: Duration,
    /// Data receive timeout; a timeout just loops
    pub recv_timeout: Duration,
    /// Local port forwarded to the app's log socket, relayed when set
    pub log_port: Option<u16>,
}

impl StreamConfig {
    pub fn new(video_port: u16, control_port: u16) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            video_port,
            control_port,
            connect_retries: 5,
            retry_delay: Duration::from_secs(1),
            ping_interval: Duration::from_secs(2),
            recv_timeout: Duration::from_secs(1),
            log_port: None,
        }
    }

    fn video_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.video_port)
    }

    fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.control_port)
    }

    fn log_addr(&self) -> Option<SocketAddr> {
        self.log_port.map(|port| SocketAddr::new(self.host, port))
    }
}

/// Commands accepted by a running stream
pub enum StreamControl {
    EnableForwarding,
    DisableForwarding,
    /// Ask the app for a single frame
    OneFrame,
    SetConsumer(Box<dyn FrameConsumer>),
    ClearConsumer,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// External stop; the stream is abandoned
    Stopped,
    DataLost,
    ControlLost,
    /// The consumer refused a frame; the app is told to stop sending
    ConsumerRejected,
}

/// Handle to a running [`AppStream`] task
pub struct AppStreamHandle {
    commands: mpsc::UnboundedSender<StreamControl>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AppStreamHandle {
    pub fn enable_forwarding(&self) {
        self.command(StreamControl::EnableForwarding);
    }

    pub fn disable_forwarding(&self) {
        self.command(StreamControl::DisableForwarding);
    }

    pub fn one_frame(&self) {
        self.command(StreamControl::OneFrame);
    }

    pub fn set_consumer(&self, consumer: impl FrameConsumer + 'static) {
        self.command(StreamControl::SetConsumer(Box::new(consumer)));
    }

    pub fn clear_consumer(&self) {
        self.command(StreamControl::ClearConsumer);
    }

    pub fn command(&self, command: StreamControl) {
        if self.commands.send(command).is_err() {
            debug!("Stream command dropped: stream has ended");
        }
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the stream and wait for its task to finish
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!("Stream task ended abnormally: {}", e);
        }
    }
}

pub struct AppStream {
    udid: String,
    config: StreamConfig,
    handler: FrameHandler,
    commands: mpsc::UnboundedReceiver<StreamControl>,
    stop: watch::Receiver<bool>,
}

impl AppStream {
    pub fn spawn(udid: impl Into<String>, config: StreamConfig, handler: FrameHandler) -> AppStreamHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (stop_tx, stop) = watch::channel(false);

        let stream = AppStream {
            udid: udid.into(),
            config,
            handler,
            commands,
            stop,
        };
        let task = tokio::spawn(stream.run());

        AppStreamHandle {
            commands: commands_tx,
            stop: stop_tx,
            task,
        }
    }

    async fn run(mut self) {
        let id = censor_udid(&self.udid);
        let mut control: Option<ControlChannel> = None;
        let mut data: Option<PullSocket> = None;

        let log_relay = self.config.log_addr().map(|addr| {
            let log_id = id.clone();
            tokio::spawn(relay_log(
                addr,
                self.config.connect_retries,
                self.config.retry_delay,
                move |line| debug!("[vidapp {}] {}", log_id, line),
            ))
        });

        loop {
            let channel = match control.take() {
                Some(channel) => channel,
                None => match self.connect_control().await {
                    Some(channel) => channel,
                    None => break,
                },
            };
            let mut socket = match data.take() {
                Some(socket) => socket,
                None => match self.connect_data().await {
                    Some(socket) => socket,
                    None => break,
                },
            };

            // Every session starts the broadcast so dimensions arrive even while discarding
            if let Err(e) = channel.send(ControlAction::Start).await {
                warn!("Could not start video app for {}: {}", id, e);
            }

            let end = self.session(&mut socket, &channel).await;
            debug!("Video session for {} ended: {:?}", id, end);

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::DataLost => {
                    self.handler.mark_down();
                    control = Some(channel);
                }
                SessionEnd::ControlLost => {
                    self.handler.control_lost();
                    data = Some(socket);
                }
                SessionEnd::ConsumerRejected => {
                    if let Err(e) = channel.send(ControlAction::Stop).await {
                        warn!("Could not pause video app for {}: {}", id, e);
                    }
                    control = Some(channel);
                    data = Some(socket);
                }
            }
        }

        if let Some(relay) = log_relay {
            relay.abort();
        }
        info!(
            "Video stream for {} finished after {} frames",
            id,
            self.handler.frames()
        );
    }

    async fn session(&mut self, data: &mut PullSocket, control: &ControlChannel) -> SessionEnd {
        let recv_timeout = self.config.recv_timeout;

        loop {
            tokio::select! {
                biased;

                _ = control.lost() => return SessionEnd::ControlLost,
                _ = stopped(&mut self.stop) => return SessionEnd::Stopped,
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return SessionEnd::Stopped;
                    };
                    if let Err(end) = self.apply(command, control).await {
                        return end;
                    }
                }
                received = tokio::time::timeout(recv_timeout, data.recv()) => match received {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        info!("Video data for {} lost: {}", censor_udid(&self.udid), e);
                        return SessionEnd::DataLost;
                    }
                    Ok(Ok(msg)) => {
                        if self.handler.handle(msg) == Handled::Rejected {
                            return SessionEnd::ConsumerRejected;
                        }
                    }
                },
            }
        }
    }

    async fn apply(&mut self, command: StreamControl, control: &ControlChannel) -> std::result::Result<(), SessionEnd> {
        let action = match command {
            StreamControl::EnableForwarding => {
                self.handler.set_discard(false);
                Some(ControlAction::Start)
            }
            StreamControl::DisableForwarding => {
                self.handler.set_discard(true);
                Some(ControlAction::Stop)
            }
            StreamControl::OneFrame => Some(ControlAction::OneFrame),
            StreamControl::SetConsumer(consumer) => {
                self.handler.set_consumer(consumer);
                // A new consumer gets a frame right away
                Some(ControlAction::OneFrame)
            }
            StreamControl::ClearConsumer => {
                self.handler.clear_consumer();
                None
            }
        };

        match action {
            Some(action) => control
                .send(action)
                .await
                .map(|_| ())
                .map_err(|_| SessionEnd::ControlLost),
            None => Ok(()),
        }
    }

    async fn connect_control(&mut self) -> Option<ControlChannel> {
        let addr = self.config.control_addr();
        let ping = self.config.ping_interval;
        let channel = self
            .retry("control", || ControlChannel::connect(addr, ping))
            .await?;
        info!("Video control connected for {}", censor_udid(&self.udid));
        Some(channel)
    }

    async fn connect_data(&mut self) -> Option<PullSocket> {
        let addr = self.config.video_addr();
        let socket = self.retry("data", || PullSocket::dial(addr)).await?;
        info!("Video data connected for {}", censor_udid(&self.udid));
        Some(socket)
    }

    /// Dial with a fixed delay between attempts. `None` when stopped or out
    /// of attempts.
    async fn retry<T, F, Fut>(&mut self, what: &str, mut dial: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.config.connect_retries.max(1);
        for attempt in 1..=attempts {
            if *self.stop.borrow() {
                return None;
            }

            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return None,
                result = dial() => match result {
                    Ok(conn) => return Some(conn),
                    Err(e) => debug!(
                        "Video {} dial {}/{} for {} failed: {}",
                        what,
                        attempt,
                        attempts,
                        censor_udid(&self.udid),
                        e
                    ),
                },
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = stopped(&mut self.stop) => return None,
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
        }

        warn!(
            "Giving up on video {} connection for {} after {} attempts",
            what,
            censor_udid(&self.udid),
            attempts
        );
        None
    }
}

/// Pass each line the app writes to its log socket to `on_line` until the
/// socket closes. Gives up quietly when the socket never answers.
async fn relay_log(addr: SocketAddr, attempts: u32, delay: Duration, mut on_line: impl FnMut(&str)) {
    let attempts = attempts.max(1);
    let mut socket = None;
    for attempt in 1..=attempts {
        match PullSocket::dial(addr).await {
            Ok(conn) => {
                socket = Some(conn);
                break;
            }
            Err(e) => debug!("Video app log dial {}/{} to {} failed: {}", attempt, attempts, addr, e),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    let Some(mut socket) = socket else {
        warn!("Video app log at {} unavailable", addr);
        return;
    };

    debug!("Video app log connected at {}", addr);
    while let Ok(msg) = socket.recv().await {
        for line in String::from_utf8_lossy(&msg).lines() {
            on_line(line);
        }
    }
    debug!("Video app log at {} closed", addr);
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped handle counts as a stop
    let _ = stop.wait_for(|s| *s).await;
}
