//! Device registry and top-level event dispatch
//!
//! [`DeviceTracker`] owns every [`Device`], the port pool and the process
//! registry. A single task consumes [`TrackerEvent`]s in order; anything
//! slow (provisioning, teardown, frame fetches) runs in per-device or
//! per-request tasks so the dispatcher never stalls.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::control_floor::{ControlFloor, Notification};
use crate::device::{Device, DeviceContext, Lifecycle};
use crate::port_pool::PortPool;
use iprov_core::events::{BridgeEvent, DeviceEvent, FirstFrame};
use iprov_core::prelude::*;
use iprov_core::types::PortSet;
use iprov_daemon::{Bridge, ProcessHandle, ProcessRegistry, ProcessTable};

/// Requests handled by the tracker task
#[derive(Debug)]
pub enum TrackerEvent {
    Connect {
        udid: String,
        name: String,
    },
    Disconnect {
        udid: String,
    },
    /// Stop everything; `reply` fires once all devices are torn down
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    FirstFrame(FirstFrame),
    /// One backup-video frame; empty when unavailable
    BackupFrame {
        udid: String,
        reply: oneshot::Sender<Bytes>,
    },
    Status {
        reply: oneshot::Sender<Vec<DeviceStatus>>,
    },
}

/// Snapshot of one tracked device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub udid: String,
    pub name: String,
    pub connected: bool,
    pub lifecycle: Lifecycle,
    pub ports: PortSet,
}

/// Cloneable sender side of a running tracker
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: mpsc::UnboundedSender<TrackerEvent>,
}

impl TrackerHandle {
    pub fn connect(&self, udid: impl Into<String>, name: impl Into<String>) {
        self.send(TrackerEvent::Connect {
            udid: udid.into(),
            name: name.into(),
        });
    }

    pub fn disconnect(&self, udid: impl Into<String>) {
        self.send(TrackerEvent::Disconnect { udid: udid.into() });
    }

    /// Shut the provider down and wait until it is done
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        self.send(TrackerEvent::Shutdown { reply });
        if done.await.is_err() {
            debug!("Tracker already stopped");
        }
    }

    /// Forward a `FIRSTFRAME{...}` notification line to its device.
    /// Returns false when the line is not a first-frame notification.
    pub fn route_first_frame(&self, line: &str) -> bool {
        match FirstFrame::parse_line(line) {
            Some(frame) => {
                self.send(TrackerEvent::FirstFrame(frame));
                true
            }
            None => false,
        }
    }

    /// One frame from the device's backup video server
    pub async fn backup_frame(&self, udid: impl Into<String>) -> Bytes {
        let (reply, frame) = oneshot::channel();
        self.send(TrackerEvent::BackupFrame {
            udid: udid.into(),
            reply,
        });
        frame.await.unwrap_or_default()
    }

    /// All tracked devices; empty once the tracker has stopped
    pub async fn devices(&self) -> Vec<DeviceStatus> {
        let (reply, status) = oneshot::channel();
        self.send(TrackerEvent::Status { reply });
        status.await.unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, event: TrackerEvent) {
        if self.tx.send(event).is_err() {
            debug!("Tracker event dropped: tracker has stopped");
        }
    }
}

/// Registry of devices for one bridge
pub struct DeviceTracker<B: Bridge, C> {
    bridge: Arc<B>,
    ctx: Arc<DeviceContext<C>>,
    registry: Arc<ProcessTable>,
    ports: PortPool,
    devices: HashMap<String, Arc<Device<B::Device>>>,
    events: mpsc::UnboundedReceiver<TrackerEvent>,
    handle: TrackerHandle,
    detection: Option<ProcessHandle>,
}

impl<B, C> DeviceTracker<B, C>
where
    B: Bridge,
    C: ControlFloor + Sync + 'static,
{
    /// `registry` must be the one the bridge starts its processes in
    pub fn new(bridge: Arc<B>, ctx: Arc<DeviceContext<C>>, registry: Arc<ProcessTable>) -> Result<Self> {
        let (min, max) = ctx.settings.port_range()?;
        let (tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            bridge,
            ctx,
            registry,
            ports: PortPool::new(min, max),
            devices: HashMap::new(),
            events,
            handle: TrackerHandle { tx },
            detection: None,
        })
    }

    pub fn handle(&self) -> TrackerHandle {
        self.handle.clone()
    }

    /// Start the backend device listener and feed its events to the tracker
    pub fn start_detection(&mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<BridgeEvent>();
        let detection = self.bridge.start_detection(tx)?;
        info!("Watching for devices via {}", self.bridge.kind());

        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    BridgeEvent::Attached { udid, name } => handle.connect(udid, name),
                    BridgeEvent::Detached { udid } => handle.disconnect(udid),
                }
            }
        });

        self.detection = Some(detection);
        Ok(())
    }

    /// Run the dispatcher on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            match event {
                TrackerEvent::Connect { udid, name } => self.on_connect(udid, name),
                TrackerEvent::Disconnect { udid } => self.on_disconnect(&udid),
                TrackerEvent::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
                TrackerEvent::FirstFrame(frame) => self.on_first_frame(frame),
                TrackerEvent::BackupFrame { udid, reply } => self.on_backup_frame(&udid, reply),
                TrackerEvent::Status { reply } => {
                    let _ = reply.send(self.status());
                }
            }
        }
        debug!("Device tracker stopped");
    }

    fn on_connect(&mut self, udid: String, name: String) {
        let id = censor_udid(&udid);
        if !self.ctx.settings.allows(&udid) {
            debug!("Ignoring {}: not in id list", id);
            return;
        }
        if self.registry.is_shutting_down() {
            debug!("Ignoring {}: shutting down", id);
            return;
        }

        if let Some(device) = self.devices.get(&udid) {
            if device.is_connected() {
                debug!("{} already connected", id);
            } else {
                info!("Device {} reconnected", id);
                device.connect(self.bridge.attach(&udid, &name));
            }
            return;
        }

        let stream = &self.ctx.settings.stream;
        let ports = match self
            .ports
            .allocate_set(stream.backup_video, stream.log_device_port.is_some())
        {
            Ok(ports) => ports,
            Err(e) => {
                self.ctx.fatal.report(e);
                return;
            }
        };
        info!("Device {} ({}) attached, ports {:?}", id, name, ports.all());

        let device = Device::spawn(udid.clone(), name.clone(), ports, self.ctx.clone());
        device.connect(self.bridge.attach(&udid, &name));
        self.devices.insert(udid, device);
    }

    fn on_disconnect(&mut self, udid: &str) {
        let Some(device) = self.devices.get(udid) else {
            debug!("Disconnect for unknown device {}", censor_udid(udid));
            return;
        };
        if device.is_connected() {
            info!("Device {} detached", censor_udid(udid));
            device.disconnect();
        }
        self.bridge.detach(udid);
    }

    fn on_first_frame(&self, frame: FirstFrame) {
        let delivered = self.devices.get(&frame.uuid).is_some_and(|device| {
            device.send_event(DeviceEvent::StreamUp {
                width: frame.width,
                height: frame.height,
            })
        });
        if !delivered {
            warn!("First frame for {} not delivered", censor_udid(&frame.uuid));
        }
    }

    fn on_backup_frame(&self, udid: &str, reply: oneshot::Sender<Bytes>) {
        let server = self.devices.get(udid).and_then(|d| d.backup_video());
        tokio::spawn(async move {
            let frame = match server {
                Some(server) => server.get_frame().await,
                None => Bytes::new(),
            };
            let _ = reply.send(frame);
        });
    }

    fn status(&self) -> Vec<DeviceStatus> {
        let mut status: Vec<DeviceStatus> = self
            .devices
            .values()
            .map(|d| DeviceStatus {
                udid: d.udid().to_string(),
                name: d.name().to_string(),
                connected: d.is_connected(),
                lifecycle: d.lifecycle(),
                ports: *d.ports(),
            })
            .collect();
        status.sort_by(|a, b| a.udid.cmp(&b.udid));
        status
    }

    async fn shutdown(&mut self) {
        info!("Shutting down {} devices", self.devices.len());
        self.registry.begin_shutdown();
        if let Some(detection) = self.detection.take() {
            detection.stop();
        }

        for udid in self.devices.keys() {
            self.ctx
                .control_floor
                .notify(Notification::ProvisionStopped { udid: udid.clone() })
                .await;
        }

        // Killing the helpers first releases workers waiting on them
        self.registry.stop_all().await;
        join_all(self.devices.values().map(|device| device.teardown())).await;

        for (udid, device) in self.devices.drain() {
            self.bridge.detach(&udid);
            self.ports.release_set(device.ports());
        }
        info!("Shutdown complete");
    }
}
