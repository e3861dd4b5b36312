//! iOS device provider
//!
//! Wires the configured backend, the device tracker and the control floor
//! together and runs until a signal or a fatal error arrives.

pub mod signals;

use std::sync::Arc;

use tokio::sync::mpsc;

use iprov_app::{DeviceContext, DeviceTracker, HttpControlFloor, Settings};
use iprov_core::prelude::*;
use iprov_core::types::BackendKind;
use iprov_daemon::{Bridge, FatalReporter, GoIosBridge, IosIfBridge, ProcessTable};

/// Run the provider with the backend `settings` selects
///
/// Returns the fatal error that stopped the provider, if any. Devices are
/// shut down in order either way.
pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let registry = Arc::new(ProcessTable::new());
    let (fatal, fatal_rx) = FatalReporter::channel();
    let config = settings.bridge_config();

    match settings.bridge.backend {
        BackendKind::IosIf => {
            let bridge = Arc::new(IosIfBridge::new(config, registry.clone(), fatal.clone()));
            serve(bridge, settings, registry, fatal, fatal_rx).await
        }
        BackendKind::GoIos => {
            let bridge = Arc::new(GoIosBridge::new(config, registry.clone(), fatal.clone()));
            serve(bridge, settings, registry, fatal, fatal_rx).await
        }
    }
}

async fn serve<B: Bridge>(
    bridge: Arc<B>,
    settings: Arc<Settings>,
    registry: Arc<ProcessTable>,
    fatal: FatalReporter,
    mut fatal_rx: mpsc::UnboundedReceiver<Error>,
) -> Result<()> {
    let control_floor = Arc::new(HttpControlFloor::new(&settings.control_floor)?);
    let ctx = Arc::new(DeviceContext::new(settings, control_floor, fatal));

    let mut tracker = DeviceTracker::new(bridge.clone(), ctx, registry)?;
    let handle = tracker.handle();
    tracker.start_detection()?;

    let present = bridge.list().await;
    info!(
        "{} device(s) present: {}",
        present.len(),
        present
            .iter()
            .map(|udid| censor_udid(udid))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let task = tracker.spawn();

    let outcome = tokio::select! {
        result = signals::wait_for_signal() => result,
        Some(err) = fatal_rx.recv() => Err(err),
    };

    handle.shutdown().await;
    if let Err(e) = task.await {
        warn!("Device tracker task failed: {}", e);
    }
    outcome
}
