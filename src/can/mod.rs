//! CAN bus transceiver
//!
//! Owns one bus handle per enabled interface. Each interface runs a request scheduler
//! for its diagnostic sensors and a blocking receive loop that feeds the dispatcher.
//!
//! # State Machine
//!
//! ```text
//! Configured ──start──► Running ──stop──► Stopped
//! ```
//!
//! # Architecture
//!
//! ```text
//!             ┌─► RequestScheduler ──► bus.send ─────────────┐
//! interface ──┤                                              ▼
//!             └─► receive loop ◄── bus.recv (filtered) ◄── CAN
//!                      │
//!                      ▼
//!                CanDispatcher ──► Publisher (telemetry, control)
//!                      └─────────► input machine (ControlSignal)
//! ```

pub mod bus;
pub mod dispatch;
pub mod scheduler;

pub use bus::{BusError, CanBus, IdFilter, RawFrame, VirtualBus};
pub use dispatch::{CanDispatcher, ControlDecoder, DecodeError, Decoded};
pub use scheduler::RequestScheduler;

use crate::catalog::{InterfaceDefinition, SensorCatalog};
use crate::config::CanSettings;
use crate::input::ControlSignal;
use crate::publish::{Publisher, StatusEvent};
use statum::{machine, state};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receive timeout, bounds how long a receive loop takes to notice its stop flag
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
/// Pause after a failed receive before the next attempt
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[state]
#[derive(Debug, Clone)]
pub enum TransceiverState {
    Configured,
    Running,
    Stopped,
}

/// One opened interface with its workers
struct InterfaceWorker {
    channel: String,
    bus: Arc<dyn CanBus>,
    scheduler: RequestScheduler,
    stop: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
}

#[machine]
pub struct CanTransceiver<S: TransceiverState> {
    catalog: SensorCatalog,
    control: Option<(String, ControlDecoder)>,
    publisher: Publisher,
    control_tx: mpsc::Sender<ControlSignal>,
    workers: Vec<InterfaceWorker>,
}

impl<S: TransceiverState> CanTransceiver<S> {
    pub fn interface_count(&self) -> usize {
        self.workers.len()
    }
}

impl CanTransceiver<Configured> {
    pub fn configure(
        settings: &CanSettings,
        publisher: Publisher,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Self {
        let catalog = SensorCatalog::load(settings);

        let control = match settings.control_settings() {
            None => None,
            Some(Err(e)) => {
                error!("Control decoding disabled, malformed [controls]: {}", e.message());
                None
            }
            Some(Ok(controls)) if !controls.enabled => None,
            Some(Ok(controls)) => match ControlDecoder::from_settings(&controls) {
                Ok(decoder) => {
                    info!(
                        "Control decoding on {} at 0x{:X}",
                        controls.interface, decoder.reply_id
                    );
                    Some((controls.interface, decoder))
                }
                Err(e) => {
                    error!("Control decoding disabled: {}", e);
                    None
                }
            },
        };

        Self::new(catalog, control, publisher, control_tx, Vec::new())
    }

    pub fn start(self) -> CanTransceiver<Running> {
        self.start_with(bus::open)
    }

    /// Opens every interface through `open`. An interface that fails to open is logged
    /// and left out.
    pub fn start_with<F>(mut self, open: F) -> CanTransceiver<Running>
    where
        F: Fn(&InterfaceDefinition) -> Result<Arc<dyn CanBus>, BusError>,
    {
        let interfaces = self.catalog.interfaces().to_vec();
        for interface in &interfaces {
            let bus = match open(interface) {
                Ok(bus) => bus,
                Err(e) => {
                    error!("Skipping interface {}: {}", interface.channel, e);
                    self.publisher.status(StatusEvent::Connection {
                        module: format!("can/{}", interface.channel),
                        connected: false,
                    });
                    continue;
                }
            };
            match self.start_interface(interface, bus) {
                Ok(worker) => self.workers.push(worker),
                Err(e) => error!("Skipping interface {}: {}", interface.channel, e),
            }
        }

        info!(
            "CAN transceiver running on {} of {} interfaces",
            self.workers.len(),
            interfaces.len()
        );
        self.transition()
    }

    fn start_interface(
        &self,
        interface: &InterfaceDefinition,
        bus: Arc<dyn CanBus>,
    ) -> Result<InterfaceWorker, BusError> {
        let channel = interface.channel.clone();
        let sensors = self.catalog.sensors_for(&channel);
        let by_reply = self.catalog.sensors_by_reply(&channel);

        let control = self
            .control
            .as_ref()
            .filter(|(control_channel, _)| *control_channel == channel)
            .map(|(_, decoder)| decoder.clone());

        let mut reply_ids: BTreeSet<u32> = by_reply.keys().copied().collect();
        if let Some(decoder) = &control {
            reply_ids.insert(decoder.reply_id);
        }
        let filters: Vec<IdFilter> = reply_ids
            .iter()
            .map(|id| IdFilter::exact(*id, interface.is_extended))
            .collect();
        bus.set_filters(&filters)?;
        debug!("{}: filters installed for {:X?}", channel, reply_ids);

        let scheduler = RequestScheduler::start(bus.clone(), sensors, interface.is_extended);

        let dispatcher = CanDispatcher::new(
            &channel,
            by_reply,
            control,
            self.publisher.clone(),
            self.control_tx.clone(),
        );
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = {
            let bus = bus.clone();
            let stop = stop.clone();
            tokio::task::spawn_blocking(move || receive_loop(bus, dispatcher, stop))
        };

        info!(
            "{}: {} sensors, {} scheduled requests",
            channel,
            sensors.len(),
            scheduler.len()
        );
        Ok(InterfaceWorker {
            channel,
            bus,
            scheduler,
            stop,
            receiver,
        })
    }
}

impl CanTransceiver<Running> {
    /// Stops schedulers and receive loops, removes filters and releases the handles
    pub async fn stop(mut self) -> CanTransceiver<Stopped> {
        for mut worker in self.workers.drain(..) {
            worker.scheduler.stop();
            worker.stop.store(true, Ordering::SeqCst);

            match tokio::time::timeout(RECV_TIMEOUT * 5, worker.receiver).await {
                Ok(Ok(())) => debug!("{}: receive loop finished", worker.channel),
                Ok(Err(e)) => error!("{}: receive loop panicked: {}", worker.channel, e),
                Err(_) => warn!(
                    "{}: receive loop did not finish in time, handle stays open until it exits",
                    worker.channel
                ),
            }

            if let Err(e) = worker.bus.clear_filters() {
                warn!("{}: failed to clear filters: {}", worker.channel, e);
            }
            drop(worker.bus);
            info!("{}: stopped", worker.channel);
        }
        self.transition()
    }
}

fn receive_loop(bus: Arc<dyn CanBus>, dispatcher: CanDispatcher, stop: Arc<AtomicBool>) {
    debug!("{}: receive loop started", bus.channel());

    while !stop.load(Ordering::SeqCst) {
        match bus.recv(RECV_TIMEOUT) {
            Ok(Some(frame)) => dispatcher.dispatch(&frame),
            Ok(None) => {}
            Err(e) => {
                error!("{}: receive failed: {}", bus.channel(), e);
                std::thread::sleep(RECV_ERROR_BACKOFF);
            }
        }
    }

    debug!("{}: receive loop terminated", bus.channel());
}

/// Runs the CAN module until the token is cancelled
pub async fn run(
    settings: CanSettings,
    publisher: Publisher,
    control_tx: mpsc::Sender<ControlSignal>,
    token: CancellationToken,
) {
    let running = CanTransceiver::configure(&settings, publisher, control_tx).start();
    token.cancelled().await;
    running.stop().await;
}
