use crate::can::bus::{CanBus, RawFrame};
use crate::catalog::{SensorDefinition, SensorRole};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Periodic diagnostic requests of one interface.
///
/// Every diagnostic sensor gets its own task; the handles stay here until [`stop`] so
/// no schedule is dropped while the interface runs. Internal sensors are never polled.
///
/// [`stop`]: RequestScheduler::stop
pub struct RequestScheduler {
    channel: String,
    tasks: Vec<JoinHandle<()>>,
}

impl RequestScheduler {
    pub fn start(bus: Arc<dyn CanBus>, sensors: &[SensorDefinition], extended: bool) -> Self {
        let channel = bus.channel().to_string();
        let tasks = sensors
            .iter()
            .filter(|sensor| sensor.role == SensorRole::Diagnostic)
            .map(|sensor| {
                let frame = RawFrame::new(sensor.request_id, extended, &sensor.request_payload());
                tokio::spawn(request_loop(bus.clone(), sensor.clone(), frame))
            })
            .collect::<Vec<_>>();

        debug!("{}: {} request schedules started", channel, tasks.len());
        Self { channel, tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("{}: request schedules stopped", self.channel);
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn request_loop(bus: Arc<dyn CanBus>, sensor: SensorDefinition, frame: RawFrame) {
    let mut ticker = tokio::time::interval(sensor.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_requested_time: Option<Instant> = None;

    loop {
        ticker.tick().await;
        match bus.send(&frame) {
            Ok(()) => {
                let now = Instant::now();
                if let Some(previous) = last_requested_time {
                    debug!(
                        "{} requested after {:?}",
                        sensor.name,
                        now.duration_since(previous)
                    );
                }
                last_requested_time = Some(now);
            }
            Err(e) => warn!("{}: request for {} failed: {}", bus.channel(), sensor.name, e),
        }
    }
}
