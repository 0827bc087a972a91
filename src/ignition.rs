//! Ignition monitor
//!
//! Polls one GPIO input and publishes ignition on/off whenever it changes. Which level
//! means "off" is configurable, the wiring differs between harnesses.

use crate::config::{IgnitionSettings, OffLevel};
use crate::publish::{Publisher, StatusEvent};
use crate::supervisor::signals::{Signal, SignalSet};
use rppal::gpio::{Gpio, Level};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IgnitionError {
    #[error("GPIO pin {pin}: {source}")]
    Gpio {
        pin: u8,
        #[source]
        source: rppal::gpio::Error,
    },
}

pub fn is_on(level: Level, off_level: OffLevel) -> bool {
    match off_level {
        OffLevel::High => level == Level::Low,
        OffLevel::Low => level == Level::High,
    }
}

/// Change detector over the polled readings
#[derive(Debug, Default)]
pub struct IgnitionTracker {
    last: Option<bool>,
}

impl IgnitionTracker {
    /// Returns the new state when it differs from the previous reading
    pub fn update(&mut self, on: bool) -> Option<bool> {
        if self.last == Some(on) {
            return None;
        }
        self.last = Some(on);
        Some(on)
    }

    pub fn current(&self) -> Option<bool> {
        self.last
    }
}

/// Runs the monitor until the token is cancelled
pub async fn run(
    settings: IgnitionSettings,
    publisher: Publisher,
    signals: Arc<SignalSet>,
    token: CancellationToken,
) {
    let pin = match Gpio::new()
        .and_then(|gpio| gpio.get(settings.pin))
        .map(|pin| pin.into_input())
    {
        Ok(pin) => pin,
        Err(source) => {
            let e = IgnitionError::Gpio {
                pin: settings.pin,
                source,
            };
            error!("Ignition monitor disabled: {}", e);
            return;
        }
    };
    info!(
        "Monitoring ignition on GPIO {} (off = {:?})",
        settings.pin, settings.off_level
    );

    let mut tracker = IgnitionTracker::default();
    let mut ticker = tokio::time::interval(settings.poll_interval());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let on = is_on(pin.read(), settings.off_level);
                if let Some(on) = tracker.update(on) {
                    if on {
                        info!("Ignition on");
                    } else {
                        warn!("Ignition off");
                    }
                    publisher.status(StatusEvent::Ignition { on });
                }
                if signals.take(Signal::IgnitionQuery) {
                    publisher.status(StatusEvent::Ignition { on });
                }
            }
        }
    }
    info!("Ignition monitor stopped");
}
