//! LIN steering-wheel reader
//!
//! Reads the UART of the LIN transceiver byte by byte (or replays a recorded trace),
//! rebuilds frames with [`FrameSynchronizer`] and resolves them through the control
//! mapping. Resolved identifiers go to the input machine and the publisher.

pub mod frame;

pub use frame::{FrameReject, FrameRules, FrameSynchronizer};

use crate::config::{parse_hex_byte, LinSettings};
use crate::control::{hex_string, ControlMapping};
use crate::input::ControlSignal;
use crate::publish::{ControlSource, Publisher, StatusEvent};
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const OPEN_ATTEMPTS: u32 = 5;
const OPEN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LinError {
    #[error("Invalid {field} in lin settings: {value:?}")]
    InvalidSetting { field: &'static str, value: String },

    #[error("Serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Replay trace {path}: {source}")]
    Replay {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid byte {token:?} on trace line {line}")]
    TraceSyntax { line: usize, token: String },
}

/// Byte-level LIN decoder: synchronizer, frame rules and mapping in one place
pub struct LinDecoder {
    synchronizer: FrameSynchronizer,
    rules: FrameRules,
    mapping: ControlMapping,
    publisher: Publisher,
    control_tx: mpsc::Sender<ControlSignal>,
}

impl LinDecoder {
    pub fn from_settings(
        settings: &LinSettings,
        publisher: Publisher,
        control_tx: mpsc::Sender<ControlSignal>,
    ) -> Result<Self, LinError> {
        let byte = |field: &'static str, value: &str| {
            parse_hex_byte(value).ok_or_else(|| LinError::InvalidSetting {
                field,
                value: value.to_string(),
            })
        };
        let sync = byte("sync_id", &settings.sync_id)?;
        let rules = FrameRules {
            module_id: byte("swm_id", &settings.swm_id)?,
            idle_code: byte("zero_code", &settings.zero_code)?,
        };
        let mapping =
            ControlMapping::from_tables(&settings.commands.button, &settings.commands.joystick);

        Ok(Self {
            synchronizer: FrameSynchronizer::new(sync),
            rules,
            mapping,
            publisher,
            control_tx,
        })
    }

    pub fn push(&mut self, byte: u8) {
        if let Some(frame) = self.synchronizer.push(byte) {
            self.handle_frame(&frame);
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let key = match self.rules.validate(frame) {
            Ok(key) => key,
            Err(FrameReject::IdleCode) => {
                self.forward(ControlSignal::Idle {
                    source: ControlSource::Lin,
                });
                return;
            }
            Err(reject) => {
                debug!("LIN frame [{}] rejected: {:?}", hex_string(frame), reject);
                return;
            }
        };

        match self.mapping.lookup(&key) {
            Some(id) => {
                self.publisher.control(ControlSource::Lin, id);
                self.forward(ControlSignal::Decoded {
                    source: ControlSource::Lin,
                    id,
                });
            }
            None => {
                debug!("Unrecognized LIN command [{}]", hex_string(&key));
                self.forward(ControlSignal::Idle {
                    source: ControlSource::Lin,
                });
            }
        }
    }

    fn forward(&self, signal: ControlSignal) {
        if let Err(e) = self.control_tx.try_send(signal) {
            debug!("Control signal dropped: {}", e);
        }
    }
}

/// Parses a text trace: hex bytes separated by whitespace, any number per line
pub fn parse_trace(text: &str) -> Result<Vec<u8>, LinError> {
    let mut bytes = Vec::new();
    for (index, line) in text.lines().enumerate() {
        for token in line.split_whitespace() {
            let byte = parse_hex_byte(token).ok_or_else(|| LinError::TraceSyntax {
                line: index + 1,
                token: token.to_string(),
            })?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

/// Runs the LIN module until the token is cancelled
pub async fn run(
    settings: LinSettings,
    publisher: Publisher,
    control_tx: mpsc::Sender<ControlSignal>,
    token: CancellationToken,
) {
    let decoder = match LinDecoder::from_settings(&settings, publisher.clone(), control_tx) {
        Ok(decoder) => decoder,
        Err(e) => {
            error!("LIN disabled: {}", e);
            return;
        }
    };

    if let Some(path) = settings.replay.clone() {
        let pacing = Duration::from_millis(settings.replay_interval_ms);
        if let Err(e) = replay(&path, pacing, decoder, token).await {
            error!("{}", e);
        }
        return;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let stop = stop.clone();
        let port = settings.port.clone();
        let baudrate = settings.baudrate;
        tokio::task::spawn_blocking(move || serial_loop(&port, baudrate, decoder, publisher, stop))
    };

    token.cancelled().await;
    stop.store(true, Ordering::SeqCst);
    match tokio::time::timeout(READ_TIMEOUT * 5, reader).await {
        Ok(Ok(())) => info!("LIN reader stopped"),
        Ok(Err(e)) => error!("LIN reader panicked: {}", e),
        Err(_) => warn!("LIN reader did not stop in time"),
    }
}

/// Feeds a recorded trace byte by byte with fixed pacing
pub async fn replay(
    path: &Path,
    pacing: Duration,
    mut decoder: LinDecoder,
    token: CancellationToken,
) -> Result<(), LinError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LinError::Replay {
            path: path.display().to_string(),
            source,
        })?;
    let bytes = parse_trace(&text)?;
    info!("Replaying {} LIN bytes from {}", bytes.len(), path.display());

    let mut ticker = tokio::time::interval(pacing);
    for byte in bytes {
        tokio::select! {
            _ = token.cancelled() => {
                info!("LIN replay cancelled");
                return Ok(());
            }
            _ = ticker.tick() => decoder.push(byte),
        }
    }

    info!("LIN replay finished");
    Ok(())
}

fn open_port(port: &str, baudrate: u32, stop: &AtomicBool) -> Option<Box<dyn serialport::SerialPort>> {
    let mut backoff = OPEN_BACKOFF;
    for attempt in 1..=OPEN_ATTEMPTS {
        if stop.load(Ordering::SeqCst) {
            return None;
        }
        match serialport::new(port, baudrate).timeout(READ_TIMEOUT).open() {
            Ok(serial) => {
                info!("LIN port {} open at {} baud", port, baudrate);
                return Some(serial);
            }
            Err(source) => {
                let e = LinError::Serial {
                    port: port.to_string(),
                    source,
                };
                warn!("Attempt {}/{}: {}", attempt, OPEN_ATTEMPTS, e);
            }
        }
        sleep_unless_stopped(backoff, stop);
        backoff *= 2;
    }
    None
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = READ_TIMEOUT;
    let mut slept = Duration::ZERO;
    while slept < total && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(step);
        slept += step;
    }
}

fn serial_loop(
    port: &str,
    baudrate: u32,
    mut decoder: LinDecoder,
    publisher: Publisher,
    stop: Arc<AtomicBool>,
) {
    let mut buffer = [0u8; 64];

    while !stop.load(Ordering::SeqCst) {
        let Some(mut serial) = open_port(port, baudrate, &stop) else {
            if !stop.load(Ordering::SeqCst) {
                error!("LIN port {} unavailable, giving up", port);
                publisher.status(StatusEvent::Connection {
                    module: "lin".to_string(),
                    connected: false,
                });
            }
            return;
        };

        while !stop.load(Ordering::SeqCst) {
            match serial.read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => buffer[..n].iter().for_each(|b| decoder.push(*b)),
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => {
                    error!("LIN serial error: {}", e);
                    break;
                }
            }
        }
    }
}
