//! MOST ring-bus adapter
//!
//! Finds the adapter by USB vendor id, reads its packet stream and publishes decoded
//! messages. Losing the port drops back to periodic rediscovery.

pub mod protocol;

pub use protocol::{MostMessage, PacketDecoder};

use crate::config::MostSettings;
use crate::publish::{Outbound, Publisher, StatusEvent};
use crate::supervisor::signals::{Signal, SignalSet};
use serialport::SerialPortType;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum RingBusError {
    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),

    #[error("No adapter with vendor id 0x{0:04X}")]
    NotFound(u16),

    #[error("Failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Adapter I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte stream to the adapter
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send> Link for T {}

/// Port name of the first adapter with a matching USB vendor id
pub fn find_port(vendor_id: u16) -> Result<String, RingBusError> {
    let ports = serialport::available_ports().map_err(RingBusError::Enumerate)?;
    ports
        .into_iter()
        .find(|port| matches!(&port.port_type, SerialPortType::UsbPort(usb) if usb.vid == vendor_id))
        .map(|port| port.port_name)
        .ok_or(RingBusError::NotFound(vendor_id))
}

fn open_adapter(settings: &MostSettings) -> Result<Box<dyn Link>, RingBusError> {
    let port = find_port(settings.vendor_id)?;
    let serial = serialport::new(&port, settings.baudrate)
        .timeout(settings.read_timeout())
        .open()
        .map_err(|source| RingBusError::Open {
            port: port.clone(),
            source,
        })?;
    info!("MOST adapter found on {}", port);
    Ok(Box::new(serial))
}

/// Connection to the adapter plus the packet decoder
pub struct RingBusDecoder {
    link: Option<Box<dyn Link>>,
    decoder: PacketDecoder,
    publisher: Publisher,
}

impl RingBusDecoder {
    pub fn new(publisher: Publisher) -> Self {
        Self {
            link: None,
            decoder: PacketDecoder::new(),
            publisher,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn attach(&mut self, link: Box<dyn Link>) {
        self.decoder.reset();
        self.link = Some(link);
        self.publisher.status(StatusEvent::Connection {
            module: "most".to_string(),
            connected: true,
        });
    }

    fn detach(&mut self) {
        self.link = None;
        self.decoder.reset();
        self.publisher.status(StatusEvent::Connection {
            module: "most".to_string(),
            connected: false,
        });
    }

    /// Sends the force-switch packet. Only possible while connected.
    pub fn force_switch(&mut self) {
        let Some(link) = self.link.as_mut() else {
            error!("MOST adapter not connected, cannot force switch");
            return;
        };
        info!("Forcing MOST source switch");
        if let Err(e) = link.write_all(&protocol::FORCE_SWITCH) {
            error!("Force switch failed: {}", e);
            self.detach();
        }
    }

    /// One bounded read. Returns the number of messages published. An I/O failure
    /// drops the connection.
    pub fn poll(&mut self, buffer: &mut [u8]) -> usize {
        let Some(link) = self.link.as_mut() else {
            return 0;
        };

        let read = match link.read(buffer) {
            Ok(0) => return 0,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => return 0,
            Err(e) => {
                error!("MOST adapter disconnected: {}", e);
                self.detach();
                return 0;
            }
        };

        let mut published = 0;
        for result in self.decoder.feed(&buffer[..read]) {
            match result {
                Ok(message) => {
                    debug!("MOST message from fblock 0x{:02X}", message.fblock_id);
                    self.publisher.publish(Outbound::Most(message));
                    published += 1;
                }
                Err(e) => warn!("Dropping MOST message: {}", e),
            }
        }
        published
    }
}

/// Runs the MOST module until the token is cancelled
pub async fn run(
    settings: MostSettings,
    publisher: Publisher,
    signals: Arc<SignalSet>,
    token: CancellationToken,
) {
    if !settings.enabled {
        info!("MOST disabled in settings");
        return;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || poll_loop(settings, publisher, signals, stop))
    };

    token.cancelled().await;
    stop.store(true, Ordering::SeqCst);
    match worker.await {
        Ok(()) => info!("MOST reader stopped"),
        Err(e) => error!("MOST reader panicked: {}", e),
    }
}

fn poll_loop(
    settings: MostSettings,
    publisher: Publisher,
    signals: Arc<SignalSet>,
    stop: Arc<AtomicBool>,
) {
    let mut ring = RingBusDecoder::new(publisher.clone());
    let mut buffer = [0u8; 256];
    let mut failed_attempts = 0u32;
    let mut next_discovery = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if signals.take(Signal::MostForceSwitch) {
            ring.force_switch();
        }

        if ring.is_connected() {
            ring.poll(&mut buffer);
            if !ring.is_connected() {
                next_discovery = Instant::now() + settings.rediscover_interval();
            }
            continue;
        }

        if Instant::now() < next_discovery {
            std::thread::sleep(STOP_POLL);
            continue;
        }

        match open_adapter(&settings) {
            Ok(link) => {
                failed_attempts = 0;
                ring.attach(link);
            }
            Err(e) => {
                failed_attempts += 1;
                if failed_attempts == settings.max_connect_attempts {
                    error!("{} after {} attempts, still retrying", e, failed_attempts);
                    publisher.status(StatusEvent::Connection {
                        module: "most".to_string(),
                        connected: false,
                    });
                } else {
                    debug!("MOST discovery attempt {}: {}", failed_attempts, e);
                }
                next_discovery = Instant::now() + settings.rediscover_interval();
            }
        }
    }
}
