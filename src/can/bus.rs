//! Bus handles
//!
//! [`CanBus`] is the seam between the transceiver and the hardware. SocketCAN is the real
//! backend; [`VirtualBus`] is an in-process bus for bench setups without hardware.

use crate::catalog::{InterfaceDefinition, Transport};
use crate::control::hex_string;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info};

pub const STANDARD_MASK: u32 = 0x7FF;
pub const EXTENDED_MASK: u32 = 0x1FFF_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to open {channel}: {source}")]
    Open {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport {0} is not available on this platform")]
    Unsupported(Transport),

    #[error("Invalid arbitration id 0x{0:X}")]
    InvalidId(u32),

    #[error("Payload of {0} bytes does not fit a frame")]
    PayloadTooLong(usize),

    #[error("Failed to install filters: {0}")]
    Filter(#[source] std::io::Error),

    #[error("Bus I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One frame as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Self {
        Self {
            id,
            extended,
            data: data.to_vec(),
        }
    }
}

/// Receive filter: pass ids where `frame_id & mask == id & mask`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFilter {
    pub id: u32,
    pub mask: u32,
}

impl IdFilter {
    /// Exact match on `id`, mask picked by id width
    pub fn exact(id: u32, extended: bool) -> Self {
        let mask = if extended { EXTENDED_MASK } else { STANDARD_MASK };
        Self { id, mask }
    }

    pub fn matches(&self, id: u32) -> bool {
        id & self.mask == self.id & self.mask
    }
}

/// A bus handle shared by one sender and one receiver.
/// `recv` returns `Ok(None)` when the timeout elapses without a frame.
pub trait CanBus: Send + Sync {
    fn channel(&self) -> &str;
    fn set_filters(&self, filters: &[IdFilter]) -> Result<(), BusError>;
    fn clear_filters(&self) -> Result<(), BusError>;
    fn send(&self, frame: &RawFrame) -> Result<(), BusError>;
    fn recv(&self, timeout: Duration) -> Result<Option<RawFrame>, BusError>;
}

/// Opens the handle for an interface definition
pub fn open(interface: &InterfaceDefinition) -> Result<Arc<dyn CanBus>, BusError> {
    debug!(
        "Opening {} ({}, configured bitrate {})",
        interface.channel, interface.transport, interface.bitrate
    );
    match interface.transport {
        #[cfg(target_os = "linux")]
        Transport::Socketcan => Ok(Arc::new(socket::SocketCanBus::open(&interface.channel)?)),
        #[cfg(not(target_os = "linux"))]
        Transport::Socketcan => Err(BusError::Unsupported(Transport::Socketcan)),
        Transport::Virtual => Ok(Arc::new(VirtualBus::new(&interface.channel))),
    }
}

#[cfg(target_os = "linux")]
mod socket {
    use super::{BusError, CanBus, IdFilter, RawFrame};
    use socketcan::{
        CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, SocketOptions,
        StandardId,
    };
    use std::io::ErrorKind;
    use std::sync::Mutex;
    use std::time::Duration;

    const EFF_FLAG: u32 = 0x8000_0000;

    /// SocketCAN handle. Bitrate is a property of the kernel link and is not changed here.
    pub struct SocketCanBus {
        channel: String,
        socket: CanSocket,
        read_timeout: Mutex<Option<Duration>>,
    }

    impl SocketCanBus {
        pub fn open(channel: &str) -> Result<Self, BusError> {
            let socket = CanSocket::open(channel).map_err(|source| BusError::Open {
                channel: channel.to_string(),
                source,
            })?;
            Ok(Self {
                channel: channel.to_string(),
                socket,
                read_timeout: Mutex::new(None),
            })
        }

        fn to_socket_frame(frame: &RawFrame) -> Result<CanFrame, BusError> {
            if frame.data.len() > 8 {
                return Err(BusError::PayloadTooLong(frame.data.len()));
            }
            let built = if frame.extended {
                let id = ExtendedId::new(frame.id).ok_or(BusError::InvalidId(frame.id))?;
                CanFrame::new(id, &frame.data)
            } else {
                let raw = u16::try_from(frame.id).map_err(|_| BusError::InvalidId(frame.id))?;
                let id = StandardId::new(raw).ok_or(BusError::InvalidId(frame.id))?;
                CanFrame::new(id, &frame.data)
            };
            built.ok_or(BusError::PayloadTooLong(frame.data.len()))
        }
    }

    impl CanBus for SocketCanBus {
        fn channel(&self) -> &str {
            &self.channel
        }

        fn set_filters(&self, filters: &[IdFilter]) -> Result<(), BusError> {
            let filters: Vec<CanFilter> = filters
                .iter()
                .map(|f| {
                    if f.mask > super::STANDARD_MASK {
                        CanFilter::new(f.id | EFF_FLAG, f.mask | EFF_FLAG)
                    } else {
                        CanFilter::new(f.id, f.mask)
                    }
                })
                .collect();
            self.socket.set_filters(&filters).map_err(BusError::Filter)
        }

        fn clear_filters(&self) -> Result<(), BusError> {
            self.socket
                .set_filter_accept_all()
                .map_err(BusError::Filter)
        }

        fn send(&self, frame: &RawFrame) -> Result<(), BusError> {
            let frame = Self::to_socket_frame(frame)?;
            self.socket.write_frame(&frame)?;
            Ok(())
        }

        fn recv(&self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
            if let Ok(mut current) = self.read_timeout.lock() {
                if *current != Some(timeout) {
                    self.socket.set_read_timeout(timeout)?;
                    *current = Some(timeout);
                }
            }

            match self.socket.read_frame() {
                Ok(frame) => Ok(Some(RawFrame {
                    id: frame.raw_id(),
                    extended: frame.is_extended(),
                    data: frame.data().to_vec(),
                })),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    Ok(None)
                }
                Err(e) => Err(BusError::Io(e)),
            }
        }
    }
}

#[derive(Debug, Default)]
struct VirtualState {
    inbound: VecDeque<RawFrame>,
    sent: Vec<RawFrame>,
    filters: Vec<IdFilter>,
}

/// In-process bus. Frames injected through a clone arrive at `recv`, filters apply.
#[derive(Debug, Clone)]
pub struct VirtualBus {
    channel: String,
    state: Arc<(Mutex<VirtualState>, Condvar)>,
}

impl VirtualBus {
    pub fn new(channel: &str) -> Self {
        info!("Virtual bus {} created", channel);
        Self {
            channel: channel.to_string(),
            state: Arc::new((Mutex::new(VirtualState::default()), Condvar::new())),
        }
    }

    pub fn inject(&self, frame: RawFrame) {
        let (lock, ready) = &*self.state;
        if let Ok(mut state) = lock.lock() {
            state.inbound.push_back(frame);
            ready.notify_all();
        }
    }

    pub fn sent(&self) -> Vec<RawFrame> {
        let (lock, _) = &*self.state;
        lock.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    pub fn filters(&self) -> Vec<IdFilter> {
        let (lock, _) = &*self.state;
        lock.lock().map(|s| s.filters.clone()).unwrap_or_default()
    }
}

impl CanBus for VirtualBus {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn set_filters(&self, filters: &[IdFilter]) -> Result<(), BusError> {
        let (lock, _) = &*self.state;
        if let Ok(mut state) = lock.lock() {
            state.filters = filters.to_vec();
        }
        Ok(())
    }

    fn clear_filters(&self) -> Result<(), BusError> {
        self.set_filters(&[])
    }

    fn send(&self, frame: &RawFrame) -> Result<(), BusError> {
        if frame.data.len() > 8 {
            return Err(BusError::PayloadTooLong(frame.data.len()));
        }
        debug!("{} tx {:03X} [{}]", self.channel, frame.id, hex_string(&frame.data));
        let (lock, _) = &*self.state;
        if let Ok(mut state) = lock.lock() {
            state.sent.push(frame.clone());
        }
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<RawFrame>, BusError> {
        let (lock, ready) = &*self.state;
        let Ok(guard) = lock.lock() else {
            return Ok(None);
        };
        let Ok((mut state, _)) = ready.wait_timeout_while(guard, timeout, |s| s.inbound.is_empty())
        else {
            return Ok(None);
        };

        while let Some(frame) = state.inbound.pop_front() {
            if state.filters.is_empty() || state.filters.iter().any(|f| f.matches(frame.id)) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_mask_follows_id_width() {
        assert_eq!(IdFilter::exact(0x7E8, false).mask, STANDARD_MASK);
        assert_eq!(IdFilter::exact(0x18DAF110, true).mask, EXTENDED_MASK);
        assert!(IdFilter::exact(0x7E8, false).matches(0x7E8));
        assert!(!IdFilter::exact(0x7E8, false).matches(0x7E9));
    }

    #[test]
    fn virtual_bus_applies_filters() {
        let bus = VirtualBus::new("vcan0");
        bus.set_filters(&[IdFilter::exact(0x600, false)]).unwrap();
        bus.inject(RawFrame::new(0x123, false, &[1]));
        bus.inject(RawFrame::new(0x600, false, &[2]));

        let frame = bus.recv(Duration::from_millis(10)).unwrap();
        assert_eq!(frame, Some(RawFrame::new(0x600, false, &[2])));
        assert_eq!(bus.recv(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn virtual_bus_records_sent_frames() {
        let bus = VirtualBus::new("vcan0");
        bus.send(&RawFrame::new(0x6F1, false, &[0xCC, 0x7A])).unwrap();
        assert!(bus.send(&RawFrame::new(0x6F1, false, &[0; 9])).is_err());
        assert_eq!(bus.sent().len(), 1);
    }
}
