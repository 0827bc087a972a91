//! Frame reconstruction on the LIN byte stream
//!
//! The steering-wheel module has no framing on the UART side; a frame ends where the
//! sync byte follows a zero. The zero belongs to the sync artifact and is dropped.

use tracing::debug;

/// Upper bound of the accumulation buffer
pub const MAX_FRAME_BYTES: usize = 8;
/// Shortest frame accepted by validation
pub const MIN_FRAME_BYTES: usize = 6;
/// Length of the control lookup key
pub const KEY_LEN: usize = 5;

const IDLE_CODE_INDEX: usize = 5;

#[derive(Debug, Clone)]
pub struct FrameSynchronizer {
    sync: u8,
    buffer: Vec<u8>,
}

impl FrameSynchronizer {
    pub fn new(sync: u8) -> Self {
        Self {
            sync,
            buffer: Vec::with_capacity(MAX_FRAME_BYTES),
        }
    }

    /// Feeds one byte, returns the completed frame if this byte was a sync event.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        let n = self.buffer.len();

        if byte == self.sync && n > 2 && self.buffer[n - 1] == 0x00 {
            self.buffer.pop();
            let frame = std::mem::take(&mut self.buffer);
            self.buffer.reserve(MAX_FRAME_BYTES);
            return Some(frame);
        }

        if n == MAX_FRAME_BYTES {
            debug!("LIN buffer full without sync, discarding");
            self.buffer.clear();
        } else {
            self.buffer.push(byte);
        }
        None
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReject {
    ForeignModule(u8),
    IdleCode,
    TooShort(usize),
}

/// Acceptance rules for completed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameRules {
    pub module_id: u8,
    pub idle_code: u8,
}

impl FrameRules {
    /// Returns the lookup key of a valid frame
    pub fn validate(&self, frame: &[u8]) -> Result<[u8; KEY_LEN], FrameReject> {
        match frame.first() {
            Some(first) if *first == self.module_id => {}
            Some(first) => return Err(FrameReject::ForeignModule(*first)),
            None => return Err(FrameReject::TooShort(0)),
        }
        if frame.get(IDLE_CODE_INDEX) == Some(&self.idle_code) {
            return Err(FrameReject::IdleCode);
        }
        if frame.len() < MIN_FRAME_BYTES {
            return Err(FrameReject::TooShort(frame.len()));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&frame[..KEY_LEN]);
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(sync: &mut FrameSynchronizer, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|b| sync.push(*b)).collect()
    }

    #[test]
    fn sync_after_zero_completes_a_frame() {
        let mut sync = FrameSynchronizer::new(0x55);
        let frames = feed(&mut sync, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x55]);
        assert_eq!(frames, vec![vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06]]);
        assert_eq!(sync.buffered(), 0);
    }

    #[test]
    fn stream_without_sync_never_yields() {
        let mut sync = FrameSynchronizer::new(0x55);
        let bytes: Vec<u8> = (1..=40).collect();
        assert!(feed(&mut sync, &bytes).is_empty());
        assert!(sync.buffered() <= MAX_FRAME_BYTES);
    }

    #[test]
    fn sync_needs_a_preceding_zero_and_three_bytes() {
        let mut sync = FrameSynchronizer::new(0x55);
        // Only two bytes buffered: the sync byte is data
        assert!(feed(&mut sync, &[0x01, 0x00, 0x55]).is_empty());
        assert_eq!(sync.buffered(), 3);

        sync.reset();
        assert!(feed(&mut sync, &[0x01, 0x02, 0x03, 0x55]).is_empty());
    }

    #[test]
    fn consecutive_frames_resynchronize() {
        let mut sync = FrameSynchronizer::new(0x55);
        let stream = [
            0x80, 0x11, 0x22, 0x33, 0x44, 0x01, 0x00, 0x55, //
            0x80, 0x11, 0x22, 0x33, 0x44, 0x02, 0x00, 0x55,
        ];
        let frames = feed(&mut sync, &stream);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], vec![0x80, 0x11, 0x22, 0x33, 0x44, 0x02]);
    }

    #[test]
    fn validation_rules() {
        let rules = FrameRules {
            module_id: 0x80,
            idle_code: 0xC0,
        };
        assert_eq!(
            rules.validate(&[0x80, 0x11, 0x22, 0x33, 0x44, 0x01]),
            Ok([0x80, 0x11, 0x22, 0x33, 0x44])
        );
        assert_eq!(
            rules.validate(&[0x81, 0x11, 0x22, 0x33, 0x44, 0x01]),
            Err(FrameReject::ForeignModule(0x81))
        );
        assert_eq!(
            rules.validate(&[0x80, 0x11, 0x22, 0x33, 0x44, 0xC0]),
            Err(FrameReject::IdleCode)
        );
        assert_eq!(rules.validate(&[0x80, 0x11, 0x22]), Err(FrameReject::TooShort(3)));
    }
}
