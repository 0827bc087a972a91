//! Wire protocol of the MOST interface adapter
//!
//! Every packet is a 3-byte header followed by the payload:
//!
//! ```text
//! 0x55 | len | type | payload[len]
//! ```
//!
//! Only type `0x01` (a received MOST message) is decoded. Its payload starts with eight
//! big-endian header bytes, the rest is the opaque message body.

use serde::Serialize;
use tracing::debug;

pub const SYNC: u8 = 0x55;
pub const TYPE_MESSAGE: u8 = 0x01;
/// Bytes of the message header inside a type `0x01` payload
pub const MESSAGE_HEADER_LEN: usize = 8;

/// Packet that asks the adapter to force the ring into its own source
pub const FORCE_SWITCH: [u8; 3] = [SYNC, 0x01, 0x74];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Message payload too short: {0} bytes")]
    TooShort(usize),
}

/// A decoded MOST control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MostMessage {
    #[serde(rename = "type")]
    pub msg_type: u8,
    pub source_address_high: u8,
    pub source_address_low: u8,
    #[serde(rename = "fBlock_id")]
    pub fblock_id: u8,
    pub instance_id: u8,
    /// Upper 12 bits of the function/operation word
    pub fkt_id: u16,
    pub op_type: u8,
    pub tel_id: u8,
    pub tel_len: u8,
    #[serde(rename = "data")]
    pub body: Vec<u8>,
}

impl MostMessage {
    pub fn parse(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() < MESSAGE_HEADER_LEN {
            return Err(DecodeError::TooShort(payload.len()));
        }
        let function = u16::from_be_bytes([payload[5], payload[6]]);
        let telegram = payload[7];

        Ok(Self {
            msg_type: payload[0],
            source_address_high: payload[1],
            source_address_low: payload[2],
            fblock_id: payload[3],
            instance_id: payload[4],
            fkt_id: function >> 4,
            op_type: (function & 0x0F) as u8,
            tel_id: telegram >> 4,
            tel_len: telegram & 0x0F,
            body: payload[MESSAGE_HEADER_LEN..].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Sync,
    Length,
    Type { len: usize },
    Payload { len: usize, kind: u8 },
}

/// Streaming packet decoder. Bytes can arrive in any chunking.
#[derive(Debug)]
pub struct PacketDecoder {
    stage: Stage,
    payload: Vec<u8>,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            stage: Stage::Sync,
            payload: Vec::new(),
        }
    }

    /// Feeds a chunk and returns every message it completed
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<MostMessage, DecodeError>> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }

    /// Feeds one byte. Packets of other types complete silently.
    pub fn push(&mut self, byte: u8) -> Option<Result<MostMessage, DecodeError>> {
        match self.stage {
            Stage::Sync => {
                if byte == SYNC {
                    self.stage = Stage::Length;
                } else {
                    debug!("Skipping 0x{:02X} outside of a packet", byte);
                }
                None
            }
            Stage::Length => {
                self.stage = Stage::Type { len: byte as usize };
                None
            }
            Stage::Type { len } => {
                self.payload.clear();
                self.stage = Stage::Payload { len, kind: byte };
                if len == 0 {
                    return self.complete();
                }
                None
            }
            Stage::Payload { len, .. } => {
                self.payload.push(byte);
                if self.payload.len() == len {
                    return self.complete();
                }
                None
            }
        }
    }

    fn complete(&mut self) -> Option<Result<MostMessage, DecodeError>> {
        let Stage::Payload { kind, .. } = self.stage else {
            return None;
        };
        self.stage = Stage::Sync;

        if kind != TYPE_MESSAGE {
            debug!("Ignoring packet type 0x{:02X}", kind);
            return None;
        }
        Some(MostMessage::parse(&self.payload))
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Sync;
        self.payload.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: [u8; 10] = [0x01, 0x01, 0x61, 0x31, 0x02, 0x40, 0x1C, 0x23, 0xAA, 0xBB];

    fn packet(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![SYNC, payload.len() as u8, kind];
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn message_packet_decodes_once() {
        let mut decoder = PacketDecoder::new();
        let messages = decoder.feed(&packet(TYPE_MESSAGE, &PAYLOAD));

        assert_eq!(
            messages,
            vec![Ok(MostMessage {
                msg_type: 0x01,
                source_address_high: 0x01,
                source_address_low: 0x61,
                fblock_id: 0x31,
                instance_id: 0x02,
                fkt_id: 0x401,
                op_type: 0x0C,
                tel_id: 0x2,
                tel_len: 0x3,
                body: vec![0xAA, 0xBB],
            })]
        );
    }

    #[test]
    fn other_types_do_not_stall_the_stream() {
        let mut decoder = PacketDecoder::new();
        let mut stream = packet(0x02, &[0x01, 0x02, 0x03]);
        stream.extend(packet(0x07, &[]));
        stream.extend(packet(TYPE_MESSAGE, &PAYLOAD));

        let messages = decoder.feed(&stream);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_ok());
    }

    #[test]
    fn chunking_does_not_matter() {
        let mut decoder = PacketDecoder::new();
        let stream = packet(TYPE_MESSAGE, &PAYLOAD);
        let mut messages = Vec::new();
        for chunk in stream.chunks(2) {
            messages.extend(decoder.feed(chunk));
        }
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn short_message_is_an_error_and_decoding_continues() {
        let mut decoder = PacketDecoder::new();
        let mut stream = vec![0x00, 0x13];
        stream.extend(packet(TYPE_MESSAGE, &[0x01, 0x02]));
        stream.extend(packet(TYPE_MESSAGE, &PAYLOAD));

        let messages = decoder.feed(&stream);
        assert_eq!(messages[0], Err(DecodeError::TooShort(2)));
        assert!(messages[1].is_ok());
    }

    #[test]
    fn serializes_with_wire_names() {
        let message = MostMessage::parse(&PAYLOAD).unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], 1);
        assert_eq!(json["fBlock_id"], 0x31);
        assert_eq!(json["data"], serde_json::json!([0xAA, 0xBB]));
    }
}
