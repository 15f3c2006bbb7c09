use crate::buffer::Buffer;
use byteorder::{ByteOrder, LittleEndian};
use ed2k_support::error::{EngineError, EngineResult, FatalKind};
use std::collections::VecDeque;

pub const HEADER_SIZE: usize = 6;

/// The 6-byte packet header: protocol byte, little-endian payload size, opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub protocol: u8,
    pub size: u32,
    pub opcode: u8,
}

impl Header {
    pub fn peek(bytes: &[u8]) -> Header {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        Header {
            protocol: bytes[0],
            size: LittleEndian::read_u32(&bytes[1..5]),
            opcode: bytes[5],
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.push(self.protocol);
        let mut size_bytes = [0u8; 4];
        LittleEndian::write_u32(&mut size_bytes, self.size);
        out.extend_from_slice(&size_bytes);
        out.push(self.opcode);
    }
}

/// Slices complete packets (header + payload) out of a connection's read buffer. Stateless
/// beyond the buffer itself: every call just tries to make as much progress as the currently
/// buffered bytes allow.
pub struct Framer {
    max_packet_size: u32,
}

impl Framer {
    pub fn new(max_packet_size: u32) -> Framer {
        Framer { max_packet_size }
    }

    /// Pulls every complete packet currently sitting in `buffer` into `out`, in order. Leaves
    /// any trailing partial packet in `buffer` for the next call. Returns `Fatal(MalformedPacket)`
    /// if a claimed size exceeds the configured bound -- the caller is expected to close the
    /// connection's read half in that case.
    pub fn drain_into(
        &self,
        buffer: &mut Buffer,
        out: &mut VecDeque<Vec<u8>>,
    ) -> EngineResult<()> {
        loop {
            let header_bytes = match buffer.peek(HEADER_SIZE) {
                Some(bytes) => bytes,
                None => return Ok(()),
            };

            let header = Header::peek(&header_bytes);

            if header.size > self.max_packet_size {
                return Err(EngineError::Fatal(FatalKind::MalformedPacket));
            }

            let total = HEADER_SIZE + header.size as usize;
            if buffer.len() < total {
                return Ok(());
            }

            out.push_back(buffer.consume(total));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_bytes(protocol: u8, opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        Header {
            protocol,
            size: payload.len() as u32,
            opcode,
        }
        .write(&mut out);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn drains_a_single_complete_packet() {
        let bytes = packet_bytes(0xE3, 0x34, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut buffer = Buffer::new();
        buffer.ingress(&mut &bytes[..], bytes.len()).unwrap();

        let framer = Framer::new(1024 * 1024);
        let mut out = VecDeque::new();
        framer.drain_into(&mut buffer, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out.pop_front().unwrap(), bytes);
        assert!(buffer.is_empty());
    }

    #[test]
    fn leaves_a_split_header_buffered_until_complete() {
        let bytes = packet_bytes(0xE3, 0x34, &[0xDE, 0xAD, 0xBE, 0xEF]);
        let mut buffer = Buffer::new();

        let mut first = &bytes[..3];
        buffer.ingress(&mut first, 3).unwrap();

        let framer = Framer::new(1024 * 1024);
        let mut out = VecDeque::new();
        framer.drain_into(&mut buffer, &mut out).unwrap();
        assert!(out.is_empty());

        let mut rest = &bytes[3..];
        buffer.ingress(&mut rest, rest.len()).unwrap();
        framer.drain_into(&mut buffer, &mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out.pop_front().unwrap(), bytes);
    }

    #[test]
    fn drains_multiple_back_to_back_packets() {
        let a = packet_bytes(0xE3, 0x01, &[1, 2, 3]);
        let b = packet_bytes(0xC5, 0x02, &[]);
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let mut buffer = Buffer::new();
        buffer
            .ingress(&mut &combined[..], combined.len())
            .unwrap();

        let framer = Framer::new(1024 * 1024);
        let mut out = VecDeque::new();
        framer.drain_into(&mut buffer, &mut out).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0], a);
        assert_eq!(out[1], b);
    }

    #[test]
    fn oversized_claimed_length_is_malformed() {
        let mut out_bytes = Vec::new();
        Header {
            protocol: 0xE3,
            size: 100,
            opcode: 0x01,
        }
        .write(&mut out_bytes);

        let mut buffer = Buffer::new();
        buffer
            .ingress(&mut &out_bytes[..], out_bytes.len())
            .unwrap();

        let framer = Framer::new(10);
        let mut out = VecDeque::new();
        let result = framer.drain_into(&mut buffer, &mut out);

        assert_eq!(
            result,
            Err(EngineError::Fatal(FatalKind::MalformedPacket))
        );
    }

    #[test]
    fn byte_by_byte_delivery_still_frames_correctly() {
        let bytes = packet_bytes(0xE3, 0x7F, &[9, 8, 7]);
        let mut buffer = Buffer::new();
        let framer = Framer::new(1024 * 1024);
        let mut out = VecDeque::new();

        for byte in &bytes {
            let chunk = [*byte];
            buffer.ingress(&mut &chunk[..], 1).unwrap();
            framer.drain_into(&mut buffer, &mut out).unwrap();
        }

        assert_eq!(out.len(), 1);
        assert_eq!(out.pop_front().unwrap(), bytes);
    }
}
