use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Smallest legal length byte: opcode plus two checksum bytes.
pub const MIN_LENGTH: u8 = 3;

/// Largest frame on the wire (length byte included).
pub const MAX_FRAME_SIZE: usize = 256;

/// Largest parameter block a single frame can carry.
pub const MAX_PARAMS: usize = u8::MAX as usize - MIN_LENGTH as usize;

const CHECKSUM_SIZE: usize = 2;

/// A command sent to, or a reply received from, the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message opcode (see [`crate::opcode`]).
    pub opcode: u8,
    /// Opcode-specific parameters.
    pub params: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(opcode: u8, params: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            params: params.into(),
        }
    }

    /// Parameter byte at `index`, or 0 when the reply is shorter.
    pub fn param(&self, index: usize) -> u8 {
        self.params.get(index).copied().unwrap_or(0)
    }

    /// Parameter bytes in `start..end`, clamped to what was received.
    pub fn param_range(&self, start: usize, end: usize) -> &[u8] {
        let end = end.min(self.params.len());
        let start = start.min(end);
        &self.params[start..end]
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        1 + 1 + self.params.len() + CHECKSUM_SIZE
    }

    /// Encode this frame onto `dst` as a host command.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        encode_frame(self.opcode, &self.params, dst)
    }
}

/// Which end of the link produced a frame.
///
/// The chip checks host commands over the opcode and params only, but signs
/// its own replies over the length byte as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to chip.
    Command,
    /// Chip to host.
    Reply,
}

/// Checksum of a frame body (opcode + params) sent in `direction`.
///
/// The value is the two's-complement negation of the 16-bit byte sum, so a
/// receiver adding every covered byte plus the checksum gets zero.
pub fn checksum(direction: Direction, length: u8, body: &[u8]) -> u16 {
    let seed = match direction {
        Direction::Command => 0,
        Direction::Reply => u16::from(length),
    };
    body.iter()
        .fold(seed, |acc, b| acc.wrapping_add(u16::from(*b)))
        .wrapping_neg()
}

/// Encode a host command into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────┬──────────────┬──────────────┐
/// │ Len (1B) │ Op (1B)  │ Params       │ Checksum     │
/// │ N        │          │ (N - 3 bytes)│ (2B BE)      │
/// └──────────┴──────────┴──────────────┴──────────────┘
/// ```
///
/// `N` counts the opcode, the parameters and the two checksum bytes.
pub fn encode_frame(opcode: u8, params: &[u8], dst: &mut BytesMut) -> Result<()> {
    encode_with(Direction::Command, opcode, params, dst)
}

/// Encode a chip reply. Same layout as [`encode_frame`], checksum seeded
/// with the length byte.
pub fn encode_reply(opcode: u8, params: &[u8], dst: &mut BytesMut) -> Result<()> {
    encode_with(Direction::Reply, opcode, params, dst)
}

fn encode_with(direction: Direction, opcode: u8, params: &[u8], dst: &mut BytesMut) -> Result<()> {
    if params.len() > MAX_PARAMS {
        return Err(FrameError::TooLarge {
            size: params.len(),
            max: MAX_PARAMS,
        });
    }
    let length = (1 + params.len() + CHECKSUM_SIZE) as u8;
    let start = dst.len();
    dst.reserve(1 + length as usize);
    dst.put_u8(length);
    dst.put_u8(opcode);
    dst.put_slice(params);
    let sum = checksum(direction, length, &dst[start + 1..]);
    dst.put_u16(sum);
    Ok(())
}

/// Decode a chip reply from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success the frame bytes are consumed. A frame that fails validation is
/// consumed as well (only the length byte for [`FrameError::BadLength`]) so
/// the caller can resynchronise on the following bytes.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    decode_with(Direction::Reply, src)
}

/// Decode a host command, as the chip sees it.
pub fn decode_command(src: &mut BytesMut) -> Result<Option<Frame>> {
    decode_with(Direction::Command, src)
}

fn decode_with(direction: Direction, src: &mut BytesMut) -> Result<Option<Frame>> {
    let Some(&length) = src.first() else {
        return Ok(None);
    };
    if length < MIN_LENGTH {
        src.advance(1);
        return Err(FrameError::BadLength(length));
    }

    let total = 1 + length as usize;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let mut raw = src.split_to(total);
    let body_end = total - CHECKSUM_SIZE;
    let expected = checksum(direction, length, &raw[1..body_end]);
    let actual = u16::from_be_bytes([raw[body_end], raw[body_end + 1]]);
    if expected != actual {
        return Err(FrameError::Checksum { expected, actual });
    }

    raw.truncate(body_end);
    raw.advance(1);
    let opcode = raw.get_u8();
    Ok(Some(Frame {
        opcode,
        params: raw.freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let params = [0x00, 0x16, 0x53, 0x01, 0x02, 0x03, 0x00];

        encode_frame(opcode::CONNECT, &params, &mut buf).unwrap();
        assert_eq!(buf.len(), 1 + 1 + params.len() + 2);
        assert_eq!(buf[0] as usize, 1 + params.len() + 2);

        let frame = decode_command(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::CONNECT);
        assert_eq!(frame.params.as_ref(), &params);
        assert!(buf.is_empty());

        encode_reply(opcode::CONNECT_RESULT, &[1, 2], &mut buf).unwrap();
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.opcode, opcode::CONNECT_RESULT);
        assert_eq!(frame.params.as_ref(), &[1, 2]);
    }

    #[test]
    fn test_command_checksum_excludes_length() {
        let mut buf = BytesMut::new();
        let params = [0x00, 0x16, 0x53, 0x01, 0x02, 0x03, 0x00];
        encode_frame(opcode::CONNECT, &params, &mut buf).unwrap();

        let sum = params
            .iter()
            .fold(u16::from(opcode::CONNECT), |acc, b| acc.wrapping_add(u16::from(*b)));
        let trailer = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
        assert_eq!(trailer, sum.wrapping_neg());
    }

    #[test]
    fn test_directions_do_not_mix() {
        let mut buf = BytesMut::new();
        encode_frame(opcode::GET_VERSION, &[], &mut buf).unwrap();
        assert!(matches!(decode_frame(&mut buf), Err(FrameError::Checksum { .. })));

        encode_reply(opcode::GET_VERSION_RESULT, &[1, 2], &mut buf).unwrap();
        assert!(matches!(decode_command(&mut buf), Err(FrameError::Checksum { .. })));
    }

    #[test]
    fn test_known_wire_bytes() {
        // GET_OPERATING_MODE: len 3, opcode 53 (0x35), checksum -0x35.
        let mut buf = BytesMut::new();
        encode_frame(opcode::GET_OPERATING_MODE, &[], &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0x03, 0x35, 0xff, 0xcb]);

        // The same frame from the chip is signed over the length too.
        buf.clear();
        encode_reply(opcode::GET_OPERATING_MODE, &[], &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[0x03, 0x35, 0xff, 0xc8]);
    }

    #[test]
    fn test_checksum_sums_to_zero() {
        let mut buf = BytesMut::new();
        encode_reply(opcode::SET_FRIENDLY_NAME, b"brick\0\0\0\0\0\0\0\0\0\0\0", &mut buf).unwrap();
        let body_end = buf.len() - 2;
        let sum = buf[..body_end]
            .iter()
            .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)));
        let trailer = u16::from_be_bytes([buf[body_end], buf[body_end + 1]]);
        assert_eq!(sum.wrapping_add(trailer), 0);
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let mut wire = BytesMut::new();
        encode_reply(opcode::PIN_CODE, &[1, 2, 3, 4, 5, 6, 0, b'1', b'2'], &mut wire).unwrap();

        // Skip the length byte: corrupting it changes the frame boundary instead.
        for byte in 1..wire.len() {
            for bit in 0..8 {
                let mut corrupt = wire.clone();
                corrupt[byte] ^= 1 << bit;
                let result = decode_frame(&mut corrupt);
                assert!(
                    matches!(result, Err(FrameError::Checksum { .. })),
                    "flip of byte {byte} bit {bit} was accepted"
                );
                assert!(corrupt.is_empty(), "bad frame should be consumed");
            }
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let mut buf = BytesMut::new();
        assert!(decode_frame(&mut buf).unwrap().is_none());

        encode_reply(opcode::GET_VERSION, &[], &mut buf).unwrap();
        buf.truncate(3);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3, "partial frame must stay buffered");
    }

    #[test]
    fn test_decode_bad_length_consumes_one_byte() {
        let mut buf = BytesMut::from(&[0x02, 0x03, 0x35, 0xff, 0xc8][..]);
        let result = decode_frame(&mut buf);
        assert!(matches!(result, Err(FrameError::BadLength(2))));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_params_too_large() {
        let mut buf = BytesMut::new();
        let params = vec![0u8; MAX_PARAMS + 1];
        let result = encode_frame(opcode::ADD_DEVICE, &params, &mut buf);
        assert!(matches!(result, Err(FrameError::TooLarge { .. })));
        assert!(buf.is_empty());

        encode_frame(opcode::ADD_DEVICE, &params[..MAX_PARAMS], &mut buf).unwrap();
        assert_eq!(buf.len(), MAX_FRAME_SIZE);
        let frame = decode_command(&mut buf).unwrap().unwrap();
        assert_eq!(frame.params.len(), MAX_PARAMS);
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_reply(opcode::RESET_INDICATION, &[], &mut buf).unwrap();
        encode_reply(opcode::OPERATING_MODE_RESULT, &[1], &mut buf).unwrap();

        let f1 = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(f1.opcode, opcode::RESET_INDICATION);
        assert!(f1.params.is_empty());

        let f2 = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(f2.opcode, opcode::OPERATING_MODE_RESULT);
        assert_eq!(f2.param(0), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_param_accessors_clamp() {
        let frame = Frame::new(opcode::CONNECT_RESULT, vec![1, 2]);
        assert_eq!(frame.param(1), 2);
        assert_eq!(frame.param(9), 0);
        assert_eq!(frame.param_range(1, 10), &[2]);
        assert!(frame.param_range(5, 10).is_empty());
        assert_eq!(frame.wire_size(), 6);
    }
}
