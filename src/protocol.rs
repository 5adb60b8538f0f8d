use tokio_util::bytes::{Buf, BufMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::registers::Category;

/// Bus address of the controller. The AHC 9000 answers on a fixed address;
/// there is no multi-drop addressing on this bus.
pub const DEVICE_ADDRESS: u8 = 0x01;

pub const FC_READ: u8 = 0x43;
pub const FC_WRITE: u8 = 0x44;
pub const FC_WRITE_MASKED: u8 = 0x45;

/// The largest register block any operation touches. Element blocks are the
/// widest at 11 words.
pub const MAX_READ_COUNT: u8 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read `count` consecutive registers from a category page.
    ReadRegisters { category: Category, page: u8, index: u8, count: u8 },
    /// Replace a whole register word.
    WriteRegister { category: Category, page: u8, index: u8, value: u16 },
    /// Update only the bits selected by `mask`, leaving the rest untouched.
    WriteMasked { category: Category, page: u8, index: u8, value: u16, mask: u16 },
}

impl Operation {
    pub fn function_code(&self) -> u8 {
        match self {
            Operation::ReadRegisters { .. } => FC_READ,
            Operation::WriteRegister { .. } => FC_WRITE,
            Operation::WriteMasked { .. } => FC_WRITE_MASKED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Payload of a `ReadRegisters` request, one word per register.
    Registers(Vec<u16>),
    /// Acknowledgement of a `WriteRegister` or `WriteMasked` request.
    WriteAck { function_code: u8 },
}

#[derive(thiserror::Error, Debug)]
pub enum FrameError {
    #[error("response frame is truncated ({0} bytes so far)")]
    Truncated(usize),
    #[error("response checksum mismatch (computed {computed:#06x}, received {received:#06x})")]
    ChecksumMismatch { computed: u16, received: u16 },
    #[error("malformed response frame ({0})")]
    Malformed(&'static str),
}

/// CRC-16 over the frame body, poly 0xA001, init 0xFFFF, appended low byte
/// first. Shared by requests and responses.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in bytes {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Serialize one request frame, checksum included.
pub fn encode_request(operation: &Operation, dst: &mut tokio_util::bytes::BytesMut) {
    let start = dst.len();
    dst.put_u8(DEVICE_ADDRESS);
    dst.put_u8(operation.function_code());
    match *operation {
        Operation::ReadRegisters { category, page, index, count } => {
            dst.put_u8(category as u8);
            dst.put_u8(page);
            dst.put_u8(index);
            dst.put_u8(count);
        }
        Operation::WriteRegister { category, page, index, value } => {
            dst.put_u8(category as u8);
            dst.put_u8(page);
            dst.put_u8(index);
            dst.put_u16(value);
        }
        Operation::WriteMasked { category, page, index, value, mask } => {
            dst.put_u8(category as u8);
            dst.put_u8(page);
            dst.put_u8(index);
            dst.put_u16(value);
            dst.put_u16(mask);
        }
    }
    let crc = crc16(&dst[start..]);
    dst.put_u16_le(crc);
}

/// Parse one response frame from the start of `bytes`.
///
/// Returns the consumed length and the decoded payload. `Truncated` means
/// more bytes are needed; every other error describes a frame that is
/// complete but unusable.
pub fn decode_response(bytes: &[u8]) -> Result<(usize, Response), FrameError> {
    let [address, function_code, length, rest @ ..] = bytes else {
        return Err(FrameError::Truncated(bytes.len()));
    };
    if *address != DEVICE_ADDRESS {
        return Err(FrameError::Malformed("unexpected bus address"));
    }
    if !matches!(*function_code, FC_READ | FC_WRITE | FC_WRITE_MASKED) {
        return Err(FrameError::Malformed("unknown function code"));
    }
    let payload_len = usize::from(*length);
    let Some((payload, rest)) = rest.split_at_checked(payload_len) else {
        return Err(FrameError::Truncated(bytes.len()));
    };
    let Some((crc_bytes, _)) = rest.split_first_chunk::<2>() else {
        return Err(FrameError::Truncated(bytes.len()));
    };
    let received = u16::from_le_bytes(*crc_bytes);
    let computed = crc16(&bytes[..3 + payload_len]);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }
    let consumed = 3 + payload_len + 2;
    let response = match *function_code {
        FC_READ => {
            if payload_len % 2 != 0 {
                return Err(FrameError::Malformed("odd register payload length"));
            }
            let values = payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Response::Registers(values)
        }
        code => {
            if payload_len != 0 {
                return Err(FrameError::Malformed("write acknowledgement carries payload"));
            }
            Response::WriteAck { function_code: code }
        }
    };
    Ok((consumed, response))
}

/// What the streaming decoder hands upward for each complete frame.
///
/// Corrupt frames are items rather than stream errors: a decode error would
/// terminate the `Framed` stream, and on a noisy half-duplex bus a bad frame
/// is an expected event, not a connection failure.
#[derive(Debug)]
pub enum Decoded {
    Valid(Response),
    Corrupt(FrameError),
}

pub struct WavinCodec {}

impl Encoder<&Operation> for WavinCodec {
    type Error = std::io::Error;

    fn encode(
        &mut self,
        operation: &Operation,
        dst: &mut tokio_util::bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        encode_request(operation, dst);
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for WavinCodec {
    type Item = Decoded;
    type Error = std::io::Error;

    fn decode(
        &mut self,
        src: &mut tokio_util::bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            if src.is_empty() {
                return Ok(None);
            }
            match decode_response(src) {
                Ok((consumed, response)) => {
                    src.advance(consumed);
                    return Ok(Some(Decoded::Valid(response)));
                }
                Err(FrameError::Truncated(_)) => return Ok(None),
                Err(error @ FrameError::ChecksumMismatch { .. }) => {
                    // The header was plausible, so skip the whole frame.
                    let payload_len = usize::from(src[2]);
                    src.advance((3 + payload_len + 2).min(src.len()));
                    return Ok(Some(Decoded::Corrupt(error)));
                }
                Err(FrameError::Malformed(_)) => {
                    // Line noise. Resynchronize one byte at a time until a
                    // frame header lines up again.
                    src.advance(1);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;

    fn encode(operation: &Operation) -> BytesMut {
        let mut buffer = BytesMut::new();
        encode_request(operation, &mut buffer);
        buffer
    }

    /// Build a well-formed response frame for tests.
    fn response_frame(function_code: u8, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![DEVICE_ADDRESS, function_code, payload.len() as u8];
        frame.extend_from_slice(payload);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    #[test]
    fn read_request_layout() {
        let frame = encode(&Operation::ReadRegisters {
            category: Category::Elements,
            page: 4,
            index: 0,
            count: 11,
        });
        assert_eq!(&frame[..6], &[DEVICE_ADDRESS, FC_READ, 0x01, 4, 0, 11]);
        assert_eq!(frame.len(), 8);
        let crc = crc16(&frame[..6]);
        assert_eq!(&frame[6..], crc.to_le_bytes());
    }

    #[test]
    fn masked_write_request_layout() {
        let frame = encode(&Operation::WriteMasked {
            category: Category::Packed,
            page: 2,
            index: 7,
            value: 0x0001,
            mask: 0x0007,
        });
        assert_eq!(
            &frame[..9],
            &[DEVICE_ADDRESS, FC_WRITE_MASKED, 0x02, 2, 7, 0x00, 0x01, 0x00, 0x07],
        );
    }

    #[test]
    fn encode_is_deterministic() {
        let operation = Operation::WriteRegister {
            category: Category::Packed,
            page: 9,
            index: 0,
            value: 215,
        };
        assert_eq!(encode(&operation), encode(&operation));
    }

    #[test]
    fn response_round_trip() {
        let words = [215u16, 0x8001, 0, 42];
        let payload: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let frame = response_frame(FC_READ, &payload);
        let (consumed, response) = decode_response(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(response, Response::Registers(words.to_vec()));
    }

    #[test]
    fn write_ack_round_trip() {
        let frame = response_frame(FC_WRITE, &[]);
        let (consumed, response) = decode_response(&frame).unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(response, Response::WriteAck { function_code: FC_WRITE });
    }

    #[test]
    fn truncated_frames_ask_for_more() {
        let frame = response_frame(FC_READ, &[0x00, 0xd7]);
        for cut in 0..frame.len() {
            assert!(matches!(
                decode_response(&frame[..cut]),
                Err(FrameError::Truncated(_)),
            ));
        }
    }

    #[test]
    fn checksum_mismatch_is_reported() {
        let mut frame = response_frame(FC_READ, &[0x00, 0xd7]);
        *frame.last_mut().unwrap() ^= 0xFF;
        assert!(matches!(
            decode_response(&frame),
            Err(FrameError::ChecksumMismatch { .. }),
        ));
    }

    #[test]
    fn malformed_input_never_panics() {
        let frame = response_frame(FC_READ, &[0x00, 0xd7, 0x01]);
        assert!(matches!(decode_response(&frame), Err(FrameError::Malformed(_))));
        assert!(matches!(
            decode_response(&[0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]),
            Err(FrameError::Malformed(_)),
        ));
    }

    #[test]
    fn decoder_resynchronizes_after_noise() {
        let mut codec = WavinCodec {};
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&[0xFF, 0x12]); // leading garbage
        buffer.extend_from_slice(&response_frame(FC_WRITE, &[]));
        let decoded = codec.decode(&mut buffer).unwrap();
        assert!(matches!(
            decoded,
            Some(Decoded::Valid(Response::WriteAck { function_code: FC_WRITE })),
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn decoder_surfaces_corrupt_frames_and_keeps_going() {
        let mut codec = WavinCodec {};
        let mut buffer = BytesMut::new();
        let mut bad = response_frame(FC_READ, &[0x00, 0xd7]);
        let bad_len = bad.len();
        *bad.last_mut().unwrap() ^= 0xFF;
        buffer.extend_from_slice(&bad);
        buffer.extend_from_slice(&response_frame(FC_READ, &[0x00, 0x2a]));

        let first = codec.decode(&mut buffer).unwrap();
        assert!(matches!(first, Some(Decoded::Corrupt(FrameError::ChecksumMismatch { .. }))));
        assert_eq!(buffer.len(), bad_len);
        let second = codec.decode(&mut buffer).unwrap();
        assert!(matches!(
            second,
            Some(Decoded::Valid(Response::Registers(values))) if values == vec![0x2a],
        ));
    }
}
