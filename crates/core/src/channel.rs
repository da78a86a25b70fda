//! Channel coding and physical framing
//!
//! A packet is zero-padded to one of two unit sizes, a CRC-32 is appended,
//! the unit is optionally Reed-Solomon encoded and a 4-byte preamble naming
//! the unit size is prepended:
//!
//! ```text
//! request: [0000 0000][ 8 -> 12 coded ]   16 bytes on the wire
//! data:    [FFFF FFFF][223 -> 255 coded ] 259 bytes on the wire
//! ```

use log::{debug, trace};
use reed_solomon::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::HEADER_LEN_RELAY_NC;

pub const SIZE_DATA: usize = 223;
pub const SIZE_CODED_DATA: usize = 255;
pub const SIZE_REQUEST: usize = 8;
pub const SIZE_CODED_REQUEST: usize = 12;
pub const CRC_LEN: usize = 4;
pub const PREAMBLE_LEN: usize = 4;

pub const WIRE_DATA_LEN: usize = PREAMBLE_LEN + SIZE_CODED_DATA;
pub const WIRE_REQUEST_LEN: usize = PREAMBLE_LEN + SIZE_CODED_REQUEST;

const SYNC_DATA: u16 = 0xffff;
const SYNC_REQUEST: u16 = 0x0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("no block length matches a {0}-byte unit")]
    WrongSize(usize),

    #[error("packet of {0} bytes does not fit in a frame")]
    TooLong(usize),

    #[error("malformed wire frame of {0} bytes")]
    Malformed(usize),

    #[error("too many errors or erasures")]
    Uncorrectable,
}

/// Forward error correction applied to every unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelCode {
    None,
    #[default]
    ReedSolomon,
}

impl ChannelCode {
    /// Application bytes carried by one data packet under this code, leaving
    /// room for the largest header and the CRC.
    pub fn payload_capacity(self) -> usize {
        self.max_packet_len() - HEADER_LEN_RELAY_NC
    }

    /// Largest header-plus-payload packet that fits in a data unit.
    pub fn max_packet_len(self) -> usize {
        match self {
            ChannelCode::None => SIZE_CODED_DATA - CRC_LEN,
            ChannelCode::ReedSolomon => SIZE_DATA - CRC_LEN,
        }
    }

    fn request_packet_len(self) -> usize {
        match self {
            ChannelCode::None => SIZE_CODED_REQUEST - CRC_LEN,
            ChannelCode::ReedSolomon => SIZE_REQUEST - CRC_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Data,
}

impl FrameKind {
    /// Classifies a preamble by Hamming weight so single bit errors in the
    /// sync words do not flip the frame type.
    pub fn from_preamble(preamble: [u8; PREAMBLE_LEN]) -> Self {
        if u32::from_be_bytes(preamble).count_ones() >= 16 {
            FrameKind::Data
        } else {
            FrameKind::Request
        }
    }

    pub fn wire_len(self) -> usize {
        match self {
            FrameKind::Request => WIRE_REQUEST_LEN,
            FrameKind::Data => WIRE_DATA_LEN,
        }
    }
}

/// A received unit with its CRC stripped. The payload keeps the zero padding
/// added by the sender; headers carry the real lengths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub payload: Vec<u8>,
    pub crc_ok: bool,
}

pub struct ChannelCoder {
    code: ChannelCode,
    data_encoder: Encoder,
    request_encoder: Encoder,
    data_decoder: Decoder,
    request_decoder: Decoder,
}

impl ChannelCoder {
    pub fn new(code: ChannelCode) -> Self {
        let data_ecc = SIZE_CODED_DATA - SIZE_DATA;
        let request_ecc = SIZE_CODED_REQUEST - SIZE_REQUEST;
        Self {
            code,
            data_encoder: Encoder::new(data_ecc),
            request_encoder: Encoder::new(request_ecc),
            data_decoder: Decoder::new(data_ecc),
            request_decoder: Decoder::new(request_ecc),
        }
    }

    pub fn code(&self) -> ChannelCode {
        self.code
    }

    pub fn encode(&self, payload_with_crc: &[u8]) -> Result<Vec<u8>, ChannelError> {
        match self.code {
            ChannelCode::None => Ok(payload_with_crc.to_vec()),
            ChannelCode::ReedSolomon => match payload_with_crc.len() {
                SIZE_DATA => Ok(self.data_encoder.encode(payload_with_crc).to_vec()),
                SIZE_REQUEST => Ok(self.request_encoder.encode(payload_with_crc).to_vec()),
                other => {
                    debug!("cannot channel encode a unit of {} bytes", other);
                    Err(ChannelError::WrongSize(other))
                }
            },
        }
    }

    pub fn decode(&self, coded: &[u8]) -> Result<Vec<u8>, ChannelError> {
        match self.code {
            ChannelCode::None => Ok(coded.to_vec()),
            ChannelCode::ReedSolomon => {
                let decoder = match coded.len() {
                    SIZE_CODED_DATA => &self.data_decoder,
                    SIZE_CODED_REQUEST => &self.request_decoder,
                    other => return Err(ChannelError::WrongSize(other)),
                };
                let mut word = coded.to_vec();
                let corrected = decoder
                    .correct(&mut word, None)
                    .map_err(|_| ChannelError::Uncorrectable)?;
                Ok(corrected.data().to_vec())
            }
        }
    }

    /// Prepends the preamble matching the coded unit's size.
    pub fn frame(&self, coded: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let sync = match coded.len() {
            SIZE_CODED_DATA => SYNC_DATA,
            SIZE_CODED_REQUEST => SYNC_REQUEST,
            other => return Err(ChannelError::WrongSize(other)),
        };
        let mut wire = Vec::with_capacity(PREAMBLE_LEN + coded.len());
        wire.extend_from_slice(&sync.to_be_bytes());
        wire.extend_from_slice(&sync.to_be_bytes());
        wire.extend_from_slice(coded);
        Ok(wire)
    }

    /// Strips and checks the preamble, returning the coded unit.
    pub fn deframe<'a>(&self, wire: &'a [u8]) -> Result<&'a [u8], ChannelError> {
        if wire.len() != WIRE_DATA_LEN && wire.len() != WIRE_REQUEST_LEN {
            return Err(ChannelError::Malformed(wire.len()));
        }
        let (preamble, coded) = wire.split_at(PREAMBLE_LEN);
        let kind = FrameKind::from_preamble([preamble[0], preamble[1], preamble[2], preamble[3]]);
        if kind.wire_len() != wire.len() {
            return Err(ChannelError::Malformed(wire.len()));
        }
        Ok(coded)
    }

    /// Pads `packet` to its unit size, appends the CRC, encodes and frames it.
    pub fn wrap(&self, packet: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let request_len = self.code.request_packet_len();
        let unit_len = if packet.len() <= request_len && self.fits_request(packet.len()) {
            request_len
        } else if packet.len() <= self.code.max_packet_len() {
            self.code.max_packet_len()
        } else {
            return Err(ChannelError::TooLong(packet.len()));
        };

        let mut unit = Vec::with_capacity(unit_len + CRC_LEN);
        unit.extend_from_slice(packet);
        unit.resize(unit_len, 0);
        let crc = crc32fast::hash(&unit);
        unit.extend_from_slice(&crc.to_be_bytes());
        trace!("wrapping {} byte packet in a {} byte unit", packet.len(), unit.len());

        let coded = self.encode(&unit)?;
        self.frame(&coded)
    }

    /// Inverse of [`ChannelCoder::wrap`]. A CRC mismatch is not an error here:
    /// the payload is still returned so callers can inspect a damaged header.
    pub fn open(&self, wire: &[u8]) -> Result<Opened, ChannelError> {
        let coded = self.deframe(wire)?;
        let mut unit = self.decode(coded)?;
        if unit.len() < CRC_LEN {
            return Err(ChannelError::Malformed(wire.len()));
        }
        let crc_bytes = unit.split_off(unit.len() - CRC_LEN);
        let expected = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let crc_ok = crc32fast::hash(&unit) == expected;
        Ok(Opened { payload: unit, crc_ok })
    }

    // With FEC only an exact 4-byte packet takes the short block, as the
    // request block has no room for padding beyond it.
    fn fits_request(&self, len: usize) -> bool {
        match self.code {
            ChannelCode::None => true,
            ChannelCode::ReedSolomon => len == self.code.request_packet_len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_size_for_every_packet_length() {
        for code in [ChannelCode::None, ChannelCode::ReedSolomon] {
            let coder = ChannelCoder::new(code);
            for len in 0..=code.max_packet_len() {
                let wire = coder.wrap(&vec![0xa5; len]).unwrap();
                assert!(
                    wire.len() == WIRE_DATA_LEN || wire.len() == WIRE_REQUEST_LEN,
                    "{:?}: {} byte packet produced {} byte frame",
                    code,
                    len,
                    wire.len()
                );
            }
            assert_eq!(
                coder.wrap(&vec![0; code.max_packet_len() + 1]),
                Err(ChannelError::TooLong(code.max_packet_len() + 1))
            );
        }
    }

    #[test]
    fn test_request_and_data_sizes() {
        let coder = ChannelCoder::new(ChannelCode::ReedSolomon);
        assert_eq!(coder.wrap(&[1, 2, 3, 4]).unwrap().len(), WIRE_REQUEST_LEN);
        assert_eq!(coder.wrap(&[1, 2, 3, 4, 5]).unwrap().len(), WIRE_DATA_LEN);

        let plain = ChannelCoder::new(ChannelCode::None);
        assert_eq!(plain.wrap(&[1; 8]).unwrap().len(), WIRE_REQUEST_LEN);
        assert_eq!(plain.wrap(&[1; 9]).unwrap().len(), WIRE_DATA_LEN);
        assert_eq!(ChannelCode::None.payload_capacity(), 245);
        assert_eq!(ChannelCode::ReedSolomon.payload_capacity(), 213);
    }

    #[test]
    fn test_open_recovers_padded_payload() {
        for code in [ChannelCode::None, ChannelCode::ReedSolomon] {
            let coder = ChannelCoder::new(code);
            let packet = b"\x08\x00\x01\x05hello".to_vec();
            let opened = coder.open(&coder.wrap(&packet).unwrap()).unwrap();
            assert!(opened.crc_ok);
            assert_eq!(&opened.payload[..packet.len()], &packet[..]);
            assert!(opened.payload[packet.len()..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_reed_solomon_corrects_byte_errors() {
        let coder = ChannelCoder::new(ChannelCode::ReedSolomon);
        let packet = vec![0x42; 200];
        let mut wire = coder.wrap(&packet).unwrap();
        for i in 0..16 {
            wire[PREAMBLE_LEN + i * 13] ^= 0x5a;
        }
        let opened = coder.open(&wire).unwrap();
        assert!(opened.crc_ok);
        assert_eq!(&opened.payload[..200], &packet[..]);
    }

    #[test]
    fn test_heavy_corruption_is_never_accepted() {
        let coder = ChannelCoder::new(ChannelCode::ReedSolomon);
        let mut wire = coder.wrap(&[0x11; 100]).unwrap();
        for byte in wire[PREAMBLE_LEN..PREAMBLE_LEN + 60].iter_mut() {
            *byte = !*byte;
        }
        match coder.open(&wire) {
            Err(err) => assert_eq!(err, ChannelError::Uncorrectable),
            Ok(opened) => assert!(!opened.crc_ok),
        }
    }

    #[test]
    fn test_crc_failure_without_fec() {
        let coder = ChannelCoder::new(ChannelCode::None);
        let mut wire = coder.wrap(&[0x0a, 0, 0, 0]).unwrap();
        wire[PREAMBLE_LEN + 1] ^= 0x01;
        let opened = coder.open(&wire).unwrap();
        assert!(!opened.crc_ok);
        assert_eq!(opened.payload[0], 0x0a);
    }

    #[test]
    fn test_deframe_rejects_bad_sizes_and_preambles() {
        let coder = ChannelCoder::new(ChannelCode::None);
        assert_eq!(coder.deframe(&[0; 17]), Err(ChannelError::Malformed(17)));

        let mut wire = coder.wrap(&[0; 4]).unwrap();
        assert!(coder.deframe(&wire).is_ok());
        wire[..PREAMBLE_LEN].copy_from_slice(&[0xff; PREAMBLE_LEN]);
        assert_eq!(coder.deframe(&wire), Err(ChannelError::Malformed(WIRE_REQUEST_LEN)));

        let mut data = coder.wrap(&[0; 100]).unwrap();
        data[0] = 0x00;
        assert!(coder.deframe(&data).is_ok(), "one damaged sync byte is tolerated");
    }

    #[test]
    fn test_encode_rejects_unknown_unit_size() {
        let coder = ChannelCoder::new(ChannelCode::ReedSolomon);
        assert_eq!(coder.encode(&[0; 100]), Err(ChannelError::WrongSize(100)));
        assert_eq!(coder.decode(&[0; 100]), Err(ChannelError::WrongSize(100)));
        assert_eq!(coder.frame(&[0; 100]), Err(ChannelError::WrongSize(100)));
    }
}
