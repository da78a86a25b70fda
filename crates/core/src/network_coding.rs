//! XOR network coding of two length-prefixed payloads.
//!
//! The relay combines `[len_a][data_a]` and `[len_b][data_b]`; each node
//! recovers the peer's unit by XORing the combination with its own unit.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodingError {
    #[error("there is no data to combine")]
    EmptyOperand,

    #[error("operands differ in length: {left} vs {right} bytes")]
    LengthMismatch { left: usize, right: usize },

    #[error("decoded length {decoded} exceeds the {available} bytes available")]
    Truncated { decoded: usize, available: usize },
}

/// Right-pads the shorter payload with zeros and XORs the two byte-wise.
pub fn combine(payload_a: &[u8], payload_b: &[u8]) -> Result<Vec<u8>, CodingError> {
    if payload_a.is_empty() || payload_b.is_empty() {
        return Err(CodingError::EmptyOperand);
    }
    let len = payload_a.len().max(payload_b.len());
    xor(&padded(payload_a, len), &padded(payload_b, len))
}

/// Reverses [`combine`] given this station's own prior unit.
///
/// The first byte of each input is a length field; the peer's length is
/// recovered first and the XORed data is cut back to it. Trailing bytes of
/// `received` beyond the coded data (frame padding) are tolerated.
pub fn decode(received: &[u8], own_prior: &[u8]) -> Result<Vec<u8>, CodingError> {
    let (Some((&coded_len, coded_data)), Some((&own_len, own_data))) =
        (received.split_first(), own_prior.split_first())
    else {
        return Err(CodingError::EmptyOperand);
    };

    let length = coded_len ^ own_len;
    if coded_data.is_empty() && own_data.is_empty() {
        return Ok(Vec::new());
    }

    let width = coded_data.len().max(own_data.len());
    let mut data = xor(&padded(coded_data, width), &padded(own_data, width))?;
    if usize::from(length) > data.len() {
        return Err(CodingError::Truncated { decoded: length as usize, available: data.len() });
    }
    data.truncate(length as usize);

    let mut unit = Vec::with_capacity(data.len() + 1);
    unit.push(length);
    unit.extend_from_slice(&data);
    Ok(unit)
}

fn padded(payload: &[u8], len: usize) -> Vec<u8> {
    let mut out = payload.to_vec();
    if out.len() < len {
        out.resize(len, 0);
    }
    out
}

fn xor(left: &[u8], right: &[u8]) -> Result<Vec<u8>, CodingError> {
    if left.len() != right.len() {
        return Err(CodingError::LengthMismatch { left: left.len(), right: right.len() });
    }
    Ok(left.iter().zip(right).map(|(l, r)| l ^ r).collect())
}

/// Prefixes `data` with its length byte, the unit that travels through coding.
pub fn unit(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(data.len().min(u8::MAX as usize) as u8);
    out.extend_from_slice(data);
    out
}
