//! Variable byte integer encoding as defined by the MQTT specification
//!
//! Values use 1-4 bytes, 7 value bits per byte with the high bit as the
//! continuation flag:
//! - 0-127: 1 byte
//! - 128-16,383: 2 bytes
//! - 16,384-2,097,151: 3 bytes
//! - 2,097,152-268,435,455: 4 bytes

use crate::constants::masks::{CONTINUATION_BIT, VARIABLE_BYTE_VALUE};
use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut};

/// Maximum value that can be encoded as a variable byte integer (268,435,455)
pub const VARIABLE_INT_MAX: u32 = 268_435_455;

/// Encodes a u32 value as a variable byte integer
///
/// # Errors
///
/// Returns `MqttError::MalformedPacket` if the value exceeds the maximum
pub fn encode_variable_int<B: BufMut>(buf: &mut B, value: u32) -> Result<()> {
    if value > VARIABLE_INT_MAX {
        return Err(MqttError::MalformedPacket(format!(
            "Variable integer value {value} exceeds maximum {VARIABLE_INT_MAX}"
        )));
    }

    let mut val = value;
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            byte |= CONTINUATION_BIT;
        }
        buf.put_u8(byte);
        if val == 0 {
            break;
        }
    }
    Ok(())
}

/// Decodes a variable byte integer from a buffer that is known to be complete
///
/// # Errors
///
/// Returns an error if:
/// - The buffer doesn't contain enough bytes
/// - More than 4 bytes are used (protocol violation)
pub fn decode_variable_int<B: Buf>(buf: &mut B) -> Result<u32> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for _ in 0..4 {
        if !buf.has_remaining() {
            return Err(MqttError::MalformedPacket(
                "Insufficient bytes for variable integer".to_string(),
            ));
        }

        let byte = buf.get_u8();
        value += u32::from(byte & VARIABLE_BYTE_VALUE) * multiplier;

        if byte & CONTINUATION_BIT == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }

    Err(MqttError::MalformedPacket(
        "Variable integer exceeds 4 bytes".to_string(),
    ))
}

/// Attempts to decode a variable byte integer from the front of `bytes`
/// without consuming anything.
///
/// Returns `Ok(None)` when the slice ends before the final byte of the
/// integer, and `Ok(Some((value, consumed)))` otherwise.
///
/// # Errors
///
/// Returns `MqttError::MalformedPacket` when a fifth continuation byte is seen
pub fn try_decode_variable_int(bytes: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    let mut multiplier = 1u32;

    for (index, byte) in bytes.iter().enumerate() {
        if index == 4 {
            return Err(MqttError::MalformedPacket(
                "Variable integer exceeds 4 bytes".to_string(),
            ));
        }
        value += u32::from(byte & VARIABLE_BYTE_VALUE) * multiplier;
        if byte & CONTINUATION_BIT == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if bytes.len() >= 4 {
        return Err(MqttError::MalformedPacket(
            "Variable integer exceeds 4 bytes".to_string(),
        ));
    }
    Ok(None)
}

/// Calculates the number of bytes needed to encode a value
#[must_use]
pub fn variable_int_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
