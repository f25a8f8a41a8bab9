use crate::error::{MqttError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Writes binary data with a two byte big-endian length prefix
///
/// # Errors
///
/// Returns an error if the data is longer than 65,535 bytes
pub fn encode_binary<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len()).map_err(|_| {
        MqttError::MalformedPacket(format!(
            "Binary data length {} exceeds maximum 65535",
            data.len()
        ))
    })?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Reads length-prefixed binary data
///
/// # Errors
///
/// Returns an error if the declared length runs past the end of the buffer
pub fn decode_binary<B: Buf>(buf: &mut B) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(MqttError::MalformedPacket(
            "Insufficient bytes for binary data length".to_string(),
        ));
    }

    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(MqttError::MalformedPacket(format!(
            "Binary data declares {len} bytes but only {} remain",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Encoded length of `data`, length prefix included
#[must_use]
pub fn binary_len(data: &[u8]) -> usize {
    2 + data.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_encode_decode_binary() {
        let mut buf = BytesMut::new();
        for data in [&b""[..], &b"\x00\x01\xff"[..], &[7u8; 512][..]] {
            buf.clear();
            encode_binary(&mut buf, data).unwrap();
            assert_eq!(buf.len(), binary_len(data));
            assert_eq!(&decode_binary(&mut buf).unwrap()[..], data);
        }
    }

    #[test]
    fn test_binary_too_long() {
        let mut buf = BytesMut::new();
        assert!(encode_binary(&mut buf, &vec![0u8; 65_536]).is_err());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_slice(b"ab");
        assert!(decode_binary(&mut buf).is_err());
    }
}
