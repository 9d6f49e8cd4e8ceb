use bytes::{Buf, BufMut, BytesMut};

use crate::error::RemoteError;

/// Fixed 8-byte packet header, all fields little-endian. `len` is
///  authoritative and includes the header itself; there is no escaping.
///
/// ```ascii
/// 0: len (u16 LE)        - total packet length including this header
/// 2: message_id (i32 LE) - registry key for the payload codec
/// 6: rpc_id (i16 LE)     - 0: not an rpc; >0: request expecting a response;
///                          <0: response to the request with the negated id
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub len: u16,
    pub message_id: i32,
    pub rpc_id: i16,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.len);
        buf.put_i32_le(self.message_id);
        buf.put_i16_le(self.rpc_id);
    }

    pub fn try_parse(mut buf: &[u8]) -> Result<PacketHeader, RemoteError> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(RemoteError::ShortHeader);
        }

        Ok(PacketHeader {
            len: buf.get_u16_le(),
            message_id: buf.get_i32_le(),
            rpc_id: buf.get_i16_le(),
        })
    }

    /// Sanity check of the parsed `len` against the configured packet cap.
    pub fn validate_len(&self, max_packet_size: usize) -> Result<(), RemoteError> {
        let len = self.len as usize;
        if len < Self::SERIALIZED_LEN {
            return Err(RemoteError::Framing(format!("packet length {} is smaller than the header", len)));
        }
        if len > max_packet_size {
            return Err(RemoteError::Framing(format!("packet length {} exceeds the cap of {}", len, max_packet_size)));
        }
        Ok(())
    }
}

/// Assembles a complete packet: header first, then one copy of the payload.
pub fn frame(
    message_id: i32,
    rpc_id: i16,
    payload: &[u8],
    out: &mut BytesMut,
    max_packet_size: usize,
) -> Result<(), RemoteError> {
    let total = PacketHeader::SERIALIZED_LEN + payload.len();
    if total > max_packet_size {
        return Err(RemoteError::Framing(format!("packet of {} bytes exceeds the cap of {}", total, max_packet_size)));
    }

    PacketHeader {
        len: total as u16,
        message_id,
        rpc_id,
    }.ser(out);
    out.put_slice(payload);
    Ok(())
}
