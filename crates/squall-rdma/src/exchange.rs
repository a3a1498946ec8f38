//! The on-wire record exchanged when two peers pair up memory regions.
//!
//! Each side tells the other where to aim its one-sided writes: the
//! registration key of its receive buffer and that buffer's virtual
//! address.  The record is 16 bytes, big-endian on the wire regardless
//! of host endianness, and the exchange is symmetric: one send and one
//! receive of the same record over the TCP side channel.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::provider::{MrKey, Vaddr};

/// On-wire length of a [`RegionDescriptor`].
pub const DESCRIPTOR_LEN: usize = 16;

/// Remote-write target description for one memory region.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionDescriptor {
    /// Registration key of the peer's receive buffer.
    pub key: MrKey,
    /// Virtual address of the peer's receive buffer.
    pub addr: Vaddr,
}

impl RegionDescriptor {
    /// Encode this descriptor in wire format.
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut out = [0_u8; DESCRIPTOR_LEN];
        out[..8].copy_from_slice(&self.key.0.to_be_bytes());
        out[8..].copy_from_slice(&self.addr.0.to_be_bytes());
        out
    }

    /// Decode a descriptor from wire format.
    pub fn decode(bytes: &[u8; DESCRIPTOR_LEN]) -> Self {
        // The unwraps cannot fail: both ranges are exactly 8 bytes.
        #[allow(clippy::unwrap_used)]
        let key = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        #[allow(clippy::unwrap_used)]
        let addr = u64::from_be_bytes(bytes[8..].try_into().unwrap());
        RegionDescriptor {
            key: MrKey(key),
            addr: Vaddr(addr),
        }
    }
}

/// Perform the symmetric descriptor exchange over `stream`.
///
/// Sends `mine`, then reads the peer's record.  Both sides run the
/// same sequence, so the call returns once both have entered it.
pub(crate) fn exchange_descriptors(
    stream: &mut TcpStream,
    mine: RegionDescriptor,
) -> std::io::Result<RegionDescriptor> {
    stream.write_all(&mine.encode())?;
    stream.flush()?;
    let mut buf = [0_u8; DESCRIPTOR_LEN];
    stream.read_exact(&mut buf)?;
    Ok(RegionDescriptor::decode(&buf))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;
    use hex_literal::hex;

    #[test]
    fn encoding_is_big_endian() {
        let d = RegionDescriptor {
            key: MrKey(0x0102_0304_0506_0708),
            addr: Vaddr(0x1122_3344_5566_7788),
        };
        assert_eq!(d.encode(), hex!("0102030405060708 1122334455667788"));
    }

    #[test]
    fn decode_inverts_encode() {
        let d = RegionDescriptor {
            key: MrKey(0xdead_beef_cafe_babe),
            addr: Vaddr(0x0000_7fff_1234_5678),
        };
        assert_eq!(RegionDescriptor::decode(&d.encode()), d);
    }

    #[test]
    fn zero_record() {
        let d = RegionDescriptor::decode(&[0; DESCRIPTOR_LEN]);
        assert_eq!(d.key, MrKey(0));
        assert_eq!(d.addr, Vaddr(0));
    }
}
