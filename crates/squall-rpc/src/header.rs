//! The fixed header preceding every RPC message.
//!
//! Three fields, in this order and in native byte order (messages never
//! leave the cluster, and every member runs the same build):
//!
//! | field          | width               |
//! |----------------|---------------------|
//! | `payload_size` | platform size word  |
//! | `opcode`       | 64 bits             |
//! | `from`         | 32 bits             |

use derive_more::{Display, From, Into};

use squall_rdma::NodeId;

/// Identifier of the remote function a message invokes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Display, From, Into)]
#[display("{_0:#x}")]
pub struct Opcode(pub u64);

/// Byte width of the `payload_size` field.
const SIZE_WIDTH: usize = std::mem::size_of::<usize>();

/// Byte width of the `opcode` field.
const OPCODE_WIDTH: usize = std::mem::size_of::<u64>();

/// Byte width of the `from` field.
const FROM_WIDTH: usize = std::mem::size_of::<u32>();

/// Total byte width of the header.
pub const HEADER_LEN: usize = SIZE_WIDTH + OPCODE_WIDTH + FROM_WIDTH;

/// The decoded (or to-be-encoded) fields of a message header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    /// Byte length of the body that follows the header.
    pub payload_size: usize,
    /// Which remote function the message invokes.
    pub opcode: Opcode,
    /// Sender's node id.
    pub from: NodeId,
}

/// Write `header` into the first [`HEADER_LEN`] bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than [`HEADER_LEN`].
pub fn populate_header(buf: &mut [u8], header: &Header) {
    assert!(buf.len() >= HEADER_LEN, "buffer too short for header");
    let mut at = 0;
    buf[at..at + SIZE_WIDTH].copy_from_slice(&header.payload_size.to_ne_bytes());
    at += SIZE_WIDTH;
    buf[at..at + OPCODE_WIDTH].copy_from_slice(&header.opcode.0.to_ne_bytes());
    at += OPCODE_WIDTH;
    buf[at..at + FROM_WIDTH].copy_from_slice(&header.from.0.to_ne_bytes());
}

/// Read a header back out of the first [`HEADER_LEN`] bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than [`HEADER_LEN`].
pub fn retrieve_header(buf: &[u8]) -> Header {
    assert!(buf.len() >= HEADER_LEN, "buffer too short for header");
    /// Fixed-size copy out of a slice; infallible once the outer length
    /// check has passed.
    fn take<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut out = [0_u8; N];
        out.copy_from_slice(&bytes[..N]);
        out
    }
    let mut at = 0;
    let payload_size = usize::from_ne_bytes(take(&buf[at..at + SIZE_WIDTH]));
    at += SIZE_WIDTH;
    let opcode = u64::from_ne_bytes(take(&buf[at..at + OPCODE_WIDTH]));
    at += OPCODE_WIDTH;
    let from = u32::from_ne_bytes(take(&buf[at..at + FROM_WIDTH]));
    Header {
        payload_size,
        opcode: Opcode(opcode),
        from: NodeId(from),
    }
}

/// An owned message buffer: header space followed by a body region.
///
/// `with_body_len(n)` reserves `HEADER_LEN + n` zeroed bytes; the body
/// accessors expose the region after the header, which is where payload
/// serialization writes.
#[derive(Debug, Clone)]
pub struct FramedBuf {
    /// Header bytes followed by body bytes.
    bytes: Box<[u8]>,
}

impl FramedBuf {
    /// Allocate a frame with room for an `n`-byte body.
    pub fn with_body_len(n: usize) -> Self {
        FramedBuf {
            bytes: vec![0_u8; HEADER_LEN + n].into_boxed_slice(),
        }
    }

    /// Encode `header` into the frame.
    pub fn set_header(&mut self, header: &Header) {
        populate_header(&mut self.bytes, header);
    }

    /// Decode the frame's header.
    pub fn header(&self) -> Header {
        retrieve_header(&self.bytes)
    }

    /// Return the body region.
    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Return the body region, mutably.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[HEADER_LEN..]
    }

    /// Return the whole frame (header plus body), ready for the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::missing_docs_in_private_items)]
    use super::*;

    #[test]
    fn round_trip() {
        let header = Header {
            payload_size: 1234,
            opcode: Opcode(0xDEAD_BEEF_CAFE_BABE),
            from: NodeId(7),
        };
        let mut buf = [0_u8; HEADER_LEN + 3];
        populate_header(&mut buf, &header);
        assert_eq!(retrieve_header(&buf), header);
    }

    #[test]
    fn extreme_values_round_trip() {
        for header in [
            Header {
                payload_size: 0,
                opcode: Opcode(0),
                from: NodeId(0),
            },
            Header {
                payload_size: usize::MAX,
                opcode: Opcode(u64::MAX),
                from: NodeId(u32::MAX),
            },
        ] {
            let mut buf = [0_u8; HEADER_LEN];
            populate_header(&mut buf, &header);
            assert_eq!(retrieve_header(&buf), header);
        }
    }

    #[test]
    fn framed_buf_reserves_header_space() {
        let mut frame = FramedBuf::with_body_len(16);
        assert_eq!(frame.as_bytes().len(), HEADER_LEN + 16);
        frame.body_mut().copy_from_slice(&[0xab_u8; 16]);
        frame.set_header(&Header {
            payload_size: 16,
            opcode: Opcode(2),
            from: NodeId(1),
        });
        // Writing the header does not clobber the body, and vice versa.
        assert_eq!(frame.body(), &[0xab_u8; 16]);
        assert_eq!(frame.header().payload_size, 16);
        let mut expect = [0_u8; HEADER_LEN];
        populate_header(
            &mut expect,
            &Header {
                payload_size: 16,
                opcode: Opcode(2),
                from: NodeId(1),
            },
        );
        assert_eq!(&frame.as_bytes()[..HEADER_LEN], expect);
    }

    #[test]
    #[should_panic(expected = "buffer too short")]
    fn short_buffer_rejected() {
        let mut buf = [0_u8; HEADER_LEN - 1];
        populate_header(
            &mut buf,
            &Header {
                payload_size: 0,
                opcode: Opcode(0),
                from: NodeId(0),
            },
        );
    }
}
