//! # Message Envelope
//!
//! The framed unit exchanged between a peer and the server.
//!
//! ## Wire Format
//! ```text
//! [Tag(2, BE)] [Channel(1)] [DeliveryMode(1)] [Length(4, BE)] [Payload(N)]
//! ```
//!
//! ## Ownership
//! An [`Envelope`] never copies its payload. The bytes live in a [`PooledBuffer`]
//! behind an atomic reference count: [`Envelope::duplicate`] adds a reference,
//! dropping (or [`Envelope::dispose`]-ing) an envelope removes one, and the buffer
//! goes back to its pool when the last reference is gone. Because disposal
//! consumes the envelope, a double dispose does not type-check.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};
use crate::utils::buffer_pool::PooledBuffer;

/// Fixed size of the envelope header in bytes
pub const HEADER_SIZE: usize = 8;

/// Message discriminator.
///
/// The two highest values are reserved for server-originated control envelopes
/// and must never arrive from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u16);

impl Tag {
    /// Delivers the session's identity/configuration to the peer.
    pub const CONFIGURE: Tag = Tag(u16::MAX);
    /// Peer identity announcement.
    pub const IDENTIFY: Tag = Tag(u16::MAX - 1);

    /// True for the reserved control tags.
    #[inline]
    pub fn is_command(self) -> bool {
        self == Tag::CONFIGURE || self == Tag::IDENTIFY
    }
}

impl From<u16> for Tag {
    fn from(value: u16) -> Self {
        Tag(value)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::CONFIGURE => f.write_str("CONFIGURE"),
            Tag::IDENTIFY => f.write_str("IDENTIFY"),
            Tag(value) => write!(f, "{value}"),
        }
    }
}

/// Reliability/ordering class requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DeliveryMode {
    Unreliable = 0,
    #[default]
    Reliable = 1,
    ReliableOrdered = 2,
}

impl DeliveryMode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DeliveryMode::Unreliable),
            1 => Some(DeliveryMode::Reliable),
            2 => Some(DeliveryMode::ReliableOrdered),
            _ => None,
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Decoded fixed-width header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub tag: Tag,
    pub channel: u8,
    pub delivery_mode: DeliveryMode,
    pub payload_len: usize,
}

impl EnvelopeHeader {
    /// Parse the header at the start of `buf`.
    ///
    /// With `validate` set, an unknown delivery mode or a declared length that
    /// disagrees with the bytes present is rejected. Without it the mode falls
    /// back to [`DeliveryMode::Reliable`] and the payload is whatever follows
    /// the header.
    pub fn decode(buf: &[u8], validate: bool) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut cursor = buf;
        let tag = Tag(cursor.get_u16());
        let channel = cursor.get_u8();
        let mode_byte = cursor.get_u8();
        let declared = cursor.get_u32() as usize;
        let actual = cursor.remaining();

        let delivery_mode = match DeliveryMode::from_byte(mode_byte) {
            Some(mode) => mode,
            None if validate => return Err(ProtocolError::UnknownDeliveryMode(mode_byte)),
            None => DeliveryMode::default(),
        };

        if validate && declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            tag,
            channel,
            delivery_mode,
            payload_len: actual,
        })
    }

    /// Append the header to `out`.
    pub fn encode<B: BufMut>(&self, out: &mut B) -> Result<()> {
        let len = u32::try_from(self.payload_len)
            .map_err(|_| ProtocolError::OversizedPacket(self.payload_len))?;
        out.put_u16(self.tag.0);
        out.put_u8(self.channel);
        out.put_u8(self.delivery_mode.as_byte());
        out.put_u32(len);
        Ok(())
    }
}

/// A tagged payload sharing a reference-counted pooled buffer.
pub struct Envelope {
    tag: Tag,
    channel: u8,
    delivery_mode: DeliveryMode,
    backing: Arc<PooledBuffer>,
    payload: Range<usize>,
}

impl Envelope {
    /// Build an envelope that takes the single reference to `payload`.
    pub fn create(tag: Tag, payload: PooledBuffer) -> Self {
        let len = payload.len();
        Self {
            tag,
            channel: 0,
            delivery_mode: DeliveryMode::default(),
            backing: Arc::new(payload),
            payload: 0..len,
        }
    }

    /// Decode an envelope from a raw inbound buffer without copying the payload.
    ///
    /// On error the buffer is dropped and returns to its pool.
    pub fn from_buffer(buffer: PooledBuffer, validate_header: bool) -> Result<Self> {
        let header = EnvelopeHeader::decode(&buffer, validate_header)?;
        let end = buffer.len();
        Ok(Self {
            tag: header.tag,
            channel: header.channel,
            delivery_mode: header.delivery_mode,
            backing: Arc::new(buffer),
            payload: HEADER_SIZE..end,
        })
    }

    /// New envelope sharing this one's backing buffer.
    pub fn duplicate(&self) -> Self {
        Self {
            tag: self.tag,
            channel: self.channel,
            delivery_mode: self.delivery_mode,
            backing: Arc::clone(&self.backing),
            payload: self.payload.clone(),
        }
    }

    /// Release this reference. The buffer is recycled once every duplicate is gone.
    #[inline]
    pub fn dispose(self) {
        drop(self);
    }

    /// Number of live envelopes sharing the backing buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.backing)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn payload(&self) -> &[u8] {
        &self.backing[self.payload.clone()]
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Serialize header and payload into `out` using the given routing fields.
    pub fn encode_into<B: BufMut>(
        &self,
        channel: u8,
        delivery_mode: DeliveryMode,
        out: &mut B,
    ) -> Result<()> {
        EnvelopeHeader {
            tag: self.tag,
            channel,
            delivery_mode,
            payload_len: self.len(),
        }
        .encode(out)?;
        out.put_slice(self.payload());
        Ok(())
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("tag", &self.tag)
            .field("channel", &self.channel)
            .field("delivery_mode", &self.delivery_mode)
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::buffer_pool::BufferPool;

    fn frame(tag: u16, channel: u8, mode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(tag);
        out.put_u8(channel);
        out.put_u8(mode);
        out.put_u32(payload.len() as u32);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn decodes_header_and_payload() {
        let pool = BufferPool::new(1);
        let buf = pool.acquire_from(&frame(12, 3, 2, b"hello"));
        let env = Envelope::from_buffer(buf, true).expect("valid frame");

        assert_eq!(env.tag(), Tag(12));
        assert_eq!(env.channel(), 3);
        assert_eq!(env.delivery_mode(), DeliveryMode::ReliableOrdered);
        assert_eq!(env.payload(), b"hello");
    }

    #[test]
    fn undersized_buffer_is_bounds_violation() {
        let pool = BufferPool::new(1);
        let err = Envelope::from_buffer(pool.acquire_from(&[1, 2]), true).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::BufferTooSmall {
                needed: HEADER_SIZE,
                actual: 2
            }
        ));
        // rejected buffer went straight back to the pool
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn validation_checks_mode_and_length() {
        let pool = BufferPool::new(2);

        let bad_mode = frame(1, 0, 9, b"x");
        assert!(matches!(
            Envelope::from_buffer(pool.acquire_from(&bad_mode), true),
            Err(ProtocolError::UnknownDeliveryMode(9))
        ));
        let lenient = Envelope::from_buffer(pool.acquire_from(&bad_mode), false).unwrap();
        assert_eq!(lenient.delivery_mode(), DeliveryMode::Reliable);

        let mut short = frame(1, 0, 1, b"abcd");
        short.truncate(short.len() - 1);
        assert!(matches!(
            Envelope::from_buffer(pool.acquire_from(&short), true),
            Err(ProtocolError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        ));
        let lenient = Envelope::from_buffer(pool.acquire_from(&short), false).unwrap();
        assert_eq!(lenient.payload(), b"abc");
    }

    #[test]
    fn duplicate_shares_backing_storage() {
        let pool = BufferPool::new(1);
        let original = Envelope::create(Tag(5), pool.acquire_from(b"data"));
        assert_eq!(pool.available(), 0);

        let copy = original.duplicate();
        assert_eq!(original.ref_count(), 2);
        assert_eq!(copy.payload().as_ptr(), original.payload().as_ptr());

        original.dispose();
        assert_eq!(copy.ref_count(), 1);
        assert_eq!(pool.available(), 0);

        copy.dispose();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn encode_uses_routing_arguments() {
        let pool = BufferPool::new(1);
        let env = Envelope::create(Tag(300), pool.acquire_from(&[0xAA, 0xBB]));
        let mut out = Vec::new();
        env.encode_into(7, DeliveryMode::Unreliable, &mut out).unwrap();

        assert_eq!(out, frame(300, 7, 0, &[0xAA, 0xBB]));
    }

    #[test]
    fn command_tags() {
        assert!(Tag::CONFIGURE.is_command());
        assert!(Tag::IDENTIFY.is_command());
        assert!(!Tag(0).is_command());
        assert_eq!(Tag::CONFIGURE.to_string(), "CONFIGURE");
        assert_eq!(Tag(42).to_string(), "42");
    }
}
