//! Length-delimited, typed binary framing over a byte stream (spec.md
//! §4.1, component C1).
//!
//! A frame on the wire is `u32 length || u8 kind || payload[length-1]`,
//! `length` counting the kind byte and payload, in the byte order
//! negotiated at handshake (little-endian in practice — we only implement
//! little-endian, since no peer in this crate ever negotiates otherwise).
//! `kind` distinguishes handshake, subscription announcement, service
//! announcement and ib-message (the carrier of all typed simulation
//! traffic) frames; the typed payload's own tag (see [`messages`]) further
//! discriminates ib-message frames.

pub mod messages;

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use speedy::{Endianness, Readable, Writable};

use crate::error::{Result, SilKitError};

/// Serialization protocol version understood by this crate. Writers must
/// refuse to downgrade below [`MIN_PROTOCOL_VERSION`].
pub const PROTOCOL_VERSION: u32 = 1;
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Frame kind, carried as the single byte right after the length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
  Handshake = 0,
  SubscriptionAnnouncement = 1,
  ServiceAnnouncement = 2,
  IbMessage = 3,
  /// Registry directory traffic: known-peers snapshot, peer-joined,
  /// peer-left. Never sent over a peer-mesh link, only over the
  /// registry's liveness connection.
  Registry = 4,
}

impl FrameKind {
  pub fn from_byte(b: u8) -> Result<Self> {
    Ok(match b {
      0 => FrameKind::Handshake,
      1 => FrameKind::SubscriptionAnnouncement,
      2 => FrameKind::ServiceAnnouncement,
      3 => FrameKind::IbMessage,
      4 => FrameKind::Registry,
      other => return Err(SilKitError::protocol(format!("unknown frame kind {other}"))),
    })
  }
}

/// Stable integer tag for the three registry directory messages, mirrors
/// [`MessageTag`]'s role for ib-messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryMessageTag {
  KnownPeers = 0,
  PeerJoined = 1,
  PeerLeft = 2,
  /// Sent by a newly connected participant right after the generic
  /// handshake, carrying the address its *peer-mesh* listener accepts
  /// dials on (distinct from the ephemeral source port of this very
  /// registry connection). The generic handshake fields (spec.md §4.2)
  /// don't carry an address since they are shared with peer-to-peer
  /// handshakes; the registry needs one more round-trip to learn it.
  Advertise = 3,
}

impl RegistryMessageTag {
  pub fn from_byte(b: u8) -> Result<Self> {
    Ok(match b {
      0 => RegistryMessageTag::KnownPeers,
      1 => RegistryMessageTag::PeerJoined,
      2 => RegistryMessageTag::PeerLeft,
      3 => RegistryMessageTag::Advertise,
      other => return Err(SilKitError::protocol(format!("unknown registry message tag {other}"))),
    })
  }
}

/// A single frame read off (or about to be written onto) a peer byte
/// stream: the kind byte plus the undecoded payload bytes. Typed decoding
/// into a concrete message happens one layer up, once the kind is known.
#[derive(Debug, Clone)]
pub struct Frame {
  pub kind: FrameKind,
  pub payload: Vec<u8>,
}

impl Frame {
  pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
    Self { kind, payload }
  }

  /// Encodes `length || kind || payload` onto `out`. `length` is
  /// `payload.len() + 1` (the kind byte is counted).
  pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
    let length = u32::try_from(self.payload.len() + 1)
      .map_err(|_| SilKitError::protocol("frame payload too large"))?;
    out.write_u32::<LittleEndian>(length)?;
    out.write_u8(self.kind as u8)?;
    out.write_all(&self.payload)?;
    Ok(())
  }

  /// Reads one complete frame from `input`. Blocks (on a blocking stream)
  /// or returns `WouldBlock` (on a non-blocking one) until the whole frame
  /// is available; callers that drive a non-blocking socket should buffer
  /// partial reads themselves (see [`crate::transport::peer::PeerLink`]),
  /// this helper is for the simple blocking registry path.
  pub fn read_from<R: Read>(input: &mut R) -> Result<Self> {
    let length = input.read_u32::<LittleEndian>()?;
    if length == 0 {
      return Err(SilKitError::protocol("zero-length frame"));
    }
    let kind = FrameKind::from_byte(input.read_u8()?)?;
    let mut payload = vec![0u8; (length - 1) as usize];
    input.read_exact(&mut payload)?;
    Ok(Frame { kind, payload })
  }

  pub fn encode_ib_message<T: Writable<Endianness>>(tag: MessageTag, message: &T) -> Result<Self> {
    let mut payload = Vec::with_capacity(64);
    payload.push(tag as u8);
    let body = message
      .write_to_vec_with_ctx(Endianness::LittleEndian)
      .map_err(|e| SilKitError::protocol(format!("failed to encode {tag:?}: {e}")))?;
    payload.extend_from_slice(&body);
    Ok(Frame::new(FrameKind::IbMessage, payload))
  }

  pub fn decode_ib_message<T: for<'a> Readable<'a, Endianness>>(&self) -> Result<(MessageTag, T)> {
    if self.kind != FrameKind::IbMessage {
      return Err(SilKitError::protocol("expected ib-message frame"));
    }
    let &[tag_byte, ref body @ ..] = self.payload.as_slice() else {
      return Err(SilKitError::protocol("empty ib-message frame"));
    };
    let tag = MessageTag::from_byte(tag_byte)?;
    let message = T::read_from_buffer_with_ctx(Endianness::LittleEndian, body)
      .map_err(|e| SilKitError::protocol(format!("failed to decode {tag:?}: {e}")))?;
    Ok((tag, message))
  }

  /// Encodes a frame whose kind alone identifies the payload type (no
  /// leading tag byte needed): handshake, subscription announcement and
  /// service announcement frames, each of which carries exactly one
  /// message shape.
  pub fn encode_simple<T: Writable<Endianness>>(kind: FrameKind, message: &T) -> Result<Self> {
    let payload = message
      .write_to_vec_with_ctx(Endianness::LittleEndian)
      .map_err(|e| SilKitError::protocol(format!("failed to encode {kind:?} frame: {e}")))?;
    Ok(Frame::new(kind, payload))
  }

  pub fn decode_simple<T: for<'a> Readable<'a, Endianness>>(&self, expected_kind: FrameKind) -> Result<T> {
    if self.kind != expected_kind {
      return Err(SilKitError::protocol(format!(
        "expected {expected_kind:?} frame, got {:?}",
        self.kind
      )));
    }
    T::read_from_buffer_with_ctx(Endianness::LittleEndian, &self.payload)
      .map_err(|e| SilKitError::protocol(format!("failed to decode {expected_kind:?} frame: {e}")))
  }

  pub fn encode_registry_message<T: Writable<Endianness>>(tag: RegistryMessageTag, message: &T) -> Result<Self> {
    let mut payload = Vec::with_capacity(64);
    payload.push(tag as u8);
    let body = message
      .write_to_vec_with_ctx(Endianness::LittleEndian)
      .map_err(|e| SilKitError::protocol(format!("failed to encode {tag:?}: {e}")))?;
    payload.extend_from_slice(&body);
    Ok(Frame::new(FrameKind::Registry, payload))
  }

  pub fn decode_registry_message<T: for<'a> Readable<'a, Endianness>>(&self) -> Result<(RegistryMessageTag, T)> {
    if self.kind != FrameKind::Registry {
      return Err(SilKitError::protocol("expected registry frame"));
    }
    let &[tag_byte, ref body @ ..] = self.payload.as_slice() else {
      return Err(SilKitError::protocol("empty registry frame"));
    };
    let tag = RegistryMessageTag::from_byte(tag_byte)?;
    let message = T::read_from_buffer_with_ctx(Endianness::LittleEndian, body)
      .map_err(|e| SilKitError::protocol(format!("failed to decode {tag:?}: {e}")))?;
    Ok((tag, message))
  }
}

/// Stable integer tag for every typed message carried inside an
/// `IbMessage` frame. Unknown tags on read are a fatal protocol error, not
/// silently skipped, because misalignment corrupts the rest of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageTag {
  CanFrameEvent = 0,
  CanTransmitAck = 1,
  LinFrameEvent = 2,
  FlexrayFrameEvent = 3,
  FlexraySymbolEvent = 4,
  FlexrayPocStatusEvent = 5,
  EthernetFrameEvent = 6,
  GenericMessage = 7,
  ParticipantStatusMessage = 8,
  SystemCommandMessage = 9,
  NextSimTask = 10,
}

impl MessageTag {
  pub fn from_byte(b: u8) -> Result<Self> {
    Ok(match b {
      0 => MessageTag::CanFrameEvent,
      1 => MessageTag::CanTransmitAck,
      2 => MessageTag::LinFrameEvent,
      3 => MessageTag::FlexrayFrameEvent,
      4 => MessageTag::FlexraySymbolEvent,
      5 => MessageTag::FlexrayPocStatusEvent,
      6 => MessageTag::EthernetFrameEvent,
      7 => MessageTag::GenericMessage,
      8 => MessageTag::ParticipantStatusMessage,
      9 => MessageTag::SystemCommandMessage,
      10 => MessageTag::NextSimTask,
      other => return Err(SilKitError::protocol(format!("unknown message tag {other}"))),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_round_trips_through_bytes() {
    let frame = Frame::new(FrameKind::ServiceAnnouncement, vec![1, 2, 3, 4]);
    let mut buf = Vec::new();
    frame.write_to(&mut buf).unwrap();
    // length (4) + kind (1) + payload (4)
    assert_eq!(buf.len(), 4 + 1 + 4);
    let mut cursor = io::Cursor::new(buf);
    let decoded = Frame::read_from(&mut cursor).unwrap();
    assert_eq!(decoded.kind, FrameKind::ServiceAnnouncement);
    assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
  }

  #[test]
  fn unknown_frame_kind_is_a_protocol_error() {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(2).unwrap();
    buf.write_u8(200).unwrap();
    buf.write_u8(0).unwrap();
    let mut cursor = io::Cursor::new(buf);
    assert!(Frame::read_from(&mut cursor).is_err());
  }
}
