//! One reliable, ordered, bidirectional byte-stream per peer pair (spec.md
//! §4.2, component C2). Handshake framing is done with a plain blocking
//! `std::net::TcpStream` (simple, and only happens once per link); once
//! established the stream is switched to non-blocking and handed to the
//! [`crate::mesh::ConnectionManager`]'s single `mio::Poll` event loop for
//! the lifetime of the link.

pub mod peer;

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{Result, SilKitError};
use crate::wire::messages::{HandshakeRequest, HandshakeResponse};
use crate::wire::{Frame, FrameKind, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// Performs the connecting side of the handshake (spec.md §4.2):
/// `{protocolVersion, participantName, capabilityFlags}` ->
/// `{participantId, acceptedVersion}` or a one-byte rejection.
pub fn connect_and_handshake(
  addr: SocketAddr,
  participant_name: &str,
  capability_flags: u32,
  timeout: Duration,
) -> Result<(TcpStream, HandshakeResponse)> {
  let stream = TcpStream::connect_timeout(&addr, timeout)?;
  stream.set_nodelay(true)?;
  handshake_as_client(stream, participant_name, capability_flags)
}

pub fn handshake_as_client(
  mut stream: TcpStream,
  participant_name: &str,
  capability_flags: u32,
) -> Result<(TcpStream, HandshakeResponse)> {
  let request = HandshakeRequest {
    protocol_version: PROTOCOL_VERSION,
    participant_name: participant_name.to_owned(),
    capability_flags,
  };
  let payload = speedy::Writable::write_to_vec_with_ctx(&request, speedy::Endianness::LittleEndian)
    .map_err(|e| SilKitError::protocol(format!("failed to encode handshake request: {e}")))?;
  Frame::new(FrameKind::Handshake, payload).write_to(&mut stream)?;

  let response_frame = Frame::read_from(&mut stream)?;
  match response_frame.kind {
    FrameKind::Handshake if response_frame.payload.len() == 1 => {
      let reason = crate::error::RejectReason::from_byte(response_frame.payload[0]);
      Err(SilKitError::protocol(format!("handshake rejected: {reason:?}")))
    }
    FrameKind::Handshake => {
      let response: HandshakeResponse =
        speedy::Readable::read_from_buffer_with_ctx(speedy::Endianness::LittleEndian, &response_frame.payload)
          .map_err(|e| SilKitError::protocol(format!("failed to decode handshake response: {e}")))?;
      Ok((stream, response))
    }
    other => Err(SilKitError::protocol(format!(
      "expected handshake frame, got {other:?}"
    ))),
  }
}

/// Performs the accepting side of the handshake and assigns `participant_id`.
pub fn handshake_as_server(
  mut stream: TcpStream,
  participant_id: u64,
  own_name: &str,
) -> Result<(TcpStream, HandshakeRequest)> {
  let request_frame = Frame::read_from(&mut stream)?;
  if request_frame.kind != FrameKind::Handshake {
    return Err(SilKitError::protocol("expected handshake frame"));
  }
  let request: HandshakeRequest =
    speedy::Readable::read_from_buffer_with_ctx(speedy::Endianness::LittleEndian, &request_frame.payload)
      .map_err(|e| SilKitError::protocol(format!("failed to decode handshake request: {e}")))?;

  if request.protocol_version < MIN_PROTOCOL_VERSION {
    Frame::new(FrameKind::Handshake, vec![crate::error::RejectReason::VersionTooOld as u8])
      .write_to(&mut stream)?;
    return Err(SilKitError::protocol("peer protocol version below floor"));
  }

  let response = HandshakeResponse {
    participant_id,
    accepted_version: PROTOCOL_VERSION.min(request.protocol_version),
    participant_name: own_name.to_owned(),
  };
  let payload = speedy::Writable::write_to_vec_with_ctx(&response, speedy::Endianness::LittleEndian)
    .map_err(|e| SilKitError::protocol(format!("failed to encode handshake response: {e}")))?;
  Frame::new(FrameKind::Handshake, payload).write_to(&mut stream)?;

  Ok((stream, request))
}
