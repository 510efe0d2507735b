//! Field-by-field wire encoding of every typed protocol and payload
//! message (spec.md §4.1): fixed-width little-endian integers, `u32`
//! length-prefixed byte vectors and UTF-8 strings, `u32`-counted
//! sequences, `u8` present-flag optionals, and enums at the smallest
//! fitting fixed width. `speedy`'s derive gives us exactly this shape for
//! free, the same way the teacher's submessages (e.g. `Gap`) derive
//! `Readable`/`Writable` rather than hand-rolling a codec.

use speedy::{Readable, Writable};

// ---------------------------------------------------------------------
// Handshake (C2 / C3)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct HandshakeRequest {
  pub protocol_version: u32,
  pub participant_name: String,
  pub capability_flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct HandshakeResponse {
  pub participant_id: u64,
  pub accepted_version: u32,
  pub participant_name: String,
}

/// One already-joined participant, as handed out by the registry to a
/// newcomer (spec.md §4.3, known-peers message).
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct KnownPeer {
  pub name: String,
  pub id: u64,
  pub socket_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct KnownPeersMessage {
  pub peers: Vec<KnownPeer>,
}

/// Broadcast by the registry whenever a newcomer joins, to every
/// already-joined peer.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct PeerJoinedMessage {
  pub peer: KnownPeer,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct PeerLeftMessage {
  pub name: String,
  pub id: u64,
}

/// Sent by a joining participant to the registry right after the generic
/// handshake, advertising the address its peer-mesh listener accepts
/// dials on.
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct AdvertiseListenAddress {
  pub socket_address: String,
}

// ---------------------------------------------------------------------
// Subscriptions (C4)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SubscriptionAnnouncement {
  pub network_name: String,
  pub message_type_tag: u8,
  pub endpoint_id: u64,
}

// ---------------------------------------------------------------------
// Services (C5)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ServiceAttribute {
  pub key: String,
  pub value: String,
}

/// Identity is the full tuple; equality compares all fields (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ServiceDescriptor {
  pub participant_name: String,
  pub network_name: String,
  pub service_name: String,
  pub service_type: String,
  pub endpoint_id: u64,
  pub attributes: Vec<ServiceAttribute>,
}

/// A full snapshot of a participant's service set (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ServiceAnnouncement {
  pub originator: String,
  pub services: Vec<ServiceDescriptor>,
}

// ---------------------------------------------------------------------
// CAN (C6, trivial simulation)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct CanFrameEvent {
  pub network_name: String,
  pub can_id: u32,
  pub data: Vec<u8>,
  pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum CanTransmitStatus {
  Transmitted,
  Cancelled,
  TransmitQueueFull,
  DuplicatedTransmitId,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct CanTransmitAck {
  pub network_name: String,
  pub user_context: u64,
  pub status: CanTransmitStatus,
  pub timestamp_ns: u64,
}

// ---------------------------------------------------------------------
// LIN (C6, trivial simulation)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum LinFrameResponseType {
  MasterResponse,
  SlaveResponse,
  SlaveToSlave,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct LinFrameEvent {
  pub network_name: String,
  pub lin_id: u8,
  pub data: Vec<u8>,
  pub response_type: LinFrameResponseType,
  pub timestamp_ns: u64,
}

// ---------------------------------------------------------------------
// FlexRay (C6, trivial simulation)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum PocState {
  DefaultConfig,
  Ready,
  Wakeup,
  NormalActive,
  Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct FlexrayFrameEvent {
  pub network_name: String,
  pub buffer_id: u16,
  pub slot_id: u16,
  pub payload: Vec<u8>,
  pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum FlexraySymbolPattern {
  Wakeup,
  ColdstartCollision,
  Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct FlexraySymbolEvent {
  pub network_name: String,
  pub pattern: FlexraySymbolPattern,
  pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct FlexrayPocStatusEvent {
  pub network_name: String,
  pub state: PocState,
  pub timestamp_ns: u64,
}

// ---------------------------------------------------------------------
// Ethernet (C6, trivial simulation)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct EthernetFrameEvent {
  pub network_name: String,
  pub data: Vec<u8>,
  pub timestamp_ns: u64,
}

// ---------------------------------------------------------------------
// Generic publish/subscribe (C6)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct GenericMessage {
  pub network_name: String,
  pub topic: String,
  pub data: Vec<u8>,
  pub timestamp_ns: u64,
}

// ---------------------------------------------------------------------
// Lifecycle (C7 / C8)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum ParticipantStateWire {
  Invalid,
  ServicesCreated,
  CommunicationInitializing,
  CommunicationInitialized,
  ReadyToRun,
  Running,
  Paused,
  Stopping,
  Stopped,
  Error,
  ShuttingDown,
  Shutdown,
  Reinitializing,
  Aborting,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct ParticipantStatusMessage {
  pub participant_name: String,
  pub state: ParticipantStateWire,
  pub enter_reason: String,
  pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
#[speedy(tag_type = u8)]
pub enum SystemCommandKind {
  Initialize,
  Run,
  Stop,
  Shutdown,
  AbortSimulation,
  PrepareColdReinitialize,
}

#[derive(Debug, Clone, PartialEq, Eq, Readable, Writable)]
pub struct SystemCommandMessage {
  pub kind: SystemCommandKind,
  /// Present only for `Initialize`, which targets one participant id;
  /// absent (and ignored) for the broadcast commands.
  pub target_participant_id: Option<u64>,
}

// ---------------------------------------------------------------------
// Time synchronization (C9)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub struct NextSimTask {
  pub now_ns: u64,
  pub duration_ns: u64,
}

#[cfg(test)]
mod tests {
  use speedy::Endianness;

  use super::*;

  fn round_trip<T>(value: &T)
  where
    T: for<'a> Readable<'a, Endianness> + Writable<Endianness> + PartialEq + std::fmt::Debug,
  {
    let bytes = value.write_to_vec_with_ctx(Endianness::LittleEndian).unwrap();
    let decoded = T::read_from_buffer_with_ctx(Endianness::LittleEndian, &bytes).unwrap();
    assert_eq!(value, &decoded);
  }

  #[test]
  fn can_frame_event_round_trips() {
    round_trip(&CanFrameEvent {
      network_name: "PowerTrain1".to_owned(),
      can_id: 42,
      data: b"Test Message 42".to_vec(),
      timestamp_ns: 1_000_000,
    });
  }

  #[test]
  fn service_descriptor_round_trips() {
    round_trip(&ServiceDescriptor {
      participant_name: "ECU1".to_owned(),
      network_name: "PowerTrain1".to_owned(),
      service_name: "CAN1".to_owned(),
      service_type: "CanController".to_owned(),
      endpoint_id: 7,
      attributes: vec![ServiceAttribute {
        key: "vendor".to_owned(),
        value: "demo".to_owned(),
      }],
    });
  }

  #[test]
  fn system_command_with_absent_target_round_trips() {
    round_trip(&SystemCommandMessage {
      kind: SystemCommandKind::Run,
      target_participant_id: None,
    });
  }

  #[test]
  fn flexray_poc_status_round_trips() {
    round_trip(&FlexrayPocStatusEvent {
      network_name: "FlexRay1".to_owned(),
      state: PocState::NormalActive,
      timestamp_ns: 5,
    });
  }
}
