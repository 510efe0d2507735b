// Crate-wide error type. One variant family per error kind in the system's
// error handling design: configuration, transport, protocol, lifecycle and
// timeout errors. Transport/protocol errors are raised at the connection
// that caused them and surfaced as peer-departure events by the connection
// manager; lifecycle errors are raised when a user handler panics or an
// illegal state transition is requested.

use std::fmt;

pub type Result<T> = std::result::Result<T, SilKitError>;

#[derive(thiserror::Error, Debug)]
pub enum SilKitError {
  /// Invalid participant name, duplicate controller on the same network,
  /// or an unknown service referenced by the caller. Raised at
  /// construction time.
  #[error("configuration error: {0}")]
  Configuration(String),

  /// Peer disconnect, handshake mismatch, or any I/O failure on a peer
  /// link.
  #[error("transport error: {0}")]
  Transport(String),

  /// Unknown wire tag, version floor violation, or a command that is
  /// unexpected in the current protocol state.
  #[error("protocol error: {0}")]
  Protocol(String),

  /// A handler threw, or an illegal lifecycle state transition was
  /// requested.
  #[error("lifecycle error: {0}")]
  Lifecycle(String),

  /// A barrier wait or a cancellation exceeded its bound.
  #[error("timeout error: {0}")]
  Timeout(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl SilKitError {
  pub fn configuration(msg: impl fmt::Display) -> Self {
    SilKitError::Configuration(msg.to_string())
  }

  pub fn transport(msg: impl fmt::Display) -> Self {
    SilKitError::Transport(msg.to_string())
  }

  pub fn protocol(msg: impl fmt::Display) -> Self {
    SilKitError::Protocol(msg.to_string())
  }

  pub fn lifecycle(msg: impl fmt::Display) -> Self {
    SilKitError::Lifecycle(msg.to_string())
  }

  pub fn timeout(msg: impl fmt::Display) -> Self {
    SilKitError::Timeout(msg.to_string())
  }
}

/// A specific reason why a handshake was rejected. Sent as a one-byte
/// payload per spec (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
  VersionTooOld = 0,
  DuplicateName = 1,
  Other = 2,
}

impl RejectReason {
  pub fn from_byte(b: u8) -> Self {
    match b {
      0 => RejectReason::VersionTooOld,
      1 => RejectReason::DuplicateName,
      _ => RejectReason::Other,
    }
  }
}
