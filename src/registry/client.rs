//! Participant-side registry join (spec.md §4.3/§4.4): dial the registry,
//! hand over our handshake, and keep the liveness connection alive on a
//! background thread so the connection manager learns about later
//! joins/departures without polling.

use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::Sender;
use std::thread;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Result, SilKitError};
use crate::transport;
use crate::wire::messages::{
  AdvertiseListenAddress, HandshakeResponse, KnownPeer, KnownPeersMessage, PeerJoinedMessage, PeerLeftMessage,
};
use crate::wire::{Frame, RegistryMessageTag};

/// Directory events the registry liveness thread forwards to the
/// connection manager.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
  KnownPeers(Vec<KnownPeer>),
  PeerJoined(KnownPeer),
  PeerLeft { name: String, id: u64 },
  Disconnected,
}

/// Joins the registry at `registry_addr`, returning our assigned identity
/// and a `JoinHandle` for the background liveness thread that forwards
/// subsequent directory events to `events`.
pub fn join_registry(
  registry_addr: SocketAddr,
  participant_name: &str,
  capability_flags: u32,
  peer_listen_addr: SocketAddr,
  events: Sender<RegistryEvent>,
) -> Result<(HandshakeResponse, thread::JoinHandle<()>)> {
  let stream = TcpStream::connect(registry_addr)?;
  stream.set_nodelay(true)?;
  let (mut stream, response) = transport::handshake_as_client(stream, participant_name, capability_flags)?;

  let advertise_frame = Frame::encode_registry_message(
    RegistryMessageTag::Advertise,
    &AdvertiseListenAddress {
      socket_address: peer_listen_addr.to_string(),
    },
  )?;
  advertise_frame.write_to(&mut stream)?;

  let known_peers_frame = Frame::read_from(&mut (&stream))?;
  let (tag, known_peers): (RegistryMessageTag, KnownPeersMessage) =
    known_peers_frame.decode_registry_message()?;
  if tag != RegistryMessageTag::KnownPeers {
    return Err(SilKitError::protocol("expected known-peers message on join"));
  }
  let _ = events.send(RegistryEvent::KnownPeers(known_peers.peers));

  let handle = thread::spawn(move || run_liveness_thread(stream, events));
  Ok((response, handle))
}

fn run_liveness_thread(mut stream: TcpStream, events: Sender<RegistryEvent>) {
  loop {
    let frame = match Frame::read_from(&mut stream) {
      Ok(f) => f,
      Err(e) => {
        warn!("registry liveness connection ended: {e}");
        let _ = events.send(RegistryEvent::Disconnected);
        return;
      }
    };
    let decoded = match frame.decode_registry_message::<PeerJoinedMessage>() {
      Ok((RegistryMessageTag::PeerJoined, msg)) => Some(RegistryEvent::PeerJoined(msg.peer)),
      _ => None,
    };
    if let Some(event) = decoded {
      let _ = events.send(event);
      continue;
    }
    if let Ok((RegistryMessageTag::PeerLeft, msg)) = frame.decode_registry_message::<PeerLeftMessage>() {
      let _ = events.send(RegistryEvent::PeerLeft {
        name: msg.name,
        id: msg.id,
      });
    }
  }
}
