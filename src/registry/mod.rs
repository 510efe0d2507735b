//! A long-lived, well-known rendezvous endpoint every participant
//! contacts first (spec.md §4.3, component C3). The registry is a
//! directory only — it never relays simulation traffic, so a simple
//! thread-per-connection server built on blocking `std::net` sockets is
//! sufficient; the mesh itself (C4) is where the multiplexed `mio` event
//! loop lives.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::error::{Result, SilKitError};
use crate::transport;
use crate::wire::messages::{AdvertiseListenAddress, KnownPeer, KnownPeersMessage, PeerJoinedMessage, PeerLeftMessage};
use crate::wire::{Frame, RegistryMessageTag};

struct RegistryState {
  next_id: u64,
  peers: HashMap<String, KnownPeer>,
  /// One outbound channel per currently-connected liveness thread, used to
  /// push join/departure broadcasts without each connection's writer
  /// having to take the state lock while holding the socket.
  broadcast_senders: HashMap<String, Sender<Frame>>,
}

impl RegistryState {
  fn new() -> Self {
    Self {
      next_id: 1,
      peers: HashMap::new(),
      broadcast_senders: HashMap::new(),
    }
  }
}

/// Handle to a running registry; dropping it does not stop the server —
/// call [`Registry::run`] in a dedicated thread and keep the `JoinHandle`
/// if you need to stop the process some other way (e.g. process exit).
pub struct Registry {
  listener: TcpListener,
  state: Arc<Mutex<RegistryState>>,
}

impl Registry {
  pub fn bind(addr: SocketAddr) -> Result<Self> {
    let listener = TcpListener::bind(addr)?;
    Ok(Self {
      listener,
      state: Arc::new(Mutex::new(RegistryState::new())),
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Runs the accept loop on the calling thread, blocking forever (or
  /// until the listener errors out). Callers typically spawn this on its
  /// own thread.
  pub fn run(self) -> Result<()> {
    for incoming in self.listener.incoming() {
      let stream = match incoming {
        Ok(s) => s,
        Err(e) => {
          warn!("registry accept error: {e}");
          continue;
        }
      };
      let state = Arc::clone(&self.state);
      thread::spawn(move || {
        if let Err(e) = handle_connection(stream, state) {
          warn!("registry connection ended: {e}");
        }
      });
    }
    Ok(())
  }
}

fn handle_connection(stream: TcpStream, state: Arc<Mutex<RegistryState>>) -> Result<()> {
  let participant_id = {
    let mut guard = state.lock().unwrap();
    let id = guard.next_id;
    guard.next_id += 1;
    id
  };

  let (mut stream, request) = transport::handshake_as_server(stream, participant_id, "registry")?;
  let participant_name = request.participant_name;

  let advertise_frame = Frame::read_from(&mut stream)?;
  let (tag, advertised): (RegistryMessageTag, AdvertiseListenAddress) =
    advertise_frame.decode_registry_message()?;
  if tag != RegistryMessageTag::Advertise {
    return Err(SilKitError::protocol("expected listen-address advertisement"));
  }
  info!(
    "registry: {participant_name} joined as id {participant_id} at {}",
    advertised.socket_address
  );

  let (known_peers, sender) = {
    let mut guard = state.lock().unwrap();
    let known_peers: Vec<KnownPeer> = guard.peers.values().cloned().collect();

    let new_peer = KnownPeer {
      name: participant_name.clone(),
      id: participant_id,
      socket_address: advertised.socket_address,
    };
    guard.peers.insert(participant_name.clone(), new_peer.clone());

    let (tx, rx) = mpsc::channel::<Frame>();
    guard.broadcast_senders.insert(participant_name.clone(), tx.clone());

    let join_frame = Frame::encode_registry_message(
      RegistryMessageTag::PeerJoined,
      &PeerJoinedMessage { peer: new_peer },
    )?;
    for (name, sender) in guard.broadcast_senders.iter() {
      if name != &participant_name {
        let _ = sender.send(join_frame.clone());
      }
    }

    (known_peers, rx)
  };

  let known_peers_frame = Frame::encode_registry_message(
    RegistryMessageTag::KnownPeers,
    &KnownPeersMessage { peers: known_peers },
  )?;

  let mut writer_stream = stream.try_clone()?;
  known_peers_frame.write_to(&mut writer_stream)?;

  // Writer thread: drains this connection's broadcast channel for the
  // lifetime of the liveness connection.
  let writer_handle = thread::spawn(move || {
    for frame in sender.iter() {
      if frame.write_to(&mut writer_stream).is_err() {
        break;
      }
    }
  });

  // Liveness: block on reads (registry never expects application data on
  // this connection after the handshake) until EOF/error signals
  // departure.
  let mut reader_stream = stream;
  let mut scratch = [0u8; 1];
  loop {
    use std::io::Read;
    match reader_stream.read(&mut scratch) {
      Ok(0) => break,
      Ok(_) => continue, // unexpected application data; ignore, registry is directory-only
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(_) => break,
    }
  }

  let mut guard = state.lock().unwrap();
  guard.peers.remove(&participant_name);
  guard.broadcast_senders.remove(&participant_name);
  let departure_frame = Frame::encode_registry_message(
    RegistryMessageTag::PeerLeft,
    &PeerLeftMessage {
      name: participant_name.clone(),
      id: participant_id,
    },
  )?;
  for sender in guard.broadcast_senders.values() {
    let _ = sender.send(departure_frame.clone());
  }
  drop(guard);

  info!("registry: {participant_name} departed");
  let _ = writer_handle.join();
  Ok(())
}

pub mod client;
