//! Per-participant connection manager (spec.md §4.4, component C4): joins
//! the registry, dials every known peer, accepts inbound peer dials,
//! maintains the mesh, and routes inbound frames to local subscribers.
//!
//! Owns the single I/O thread described in spec.md §5: a `mio::Poll`
//! event loop drives every peer socket plus the peer-mesh listener, on
//! one thread, so user-facing handlers invoked from a received frame are
//! serialized with respect to each other exactly as the concurrency model
//! requires. Everything else in the participant talks to this thread only
//! through [`ConnectionManagerHandle`], never by touching the event loop.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{Result, SilKitError};
use crate::registry::client::{self, RegistryEvent};
use crate::transport;
use crate::transport::peer::PeerLink;
use crate::wire::messages::{KnownPeer, ServiceAnnouncement, SubscriptionAnnouncement};
use crate::wire::{Frame, FrameKind, MessageTag};

const WAKE_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);
const FIRST_PEER_TOKEN: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Events the connection manager pushes up to the rest of the
/// participant (discovery, lifecycle, orchestration, controllers).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
  PeerJoined { name: String, id: u64 },
  PeerDeparted { name: String, is_required: bool },
  ServiceAnnouncement(ServiceAnnouncement),
  IbMessage { tag: MessageTag, sender: String, frame: Frame },
}

enum IoCommand {
  Subscribe {
    network: String,
    tag: MessageTag,
    endpoint_id: u64,
  },
  SendIbMessage {
    network: String,
    tag: MessageTag,
    frame: Frame,
  },
  BroadcastServiceAnnouncement(ServiceAnnouncement),
  Shutdown,
}

/// Cheap, `Clone`, thread-safe handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionManagerHandle {
  inner: Arc<HandleInner>,
}

struct HandleInner {
  commands: Sender<IoCommand>,
  waker: Waker,
  participant_name: String,
  participant_id: u64,
}

impl ConnectionManagerHandle {
  pub fn participant_name(&self) -> &str {
    &self.inner.participant_name
  }

  pub fn participant_id(&self) -> u64 {
    self.inner.participant_id
  }

  fn send_command(&self, command: IoCommand) -> Result<()> {
    self
      .inner
      .commands
      .send(command)
      .map_err(|_| SilKitError::transport("connection manager I/O thread is gone"))?;
    self.inner.waker.wake()?;
    Ok(())
  }

  /// Declares interest in `(network, tag)`: announces it to every current
  /// and future peer, and enables in-process loopback for locally sent
  /// traffic of the same kind (spec.md §4.4/§4.5, "local fan-out also
  /// occurs in-process for handlers on the same participant").
  pub fn subscribe(&self, network: impl Into<String>, tag: MessageTag, endpoint_id: u64) -> Result<()> {
    self.send_command(IoCommand::Subscribe {
      network: network.into(),
      tag,
      endpoint_id,
    })
  }

  pub fn send_ib_message(&self, network: impl Into<String>, tag: MessageTag, frame: Frame) -> Result<()> {
    self.send_command(IoCommand::SendIbMessage {
      network: network.into(),
      tag,
      frame,
    })
  }

  pub fn broadcast_service_announcement(&self, announcement: ServiceAnnouncement) -> Result<()> {
    self.send_command(IoCommand::BroadcastServiceAnnouncement(announcement))
  }

  pub fn shutdown(&self) -> Result<()> {
    self.send_command(IoCommand::Shutdown)
  }
}

pub struct ConnectionManager {
  pub handle: ConnectionManagerHandle,
  pub events: Receiver<ConnectionEvent>,
  join_handle: JoinHandle<()>,
}

impl ConnectionManager {
  /// Binds a peer-mesh listener, joins the registry, dials every
  /// already-known peer and starts the I/O thread.
  pub fn start(
    participant_name: &str,
    capability_flags: u32,
    registry_addr: SocketAddr,
    bind_addr: SocketAddr,
    required_peers: impl Fn(&str) -> bool + Send + Sync + 'static,
  ) -> Result<Self> {
    let std_listener = StdTcpListener::bind(bind_addr)?;
    std_listener.set_nonblocking(true)?;
    let listen_addr = std_listener.local_addr()?;
    let mut listener = TcpListener::from_std(std_listener);

    let (registry_events_tx, registry_events_rx) = mpsc::channel();
    let (response, _liveness_handle) = client::join_registry(
      registry_addr,
      participant_name,
      capability_flags,
      listen_addr,
      registry_events_tx,
    )?;
    let participant_id = response.participant_id;

    let poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

    let (command_tx, command_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();

    let handle = ConnectionManagerHandle {
      inner: Arc::new(HandleInner {
        commands: command_tx,
        waker,
        participant_name: participant_name.to_owned(),
        participant_id,
      }),
    };

    let worker = IoWorker {
      participant_name: participant_name.to_owned(),
      participant_id,
      capability_flags,
      poll,
      listener,
      peers: HashMap::new(),
      name_to_token: HashMap::new(),
      known_peer_ids: HashMap::new(),
      next_token: FIRST_PEER_TOKEN,
      local_subscriptions: Vec::new(),
      command_rx,
      registry_events_rx,
      event_tx,
      required_peers: Box::new(required_peers),
    };

    let join_handle = thread::spawn(move || worker.run());

    Ok(Self {
      handle,
      events: event_rx,
      join_handle,
    })
  }

  pub fn join(self) {
    let _ = self.join_handle.join();
  }
}

struct IoWorker {
  participant_name: String,
  participant_id: u64,
  capability_flags: u32,
  poll: Poll,
  listener: TcpListener,
  peers: HashMap<Token, PeerLink>,
  name_to_token: HashMap<String, Token>,
  /// Participant id the registry assigned to each peer name, learned from
  /// `KnownPeers`/`PeerJoined` registry events. An inbound dial's handshake
  /// (spec.md §4.2) carries no participant id of its own — only the
  /// registry assigns those — so the accept side must look the dialer's id
  /// up here instead of inventing one.
  known_peer_ids: HashMap<String, u64>,
  next_token: usize,
  /// (network, tag, endpoint_id) this participant has subscribed to;
  /// replayed to every peer that joins after the subscription was made.
  local_subscriptions: Vec<(String, MessageTag, u64)>,
  command_rx: Receiver<IoCommand>,
  registry_events_rx: Receiver<RegistryEvent>,
  event_tx: Sender<ConnectionEvent>,
  required_peers: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl IoWorker {
  fn run(mut self) {
    let mut events = Events::with_capacity(256);
    loop {
      if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
        if e.kind() == std::io::ErrorKind::Interrupted {
          continue;
        }
        error!("connection manager poll error: {e}");
        break;
      }

      for event in events.iter() {
        match event.token() {
          WAKE_TOKEN => {
            if !self.drain_commands() {
              return;
            }
          }
          LISTENER_TOKEN => self.accept_inbound_peers(),
          token => self.service_peer(token, event.is_readable(), event.is_writable()),
        }
      }
      self.drain_registry_events();
    }
  }

  /// Returns `false` once a `Shutdown` command has been processed.
  fn drain_commands(&mut self) -> bool {
    while let Ok(command) = self.command_rx.try_recv() {
      match command {
        IoCommand::Subscribe { network, tag, endpoint_id } => {
          self.local_subscriptions.push((network.clone(), tag, endpoint_id));
          let announcement = SubscriptionAnnouncement {
            network_name: network,
            message_type_tag: tag as u8,
            endpoint_id,
          };
          self.broadcast_subscription(&announcement);
        }
        IoCommand::SendIbMessage { network, tag, frame } => self.dispatch_outbound(&network, tag, frame),
        IoCommand::BroadcastServiceAnnouncement(announcement) => self.broadcast_service_announcement(&announcement),
        IoCommand::Shutdown => return false,
      }
    }
    true
  }

  fn drain_registry_events(&mut self) {
    while let Ok(event) = self.registry_events_rx.try_recv() {
      match event {
        RegistryEvent::KnownPeers(peers) => {
          for peer in peers {
            self.known_peer_ids.insert(peer.name.clone(), peer.id);
            self.dial_peer(peer);
          }
        }
        RegistryEvent::PeerJoined(peer) => {
          self.known_peer_ids.insert(peer.name.clone(), peer.id);
          self.dial_peer(peer);
        }
        RegistryEvent::PeerLeft { name, .. } => {
          // The registry only tells us about the liveness connection
          // dropping; the peer-mesh link itself is torn down when its
          // socket errors out, which we detect independently in
          // `service_peer`. Nothing to do here beyond logging.
          debug!("registry reports {name} departed");
        }
        RegistryEvent::Disconnected => warn!("registry liveness connection lost; existing peer links are unaffected"),
      }
    }
  }

  fn dial_peer(&mut self, peer: KnownPeer) {
    if peer.name == self.participant_name || self.name_to_token.contains_key(&peer.name) {
      return;
    }
    // Both sides of a pair learn about each other from the registry at
    // roughly the same time and would otherwise both dial, racing two
    // independent links into existence for one logical peer pair. Break
    // the tie by name order: only the lexicographically lesser name
    // initiates the dial, the other waits to accept it (spec.md §4.4
    // describes a fully-meshed result, not which side opens each socket).
    if self.participant_name > peer.name {
      return;
    }
    let addr: SocketAddr = match peer.socket_address.parse() {
      Ok(a) => a,
      Err(e) => {
        warn!("bad peer address for {}: {e}", peer.name);
        return;
      }
    };
    let dial_result = transport::connect_and_handshake(
      addr,
      &self.participant_name,
      self.capability_flags,
      Duration::from_secs(5),
    );
    let (stream, _response) = match dial_result {
      Ok(ok) => ok,
      Err(e) => {
        warn!("failed to dial peer {} at {addr}: {e}", peer.name);
        let _ = self.event_tx.send(ConnectionEvent::PeerDeparted {
          name: peer.name.clone(),
          is_required: (self.required_peers)(&peer.name),
        });
        return;
      }
    };
    self.register_peer(stream, peer.name, peer.id, addr);
  }

  fn accept_inbound_peers(&mut self) {
    loop {
      match self.listener.accept() {
        Ok((stream, addr)) => {
          let std_stream = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
          }) {
            Ok(s) => s,
            Err(e) => {
              warn!("failed to prepare inbound peer socket from {addr}: {e}");
              continue;
            }
          };
          match transport::handshake_as_server(std_stream, self.participant_id, &self.participant_name) {
            Ok((stream, request)) => {
              // The handshake itself carries no participant id for the
              // dialing side (spec.md §4.2: only name and capability
              // flags) — only the registry assigns ids, so look the
              // dialer's up by name among what we've already learned from
              // it. A dial that races ahead of the registry's own
              // broadcast is logged and skipped rather than registered
              // under a wrong id; the dialer will retry via its own
              // `dial_peer` once our `KnownPeers`/`PeerJoined` event for it
              // arrives.
              match self.known_peer_ids.get(&request.participant_name).copied() {
                Some(remote_id) => self.register_peer(stream, request.participant_name, remote_id, addr),
                None => warn!(
                  "inbound peer {} dialed before its registry id was known; dropping this attempt",
                  request.participant_name
                ),
              }
            }
            Err(e) => warn!("inbound handshake from {addr} failed: {e}"),
          }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
        Err(e) => {
          warn!("accept error: {e}");
          break;
        }
      }
    }
  }

  fn register_peer(&mut self, std_stream: std::net::TcpStream, name: String, id: u64, addr: SocketAddr) {
    if self.name_to_token.contains_key(&name) {
      debug!("ignoring duplicate link to already-connected peer {name}");
      return;
    }
    if let Err(e) = std_stream.set_nonblocking(true) {
      warn!("failed to set peer socket non-blocking: {e}");
      return;
    }
    let mut mio_stream = TcpStream::from_std(std_stream);
    let token = Token(self.next_token);
    self.next_token += 1;
    if let Err(e) = self
      .poll
      .registry()
      .register(&mut mio_stream, token, Interest::READABLE | Interest::WRITABLE)
    {
      warn!("failed to register peer {name} with poll: {e}");
      return;
    }

    let mut link = PeerLink::new(mio_stream, name.clone(), id, addr);
    for (network, tag, endpoint_id) in &self.local_subscriptions {
      let announcement = SubscriptionAnnouncement {
        network_name: network.clone(),
        message_type_tag: *tag as u8,
        endpoint_id: *endpoint_id,
      };
      if let Ok(frame) = Frame::encode_simple(FrameKind::SubscriptionAnnouncement, &announcement) {
        let _ = link.enqueue(&frame);
      }
    }

    self.peers.insert(token, link);
    self.name_to_token.insert(name.clone(), token);
    let _ = self.event_tx.send(ConnectionEvent::PeerJoined { name, id });
  }

  fn service_peer(&mut self, token: Token, readable: bool, writable: bool) {
    let mut departed_name = None;

    if let Some(link) = self.peers.get_mut(&token) {
      if writable {
        if let Err(e) = link.flush() {
          debug!("peer {} write failed: {e}", link.remote_name);
          departed_name = Some(link.remote_name.clone());
        }
      }
      if departed_name.is_none() && readable {
        match link.read_available_frames() {
          Ok(frames) => {
            let sender_name = link.remote_name.clone();
            for frame in frames {
              self.handle_inbound_frame(token, &sender_name, frame);
            }
          }
          Err(e) => {
            debug!("peer {} read failed: {e}", link.remote_name);
            departed_name = Some(link.remote_name.clone());
          }
        }
      }
    }

    if let Some(name) = departed_name {
      self.remove_peer(token, &name);
    }
  }

  fn handle_inbound_frame(&mut self, token: Token, sender_name: &str, frame: Frame) {
    match frame.kind {
      FrameKind::SubscriptionAnnouncement => {
        if let Ok(announcement) = frame.decode_simple::<SubscriptionAnnouncement>(FrameKind::SubscriptionAnnouncement) {
          if let Some(link) = self.peers.get_mut(&token) {
            link.note_subscription(announcement.network_name, announcement.message_type_tag);
          }
        }
      }
      FrameKind::ServiceAnnouncement => {
        if let Ok(announcement) = frame.decode_simple::<ServiceAnnouncement>(FrameKind::ServiceAnnouncement) {
          let _ = self.event_tx.send(ConnectionEvent::ServiceAnnouncement(announcement));
        }
      }
      FrameKind::IbMessage => {
        if let Some(&[tag_byte, ..]) = frame.payload.get(0..1) {
          if let Ok(tag) = MessageTag::from_byte(tag_byte) {
            let _ = self.event_tx.send(ConnectionEvent::IbMessage {
              tag,
              sender: sender_name.to_owned(),
              frame,
            });
          }
        }
      }
      FrameKind::Handshake | FrameKind::Registry => {
        warn!("unexpected {:?} frame on peer link from {sender_name}", frame.kind);
      }
    }
  }

  fn remove_peer(&mut self, token: Token, name: &str) {
    self.peers.remove(&token);
    self.name_to_token.remove(name);
    let _ = self.event_tx.send(ConnectionEvent::PeerDeparted {
      name: name.to_owned(),
      is_required: (self.required_peers)(name),
    });
  }

  fn dispatch_outbound(&mut self, network: &str, tag: MessageTag, frame: Frame) {
    let is_locally_subscribed = self
      .local_subscriptions
      .iter()
      .any(|(n, t, _)| n == network && *t == tag);
    if is_locally_subscribed {
      let _ = self.event_tx.send(ConnectionEvent::IbMessage {
        tag,
        sender: self.participant_name.clone(),
        frame: frame.clone(),
      });
    }
    for link in self.peers.values_mut() {
      if link.is_subscribed(network, tag as u8) {
        let _ = link.enqueue(&frame);
        if let Err(e) = link.flush() {
          debug!("immediate flush to {} failed, will retry on writable: {e}", link.remote_name);
        }
      }
    }
  }

  fn broadcast_subscription(&mut self, announcement: &SubscriptionAnnouncement) {
    let Ok(frame) = Frame::encode_simple(FrameKind::SubscriptionAnnouncement, announcement) else {
      return;
    };
    for link in self.peers.values_mut() {
      let _ = link.enqueue(&frame);
    }
  }

  fn broadcast_service_announcement(&mut self, announcement: &ServiceAnnouncement) {
    let Ok(frame) = Frame::encode_simple(FrameKind::ServiceAnnouncement, announcement) else {
      return;
    };
    for link in self.peers.values_mut() {
      let _ = link.enqueue(&frame);
    }
  }
}
