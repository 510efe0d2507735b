//! Top-level entry point (spec.md §2 data flow): wires the connection
//! manager (C4) to service discovery (C5), the controller facade (C6), the
//! system monitor/controller (C7), the lifecycle service (C8) and the time
//! synchronization service (C9).
//!
//! `Participant::create` performs the construction spec.md §2 describes:
//! "user code creates a participant → C4 joins via C3 → C4 establishes peer
//! links via C1/C2 → C5 announces services → C6 binds user-facing
//! controller objects ... → C8 drives local lifecycle, C9 drives local time
//! step, both communicating through C4 to peers and the system controller
//! C7." The dispatch loop below is the thread that keeps that data flow
//! moving for the lifetime of the participant.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;

#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::config::ParticipantConfiguration;
use crate::controller::can::CanController;
use crate::controller::ethernet::EthernetController;
use crate::controller::flexray::FlexrayController;
use crate::controller::generic::GenericController;
use crate::controller::lin::LinController;
use crate::controller::ControllerRegistry;
use crate::discovery::ServiceDiscovery;
use crate::error::Result;
use crate::lifecycle::LifecycleService;
use crate::mesh::{ConnectionEvent, ConnectionManager, ConnectionManagerHandle};
use crate::orchestration::{SystemController, SystemMonitor};
use crate::timesync::TimeSyncService;
use crate::wire::messages::{NextSimTask, ParticipantStatusMessage, SystemCommandMessage};
use crate::wire::MessageTag;

/// Virtual network name carrying lifecycle status, system commands and
/// time-sync ticks. Every participant subscribes to it unconditionally at
/// construction — unlike bus traffic, the control plane is not something a
/// participant opts into (spec.md §4.7/§4.8/§4.9 assume every participant's
/// status and commands reach every peer regardless of which bus controllers
/// it happens to have created).
pub const SYSTEM_NETWORK: &str = "__system__";

/// A running participant: the connection manager, discovery layer,
/// controller dispatch table and lifecycle service, plus whichever optional
/// pieces (`SystemMonitor`, `SystemController`, `TimeSyncService`) the
/// caller asks for.
pub struct Participant {
  config: ParticipantConfiguration,
  connections: ConnectionManagerHandle,
  discovery: Arc<ServiceDiscovery>,
  controllers: Arc<ControllerRegistry>,
  lifecycle: Arc<LifecycleService>,
  system_monitor: Mutex<Option<Arc<SystemMonitor>>>,
  time_sync: Mutex<Option<Arc<TimeSyncService>>>,
  /// Participant id of every peer seen joining the mesh so far, keyed by
  /// name — lets a system controller target `Initialize(participantId)`
  /// without threading registry bookkeeping through application code.
  peer_ids: Mutex<HashMap<String, u64>>,
}

impl Participant {
  /// Joins the registry at `registry_addr`, binds the peer-mesh listener at
  /// `bind_addr`, and starts the dispatch thread. `required_peers` decides,
  /// for a departed peer, whether its loss is fatal to this participant's
  /// lifecycle (spec.md §7).
  pub fn create(
    config: ParticipantConfiguration,
    registry_addr: SocketAddr,
    bind_addr: SocketAddr,
    required_peers: impl Fn(&str) -> bool + Send + Sync + 'static,
  ) -> Result<Arc<Self>> {
    config.validate()?;

    let manager = ConnectionManager::start(
      &config.participant_name,
      config.capability_flags.bits(),
      registry_addr,
      bind_addr,
      required_peers,
    )?;
    let connections = manager.handle.clone();
    let events = manager.events;

    let control_endpoint_id = connections.participant_id();
    connections.subscribe(SYSTEM_NETWORK, MessageTag::ParticipantStatusMessage, control_endpoint_id)?;
    connections.subscribe(SYSTEM_NETWORK, MessageTag::SystemCommandMessage, control_endpoint_id)?;
    connections.subscribe(SYSTEM_NETWORK, MessageTag::NextSimTask, control_endpoint_id)?;

    let discovery = Arc::new(ServiceDiscovery::new(connections.clone()));
    let controllers = Arc::new(ControllerRegistry::new());
    let lifecycle = LifecycleService::new(
      config.participant_name.clone(),
      connections.participant_id(),
      config.is_required,
      config.has_coordinated_simulation_start,
      config.has_coordinated_simulation_stop,
      connections.clone(),
    );
    lifecycle.mark_services_created()?;

    let participant = Arc::new(Self {
      config,
      connections,
      discovery,
      controllers,
      lifecycle,
      system_monitor: Mutex::new(None),
      time_sync: Mutex::new(None),
      peer_ids: Mutex::new(HashMap::new()),
    });

    let dispatch_participant = Arc::clone(&participant);
    thread::spawn(move || dispatch_participant.run_dispatch_loop(events));

    Ok(participant)
  }

  pub fn name(&self) -> &str {
    &self.config.participant_name
  }

  pub fn lifecycle(&self) -> &Arc<LifecycleService> {
    &self.lifecycle
  }

  pub fn discovery(&self) -> &Arc<ServiceDiscovery> {
    &self.discovery
  }

  pub fn connections(&self) -> &ConnectionManagerHandle {
    &self.connections
  }

  /// The participant id assigned to `name` by the registry, once this
  /// participant has observed it join the mesh.
  pub fn known_peer_id(&self, name: &str) -> Option<u64> {
    self.peer_ids.lock().unwrap().get(name).copied()
  }

  pub fn system_controller(&self) -> SystemController {
    SystemController::new(self.connections.clone())
  }

  /// Creates this participant's system monitor. Only one call takes effect;
  /// a participant has at most one monitor (spec.md §4.7 describes a single
  /// aggregate system state per run).
  pub fn create_system_monitor(&self, required_participants: Vec<String>) -> Arc<SystemMonitor> {
    let monitor = SystemMonitor::new(required_participants);
    *self.system_monitor.lock().unwrap() = Some(Arc::clone(&monitor));
    monitor
  }

  /// Creates this participant's time synchronization service. Requires
  /// `SynchronizationMode::Synchronized` in the configuration (spec.md
  /// §4.9: "non-synchronized participants ... do not participate in the
  /// barrier").
  pub fn create_time_sync_service(&self, required_synced_peers: Vec<String>) -> Result<Arc<TimeSyncService>> {
    let step_duration_ns = crate::timesync::require_synchronized(match self.config.synchronization {
      crate::config::SynchronizationMode::Synchronized { step_duration_ns } => Some(step_duration_ns),
      crate::config::SynchronizationMode::Unsynchronized => None,
    })?;
    let service = TimeSyncService::new(
      self.config.participant_name.clone(),
      step_duration_ns,
      required_synced_peers,
      self.connections.clone(),
      Arc::clone(&self.lifecycle),
    );
    *self.time_sync.lock().unwrap() = Some(Arc::clone(&service));
    Ok(service)
  }

  pub fn create_can_controller(&self, network: impl Into<String>, service_name: impl Into<String>) -> Result<CanController> {
    let endpoint_id = self.connections.participant_id();
    CanController::create(
      self.connections.clone(),
      &self.discovery,
      &self.controllers,
      network,
      service_name,
      endpoint_id,
    )
  }

  pub fn create_lin_controller(&self, network: impl Into<String>, service_name: impl Into<String>) -> Result<LinController> {
    let endpoint_id = self.connections.participant_id();
    LinController::create(
      self.connections.clone(),
      &self.discovery,
      &self.controllers,
      network,
      service_name,
      endpoint_id,
    )
  }

  pub fn create_flexray_controller(
    &self,
    network: impl Into<String>,
    service_name: impl Into<String>,
  ) -> Result<FlexrayController> {
    let endpoint_id = self.connections.participant_id();
    FlexrayController::create(
      self.connections.clone(),
      &self.discovery,
      &self.controllers,
      network,
      service_name,
      endpoint_id,
    )
  }

  pub fn create_ethernet_controller(
    &self,
    network: impl Into<String>,
    service_name: impl Into<String>,
  ) -> Result<EthernetController> {
    let endpoint_id = self.connections.participant_id();
    EthernetController::create(
      self.connections.clone(),
      &self.discovery,
      &self.controllers,
      network,
      service_name,
      endpoint_id,
    )
  }

  pub fn create_generic_controller(
    &self,
    network: impl Into<String>,
    topic: impl Into<String>,
    service_name: impl Into<String>,
  ) -> Result<GenericController> {
    let endpoint_id = self.connections.participant_id();
    GenericController::create(
      self.connections.clone(),
      &self.discovery,
      &self.controllers,
      network,
      topic,
      service_name,
      endpoint_id,
    )
  }

  fn run_dispatch_loop(self: Arc<Self>, events: std::sync::mpsc::Receiver<ConnectionEvent>) {
    for event in events.iter() {
      match event {
        ConnectionEvent::PeerJoined { name, id } => {
          debug!("{}: peer {name} (id {id}) joined the mesh", self.name());
          self.peer_ids.lock().unwrap().insert(name, id);
        }
        ConnectionEvent::PeerDeparted { name, is_required } => {
          warn!("{}: peer {name} departed (required={is_required})", self.name());
          if is_required && self.lifecycle.state().rank() >= crate::lifecycle::ParticipantState::ReadyToRun.rank() {
            self.lifecycle.report_error(format!("required peer {name} departed"));
          }
        }
        ConnectionEvent::ServiceAnnouncement(announcement) => {
          self.discovery.apply_announcement(announcement);
        }
        ConnectionEvent::IbMessage { tag, sender, frame } => {
          self.dispatch_ib_message(tag, &sender, frame);
        }
      }
    }
  }

  fn dispatch_ib_message(&self, tag: MessageTag, sender: &str, frame: crate::wire::Frame) {
    match tag {
      MessageTag::SystemCommandMessage => {
        if let Ok((_, command)) = frame.decode_ib_message::<SystemCommandMessage>() {
          self.lifecycle.apply_system_command(&command);
        }
      }
      MessageTag::ParticipantStatusMessage => {
        if let Ok((_, status)) = frame.decode_ib_message::<ParticipantStatusMessage>() {
          if let Some(monitor) = self.system_monitor.lock().unwrap().as_ref() {
            monitor.apply_status(&status);
          }
        }
      }
      MessageTag::NextSimTask => {
        if let Ok((_, task)) = frame.decode_ib_message::<NextSimTask>() {
          if let Some(time_sync) = self.time_sync.lock().unwrap().as_ref() {
            time_sync.on_peer_next_sim_task(sender, &task);
          }
        }
      }
      other => self.controllers.dispatch(other, sender, &frame),
    }
  }
}
