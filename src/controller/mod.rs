//! Controller facade & routing (spec.md §4.6, component C6): every typed
//! bus controller the user creates binds to either an in-process *trivial*
//! simulation or a proxy to a remote network simulator, switched
//! transparently as service discovery reports (or retracts) a simulator on
//! the controller's network.
//!
//! Re-architected per spec.md §9's design note: the source hierarchy's
//! dynamic dispatch becomes a tagged `Backend` behind a guarded swap, with
//! handler registration captured in the facade rather than either backend
//! so a switch never loses a registered handler.

pub mod can;
pub mod ethernet;
pub mod flexray;
pub mod generic;
pub mod lin;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::wire::{Frame, MessageTag};
use crate::wire::messages::ServiceDescriptor;

/// The service type string a network simulator announces itself under
/// (spec.md §4.6: "a network simulator has announced ownership of
/// `network`").
pub const NETWORK_SIMULATOR_SERVICE_TYPE: &str = "NetworkSimulator";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Backend {
  Trivial,
  Proxy { simulator: String },
}

/// Shared facade state for one controller: which backend it is currently
/// bound to. Bus-specific controllers each own one `FacadeCore` and consult
/// it on every send and every inbound delivery; the backend pointer itself
/// is swapped under `backend`'s mutex, readers take a snapshot per send
/// (spec.md §5).
pub(crate) struct FacadeCore {
  network: String,
  backend: Mutex<Backend>,
}

impl FacadeCore {
  pub fn new(network: impl Into<String>) -> Self {
    Self {
      network: network.into(),
      backend: Mutex::new(Backend::Trivial),
    }
  }

  pub fn network(&self) -> &str {
    &self.network
  }

  pub fn is_proxied(&self) -> bool {
    matches!(*self.backend.lock().unwrap(), Backend::Proxy { .. })
  }

  /// Feeds one service-discovery event to the facade. Switches to the
  /// proxy backend the first time a `NetworkSimulator` for this controller's
  /// network is observed; reverts to trivial if that same simulator later
  /// departs. Handlers registered by the user are untouched either way —
  /// they live in the bus controller, not here.
  pub fn on_discovery_event(&self, created: bool, descriptor: &ServiceDescriptor) {
    if descriptor.network_name != self.network || descriptor.service_type != NETWORK_SIMULATOR_SERVICE_TYPE {
      return;
    }
    let mut backend = self.backend.lock().unwrap();
    if created {
      *backend = Backend::Proxy {
        simulator: descriptor.participant_name.clone(),
      };
    } else if matches!(&*backend, Backend::Proxy { simulator } if simulator == &descriptor.participant_name) {
      *backend = Backend::Trivial;
    }
  }

  /// Whether a frame from `sender` should be delivered to handlers. In
  /// trivial mode every peer's traffic on this network is authoritative. In
  /// proxy mode the simulator is the sole source of truth (spec.md §4.6);
  /// our own loopback delivery (sender == our own participant) is always
  /// accepted so sent acknowledgements and local taps keep working.
  pub fn should_accept(&self, sender: &str, own_participant_name: &str) -> bool {
    if sender == own_participant_name {
      return true;
    }
    match &*self.backend.lock().unwrap() {
      Backend::Trivial => true,
      Backend::Proxy { simulator } => sender == simulator,
    }
  }

  /// Whether locally originated sends should be treated as already final
  /// (trivial: an acknowledgement can be synthesized immediately) or must
  /// wait on a reply that only the simulator can produce (proxy).
  pub fn is_trivial(&self) -> bool {
    matches!(*self.backend.lock().unwrap(), Backend::Trivial)
  }
}

/// One controller's subscription to inbound ib-messages of a given tag.
/// Controllers register themselves for every tag they care about; the
/// participant's connection-event loop decodes nothing itself; it hands the
/// raw frame straight to every matching route (spec.md §9: "a small
/// dispatch table").
pub trait InboundRoute: Send + Sync {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame);
}

/// Maps message tag to the controllers currently interested in it. A
/// controller decides for itself, inside `on_inbound`, whether a given
/// frame's `network_name` and originator match — the registry only does
/// coarse tag-based fan-out.
#[derive(Default)]
pub struct ControllerRegistry {
  routes: Mutex<HashMap<MessageTag, Vec<Arc<dyn InboundRoute>>>>,
}

impl ControllerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, tag: MessageTag, route: Arc<dyn InboundRoute>) {
    self.routes.lock().unwrap().entry(tag).or_default().push(route);
  }

  pub fn dispatch(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    let routes = self.routes.lock().unwrap().get(&tag).cloned().unwrap_or_default();
    for route in routes {
      route.on_inbound(tag, sender, frame);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn simulator_descriptor(network: &str, participant: &str) -> ServiceDescriptor {
    ServiceDescriptor {
      participant_name: participant.to_owned(),
      network_name: network.to_owned(),
      service_name: "Simulator".to_owned(),
      service_type: NETWORK_SIMULATOR_SERVICE_TYPE.to_owned(),
      endpoint_id: 1,
      attributes: Vec::new(),
    }
  }

  #[test]
  fn starts_trivial_and_switches_to_proxy_on_simulator_discovery() {
    let facade = FacadeCore::new("PowerTrain1");
    assert!(facade.is_trivial());
    facade.on_discovery_event(true, &simulator_descriptor("PowerTrain1", "NetworkSimulator1"));
    assert!(!facade.is_trivial());
    assert!(facade.should_accept("NetworkSimulator1", "ECU1"));
    assert!(!facade.should_accept("SomeOtherEcu", "ECU1"));
  }

  #[test]
  fn ignores_simulator_on_a_different_network() {
    let facade = FacadeCore::new("PowerTrain1");
    facade.on_discovery_event(true, &simulator_descriptor("Infotainment1", "NetworkSimulator1"));
    assert!(facade.is_trivial());
  }

  #[test]
  fn reverts_to_trivial_when_simulator_departs() {
    let facade = FacadeCore::new("PowerTrain1");
    facade.on_discovery_event(true, &simulator_descriptor("PowerTrain1", "NetworkSimulator1"));
    facade.on_discovery_event(false, &simulator_descriptor("PowerTrain1", "NetworkSimulator1"));
    assert!(facade.is_trivial());
  }

  #[test]
  fn own_traffic_always_accepted_even_when_proxied() {
    let facade = FacadeCore::new("PowerTrain1");
    facade.on_discovery_event(true, &simulator_descriptor("PowerTrain1", "NetworkSimulator1"));
    assert!(facade.should_accept("ECU1", "ECU1"));
  }
}
