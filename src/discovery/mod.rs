//! Service discovery (spec.md §4.5, component C5): each participant
//! maintains a full snapshot of its own service set and rebroadcasts it
//! whenever a local service is created. Receivers diff the incoming
//! snapshot against the previous one they cached for that originator and
//! fire registered handlers synchronously, on the thread that received
//! the announcement — snapshot-diff rather than per-event deltas, because
//! it is idempotent under retransmission and tolerates out-of-order
//! delivery from late joiners (spec.md §4.5 rationale).
//!
//! Grounded on `original_source/.../ServiceDiscovery.hpp`: the diff cache
//! is `unordered_map<participant name, ServiceMap>`, one map per
//! originator, exactly mirrored here as `HashMap<String, HashMap<...>>`.

use std::collections::HashMap;
use std::sync::Mutex;

#[allow(unused_imports)]
use log::{debug, info};

use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{ServiceAnnouncement, ServiceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceDiscoveryEventKind {
  ServiceCreated,
  ServiceRemoved,
}

pub type ServiceDiscoveryHandler = Box<dyn Fn(ServiceDiscoveryEventKind, &ServiceDescriptor) + Send>;

/// Identity key for a service descriptor: the full tuple, per spec.md §3
/// ("equality compares all fields"). We additionally need a stable *map
/// key* distinct from full equality so a changed-but-same-identity
/// descriptor is impossible by construction: the descriptor's own fields
/// already form its identity, so the key is simply the descriptor cloned
/// into a hashable tuple.
fn service_key(descriptor: &ServiceDescriptor) -> (String, String, String, String, u64) {
  (
    descriptor.participant_name.clone(),
    descriptor.network_name.clone(),
    descriptor.service_name.clone(),
    descriptor.service_type.clone(),
    descriptor.endpoint_id,
  )
}

type ServiceMap = HashMap<(String, String, String, String, u64), ServiceDescriptor>;

/// Diffs `new_services` against `previous` (the originator's last-seen
/// announcement) and returns `(created, removed, new_map)`. Pure and
/// side-effect free, so it is testable without a live connection manager.
fn diff_announcement(
  previous: &ServiceMap,
  new_services: &[ServiceDescriptor],
) -> (Vec<ServiceDescriptor>, Vec<ServiceDescriptor>, ServiceMap) {
  let mut new_map = ServiceMap::new();
  for descriptor in new_services {
    new_map.insert(service_key(descriptor), descriptor.clone());
  }
  let created = new_map
    .iter()
    .filter(|(key, _)| !previous.contains_key(*key))
    .map(|(_, d)| d.clone())
    .collect();
  let removed = previous
    .iter()
    .filter(|(key, _)| !new_map.contains_key(*key))
    .map(|(_, d)| d.clone())
    .collect();
  (created, removed, new_map)
}

struct State {
  /// This participant's own announcement, rebuilt on every local service
  /// creation.
  own_services: Vec<ServiceDescriptor>,
  /// Per-originator previous announcement, used to diff against the next
  /// one received from that originator.
  cache: HashMap<String, ServiceMap>,
  handlers: Vec<ServiceDiscoveryHandler>,
}

pub struct ServiceDiscovery {
  state: Mutex<State>,
  connections: ConnectionManagerHandle,
  own_participant_name: String,
}

impl ServiceDiscovery {
  pub fn new(connections: ConnectionManagerHandle) -> Self {
    let own_participant_name = connections.participant_name().to_owned();
    Self {
      state: Mutex::new(State {
        own_services: Vec::new(),
        cache: HashMap::new(),
        handlers: Vec::new(),
      }),
      connections,
      own_participant_name,
    }
  }

  pub fn register_handler(&self, handler: ServiceDiscoveryHandler) {
    self.state.lock().unwrap().handlers.push(handler);
  }

  /// Adds a service descriptor to this participant's announcement and
  /// rebroadcasts the full snapshot to every peer (spec.md §4.5).
  /// Services are never individually retracted during a run (spec.md §3)
  /// — the set only grows until the participant departs.
  pub fn notify_service_created(&self, descriptor: ServiceDescriptor) -> crate::error::Result<()> {
    let announcement = {
      let mut state = self.state.lock().unwrap();
      state.own_services.push(descriptor);
      ServiceAnnouncement {
        originator: self.own_participant_name.clone(),
        services: state.own_services.clone(),
      }
    };
    self.connections.broadcast_service_announcement(announcement)
  }

  /// Applies an incoming full-snapshot announcement from `originator`:
  /// diffs it against the cached previous snapshot and fires handlers for
  /// every addition/removal. A repeated, identical announcement produces
  /// no events (spec.md §8, S4).
  pub fn apply_announcement(&self, announcement: ServiceAnnouncement) {
    let mut state = self.state.lock().unwrap();
    let originator = announcement.originator.clone();
    let previous = state.cache.remove(&originator).unwrap_or_default();
    let (created, removed, new_map) = diff_announcement(&previous, &announcement.services);
    state.cache.insert(originator, new_map);

    // Fire handlers after the cache mutation; the lock is held only
    // briefly while diffing (spec.md §5).
    for descriptor in &removed {
      for handler in &state.handlers {
        handler(ServiceDiscoveryEventKind::ServiceRemoved, descriptor);
      }
    }
    for descriptor in &created {
      for handler in &state.handlers {
        handler(ServiceDiscoveryEventKind::ServiceCreated, descriptor);
      }
    }
  }

  pub fn known_services_of(&self, participant_name: &str) -> Vec<ServiceDescriptor> {
    self
      .state
      .lock()
      .unwrap()
      .cache
      .get(participant_name)
      .map(|map| map.values().cloned().collect())
      .unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn descriptor(service_name: &str) -> ServiceDescriptor {
    ServiceDescriptor {
      participant_name: "NetworkSimulator".to_owned(),
      network_name: "PowerTrain1".to_owned(),
      service_name: service_name.to_owned(),
      service_type: "CanController".to_owned(),
      endpoint_id: 1,
      attributes: Vec::new(),
    }
  }

  #[test]
  fn first_announcement_is_all_created() {
    let (created, removed, _map) = diff_announcement(&ServiceMap::new(), &[descriptor("CAN1")]);
    assert_eq!(created.len(), 1);
    assert!(removed.is_empty());
  }

  #[test]
  fn repeated_identical_announcement_produces_no_events() {
    let (_, _, first_map) = diff_announcement(&ServiceMap::new(), &[descriptor("CAN1")]);
    let (created, removed, _) = diff_announcement(&first_map, &[descriptor("CAN1")]);
    assert!(created.is_empty());
    assert!(removed.is_empty());
  }

  #[test]
  fn dropped_service_is_reported_removed() {
    let (_, _, first_map) = diff_announcement(&ServiceMap::new(), &[descriptor("CAN1"), descriptor("CAN2")]);
    let (created, removed, _) = diff_announcement(&first_map, &[descriptor("CAN1")]);
    assert!(created.is_empty());
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].service_name, "CAN2");
  }
}
