//! spec.md §8 S4 — discovery fires for a service created after a handler is
//! already registered, and exactly once per distinct announcement (the
//! snapshot-diff idempotency already unit-tested in `discovery::tests` here
//! runs end-to-end over a live peer link).

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use silkit_rs::discovery::ServiceDiscoveryEventKind;
use silkit_rs::ConfigurationBuilder;
use silkit_rs::Participant;

#[test]
fn handler_registered_before_peer_join_sees_the_later_service_exactly_once() {
  let registry_addr = common::start_registry();

  let watcher = Participant::create(
    ConfigurationBuilder::new("Watcher").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();

  let created_events = Arc::new(Mutex::new(Vec::new()));
  let created_for_handler = Arc::clone(&created_events);
  watcher.discovery().register_handler(Box::new(move |kind, descriptor| {
    if kind == ServiceDiscoveryEventKind::ServiceCreated {
      created_for_handler.lock().unwrap().push(descriptor.clone());
    }
  }));

  let producer = Participant::create(
    ConfigurationBuilder::new("Producer").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();

  common::wait_for_mutual_join(&watcher, &producer, Duration::from_secs(5));

  let _can = producer.create_can_controller("PowerTrain1", "ProducerCan").unwrap();

  assert!(
    common::poll_until(Duration::from_secs(3), || !created_events.lock().unwrap().is_empty()),
    "watcher never observed the producer's service announcement"
  );

  // Give any further (spurious) announcements a chance to arrive before
  // asserting there was exactly one.
  std::thread::sleep(Duration::from_millis(200));

  let events = created_events.lock().unwrap();
  assert_eq!(events.len(), 1, "expected exactly one ServiceCreated event, got {events:?}");
  assert_eq!(events[0].participant_name, "Producer");
  assert_eq!(events[0].network_name, "PowerTrain1");
  assert_eq!(events[0].service_name, "ProducerCan");
  assert_eq!(events[0].service_type, "CanController");
}
