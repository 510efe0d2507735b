//! spec.md §8 S3 — FlexRay coldstart in trivial simulation.
//!
//! Each node's POC state machine is purely local (no coldstart coordination
//! frame exists on the wire, per `controller::flexray`'s module doc), so
//! both nodes drive `Wakeup -> AllowColdstart -> Run` independently and are
//! expected to land on the same POC sequence. The first frame Node0 sends
//! after reaching `NormalActive` is still ordinary bus traffic and is
//! expected to reach Node1 exactly as sent.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use silkit_rs::wire::messages::PocState;
use silkit_rs::ConfigurationBuilder;
use silkit_rs::Participant;

fn run_coldstart_sequence(controller: &silkit_rs::controller::flexray::FlexrayController, observed: &Arc<Mutex<Vec<PocState>>>) {
  let observed_for_handler = Arc::clone(observed);
  controller.on_poc_status(Box::new(move |event| {
    observed_for_handler.lock().unwrap().push(event.state);
  }));
  controller.wakeup(0).unwrap();
  controller.allow_coldstart().unwrap();
  controller.run(0).unwrap();
}

#[test]
fn both_nodes_reach_normal_active_and_exchange_the_first_frame() {
  let registry_addr = common::start_registry();

  let node0 = Participant::create(
    ConfigurationBuilder::new("Node0").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();
  let node1 = Participant::create(
    ConfigurationBuilder::new("Node1").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();

  common::wait_for_mutual_join(&node0, &node1, Duration::from_secs(5));

  let flexray0 = node0.create_flexray_controller("FlexRay1", "Node0FR").unwrap();
  let flexray1 = node1.create_flexray_controller("FlexRay1", "Node1FR").unwrap();
  std::thread::sleep(Duration::from_millis(150));

  let observed0 = Arc::new(Mutex::new(Vec::new()));
  let observed1 = Arc::new(Mutex::new(Vec::new()));
  run_coldstart_sequence(&flexray0, &observed0);
  run_coldstart_sequence(&flexray1, &observed1);

  assert_eq!(flexray0.poc_state(), PocState::NormalActive);
  assert_eq!(flexray1.poc_state(), PocState::NormalActive);
  assert_eq!(*observed0.lock().unwrap(), vec![PocState::Wakeup, PocState::Ready, PocState::NormalActive]);
  assert_eq!(*observed1.lock().unwrap(), vec![PocState::Wakeup, PocState::Ready, PocState::NormalActive]);

  let received_frames = Arc::new(Mutex::new(Vec::new()));
  let received_for_handler = Arc::clone(&received_frames);
  flexray1.on_frame(Box::new(move |event| {
    received_for_handler.lock().unwrap().push(event.clone());
  }));

  let payload = b"FlexrayFrameEvent#0000".to_vec();
  flexray0.send_frame(0, 40, payload.clone(), 0).unwrap();

  assert!(
    common::poll_until(Duration::from_secs(3), || !received_frames.lock().unwrap().is_empty()),
    "Node1 never received Node0's first frame"
  );
  let received = received_frames.lock().unwrap();
  assert_eq!(received[0].buffer_id, 0);
  assert_eq!(received[0].slot_id, 40);
  assert_eq!(received[0].payload, payload);
}
