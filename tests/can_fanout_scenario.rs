//! spec.md §8 S2 — CAN fan-out without time synchronization.
//!
//! A writer sends ten frames; a reader subscribed to the same network
//! receives every one, in order, bit-equal to what was sent. Since neither
//! participant ever announces a `NetworkSimulator` service, both controllers
//! stay on the trivial backend and the writer's own acknowledgements are
//! synthesized locally.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use silkit_rs::wire::messages::{CanTransmitAck, CanTransmitStatus};
use silkit_rs::ConfigurationBuilder;
use silkit_rs::Participant;

#[test]
fn reader_receives_every_frame_in_order() {
  let registry_addr = common::start_registry();

  let writer = Participant::create(
    ConfigurationBuilder::new("CanWriter").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();
  let reader = Participant::create(
    ConfigurationBuilder::new("CanReader").required(false).build().unwrap(),
    registry_addr,
    "127.0.0.1:0".parse().unwrap(),
    |_| false,
  )
  .unwrap();

  common::wait_for_mutual_join(&writer, &reader, Duration::from_secs(5));

  let writer_can = writer.create_can_controller("PowerTrain1", "CanWriter").unwrap();
  let reader_can = reader.create_can_controller("PowerTrain1", "CanReader").unwrap();
  // Controller creation announces a service and subscribes, both of which
  // are themselves frames in flight; give them the same settling window the
  // mesh join already waited out.
  std::thread::sleep(Duration::from_millis(150));

  let received_frames: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
  let received_for_handler = Arc::clone(&received_frames);
  reader_can.on_frame(Box::new(move |event| {
    received_for_handler.lock().unwrap().push((event.can_id, event.data.clone()));
  }));

  let acks: Arc<Mutex<Vec<CanTransmitAck>>> = Arc::new(Mutex::new(Vec::new()));
  let acks_for_handler = Arc::clone(&acks);
  writer_can.on_transmit_ack(Box::new(move |ack| {
    acks_for_handler.lock().unwrap().push(ack.clone());
  }));

  for i in 0u32..10 {
    let data = format!("Test Message {i}").into_bytes();
    writer_can.send_frame(i, data, i as u64, i as u64).unwrap();
  }

  assert!(
    common::poll_until(Duration::from_secs(3), || received_frames.lock().unwrap().len() == 10),
    "reader only received {} of 10 frames",
    received_frames.lock().unwrap().len()
  );

  let received = received_frames.lock().unwrap();
  for i in 0u32..10 {
    let expected_data = format!("Test Message {i}").into_bytes();
    assert_eq!(received[i as usize], (i, expected_data));
  }

  let acks = acks.lock().unwrap();
  assert_eq!(acks.len(), 10);
  for (i, ack) in acks.iter().enumerate() {
    assert_eq!(ack.user_context, i as u64);
    assert_eq!(ack.status, CanTransmitStatus::Transmitted);
  }
}
