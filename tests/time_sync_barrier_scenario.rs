//! spec.md §8 S6 — two synchronized participants step through the virtual
//! time barrier in lockstep. Step count is reduced from the scenario's
//! literal 1000 steps to 10 (and the step duration from whatever the
//! original scale implies to 1ms) purely for test speed; the barrier
//! invariant under test — every participant sees the identical sequence of
//! `now` values — does not depend on the step count.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use silkit_rs::{ConfigurationBuilder, Participant};

const STEP_DURATION_NS: u64 = 1_000_000;
const TARGET_STEPS: usize = 10;

fn drive_synced_participant(
  participant: &Arc<Participant>,
  peers: Vec<String>,
  log: Arc<Mutex<Vec<(String, u64)>>>,
) -> std::thread::JoinHandle<()> {
  let time_sync = participant.create_time_sync_service(peers).unwrap();
  let lifecycle = Arc::clone(participant.lifecycle());
  let name = participant.name().to_owned();
  let mut steps_seen = 0usize;
  std::thread::spawn(move || {
    time_sync
      .run(
        0,
        Box::new(move |now_ns, _duration_ns| {
          log.lock().unwrap().push((name.clone(), now_ns));
          steps_seen += 1;
          if steps_seen >= TARGET_STEPS {
            lifecycle.stop("reached target step count").ok();
          }
        }),
      )
      .unwrap();
  })
}

#[test]
fn both_participants_observe_the_identical_step_sequence() {
  let registry_addr = common::start_registry();

  let config_for = |name: &str| {
    ConfigurationBuilder::new(name)
      .required(true)
      .coordinated_start(true)
      .coordinated_stop(true)
      .synchronized(STEP_DURATION_NS)
      .build()
      .unwrap()
  };

  let sync0 = Participant::create(config_for("Sync0"), registry_addr, "127.0.0.1:0".parse().unwrap(), |_| true).unwrap();
  let sync1 = Participant::create(config_for("Sync1"), registry_addr, "127.0.0.1:0".parse().unwrap(), |_| true).unwrap();

  common::wait_for_mutual_join(&sync0, &sync1, Duration::from_secs(5));

  let controller = sync0.system_controller();
  let sync0_id = sync0.connections().participant_id();
  let sync1_id = sync1.connections().participant_id();

  controller.initialize(sync0_id).unwrap();
  controller.initialize(sync1_id).unwrap();
  assert!(common::poll_until(Duration::from_secs(2), || {
    sync0.lifecycle().state() == silkit_rs::ParticipantState::ReadyToRun && sync1.lifecycle().state() == silkit_rs::ParticipantState::ReadyToRun
  }));

  controller.run().unwrap();
  assert!(common::poll_until(Duration::from_secs(2), || {
    sync0.lifecycle().state() == silkit_rs::ParticipantState::Running && sync1.lifecycle().state() == silkit_rs::ParticipantState::Running
  }));

  let log: Arc<Mutex<Vec<(String, u64)>>> = Arc::new(Mutex::new(Vec::new()));
  let peers = vec!["Sync0".to_owned(), "Sync1".to_owned()];

  let handle0 = drive_synced_participant(&sync0, peers.clone(), Arc::clone(&log));
  let handle1 = drive_synced_participant(&sync1, peers, Arc::clone(&log));

  handle0.join().unwrap();
  handle1.join().unwrap();

  let log = log.lock().unwrap();
  let mut sync0_steps: Vec<u64> = log.iter().filter(|(n, _)| n == "Sync0").map(|(_, t)| *t).collect();
  let mut sync1_steps: Vec<u64> = log.iter().filter(|(n, _)| n == "Sync1").map(|(_, t)| *t).collect();
  sync0_steps.sort_unstable();
  sync1_steps.sort_unstable();

  assert_eq!(sync0_steps.len(), TARGET_STEPS);
  assert_eq!(sync1_steps.len(), TARGET_STEPS);
  assert_eq!(sync0_steps, sync1_steps, "barrier allowed participants to diverge on step timing");

  let expected: Vec<u64> = (0..TARGET_STEPS as u64).map(|i| i * STEP_DURATION_NS).collect();
  assert_eq!(sync0_steps, expected);
}
