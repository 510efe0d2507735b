//! spec.md §8 S5 — a required participant's stop handler reports an error;
//! the participant settles into `Error` rather than `Shutdown`, the system
//! monitor observes the aggregate system state become `Error`, and anyone
//! blocked on the terminal-state wait is released rather than left hanging.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use silkit_rs::{ConfigurationBuilder, Participant, ParticipantState};

#[test]
fn stop_handler_error_settles_participant_and_system_into_error() {
  let registry_addr = common::start_registry();

  let unit_config = ConfigurationBuilder::new("FailingUnit")
    .required(true)
    .coordinated_start(true)
    .coordinated_stop(true)
    .build()
    .unwrap();
  let unit = Participant::create(unit_config, registry_addr, "127.0.0.1:0".parse().unwrap(), |_| true).unwrap();

  let monitor_config = ConfigurationBuilder::new("Monitor").required(false).build().unwrap();
  let monitor_participant = Participant::create(monitor_config, registry_addr, "127.0.0.1:0".parse().unwrap(), |_| false).unwrap();

  common::wait_for_mutual_join(&unit, &monitor_participant, Duration::from_secs(5));

  let system_monitor = monitor_participant.create_system_monitor(vec![unit.name().to_owned()]);

  let unit_lifecycle = std::sync::Arc::clone(unit.lifecycle());
  unit.lifecycle().on_stop(Box::new(move || {
    unit_lifecycle.report_error("simulated failure in stop handler");
  }));

  // A separate thread blocks on the terminal-state wait, mirroring how a
  // hosting process would; this proves the wait is released on error rather
  // than hanging forever waiting for a `Shutdown` that will never come.
  let (terminal_tx, terminal_rx) = mpsc::channel();
  let waiting_unit = std::sync::Arc::clone(&unit);
  std::thread::spawn(move || {
    let _ = terminal_tx.send(waiting_unit.lifecycle().wait_for_terminal_state());
  });

  let system = monitor_participant.system_controller();
  let unit_id = unit.connections().participant_id();

  system.initialize(unit_id).unwrap();
  assert!(common::poll_until(Duration::from_secs(2), || unit.lifecycle().state() == ParticipantState::ReadyToRun));

  system.run().unwrap();
  assert!(common::poll_until(Duration::from_secs(2), || unit.lifecycle().state() == ParticipantState::Running));

  system.stop().unwrap();

  assert!(
    common::poll_until(Duration::from_secs(2), || unit.lifecycle().state() == ParticipantState::Error),
    "unit never settled into Error after its stop handler reported one, was {:?}",
    unit.lifecycle().state()
  );

  let terminal = terminal_rx
    .recv_timeout(Duration::from_secs(2))
    .expect("terminal-state wait never resolved after the stop handler's error");
  assert_eq!(terminal, ParticipantState::Error);

  assert!(
    common::poll_until(Duration::from_secs(2), || system_monitor.system_state() == Some(ParticipantState::Error)),
    "system monitor never observed the aggregate system state become Error, was {:?}",
    system_monitor.system_state()
  );
}
