//! spec.md §8 S1 — two-participant lifecycle, no time synchronization.
//!
//! A controller issues `Initialize(TestUnit.id) -> Run -> Stop -> Shutdown`
//! and the unit's observed states follow the full lifecycle graph through to
//! `Shutdown`.

mod common;

use std::time::Duration;

use silkit_rs::{ConfigurationBuilder, Participant, ParticipantState};

#[test]
fn controller_drives_unit_through_full_lifecycle() {
  let registry_addr = common::start_registry();

  let unit_config = ConfigurationBuilder::new("TestUnit")
    .required(true)
    .coordinated_start(true)
    .coordinated_stop(true)
    .build()
    .unwrap();
  let test_unit = Participant::create(unit_config, registry_addr, "127.0.0.1:0".parse().unwrap(), |_| true).unwrap();

  let controller_config = ConfigurationBuilder::new("TestController").required(false).build().unwrap();
  let test_controller = Participant::create(controller_config, registry_addr, "127.0.0.1:0".parse().unwrap(), |_| false).unwrap();

  common::wait_for_mutual_join(&test_controller, &test_unit, Duration::from_secs(5));

  let system = test_controller.system_controller();
  let unit_id = test_unit.connections().participant_id();

  system.initialize(unit_id).unwrap();
  assert!(
    common::poll_until(Duration::from_secs(2), || test_unit.lifecycle().state() == ParticipantState::ReadyToRun),
    "unit never reached ReadyToRun after Initialize, was {:?}",
    test_unit.lifecycle().state()
  );

  system.run().unwrap();
  assert!(
    common::poll_until(Duration::from_secs(2), || test_unit.lifecycle().state() == ParticipantState::Running),
    "unit never reached Running after Run"
  );

  system.stop().unwrap();
  // Stop and Shutdown are distinct system commands (spec.md §4.8): Stop
  // carries the unit to Stopped only, leaving Stopped -> ShuttingDown ->
  // Shutdown to the explicit Shutdown command below.
  assert!(
    common::poll_until(Duration::from_secs(2), || test_unit.lifecycle().state() == ParticipantState::Stopped),
    "unit never reached Stopped after Stop, was {:?}",
    test_unit.lifecycle().state()
  );

  system.shutdown().unwrap();
  assert!(
    common::poll_until(Duration::from_secs(2), || test_unit.lifecycle().state() == ParticipantState::Shutdown),
    "unit never reached Shutdown after Shutdown, was {:?}",
    test_unit.lifecycle().state()
  );
}
