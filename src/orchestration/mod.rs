//! System monitor & controller (spec.md §4.7, component C7): aggregates
//! every required participant's status into one system-wide state, and
//! issues the system commands that drive every participant's lifecycle
//! service in lockstep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::error::Result;
use crate::lifecycle::ParticipantState;
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{ParticipantStatusMessage, SystemCommandKind, SystemCommandMessage};
use crate::wire::{Frame, MessageTag};

pub type SystemStateHandler = Box<dyn Fn(ParticipantState) + Send>;

struct State {
  /// Last known state per required participant; absent entries are treated
  /// as not-yet-reporting and excluded from the `all(...)` computations
  /// below until their first status arrives.
  required: HashMap<String, ParticipantState>,
  last_system_state: Option<ParticipantState>,
  handlers: Vec<SystemStateHandler>,
}

/// Computes system state from a set of required-participant states, per the
/// precedence rules in spec.md §4.7.
fn compute_system_state(states: &HashMap<String, ParticipantState>) -> Option<ParticipantState> {
  if states.is_empty() {
    return None;
  }
  if states.values().any(|s| *s == ParticipantState::Error) {
    return Some(ParticipantState::Error);
  }
  if states.values().any(|s| *s == ParticipantState::Aborting) {
    return Some(ParticipantState::Aborting);
  }
  if states.values().all(|s| *s == ParticipantState::Shutdown) {
    return Some(ParticipantState::Shutdown);
  }
  if states.values().all(|s| s.rank() >= ParticipantState::Stopped.rank()) {
    return Some(ParticipantState::Stopped);
  }
  if states.values().all(|s| s.rank() >= ParticipantState::Running.rank())
    && states.values().all(|s| s.rank() <= ParticipantState::Stopped.rank())
  {
    return Some(ParticipantState::Running);
  }
  states.values().min_by_key(|s| s.rank()).copied()
}

/// Subscribes to [`ParticipantStatusMessage`]s from every required
/// participant and recomputes system state on each arrival.
pub struct SystemMonitor {
  state: Mutex<State>,
  required_participants: Vec<String>,
}

impl SystemMonitor {
  pub fn new(required_participants: Vec<String>) -> Arc<Self> {
    Arc::new(Self {
      state: Mutex::new(State {
        required: HashMap::new(),
        last_system_state: None,
        handlers: Vec::new(),
      }),
      required_participants,
    })
  }

  pub fn register_handler(&self, handler: SystemStateHandler) {
    self.state.lock().unwrap().handlers.push(handler);
  }

  pub fn system_state(&self) -> Option<ParticipantState> {
    self.state.lock().unwrap().last_system_state
  }

  /// Applies one incoming status. Non-required participants are recorded in
  /// the system-state computation only if the monitor was configured to
  /// track them (spec.md §4.7: "the monitor subscribes to participant status
  /// messages from all required participants").
  pub fn apply_status(&self, status: &ParticipantStatusMessage) {
    if !self.required_participants.iter().any(|n| n == &status.participant_name) {
      return;
    }
    let mut state = self.state.lock().unwrap();
    state
      .required
      .insert(status.participant_name.clone(), ParticipantState::from_wire(status.state));

    let new_system_state = compute_system_state(&state.required);
    if new_system_state != state.last_system_state {
      state.last_system_state = new_system_state;
      if let Some(system_state) = new_system_state {
        for handler in &state.handlers {
          handler(system_state);
        }
      }
    }
  }
}

/// Issues system commands, broadcast to every participant; each lifecycle
/// service decides for itself whether a given command applies (spec.md
/// §4.7).
pub struct SystemController {
  connections: ConnectionManagerHandle,
}

impl SystemController {
  pub fn new(connections: ConnectionManagerHandle) -> Self {
    Self { connections }
  }

  fn broadcast(&self, kind: SystemCommandKind, target_participant_id: Option<u64>) -> Result<()> {
    let message = SystemCommandMessage {
      kind,
      target_participant_id,
    };
    let frame = Frame::encode_ib_message(MessageTag::SystemCommandMessage, &message)?;
    self
      .connections
      .send_ib_message(crate::participant::SYSTEM_NETWORK, MessageTag::SystemCommandMessage, frame)
  }

  /// Targets exactly one participant, by id (spec.md §4.7).
  pub fn initialize(&self, participant_id: u64) -> Result<()> {
    self.broadcast(SystemCommandKind::Initialize, Some(participant_id))
  }

  pub fn run(&self) -> Result<()> {
    self.broadcast(SystemCommandKind::Run, None)
  }

  pub fn stop(&self) -> Result<()> {
    self.broadcast(SystemCommandKind::Stop, None)
  }

  pub fn shutdown(&self) -> Result<()> {
    self.broadcast(SystemCommandKind::Shutdown, None)
  }

  pub fn abort_simulation(&self) -> Result<()> {
    self.broadcast(SystemCommandKind::AbortSimulation, None)
  }

  pub fn prepare_cold_reinitialize(&self) -> Result<()> {
    self.broadcast(SystemCommandKind::PrepareColdReinitialize, None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn states(pairs: &[(&str, ParticipantState)]) -> HashMap<String, ParticipantState> {
    pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
  }

  #[test]
  fn any_error_dominates() {
    let s = states(&[("A", ParticipantState::Running), ("B", ParticipantState::Error)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::Error));
  }

  #[test]
  fn aborting_dominates_over_running() {
    let s = states(&[("A", ParticipantState::Aborting), ("B", ParticipantState::Running)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::Aborting));
  }

  #[test]
  fn all_shutdown_is_shutdown() {
    let s = states(&[("A", ParticipantState::Shutdown), ("B", ParticipantState::Shutdown)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::Shutdown));
  }

  #[test]
  fn mixed_running_and_stopped_is_minimum() {
    let s = states(&[("A", ParticipantState::Running), ("B", ParticipantState::ReadyToRun)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::ReadyToRun));
  }

  #[test]
  fn all_at_least_running_is_running() {
    let s = states(&[("A", ParticipantState::Running), ("B", ParticipantState::Paused)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::Running));
  }

  #[test]
  fn a_participant_ahead_of_stopped_falls_back_to_minimum_instead_of_running() {
    // spec.md §4.7: "all are at least Running (and none ahead of Stopped)".
    // `ShuttingDown` is ahead of `Stopped`, so this pair must not collapse
    // to `Running` even though both ranks are >= Running's.
    let s = states(&[("A", ParticipantState::Paused), ("B", ParticipantState::ShuttingDown)]);
    assert_eq!(compute_system_state(&s), Some(ParticipantState::Paused));
  }
}
