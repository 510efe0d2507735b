//! Per-participant lifecycle state machine (spec.md §4.8, component C8):
//! the authorized transition graph, handler registration
//! (`CommunicationReady`, `Stop`, `Shutdown`, `Reinitialize`), and the
//! `pause`/`continue_`/`stop`/`report_error` surface kept as explicit
//! first-class transitions (spec.md §9: these two are state transitions in
//! both this spec and the original, not exception-based control flow).
//!
//! Handlers run on the thread that processed the triggering system command
//! — the connection manager's I/O thread (spec.md §5; resolved Open
//! Question, see `DESIGN.md`).

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll};

#[allow(unused_imports)]
use log::{debug, info, warn};

use chrono::Utc;
use futures::task::AtomicWaker;

use crate::error::{Result, SilKitError};
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{ParticipantStateWire, ParticipantStatusMessage, SystemCommandKind, SystemCommandMessage};
use crate::wire::{Frame, MessageTag};

/// Wall-clock timestamp for a [`ParticipantStatusMessage`] (spec.md §3,
/// "enter-reason string, timestamp"). Distinct from the virtual `nowNs` the
/// time synchronization service drives — this is real time, for humans
/// reading status history, not simulated time.
fn wall_clock_now_ns() -> u64 {
  Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantState {
  Invalid,
  ServicesCreated,
  CommunicationInitializing,
  CommunicationInitialized,
  ReadyToRun,
  Running,
  Paused,
  Stopping,
  Stopped,
  Error,
  ShuttingDown,
  Shutdown,
  Reinitializing,
  Aborting,
}

impl ParticipantState {
  /// Position in the total order declared in spec.md §3
  /// (`Invalid < ServicesCreated < … < Running`), extended to cover every
  /// state. Used by the system monitor's "minimum state" and "all at least
  /// X" computations (spec.md §4.7); the special collapse rules for
  /// `Error`/`Paused`/`Shutdown`/`Aborting` are handled separately, ahead of
  /// any rank comparison.
  pub fn rank(self) -> u8 {
    self as u8
  }

  pub fn to_wire(self) -> ParticipantStateWire {
    match self {
      ParticipantState::Invalid => ParticipantStateWire::Invalid,
      ParticipantState::ServicesCreated => ParticipantStateWire::ServicesCreated,
      ParticipantState::CommunicationInitializing => ParticipantStateWire::CommunicationInitializing,
      ParticipantState::CommunicationInitialized => ParticipantStateWire::CommunicationInitialized,
      ParticipantState::ReadyToRun => ParticipantStateWire::ReadyToRun,
      ParticipantState::Running => ParticipantStateWire::Running,
      ParticipantState::Paused => ParticipantStateWire::Paused,
      ParticipantState::Stopping => ParticipantStateWire::Stopping,
      ParticipantState::Stopped => ParticipantStateWire::Stopped,
      ParticipantState::Error => ParticipantStateWire::Error,
      ParticipantState::ShuttingDown => ParticipantStateWire::ShuttingDown,
      ParticipantState::Shutdown => ParticipantStateWire::Shutdown,
      ParticipantState::Reinitializing => ParticipantStateWire::Reinitializing,
      ParticipantState::Aborting => ParticipantStateWire::Aborting,
    }
  }

  pub fn from_wire(wire: ParticipantStateWire) -> Self {
    match wire {
      ParticipantStateWire::Invalid => ParticipantState::Invalid,
      ParticipantStateWire::ServicesCreated => ParticipantState::ServicesCreated,
      ParticipantStateWire::CommunicationInitializing => ParticipantState::CommunicationInitializing,
      ParticipantStateWire::CommunicationInitialized => ParticipantState::CommunicationInitialized,
      ParticipantStateWire::ReadyToRun => ParticipantState::ReadyToRun,
      ParticipantStateWire::Running => ParticipantState::Running,
      ParticipantStateWire::Paused => ParticipantState::Paused,
      ParticipantStateWire::Stopping => ParticipantState::Stopping,
      ParticipantStateWire::Stopped => ParticipantState::Stopped,
      ParticipantStateWire::Error => ParticipantState::Error,
      ParticipantStateWire::ShuttingDown => ParticipantState::ShuttingDown,
      ParticipantStateWire::Shutdown => ParticipantState::Shutdown,
      ParticipantStateWire::Reinitializing => ParticipantState::Reinitializing,
      ParticipantStateWire::Aborting => ParticipantState::Aborting,
    }
  }

  /// Whether `self -> next` is an authorized edge of the graph in spec.md
  /// §4.8 (the system-command-driven and local-command-driven edges are
  /// both included; callers distinguish who is allowed to request which).
  fn can_transition_to(self, next: ParticipantState) -> bool {
    use ParticipantState::*;
    match (self, next) {
      (Invalid, ServicesCreated) => true,
      (ServicesCreated, CommunicationInitializing) => true,
      (CommunicationInitializing, CommunicationInitialized) => true,
      (CommunicationInitialized, ReadyToRun) => true,
      (ReadyToRun, Running) => true,
      (Running, Paused) | (Paused, Running) => true,
      (Running, Stopping) => true,
      (Stopping, Stopped) => true,
      (Stopped, ShuttingDown) => true,
      (ShuttingDown, Shutdown) => true,
      (Stopped, Reinitializing) => true,
      (Reinitializing, CommunicationInitialized) => true,
      (_, Error) => true,
      (_, Aborting) => true,
      (Aborting, Shutdown) => true,
      _ => false,
    }
  }
}

pub type LifecycleHandler = Box<dyn Fn() + Send>;

struct Handlers {
  communication_ready: Vec<LifecycleHandler>,
  stop: Vec<LifecycleHandler>,
  shutdown: Vec<LifecycleHandler>,
  reinitialize: Vec<LifecycleHandler>,
}

impl Handlers {
  fn new() -> Self {
    Self {
      communication_ready: Vec::new(),
      stop: Vec::new(),
      shutdown: Vec::new(),
      reinitialize: Vec::new(),
    }
  }
}

struct SharedState {
  state: ParticipantState,
  terminal: Option<ParticipantState>,
}

/// Per-participant lifecycle driver. Holds the current [`ParticipantState`]
/// behind a mutex, a condition variable other threads (principally the
/// time-sync service, see [`crate::timesync`]) can wait on for a terminal
/// state, and the four handler lists spec.md §4.8 names.
pub struct LifecycleService {
  participant_name: String,
  participant_id: u64,
  is_required: bool,
  has_coordinated_start: bool,
  has_coordinated_stop: bool,
  connections: ConnectionManagerHandle,
  shared: Mutex<SharedState>,
  terminal_cv: Condvar,
  terminal_waker: AtomicWaker,
  handlers: Mutex<Handlers>,
}

impl LifecycleService {
  pub fn new(
    participant_name: impl Into<String>,
    participant_id: u64,
    is_required: bool,
    has_coordinated_start: bool,
    has_coordinated_stop: bool,
    connections: ConnectionManagerHandle,
  ) -> Arc<Self> {
    Arc::new(Self {
      participant_name: participant_name.into(),
      participant_id,
      is_required,
      has_coordinated_start,
      has_coordinated_stop,
      connections,
      shared: Mutex::new(SharedState {
        state: ParticipantState::Invalid,
        terminal: None,
      }),
      terminal_cv: Condvar::new(),
      terminal_waker: AtomicWaker::new(),
      handlers: Mutex::new(Handlers::new()),
    })
  }

  pub fn state(&self) -> ParticipantState {
    self.shared.lock().unwrap().state
  }

  pub fn is_required(&self) -> bool {
    self.is_required
  }

  pub fn on_communication_ready(&self, handler: LifecycleHandler) {
    self.handlers.lock().unwrap().communication_ready.push(handler);
  }

  pub fn on_stop(&self, handler: LifecycleHandler) {
    self.handlers.lock().unwrap().stop.push(handler);
  }

  pub fn on_shutdown(&self, handler: LifecycleHandler) {
    self.handlers.lock().unwrap().shutdown.push(handler);
  }

  pub fn on_reinitialize(&self, handler: LifecycleHandler) {
    self.handlers.lock().unwrap().reinitialize.push(handler);
  }

  /// Controller creation completing: the only edge out of `Invalid`.
  pub fn mark_services_created(&self) -> Result<()> {
    self.transition(ParticipantState::ServicesCreated, "services created")
  }

  /// Blocks the calling thread until the lifecycle reaches a terminal state
  /// (`Shutdown`, `Error`, or `Aborting` settling into `Shutdown`), mirroring
  /// the future `ExecuteLifecycle…` returns in the original (spec.md §7,
  /// §9). The lifecycle's own handler dispatch runs on the I/O thread, so
  /// this method is meant to be called from a different thread (typically
  /// the hosting process's main thread).
  pub fn wait_for_terminal_state(&self) -> ParticipantState {
    let guard = self.shared.lock().unwrap();
    let guard = self
      .terminal_cv
      .wait_while(guard, |s| s.terminal.is_none())
      .unwrap();
    guard.terminal.unwrap()
  }

  /// The async counterpart of [`wait_for_terminal_state`]: the future
  /// `ExecuteLifecycle…` returns in the original (spec.md §7, "the future
  /// returned by `ExecuteLifecycle…` completes with the terminal state").
  /// Polling registers an [`AtomicWaker`] that [`Self::settle_terminal`]
  /// wakes, so the future resolves without the poller busy-looping.
  pub fn terminal_state_future(self: &Arc<Self>) -> LifecycleFuture {
    LifecycleFuture {
      lifecycle: Arc::clone(self),
    }
  }

  /// Local `Pause` command: requires `Running` (spec.md §9, supplemented
  /// from the original's precondition).
  pub fn pause(&self) -> Result<()> {
    self.transition(ParticipantState::Paused, "paused")
  }

  /// Local `Continue` command: requires `Paused`.
  pub fn continue_(&self) -> Result<()> {
    self.transition(ParticipantState::Running, "continued")
  }

  /// Local `Stop` command, independent of a system `Stop` broadcast —
  /// kept as an explicit first-class transition (spec.md §9).
  pub fn stop(&self, reason: impl Into<String>) -> Result<()> {
    self.transition(ParticipantState::Stopping, reason)?;
    self.run_handlers(|h| &h.stop);
    self.transition(ParticipantState::Stopped, "stopped")
  }

  /// Local `ReportError`: any state may transition to `Error` (spec.md
  /// §4.8). Settles the terminal-state wait immediately, since no further
  /// system command can recover a participant from `Error` in this crate
  /// (spec.md §7: handler exceptions convert to `Error`, and the exit code
  /// discipline treats it as the end of the run).
  pub fn report_error(&self, reason: impl Into<String>) {
    let reason = reason.into();
    if self.transition(ParticipantState::Error, &reason).is_ok() {
      self.publish_status(&reason);
      self.settle_terminal(ParticipantState::Error);
    }
  }

  /// Applies one incoming [`SystemCommandMessage`], transitioning this
  /// lifecycle and invoking handlers if the command targets this
  /// participant (spec.md §4.7: "each lifecycle service decides whether
  /// [a command] applies to it").
  pub fn apply_system_command(&self, command: &SystemCommandMessage) {
    match command.kind {
      SystemCommandKind::Initialize => {
        if command.target_participant_id == Some(self.participant_id) {
          self.advance_to_communication_ready();
        }
      }
      SystemCommandKind::Run => {
        if self.state() == ParticipantState::ReadyToRun {
          let _ = self.transition(ParticipantState::Running, "system run");
        }
      }
      SystemCommandKind::Stop => {
        if self.has_coordinated_stop && self.state() == ParticipantState::Running {
          let _ = self.stop("system stop");
        }
      }
      SystemCommandKind::Shutdown => {
        if self.state() == ParticipantState::Stopped {
          self.advance_to_shutdown();
        }
      }
      SystemCommandKind::AbortSimulation => {
        let _ = self.transition(ParticipantState::Aborting, "system abort");
        let _ = self.transition(ParticipantState::Shutdown, "aborted");
        self.settle_terminal(ParticipantState::Shutdown);
      }
      SystemCommandKind::PrepareColdReinitialize => {
        if self.state() == ParticipantState::Stopped {
          let _ = self.transition(ParticipantState::Reinitializing, "cold reinitialize");
          self.run_handlers(|h| &h.reinitialize);
          let _ = self.transition(ParticipantState::CommunicationInitialized, "reinitialized");
        }
      }
    }
  }

  fn advance_to_communication_ready(&self) {
    if self.transition(ParticipantState::CommunicationInitializing, "communication initializing")
      .is_err()
    {
      return;
    }
    self.run_handlers(|h| &h.communication_ready);
    let _ = self.transition(ParticipantState::CommunicationInitialized, "communication ready");
    let _ = self.transition(ParticipantState::ReadyToRun, "ready to run");
    if !self.has_coordinated_start && self.state() == ParticipantState::ReadyToRun {
      let _ = self.transition(ParticipantState::Running, "autonomous start");
    }
  }

  fn advance_to_shutdown(&self) {
    if self.transition(ParticipantState::ShuttingDown, "shutting down").is_err() {
      return;
    }
    self.run_handlers(|h| &h.shutdown);
    let _ = self.transition(ParticipantState::Shutdown, "shutdown");
    self.settle_terminal(ParticipantState::Shutdown);
  }

  fn run_handlers(&self, select: impl Fn(&Handlers) -> &Vec<LifecycleHandler>) {
    let handlers = self.handlers.lock().unwrap();
    for handler in select(&handlers) {
      handler();
    }
  }

  fn transition(&self, next: ParticipantState, reason: impl Into<String>) -> Result<()> {
    let reason = reason.into();
    {
      let mut shared = self.shared.lock().unwrap();
      if !shared.state.can_transition_to(next) {
        return Err(SilKitError::lifecycle(format!(
          "illegal transition {:?} -> {:?}",
          shared.state, next
        )));
      }
      shared.state = next;
    }
    self.publish_status(&reason);
    Ok(())
  }

  fn settle_terminal(&self, terminal: ParticipantState) {
    let mut shared = self.shared.lock().unwrap();
    if shared.terminal.is_none() {
      shared.terminal = Some(terminal);
      self.terminal_cv.notify_all();
      self.terminal_waker.wake();
    }
  }

  fn publish_status(&self, reason: &str) {
    let message = ParticipantStatusMessage {
      participant_name: self.participant_name.clone(),
      state: self.state().to_wire(),
      enter_reason: reason.to_owned(),
      timestamp_ns: wall_clock_now_ns(),
    };
    if let Ok(frame) = Frame::encode_ib_message(MessageTag::ParticipantStatusMessage, &message) {
      let _ = self
        .connections
        .send_ib_message(crate::participant::SYSTEM_NETWORK, MessageTag::ParticipantStatusMessage, frame);
    }
  }
}

/// Future returned by [`LifecycleService::terminal_state_future`]. Resolves
/// once the lifecycle settles into `Shutdown`, `Error`, or `Aborting`
/// having reached `Shutdown` — never before.
pub struct LifecycleFuture {
  lifecycle: Arc<LifecycleService>,
}

impl Future for LifecycleFuture {
  type Output = ParticipantState;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.lifecycle.terminal_waker.register(cx.waker());
    match self.lifecycle.shared.lock().unwrap().terminal {
      Some(terminal) => Poll::Ready(terminal),
      None => Poll::Pending,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ready_to_run_to_running_is_legal() {
    assert!(ParticipantState::ReadyToRun.can_transition_to(ParticipantState::Running));
  }

  #[test]
  fn running_to_stopped_directly_is_illegal() {
    assert!(!ParticipantState::Running.can_transition_to(ParticipantState::Stopped));
  }

  #[test]
  fn running_and_paused_transition_both_ways() {
    assert!(ParticipantState::Running.can_transition_to(ParticipantState::Paused));
    assert!(ParticipantState::Paused.can_transition_to(ParticipantState::Running));
  }

  #[test]
  fn any_state_can_transition_to_error() {
    assert!(ParticipantState::CommunicationInitializing.can_transition_to(ParticipantState::Error));
  }

  #[test]
  fn wire_round_trip_preserves_state() {
    for state in [
      ParticipantState::Invalid,
      ParticipantState::Running,
      ParticipantState::Aborting,
      ParticipantState::Reinitializing,
    ] {
      assert_eq!(ParticipantState::from_wire(state.to_wire()), state);
    }
  }
}
