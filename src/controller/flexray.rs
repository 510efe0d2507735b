//! FlexRay controller (spec.md §4.6, §8 S3): typed send/receive of
//! [`FlexrayFrameEvent`]/[`FlexraySymbolEvent`], plus the controller's own
//! POC (protocol operation control) state machine. The coldstart handshake
//! in trivial simulation is purely local — no cross-node coordination frame
//! exists on the wire for it, by design (spec.md §1 excludes bit-exact
//! FlexRay behavior; only the observable POC sequence is in scope) — so
//! `wakeup`/`allow_coldstart`/`run` each drive this node's own state machine
//! and fire `on_poc_status` synchronously, in line with every other handler
//! in this crate running on the calling thread.

use std::sync::{Arc, Mutex};

use crate::controller::{ControllerRegistry, FacadeCore, InboundRoute};
use crate::discovery::{ServiceDiscovery, ServiceDiscoveryEventKind};
use crate::error::{Result, SilKitError};
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{
  FlexrayFrameEvent, FlexrayPocStatusEvent, FlexraySymbolEvent, FlexraySymbolPattern, PocState, ServiceAttribute,
  ServiceDescriptor,
};
use crate::wire::{Frame, MessageTag};

pub type FlexrayFrameHandler = Box<dyn Fn(&FlexrayFrameEvent) + Send>;
pub type FlexrayPocStatusHandler = Box<dyn Fn(&FlexrayPocStatusEvent) + Send>;
pub type FlexraySymbolHandler = Box<dyn Fn(&FlexraySymbolEvent) + Send>;

/// Drives the POC state machine described in spec.md §4.8/§8 S3:
/// `DefaultConfig → Ready → Wakeup → Ready → NormalActive`. Pure, so it is
/// unit-testable without any network state.
struct PocMachine {
  state: PocState,
  coldstart_allowed: bool,
}

impl PocMachine {
  fn new() -> Self {
    // Controller creation completes configuration immediately; there is no
    // observable intermediate step between `DefaultConfig` and `Ready` in
    // trivial simulation.
    Self {
      state: PocState::Ready,
      coldstart_allowed: false,
    }
  }

  fn wakeup(&mut self) -> Result<[PocState; 2]> {
    if self.state != PocState::Ready {
      return Err(SilKitError::lifecycle(format!(
        "flexray wakeup requires Ready, was {:?}",
        self.state
      )));
    }
    self.state = PocState::Wakeup;
    let first = self.state;
    self.state = PocState::Ready;
    Ok([first, self.state])
  }

  fn allow_coldstart(&mut self) -> Result<()> {
    if self.state != PocState::Ready {
      return Err(SilKitError::lifecycle(format!(
        "flexray allow_coldstart requires Ready, was {:?}",
        self.state
      )));
    }
    self.coldstart_allowed = true;
    Ok(())
  }

  fn run(&mut self) -> Result<PocState> {
    if self.state != PocState::Ready || !self.coldstart_allowed {
      return Err(SilKitError::lifecycle(
        "flexray run requires Ready with coldstart allowed",
      ));
    }
    self.state = PocState::NormalActive;
    Ok(self.state)
  }
}

struct Inner {
  network: String,
  connections: ConnectionManagerHandle,
  facade: FacadeCore,
  poc: Mutex<PocMachine>,
  frame_handlers: Mutex<Vec<FlexrayFrameHandler>>,
  poc_handlers: Mutex<Vec<FlexrayPocStatusHandler>>,
  symbol_handlers: Mutex<Vec<FlexraySymbolHandler>>,
}

pub struct FlexrayController {
  inner: Arc<Inner>,
}

impl FlexrayController {
  pub fn create(
    connections: ConnectionManagerHandle,
    discovery: &ServiceDiscovery,
    registry: &ControllerRegistry,
    network: impl Into<String>,
    service_name: impl Into<String>,
    endpoint_id: u64,
  ) -> Result<Self> {
    let network = network.into();
    let service_name = service_name.into();

    connections.subscribe(network.clone(), MessageTag::FlexrayFrameEvent, endpoint_id)?;
    connections.subscribe(network.clone(), MessageTag::FlexraySymbolEvent, endpoint_id)?;
    connections.subscribe(network.clone(), MessageTag::FlexrayPocStatusEvent, endpoint_id)?;

    let inner = Arc::new(Inner {
      network: network.clone(),
      connections: connections.clone(),
      facade: FacadeCore::new(network.clone()),
      poc: Mutex::new(PocMachine::new()),
      frame_handlers: Mutex::new(Vec::new()),
      poc_handlers: Mutex::new(Vec::new()),
      symbol_handlers: Mutex::new(Vec::new()),
    });

    registry.register(MessageTag::FlexrayFrameEvent, inner.clone());
    registry.register(MessageTag::FlexraySymbolEvent, inner.clone());
    registry.register(MessageTag::FlexrayPocStatusEvent, inner.clone());

    let discovery_inner = Arc::clone(&inner);
    discovery.register_handler(Box::new(move |kind, descriptor| {
      discovery_inner
        .facade
        .on_discovery_event(kind == ServiceDiscoveryEventKind::ServiceCreated, descriptor);
    }));

    discovery.notify_service_created(ServiceDescriptor {
      participant_name: connections.participant_name().to_owned(),
      network_name: network,
      service_name,
      service_type: "FlexrayController".to_owned(),
      endpoint_id,
      attributes: Vec::<ServiceAttribute>::new(),
    })?;

    Ok(Self { inner })
  }

  pub fn network(&self) -> &str {
    &self.inner.network
  }

  pub fn is_proxied(&self) -> bool {
    self.inner.facade.is_proxied()
  }

  pub fn poc_state(&self) -> PocState {
    self.inner.poc.lock().unwrap().state
  }

  pub fn on_frame(&self, handler: FlexrayFrameHandler) {
    self.inner.frame_handlers.lock().unwrap().push(handler);
  }

  pub fn on_poc_status(&self, handler: FlexrayPocStatusHandler) {
    self.inner.poc_handlers.lock().unwrap().push(handler);
  }

  pub fn on_symbol(&self, handler: FlexraySymbolHandler) {
    self.inner.symbol_handlers.lock().unwrap().push(handler);
  }

  /// `Wakeup` POC command: emits a `Wakeup` symbol, then settles back to
  /// `Ready` (spec.md §8 S3 sequence).
  pub fn wakeup(&self, timestamp_ns: u64) -> Result<()> {
    let transitions = self.inner.poc.lock().unwrap().wakeup()?;
    for state in transitions {
      self.emit_poc_status(state, timestamp_ns);
    }
    self.emit_symbol(FlexraySymbolPattern::Wakeup, timestamp_ns);
    Ok(())
  }

  pub fn allow_coldstart(&self) -> Result<()> {
    self.inner.poc.lock().unwrap().allow_coldstart()
  }

  /// `Run` POC command, requires a prior `allow_coldstart` (spec.md §8 S3).
  pub fn run(&self, timestamp_ns: u64) -> Result<()> {
    let state = self.inner.poc.lock().unwrap().run()?;
    self.emit_poc_status(state, timestamp_ns);
    Ok(())
  }

  pub fn send_frame(&self, buffer_id: u16, slot_id: u16, payload: Vec<u8>, timestamp_ns: u64) -> Result<()> {
    let event = FlexrayFrameEvent {
      network_name: self.inner.network.clone(),
      buffer_id,
      slot_id,
      payload,
      timestamp_ns,
    };
    let frame = Frame::encode_ib_message(MessageTag::FlexrayFrameEvent, &event)?;
    self
      .inner
      .connections
      .send_ib_message(self.inner.network.clone(), MessageTag::FlexrayFrameEvent, frame)
  }

  fn emit_poc_status(&self, state: PocState, timestamp_ns: u64) {
    let event = FlexrayPocStatusEvent {
      network_name: self.inner.network.clone(),
      state,
      timestamp_ns,
    };
    for handler in self.inner.poc_handlers.lock().unwrap().iter() {
      handler(&event);
    }
  }

  fn emit_symbol(&self, pattern: FlexraySymbolPattern, timestamp_ns: u64) {
    let event = FlexraySymbolEvent {
      network_name: self.inner.network.clone(),
      pattern,
      timestamp_ns,
    };
    for handler in self.inner.symbol_handlers.lock().unwrap().iter() {
      handler(&event);
    }
  }
}

impl InboundRoute for Inner {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    if !self.facade.should_accept(sender, self.connections.participant_name()) {
      return;
    }
    match tag {
      MessageTag::FlexrayFrameEvent => {
        let Ok((_, event)) = frame.decode_ib_message::<FlexrayFrameEvent>() else {
          return;
        };
        if event.network_name != self.network {
          return;
        }
        for handler in self.frame_handlers.lock().unwrap().iter() {
          handler(&event);
        }
      }
      MessageTag::FlexraySymbolEvent => {
        let Ok((_, event)) = frame.decode_ib_message::<FlexraySymbolEvent>() else {
          return;
        };
        if event.network_name != self.network {
          return;
        }
        for handler in self.symbol_handlers.lock().unwrap().iter() {
          handler(&event);
        }
      }
      MessageTag::FlexrayPocStatusEvent => {
        let Ok((_, event)) = frame.decode_ib_message::<FlexrayPocStatusEvent>() else {
          return;
        };
        if event.network_name != self.network {
          return;
        }
        for handler in self.poc_handlers.lock().unwrap().iter() {
          handler(&event);
        }
      }
      _ => {}
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wakeup_then_coldstart_then_run_follows_spec_sequence() {
    let mut poc = PocMachine::new();
    assert_eq!(poc.state, PocState::Ready);
    let transitions = poc.wakeup().unwrap();
    assert_eq!(transitions, [PocState::Wakeup, PocState::Ready]);
    poc.allow_coldstart().unwrap();
    let final_state = poc.run().unwrap();
    assert_eq!(final_state, PocState::NormalActive);
  }

  #[test]
  fn run_without_coldstart_allowance_is_rejected() {
    let mut poc = PocMachine::new();
    poc.wakeup().unwrap();
    assert!(poc.run().is_err());
  }

  #[test]
  fn wakeup_is_rejected_outside_ready() {
    let mut poc = PocMachine::new();
    poc.wakeup().unwrap();
    poc.allow_coldstart().unwrap();
    poc.run().unwrap();
    assert!(poc.wakeup().is_err());
  }
}
