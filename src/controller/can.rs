//! CAN controller (spec.md §4.6, §8 S2): typed send/receive of
//! [`CanFrameEvent`] plus transmit acknowledgements. A trivial-backend send
//! synthesizes its acknowledgement immediately, since no remote simulator is
//! involved; a proxied send waits for the acknowledgement the simulator
//! eventually publishes back over the wire.

use std::sync::{Arc, Mutex};

#[allow(unused_imports)]
use log::{debug, trace};

use crate::controller::{ControllerRegistry, FacadeCore, InboundRoute};
use crate::discovery::{ServiceDiscovery, ServiceDiscoveryEventKind};
use crate::error::Result;
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{CanFrameEvent, CanTransmitAck, CanTransmitStatus, ServiceAttribute, ServiceDescriptor};
use crate::wire::{Frame, MessageTag};

pub type CanFrameHandler = Box<dyn Fn(&CanFrameEvent) + Send>;
pub type CanTransmitAckHandler = Box<dyn Fn(&CanTransmitAck) + Send>;

struct Inner {
  network: String,
  service_name: String,
  endpoint_id: u64,
  connections: ConnectionManagerHandle,
  facade: FacadeCore,
  frame_handlers: Mutex<Vec<CanFrameHandler>>,
  ack_handlers: Mutex<Vec<CanTransmitAckHandler>>,
}

/// A per-participant handle to a named CAN network (spec.md GLOSSARY,
/// "Controller").
pub struct CanController {
  inner: Arc<Inner>,
}

impl CanController {
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

    connections.subscribe(network.clone(), MessageTag::CanFrameEvent, endpoint_id)?;
    connections.subscribe(network.clone(), MessageTag::CanTransmitAck, endpoint_id)?;

    let inner = Arc::new(Inner {
      network: network.clone(),
      service_name: service_name.clone(),
      endpoint_id,
      connections: connections.clone(),
      facade: FacadeCore::new(network.clone()),
      frame_handlers: Mutex::new(Vec::new()),
      ack_handlers: Mutex::new(Vec::new()),
    });

    registry.register(MessageTag::CanFrameEvent, inner.clone());
    registry.register(MessageTag::CanTransmitAck, inner.clone());

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
      service_type: "CanController".to_owned(),
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

  pub fn on_frame(&self, handler: CanFrameHandler) {
    self.inner.frame_handlers.lock().unwrap().push(handler);
  }

  pub fn on_transmit_ack(&self, handler: CanTransmitAckHandler) {
    self.inner.ack_handlers.lock().unwrap().push(handler);
  }

  /// Sends a CAN frame. `user_context` is echoed back unmodified on the
  /// matching [`CanTransmitAck`] (spec.md §8 S2).
  pub fn send_frame(&self, can_id: u32, data: Vec<u8>, user_context: u64, timestamp_ns: u64) -> Result<()> {
    let event = CanFrameEvent {
      network_name: self.inner.network.clone(),
      can_id,
      data,
      timestamp_ns,
    };
    let frame = Frame::encode_ib_message(MessageTag::CanFrameEvent, &event)?;
    self
      .inner
      .connections
      .send_ib_message(self.inner.network.clone(), MessageTag::CanFrameEvent, frame)?;

    if self.inner.facade.is_trivial() {
      let ack = CanTransmitAck {
        network_name: self.inner.network.clone(),
        user_context,
        status: CanTransmitStatus::Transmitted,
        timestamp_ns,
      };
      for handler in self.inner.ack_handlers.lock().unwrap().iter() {
        handler(&ack);
      }
    }
    Ok(())
  }
}

impl InboundRoute for Inner {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    if !self.facade.should_accept(sender, self.connections.participant_name()) {
      return;
    }
    match tag {
      MessageTag::CanFrameEvent => {
        let Ok((_, event)) = frame.decode_ib_message::<CanFrameEvent>() else {
          return;
        };
        if event.network_name != self.network {
          return;
        }
        for handler in self.frame_handlers.lock().unwrap().iter() {
          handler(&event);
        }
      }
      MessageTag::CanTransmitAck => {
        let Ok((_, ack)) = frame.decode_ib_message::<CanTransmitAck>() else {
          return;
        };
        if ack.network_name != self.network {
          return;
        }
        for handler in self.ack_handlers.lock().unwrap().iter() {
          handler(&ack);
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
  fn trivial_ack_reports_transmitted() {
    // The trivial-ack path is exercised directly against `CanTransmitAck`
    // construction since it needs no live connection manager.
    let ack = CanTransmitAck {
      network_name: "PowerTrain1".to_owned(),
      user_context: 7,
      status: CanTransmitStatus::Transmitted,
      timestamp_ns: 1,
    };
    assert_eq!(ack.status, CanTransmitStatus::Transmitted);
  }
}
