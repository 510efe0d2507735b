//! LIN controller (spec.md §4.6): typed send/receive of [`LinFrameEvent`].
//! LIN has no separate transmit-acknowledgement message on the wire (spec.md
//! §4.1's typed-message list does not include one) — delivery of the frame
//! itself, via the same trivial/proxy routing as every other bus, is the
//! only observable effect of a send.

use std::sync::{Arc, Mutex};

use crate::controller::{ControllerRegistry, FacadeCore, InboundRoute};
use crate::discovery::{ServiceDiscovery, ServiceDiscoveryEventKind};
use crate::error::Result;
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{LinFrameEvent, LinFrameResponseType, ServiceAttribute, ServiceDescriptor};
use crate::wire::{Frame, MessageTag};

pub type LinFrameHandler = Box<dyn Fn(&LinFrameEvent) + Send>;

struct Inner {
  network: String,
  connections: ConnectionManagerHandle,
  facade: FacadeCore,
  frame_handlers: Mutex<Vec<LinFrameHandler>>,
}

pub struct LinController {
  inner: Arc<Inner>,
}

impl LinController {
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

    connections.subscribe(network.clone(), MessageTag::LinFrameEvent, endpoint_id)?;

    let inner = Arc::new(Inner {
      network: network.clone(),
      connections: connections.clone(),
      facade: FacadeCore::new(network.clone()),
      frame_handlers: Mutex::new(Vec::new()),
    });

    registry.register(MessageTag::LinFrameEvent, inner.clone());

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
      service_type: "LinController".to_owned(),
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

  pub fn on_frame(&self, handler: LinFrameHandler) {
    self.inner.frame_handlers.lock().unwrap().push(handler);
  }

  pub fn send_frame(&self, lin_id: u8, data: Vec<u8>, response_type: LinFrameResponseType, timestamp_ns: u64) -> Result<()> {
    let event = LinFrameEvent {
      network_name: self.inner.network.clone(),
      lin_id,
      data,
      response_type,
      timestamp_ns,
    };
    let frame = Frame::encode_ib_message(MessageTag::LinFrameEvent, &event)?;
    self
      .inner
      .connections
      .send_ib_message(self.inner.network.clone(), MessageTag::LinFrameEvent, frame)
  }
}

impl InboundRoute for Inner {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    if tag != MessageTag::LinFrameEvent || !self.facade.should_accept(sender, self.connections.participant_name()) {
      return;
    }
    let Ok((_, event)) = frame.decode_ib_message::<LinFrameEvent>() else {
      return;
    };
    if event.network_name != self.network {
      return;
    }
    for handler in self.frame_handlers.lock().unwrap().iter() {
      handler(&event);
    }
  }
}
