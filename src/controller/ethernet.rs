//! Ethernet controller (spec.md §4.6): typed send/receive of raw
//! [`EthernetFrameEvent`]s, routed through the same trivial/proxy facade as
//! every other bus controller.

use std::sync::{Arc, Mutex};

use crate::controller::{ControllerRegistry, FacadeCore, InboundRoute};
use crate::discovery::{ServiceDiscovery, ServiceDiscoveryEventKind};
use crate::error::Result;
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{EthernetFrameEvent, ServiceAttribute, ServiceDescriptor};
use crate::wire::{Frame, MessageTag};

pub type EthernetFrameHandler = Box<dyn Fn(&EthernetFrameEvent) + Send>;

struct Inner {
  network: String,
  connections: ConnectionManagerHandle,
  facade: FacadeCore,
  frame_handlers: Mutex<Vec<EthernetFrameHandler>>,
}

pub struct EthernetController {
  inner: Arc<Inner>,
}

impl EthernetController {
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

    connections.subscribe(network.clone(), MessageTag::EthernetFrameEvent, endpoint_id)?;

    let inner = Arc::new(Inner {
      network: network.clone(),
      connections: connections.clone(),
      facade: FacadeCore::new(network.clone()),
      frame_handlers: Mutex::new(Vec::new()),
    });

    registry.register(MessageTag::EthernetFrameEvent, inner.clone());

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
      service_type: "EthernetController".to_owned(),
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

  pub fn on_frame(&self, handler: EthernetFrameHandler) {
    self.inner.frame_handlers.lock().unwrap().push(handler);
  }

  pub fn send_frame(&self, data: Vec<u8>, timestamp_ns: u64) -> Result<()> {
    let event = EthernetFrameEvent {
      network_name: self.inner.network.clone(),
      data,
      timestamp_ns,
    };
    let frame = Frame::encode_ib_message(MessageTag::EthernetFrameEvent, &event)?;
    self
      .inner
      .connections
      .send_ib_message(self.inner.network.clone(), MessageTag::EthernetFrameEvent, frame)
  }
}

impl InboundRoute for Inner {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    if tag != MessageTag::EthernetFrameEvent || !self.facade.should_accept(sender, self.connections.participant_name()) {
      return;
    }
    let Ok((_, event)) = frame.decode_ib_message::<EthernetFrameEvent>() else {
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
