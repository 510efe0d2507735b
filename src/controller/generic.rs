//! Generic publish/subscribe controller (spec.md §4.6): a topic-addressed
//! byte payload, the catch-all bus for traffic that has no dedicated frame
//! format. Unlike the fixed-format buses, a [`GenericPublisher`] carries a
//! `topic` string alongside `network_name`, and subscribers filter on both.

use std::sync::{Arc, Mutex};

use crate::controller::{ControllerRegistry, FacadeCore, InboundRoute};
use crate::discovery::{ServiceDiscovery, ServiceDiscoveryEventKind};
use crate::error::Result;
use crate::mesh::ConnectionManagerHandle;
use crate::wire::messages::{GenericMessage, ServiceAttribute, ServiceDescriptor};
use crate::wire::{Frame, MessageTag};

pub type GenericMessageHandler = Box<dyn Fn(&GenericMessage) + Send>;

struct Inner {
  network: String,
  topic: String,
  connections: ConnectionManagerHandle,
  facade: FacadeCore,
  handlers: Mutex<Vec<GenericMessageHandler>>,
}

/// A combined publisher/subscriber handle for one `(network, topic)` pair.
pub struct GenericController {
  inner: Arc<Inner>,
}

impl GenericController {
  pub fn create(
    connections: ConnectionManagerHandle,
    discovery: &ServiceDiscovery,
    registry: &ControllerRegistry,
    network: impl Into<String>,
    topic: impl Into<String>,
    service_name: impl Into<String>,
    endpoint_id: u64,
  ) -> Result<Self> {
    let network = network.into();
    let topic = topic.into();
    let service_name = service_name.into();

    connections.subscribe(network.clone(), MessageTag::GenericMessage, endpoint_id)?;

    let inner = Arc::new(Inner {
      network: network.clone(),
      topic: topic.clone(),
      connections: connections.clone(),
      facade: FacadeCore::new(network.clone()),
      handlers: Mutex::new(Vec::new()),
    });

    registry.register(MessageTag::GenericMessage, inner.clone());

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
      service_type: "GenericPublisher".to_owned(),
      endpoint_id,
      attributes: vec![ServiceAttribute {
        key: "topic".to_owned(),
        value: topic,
      }],
    })?;

    Ok(Self { inner })
  }

  pub fn network(&self) -> &str {
    &self.inner.network
  }

  pub fn topic(&self) -> &str {
    &self.inner.topic
  }

  pub fn is_proxied(&self) -> bool {
    self.inner.facade.is_proxied()
  }

  pub fn on_message(&self, handler: GenericMessageHandler) {
    self.inner.handlers.lock().unwrap().push(handler);
  }

  pub fn publish(&self, data: Vec<u8>, timestamp_ns: u64) -> Result<()> {
    let message = GenericMessage {
      network_name: self.inner.network.clone(),
      topic: self.inner.topic.clone(),
      data,
      timestamp_ns,
    };
    let frame = Frame::encode_ib_message(MessageTag::GenericMessage, &message)?;
    self
      .inner
      .connections
      .send_ib_message(self.inner.network.clone(), MessageTag::GenericMessage, frame)
  }
}

impl InboundRoute for Inner {
  fn on_inbound(&self, tag: MessageTag, sender: &str, frame: &Frame) {
    if tag != MessageTag::GenericMessage || !self.facade.should_accept(sender, self.connections.participant_name()) {
      return;
    }
    let Ok((_, message)) = frame.decode_ib_message::<GenericMessage>() else {
      return;
    };
    if message.network_name != self.network || message.topic != self.topic {
      return;
    }
    for handler in self.handlers.lock().unwrap().iter() {
      handler(&message);
    }
  }
}
