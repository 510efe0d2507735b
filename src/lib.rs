//! Distributed co-simulation middleware for virtual vehicle networks.
//!
//! Three tightly coupled subsystems, one module tree each:
//! - participant connectivity fabric: [`wire`], [`transport`], [`registry`], [`mesh`]
//! - lifecycle, orchestration and time synchronization: [`lifecycle`], [`orchestration`], [`timesync`]
//! - service discovery and the controller facade: [`discovery`], [`controller`]
//!
//! [`participant::Participant`] wires all of the above together into the
//! single entry point application code constructs.

pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod lifecycle;
pub mod mesh;
pub mod orchestration;
pub mod participant;
pub mod registry;
pub mod timesync;
pub mod transport;
pub mod wire;

pub use config::{
  CapabilityFlag, CapabilityFlags, ConfigurationBuilder, NetworkBinding, ParticipantConfiguration, SynchronizationMode,
};
pub use error::{Result, SilKitError};
pub use lifecycle::{LifecycleFuture, ParticipantState};
pub use participant::Participant;
