// In-memory participant configuration. Parsing these values out of a YAML
// or JSON file is an external collaborator's job (out of scope, spec.md
// §1); this struct is the shape that parser would produce and is what the
// rest of the crate consumes.

use std::collections::HashMap;

use enumflags2::{bitflags, BitFlags};

use crate::error::{Result, SilKitError};

/// Capabilities a participant advertises in the handshake (spec.md §4.2,
/// §6: `capabilityFlags: u32`). Carried on the wire as a plain `u32`
/// (`CapabilityFlags::bits`); kept typed everywhere above the wire boundary
/// so callers can't pass an arbitrary bit pattern by accident, the same way
/// the teacher keeps submessage flags as `BitFlags<T>` rather than a raw
/// integer (`messages::submessages::gap::Gap::create_submessage`).
#[bitflags]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityFlag {
  /// This participant intends to create a time synchronization service.
  TimeSynchronized = 0b0001,
  /// This participant supports `PrepareColdReinitialize` (spec.md §4.8).
  SupportsReinitialize = 0b0010,
}

pub type CapabilityFlags = BitFlags<CapabilityFlag>;

/// How a participant's time is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizationMode {
  /// The participant does not take part in the time-sync barrier; it may
  /// still send and receive traffic freely.
  Unsynchronized,
  /// The participant declares a step duration and participates in the
  /// distributed barrier of the time synchronization service.
  Synchronized { step_duration_ns: u64 },
}

/// A binding of a controller name to the network it talks on, declared
/// ahead of time so the connection manager and discovery layer can
/// validate uniqueness at construction.
#[derive(Debug, Clone)]
pub struct NetworkBinding {
  pub network_name: String,
  pub service_name: String,
}

#[derive(Debug, Clone)]
pub struct ParticipantConfiguration {
  pub participant_name: String,
  pub registry_uri: String,
  pub is_required: bool,
  pub synchronization: SynchronizationMode,
  pub has_coordinated_simulation_start: bool,
  pub has_coordinated_simulation_stop: bool,
  pub network_bindings: Vec<NetworkBinding>,
  pub capability_flags: CapabilityFlags,
  /// Supplemental key/value attributes carried on every service descriptor
  /// this participant announces (spec.md §3, Service descriptor).
  pub service_attributes: HashMap<String, String>,
}

impl ParticipantConfiguration {
  pub fn builder(participant_name: impl Into<String>) -> ConfigurationBuilder {
    ConfigurationBuilder::new(participant_name)
  }

  pub fn validate(&self) -> Result<()> {
    if self.participant_name.trim().is_empty() {
      return Err(SilKitError::configuration("participant name must not be empty"));
    }
    let mut seen = HashMap::new();
    for binding in &self.network_bindings {
      let key = (binding.network_name.clone(), binding.service_name.clone());
      if seen.insert(key.clone(), ()).is_some() {
        return Err(SilKitError::configuration(format!(
          "duplicate controller '{}' on network '{}'",
          binding.service_name, binding.network_name
        )));
      }
    }
    Ok(())
  }
}

pub struct ConfigurationBuilder {
  participant_name: String,
  registry_uri: String,
  is_required: bool,
  synchronization: SynchronizationMode,
  has_coordinated_simulation_start: bool,
  has_coordinated_simulation_stop: bool,
  network_bindings: Vec<NetworkBinding>,
  capability_flags: CapabilityFlags,
  service_attributes: HashMap<String, String>,
}

impl ConfigurationBuilder {
  pub fn new(participant_name: impl Into<String>) -> Self {
    Self {
      participant_name: participant_name.into(),
      registry_uri: "silkit://localhost:8500".to_owned(),
      is_required: true,
      synchronization: SynchronizationMode::Unsynchronized,
      has_coordinated_simulation_start: true,
      has_coordinated_simulation_stop: true,
      network_bindings: Vec::new(),
      capability_flags: CapabilityFlags::empty(),
      service_attributes: HashMap::new(),
    }
  }

  pub fn capability(mut self, flag: CapabilityFlag) -> Self {
    self.capability_flags |= flag;
    self
  }

  pub fn registry_uri(mut self, uri: impl Into<String>) -> Self {
    self.registry_uri = uri.into();
    self
  }

  pub fn required(mut self, is_required: bool) -> Self {
    self.is_required = is_required;
    self
  }

  pub fn synchronized(mut self, step_duration_ns: u64) -> Self {
    self.synchronization = SynchronizationMode::Synchronized { step_duration_ns };
    self
  }

  pub fn coordinated_start(mut self, enabled: bool) -> Self {
    self.has_coordinated_simulation_start = enabled;
    self
  }

  pub fn coordinated_stop(mut self, enabled: bool) -> Self {
    self.has_coordinated_simulation_stop = enabled;
    self
  }

  pub fn bind_network(mut self, network_name: impl Into<String>, service_name: impl Into<String>) -> Self {
    self.network_bindings.push(NetworkBinding {
      network_name: network_name.into(),
      service_name: service_name.into(),
    });
    self
  }

  pub fn service_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.service_attributes.insert(key.into(), value.into());
    self
  }

  pub fn build(self) -> Result<ParticipantConfiguration> {
    let config = ParticipantConfiguration {
      participant_name: self.participant_name,
      registry_uri: self.registry_uri,
      is_required: self.is_required,
      synchronization: self.synchronization,
      has_coordinated_simulation_start: self.has_coordinated_simulation_start,
      has_coordinated_simulation_stop: self.has_coordinated_simulation_stop,
      network_bindings: self.network_bindings,
      capability_flags: self.capability_flags,
      service_attributes: self.service_attributes,
    };
    config.validate()?;
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_duplicate_controller_on_same_network() {
    let result = ParticipantConfiguration::builder("ECU1")
      .bind_network("PowerTrain1", "CAN1")
      .bind_network("PowerTrain1", "CAN1")
      .build();
    assert!(result.is_err());
  }

  #[test]
  fn rejects_empty_name() {
    let result = ParticipantConfiguration::builder("   ").build();
    assert!(result.is_err());
  }

  #[test]
  fn builds_with_defaults() {
    let config = ParticipantConfiguration::builder("ECU1").build().unwrap();
    assert_eq!(config.synchronization, SynchronizationMode::Unsynchronized);
    assert!(config.capability_flags.is_empty());
  }

  #[test]
  fn capability_flags_accumulate_and_round_trip_through_bits() {
    let config = ParticipantConfiguration::builder("ECU1")
      .capability(CapabilityFlag::TimeSynchronized)
      .capability(CapabilityFlag::SupportsReinitialize)
      .build()
      .unwrap();
    assert!(config.capability_flags.contains(CapabilityFlag::TimeSynchronized));
    let restored = CapabilityFlags::from_bits_truncate(config.capability_flags.bits());
    assert_eq!(restored, config.capability_flags);
  }
}
