// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use crate::core::errors::BridgeError;
use getset::{CopyGetters, Getters};
use serde::Deserialize;

pub const DEFAULT_FLOW_MIN: u8 = 30;
pub const DEFAULT_FLOW_MAX: u8 = 100;
pub const DEFAULT_FREQUENCY_MIN: u8 = 5;
pub const DEFAULT_FREQUENCY_MAX: u8 = 20;

/// Configuration for a single pump, immutable after load.
#[derive(Debug, Clone, Deserialize, Getters, CopyGetters)]
pub struct PumpConfig {
  /// Human label, also the source of the derived id.
  #[serde(rename = "name")]
  #[getset(get = "pub")]
  display_name: String,
  /// BLE device address in canonical `AA:BB:CC:DD:EE:FF` form.
  #[getset(get = "pub")]
  mac: String,
  /// Stable topic slug. Derived from the name when left empty.
  #[serde(default)]
  id: String,
  #[serde(default = "default_flow_min")]
  #[getset(get_copy = "pub")]
  flow_min: u8,
  #[serde(default = "default_flow_max")]
  #[getset(get_copy = "pub")]
  flow_max: u8,
  #[serde(default = "default_frequency_min")]
  #[getset(get_copy = "pub")]
  frequency_min: u8,
  #[serde(default = "default_frequency_max")]
  #[getset(get_copy = "pub")]
  frequency_max: u8,
}

fn default_flow_min() -> u8 {
  DEFAULT_FLOW_MIN
}

fn default_flow_max() -> u8 {
  DEFAULT_FLOW_MAX
}

fn default_frequency_min() -> u8 {
  DEFAULT_FREQUENCY_MIN
}

fn default_frequency_max() -> u8 {
  DEFAULT_FREQUENCY_MAX
}

/// Slug used in topics: lowercase, spaces and hyphens become underscores.
pub fn slug_from_name(name: &str) -> String {
  name.to_lowercase().replace([' ', '-'], "_")
}

impl PumpConfig {
  pub fn new(display_name: &str, mac: &str) -> Self {
    let mut config = Self {
      display_name: display_name.to_owned(),
      mac: mac.to_owned(),
      id: String::new(),
      flow_min: DEFAULT_FLOW_MIN,
      flow_max: DEFAULT_FLOW_MAX,
      frequency_min: DEFAULT_FREQUENCY_MIN,
      frequency_max: DEFAULT_FREQUENCY_MAX,
    };
    config.finalize();
    config
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Fill in the derived id when the config did not set one explicitly.
  pub(crate) fn finalize(&mut self) {
    if self.id.is_empty() {
      self.id = slug_from_name(&self.display_name);
    }
  }

  pub fn validate(&self) -> Result<(), BridgeError> {
    if self.display_name.is_empty() {
      return Err(BridgeError::ConfigInvalid("pump name must not be empty".to_owned()));
    }
    if self.mac.is_empty() {
      return Err(BridgeError::ConfigInvalid(format!(
        "pump \"{}\" has no mac address",
        self.display_name
      )));
    }
    if self.flow_min > self.flow_max || self.flow_max > 100 {
      return Err(BridgeError::ConfigInvalid(format!(
        "pump \"{}\" flow bounds {}..{} are invalid",
        self.display_name, self.flow_min, self.flow_max
      )));
    }
    if self.frequency_min > self.frequency_max {
      return Err(BridgeError::ConfigInvalid(format!(
        "pump \"{}\" frequency bounds {}..{} are invalid",
        self.display_name, self.frequency_min, self.frequency_max
      )));
    }
    Ok(())
  }

  pub fn clamp_flow(&self, percent: u8) -> u8 {
    percent.clamp(self.flow_min, self.flow_max)
  }

  pub fn clamp_frequency(&self, seconds: u8) -> u8 {
    seconds.clamp(self.frequency_min, self.frequency_max)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  pub fn test_auto_id_generation() {
    assert_eq!(PumpConfig::new("Wavemaker 1", "AA:BB:CC:DD:EE:FF").id(), "wavemaker_1");
    assert_eq!(
      PumpConfig::new("Left-Side Pump", "AA:BB:CC:DD:EE:FF").id(),
      "left_side_pump"
    );
  }

  #[test]
  pub fn test_explicit_id_kept() {
    let mut config = PumpConfig::new("Wavemaker 1", "AA:BB:CC:DD:EE:FF");
    config.id = "custom".to_owned();
    config.finalize();
    assert_eq!(config.id(), "custom");
  }

  #[test]
  pub fn test_default_limits() {
    let config = PumpConfig::new("Test", "AA:BB:CC:DD:EE:FF");
    assert_eq!(config.flow_min(), 30);
    assert_eq!(config.flow_max(), 100);
    assert_eq!(config.frequency_min(), 5);
    assert_eq!(config.frequency_max(), 20);
    assert!(config.validate().is_ok());
  }

  #[test]
  pub fn test_clamping() {
    let config = PumpConfig::new("Test", "AA:BB:CC:DD:EE:FF");
    assert_eq!(config.clamp_flow(10), 30);
    assert_eq!(config.clamp_flow(150), 100);
    assert_eq!(config.clamp_flow(55), 55);
    assert_eq!(config.clamp_frequency(1), 5);
    assert_eq!(config.clamp_frequency(60), 20);
  }

  #[test]
  pub fn test_invalid_bounds_rejected() {
    let mut config = PumpConfig::new("Test", "AA:BB:CC:DD:EE:FF");
    config.flow_min = 80;
    config.flow_max = 40;
    assert!(config.validate().is_err());

    let mut config = PumpConfig::new("Test", "AA:BB:CC:DD:EE:FF");
    config.flow_max = 120;
    assert!(config.validate().is_err());
  }
}
