// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! YAML configuration: one broker block plus a list of pumps.

use crate::core::errors::BridgeError;
use crate::device::config::PumpConfig;
use getset::{CopyGetters, Getters};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Broker connection block, all fields optional in the file.
#[derive(Debug, Clone, Deserialize, Getters, CopyGetters)]
pub struct MqttSettings {
  #[serde(default = "default_host")]
  #[getset(get = "pub")]
  host: String,
  #[serde(default = "default_port")]
  #[getset(get_copy = "pub")]
  port: u16,
  #[serde(default)]
  #[getset(get = "pub")]
  username: Option<String>,
  #[serde(default)]
  #[getset(get = "pub")]
  password: Option<String>,
  #[serde(default = "default_client_id")]
  #[getset(get = "pub")]
  client_id: String,
  #[serde(default = "default_discovery_prefix")]
  #[getset(get = "pub")]
  discovery_prefix: String,
  #[serde(default = "default_topic_prefix")]
  #[getset(get = "pub")]
  topic_prefix: String,
}

fn default_host() -> String {
  "localhost".to_owned()
}

fn default_port() -> u16 {
  1883
}

fn default_client_id() -> String {
  "jebao_mqtt_bridge".to_owned()
}

fn default_discovery_prefix() -> String {
  "homeassistant".to_owned()
}

fn default_topic_prefix() -> String {
  "jebao".to_owned()
}

impl Default for MqttSettings {
  fn default() -> Self {
    Self {
      host: default_host(),
      port: default_port(),
      username: None,
      password: None,
      client_id: default_client_id(),
      discovery_prefix: default_discovery_prefix(),
      topic_prefix: default_topic_prefix(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeConfig {
  #[serde(default)]
  pub mqtt: MqttSettings,
  #[serde(default)]
  pub pumps: Vec<PumpConfig>,
}

impl BridgeConfig {
  pub fn load(path: &Path) -> Result<Self, BridgeError> {
    let text = fs::read_to_string(path)
      .map_err(|err| BridgeError::ConfigInvalid(format!("{}: {}", path.display(), err)))?;
    Self::parse(&text)
  }

  pub fn parse(text: &str) -> Result<Self, BridgeError> {
    let mut config: BridgeConfig = serde_yaml::from_str(text)
      .map_err(|err| BridgeError::ConfigInvalid(err.to_string()))?;
    let mut seen_ids = HashSet::new();
    for pump in &mut config.pumps {
      pump.finalize();
      pump.validate()?;
      if !seen_ids.insert(pump.id().to_owned()) {
        return Err(BridgeError::ConfigInvalid(format!(
          "duplicate pump id \"{}\"",
          pump.id()
        )));
      }
    }
    Ok(config)
  }
}

/// Starter config written next to the binary when none exists yet.
pub const EXAMPLE_CONFIG: &str = "\
# Jebao MQTT Bridge Configuration

mqtt:
  host: localhost          # MQTT broker host
  port: 1883               # MQTT broker port
  username: null           # Optional: MQTT username
  password: null           # Optional: MQTT password
  discovery_prefix: homeassistant  # HA discovery prefix
  topic_prefix: jebao      # Topic prefix for pump data

pumps:
  - name: \"Wavemaker 1\"    # Friendly name
    mac: \"XX:XX:XX:XX:XX:XX\"  # BLE MAC address
    # Optional overrides:
    # flow_min: 30
    # flow_max: 100
    # frequency_min: 5
    # frequency_max: 20

  # Add more pumps:
  # - name: \"Wavemaker 2\"
  #   mac: \"YY:YY:YY:YY:YY:YY\"
";

pub fn write_example(path: &Path) -> std::io::Result<()> {
  fs::write(path, EXAMPLE_CONFIG)
}
