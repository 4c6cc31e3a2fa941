// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Home Assistant MQTT discovery documents.
//!
//! One retained config document per entity under
//! `{discovery_prefix}/{component}/jebao_{pump_id}/{entity}/config`. The
//! number entities get a parallel sensor entity so Home Assistant records
//! long-term statistics for them.

use super::topics::{command_topic, state_topic};
use crate::device::config::PumpConfig;
use crate::protocol::PumpMode;
use serde_json::{json, Value};
use strum::IntoEnumIterator;

pub fn discovery_topic(discovery_prefix: &str, component: &str, pump_id: &str, entity: &str) -> String {
  format!(
    "{}/{}/jebao_{}/{}/config",
    discovery_prefix, component, pump_id, entity
  )
}

/// Render all discovery documents for one pump as `(topic, body)` pairs.
pub fn discovery_documents(
  discovery_prefix: &str,
  topic_prefix: &str,
  config: &PumpConfig,
) -> Vec<(String, Value)> {
  let pump_id = config.id();
  let device_info = json!({
    "identifiers": [format!("jebao_{}", pump_id)],
    "name": config.display_name(),
    "manufacturer": "Jebao",
    "model": "DMP-65",
  });
  let entity = |component: &str, entity: &str, body: Value| {
    (discovery_topic(discovery_prefix, component, pump_id, entity), body)
  };

  vec![
    entity(
      "switch",
      "power",
      json!({
        "name": "Power",
        "command_topic": command_topic(topic_prefix, pump_id, "power"),
        "state_topic": state_topic(topic_prefix, pump_id, "power"),
        "payload_on": "ON",
        "payload_off": "OFF",
        "icon": "mdi:power",
        "device": device_info,
        "unique_id": format!("jebao_{}_power", pump_id),
      }),
    ),
    entity(
      "switch",
      "feed",
      json!({
        "name": "Feed Mode",
        "command_topic": command_topic(topic_prefix, pump_id, "feed"),
        "state_topic": state_topic(topic_prefix, pump_id, "feed"),
        "payload_on": "ON",
        "payload_off": "OFF",
        "icon": "mdi:fish",
        "device": device_info,
        "unique_id": format!("jebao_{}_feed", pump_id),
      }),
    ),
    entity(
      "number",
      "flow",
      json!({
        "name": "Flow",
        "command_topic": command_topic(topic_prefix, pump_id, "flow"),
        "state_topic": state_topic(topic_prefix, pump_id, "flow"),
        "min": config.flow_min(),
        "max": config.flow_max(),
        "step": 1,
        "unit_of_measurement": "%",
        "icon": "mdi:waves",
        "device": device_info,
        "unique_id": format!("jebao_{}_flow", pump_id),
      }),
    ),
    entity(
      "sensor",
      "flow_sensor",
      json!({
        "name": "Flow Level",
        "state_topic": state_topic(topic_prefix, pump_id, "flow"),
        "unit_of_measurement": "%",
        "icon": "mdi:waves",
        "device": device_info,
        "unique_id": format!("jebao_{}_flow_sensor", pump_id),
        "state_class": "measurement",
      }),
    ),
    entity(
      "number",
      "frequency",
      json!({
        "name": "Frequency",
        "command_topic": command_topic(topic_prefix, pump_id, "frequency"),
        "state_topic": state_topic(topic_prefix, pump_id, "frequency"),
        "min": config.frequency_min(),
        "max": config.frequency_max(),
        "step": 1,
        "unit_of_measurement": "s",
        "icon": "mdi:timer",
        "device": device_info,
        "unique_id": format!("jebao_{}_frequency", pump_id),
      }),
    ),
    entity(
      "sensor",
      "frequency_sensor",
      json!({
        "name": "Frequency Level",
        "state_topic": state_topic(topic_prefix, pump_id, "frequency"),
        "unit_of_measurement": "s",
        "icon": "mdi:timer",
        "device": device_info,
        "unique_id": format!("jebao_{}_frequency_sensor", pump_id),
        "state_class": "measurement",
      }),
    ),
    entity(
      "sensor",
      "runtime",
      json!({
        "name": "Runtime Today",
        "state_topic": state_topic(topic_prefix, pump_id, "runtime"),
        "unit_of_measurement": "h",
        "icon": "mdi:timer-outline",
        "device": device_info,
        "unique_id": format!("jebao_{}_runtime", pump_id),
        "state_class": "total_increasing",
      }),
    ),
    entity(
      "select",
      "mode",
      json!({
        "name": "Mode",
        "command_topic": command_topic(topic_prefix, pump_id, "mode"),
        "state_topic": state_topic(topic_prefix, pump_id, "mode"),
        "options": PumpMode::iter().map(|mode| mode.to_string()).collect::<Vec<_>>(),
        "icon": "mdi:waves-arrow-right",
        "device": device_info,
        "unique_id": format!("jebao_{}_mode", pump_id),
      }),
    ),
    entity(
      "binary_sensor",
      "connected",
      json!({
        "name": "Connected",
        "state_topic": state_topic(topic_prefix, pump_id, "connected"),
        "payload_on": "ON",
        "payload_off": "OFF",
        "device_class": "connectivity",
        "device": device_info,
        "unique_id": format!("jebao_{}_connected", pump_id),
      }),
    ),
  ]
}

#[cfg(test)]
mod test {
  use super::*;

  fn documents() -> Vec<(String, Value)> {
    let config = PumpConfig::new("Test Pump", "AA:BB:CC:DD:EE:FF");
    discovery_documents("homeassistant", "jebao", &config)
  }

  fn find(documents: &[(String, Value)], suffix: &str) -> Value {
    documents
      .iter()
      .find(|(topic, _)| topic.ends_with(suffix))
      .map(|(_, body)| body.clone())
      .unwrap_or_else(|| panic!("no discovery document for {}", suffix))
  }

  #[test]
  pub fn test_power_switch_document() {
    let documents = documents();
    let power = find(&documents, "switch/jebao_test_pump/power/config");
    assert_eq!(power["name"], "Power");
    assert_eq!(power["command_topic"], "jebao/test_pump/power/set");
    assert_eq!(power["device"]["manufacturer"], "Jebao");
  }

  #[test]
  pub fn test_flow_sensor_records_statistics() {
    let documents = documents();
    let sensor = find(&documents, "sensor/jebao_test_pump/flow_sensor/config");
    assert_eq!(sensor["state_class"], "measurement");
    assert_eq!(sensor["state_topic"], "jebao/test_pump/flow/state");
  }

  #[test]
  pub fn test_number_bounds_follow_config() {
    let documents = documents();
    let flow = find(&documents, "number/jebao_test_pump/flow/config");
    assert_eq!(flow["min"], 30);
    assert_eq!(flow["max"], 100);
  }

  #[test]
  pub fn test_mode_select_options() {
    let documents = documents();
    let mode = find(&documents, "select/jebao_test_pump/mode/config");
    let options: Vec<String> = mode["options"]
      .as_array()
      .expect("options array")
      .iter()
      .map(|option| option.as_str().expect("string option").to_owned())
      .collect();
    assert_eq!(
      options,
      vec!["Classic Wave", "Cross-flow", "Sine Wave", "Random", "Constant"]
    );
  }

  #[test]
  pub fn test_connected_binary_sensor() {
    let documents = documents();
    let connected = find(&documents, "binary_sensor/jebao_test_pump/connected/config");
    assert_eq!(connected["device_class"], "connectivity");
  }

  #[test]
  pub fn test_every_document_is_device_scoped() {
    for (_, body) in documents() {
      assert_eq!(body["device"]["identifiers"][0], "jebao_test_pump");
      assert!(body["unique_id"].as_str().expect("unique_id").starts_with("jebao_test_pump"));
    }
  }
}
