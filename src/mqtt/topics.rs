// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Topic layout and the pure rendering of retained state publishes.

use crate::device::config::PumpConfig;
use crate::device::state::PumpSnapshot;
use crate::protocol::PumpMode;

/// Entities that accept commands over `{prefix}/{pump_id}/{entity}/set`.
pub const COMMAND_ENTITIES: [&str; 5] = ["power", "feed", "flow", "frequency", "mode"];

pub fn command_topic(prefix: &str, pump_id: &str, entity: &str) -> String {
  format!("{}/{}/{}/set", prefix, pump_id, entity)
}

pub fn state_topic(prefix: &str, pump_id: &str, entity: &str) -> String {
  format!("{}/{}/{}/state", prefix, pump_id, entity)
}

/// Split a command topic back into `(pump_id, entity)`.
pub fn parse_command_topic(prefix: &str, topic: &str) -> Option<(String, String)> {
  let parts: Vec<&str> = topic.split('/').collect();
  if parts.len() != 4 || parts[0] != prefix || parts[3] != "set" {
    return None;
  }
  Some((parts[1].to_owned(), parts[2].to_owned()))
}

fn on_off(value: bool) -> String {
  if value { "ON" } else { "OFF" }.to_owned()
}

/// Render every retained state publish for one pump. Connectivity always
/// goes out; everything else is suppressed until the session has seen a
/// pump-originated update, so synthesized defaults never leak to the broker.
pub fn render_state(prefix: &str, config: &PumpConfig, snapshot: &PumpSnapshot) -> Vec<(String, String)> {
  let pump_id = config.id();
  let mut publishes = vec![(state_topic(prefix, pump_id, "connected"), on_off(snapshot.link_up))];
  if !snapshot.state_seen {
    return publishes;
  }
  publishes.push((state_topic(prefix, pump_id, "power"), on_off(snapshot.power)));
  publishes.push((state_topic(prefix, pump_id, "feed"), on_off(snapshot.feed)));
  publishes.push((
    state_topic(prefix, pump_id, "flow"),
    snapshot.flow_percent.to_string(),
  ));
  publishes.push((
    state_topic(prefix, pump_id, "frequency"),
    snapshot.frequency_seconds.to_string(),
  ));
  publishes.push((
    state_topic(prefix, pump_id, "mode"),
    PumpMode::name_of(snapshot.mode).to_owned(),
  ));
  publishes.push((
    state_topic(prefix, pump_id, "runtime"),
    format!("{:.2}", snapshot.runtime_today_hours),
  ));
  publishes
}

#[cfg(test)]
mod test {
  use super::*;

  fn snapshot() -> PumpSnapshot {
    PumpSnapshot {
      power: true,
      feed: false,
      mode: 4,
      flow_percent: 75,
      frequency_seconds: 12,
      link_up: true,
      state_seen: true,
      runtime_today_hours: 5.6789,
    }
  }

  #[test]
  pub fn test_topic_shapes() {
    assert_eq!(command_topic("jebao", "tank", "power"), "jebao/tank/power/set");
    assert_eq!(state_topic("jebao", "tank", "mode"), "jebao/tank/mode/state");
  }

  #[test]
  pub fn test_parse_command_topic() {
    assert_eq!(
      parse_command_topic("jebao", "jebao/tank/flow/set"),
      Some(("tank".to_owned(), "flow".to_owned()))
    );
    assert_eq!(parse_command_topic("jebao", "jebao/tank/flow/state"), None);
    assert_eq!(parse_command_topic("jebao", "other/tank/flow/set"), None);
    assert_eq!(parse_command_topic("jebao", "jebao/flow/set"), None);
  }

  #[test]
  pub fn test_render_full_state() {
    let config = PumpConfig::new("Tank", "AA:BB:CC:DD:EE:FF");
    let rendered = render_state("jebao", &config, &snapshot());
    let lookup = |entity: &str| {
      rendered
        .iter()
        .find(|(topic, _)| topic == &state_topic("jebao", "tank", entity))
        .map(|(_, payload)| payload.as_str())
    };
    assert_eq!(lookup("connected"), Some("ON"));
    assert_eq!(lookup("power"), Some("ON"));
    assert_eq!(lookup("feed"), Some("OFF"));
    assert_eq!(lookup("flow"), Some("75"));
    assert_eq!(lookup("frequency"), Some("12"));
    assert_eq!(lookup("mode"), Some("Random"));
    assert_eq!(lookup("runtime"), Some("5.68"));
  }

  #[test]
  pub fn test_unknown_mode_renders_unknown() {
    let config = PumpConfig::new("Tank", "AA:BB:CC:DD:EE:FF");
    let mut snapshot = snapshot();
    snapshot.mode = 3;
    let rendered = render_state("jebao", &config, &snapshot);
    assert!(rendered.contains(&(state_topic("jebao", "tank", "mode"), "Unknown".to_owned())));
  }

  #[test]
  pub fn test_only_connectivity_before_state_seen() {
    let config = PumpConfig::new("Tank", "AA:BB:CC:DD:EE:FF");
    let mut snapshot = snapshot();
    snapshot.state_seen = false;
    snapshot.link_up = false;
    let rendered = render_state("jebao", &config, &snapshot);
    assert_eq!(
      rendered,
      vec![(state_topic("jebao", "tank", "connected"), "OFF".to_owned())]
    );
  }
}
