// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Parsing of inbound broker command payloads into session calls.

use crate::protocol::PumpMode;
use displaydoc::Display;
use std::str::FromStr;
use thiserror::Error;

/// A parsed command ready to issue against a session. Numeric values are
/// still unclamped here; the session clamps to the pump's configured bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpCommand {
  Power(bool),
  Feed(bool),
  Flow(u8),
  Frequency(u8),
  Mode(PumpMode),
}

#[derive(Debug, Error, Display, Clone, PartialEq, Eq)]
pub enum CommandParseError {
  /// Unknown entity "{0}"
  UnknownEntity(String),
  /// Invalid payload "{payload}" for entity "{entity}"
  InvalidPayload { entity: String, payload: String },
}

/// Switch payloads are truthy iff the lowercased, stripped text is one of
/// `on`, `true`, `1`. Everything else means off.
fn parse_switch(payload: &str) -> bool {
  matches!(payload.trim().to_lowercase().as_str(), "on" | "true" | "1")
}

/// Float-permissive integer parse ("80", "80.0" and "80.9" all mean 80),
/// saturated into byte range.
fn parse_level(entity: &str, payload: &str) -> Result<u8, CommandParseError> {
  let value = payload.trim().parse::<f64>().map_err(|_| CommandParseError::InvalidPayload {
    entity: entity.to_owned(),
    payload: payload.to_owned(),
  })?;
  if !value.is_finite() {
    return Err(CommandParseError::InvalidPayload {
      entity: entity.to_owned(),
      payload: payload.to_owned(),
    });
  }
  Ok((value as i64).clamp(0, u8::MAX as i64) as u8)
}

pub fn parse_entity_command(entity: &str, payload: &str) -> Result<PumpCommand, CommandParseError> {
  match entity {
    "power" => Ok(PumpCommand::Power(parse_switch(payload))),
    "feed" => Ok(PumpCommand::Feed(parse_switch(payload))),
    "flow" => Ok(PumpCommand::Flow(parse_level(entity, payload)?)),
    "frequency" => Ok(PumpCommand::Frequency(parse_level(entity, payload)?)),
    "mode" => PumpMode::from_str(payload.trim())
      .map(PumpCommand::Mode)
      .map_err(|_| CommandParseError::InvalidPayload {
        entity: entity.to_owned(),
        payload: payload.to_owned(),
      }),
    _ => Err(CommandParseError::UnknownEntity(entity.to_owned())),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use test_case::test_case;

  #[test_case("on", true; "lowercase on")]
  #[test_case("ON", true; "uppercase on")]
  #[test_case(" true ", true; "padded true")]
  #[test_case("1", true; "numeric one")]
  #[test_case("off", false; "off")]
  #[test_case("0", false; "numeric zero")]
  #[test_case("yes", false; "unrecognised text is off")]
  pub fn test_switch_payloads(payload: &str, expected: bool) {
    assert_eq!(
      parse_entity_command("power", payload),
      Ok(PumpCommand::Power(expected))
    );
    assert_eq!(
      parse_entity_command("feed", payload),
      Ok(PumpCommand::Feed(expected))
    );
  }

  #[test_case("80", 80; "integer")]
  #[test_case("80.0", 80; "float")]
  #[test_case("80.9", 80; "float truncates")]
  #[test_case("300", 255; "saturates to byte range")]
  pub fn test_level_payloads(payload: &str, expected: u8) {
    assert_eq!(
      parse_entity_command("flow", payload),
      Ok(PumpCommand::Flow(expected))
    );
    assert_eq!(
      parse_entity_command("frequency", payload),
      Ok(PumpCommand::Frequency(expected))
    );
  }

  #[test]
  pub fn test_bad_level_payload_rejected() {
    assert!(parse_entity_command("flow", "fast").is_err());
    assert!(parse_entity_command("frequency", "").is_err());
  }

  #[test]
  pub fn test_mode_payloads() {
    assert_eq!(
      parse_entity_command("mode", "Sine Wave"),
      Ok(PumpCommand::Mode(PumpMode::SineWave))
    );
    assert_eq!(
      parse_entity_command("mode", "Random"),
      Ok(PumpCommand::Mode(PumpMode::Random))
    );
    assert!(parse_entity_command("mode", "Turbo").is_err());
  }

  #[test]
  pub fn test_unknown_entity() {
    assert_eq!(
      parse_entity_command("colour", "red"),
      Err(CommandParseError::UnknownEntity("colour".to_owned()))
    );
  }
}
