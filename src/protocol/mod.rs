// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Pure codec for the Gizwits BLE protocol spoken by Jebao DMP pumps.
//!
//! Everything here was reverse engineered from the vendor's Android app.
//! The module holds no state and performs no I/O: frames go in and out as
//! byte vectors, attribute writes are encoded into the 11-byte "P0" payload
//! carried by control frames.

mod frame;

pub use frame::{Frame, PumpNotification, CONTROL_REPORT_MIN_LEN, MIN_FRAME_LEN};

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Command codes carried big-endian at frame offset 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum ProtocolCommand {
  GetPasscode = 0x0006,
  PasscodeResponse = 0x0007,
  Login = 0x0008,
  LoginResponse = 0x0009,
  Control = 0x0093,
  ControlAck = 0x0094,
}

impl ProtocolCommand {
  pub fn code(&self) -> u16 {
    *self as u16
  }
}

/// The five attributes a DMP pump exposes, addressed on the wire by a
/// `(type, attr_hi, attr_lo)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum PumpAttribute {
  Power,
  Feed,
  Mode,
  Flow,
  Frequency,
}

impl PumpAttribute {
  pub const fn triple(&self) -> (u8, u8, u8) {
    match self {
      PumpAttribute::Power => (0x00, 0x00, 0x01),
      PumpAttribute::Feed => (0x00, 0x00, 0x04),
      PumpAttribute::Mode => (0x00, 0x10, 0x02),
      PumpAttribute::Flow => (0x00, 0x80, 0x00),
      PumpAttribute::Frequency => (0x01, 0x00, 0x00),
    }
  }

  pub fn from_triple(triple: (u8, u8, u8)) -> Option<Self> {
    Self::iter().find(|attribute| attribute.triple() == triple)
  }
}

/// Wave modes, keyed by the code the pump reports. The code space is
/// deliberately non-contiguous: 3 and 5 do not exist on the controller.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter, FromRepr, IntoStaticStr,
)]
#[repr(u8)]
pub enum PumpMode {
  #[strum(serialize = "Classic Wave")]
  ClassicWave = 0,
  #[strum(serialize = "Cross-flow")]
  CrossFlow = 1,
  #[strum(serialize = "Sine Wave")]
  SineWave = 2,
  #[strum(serialize = "Random")]
  Random = 4,
  #[strum(serialize = "Constant")]
  Constant = 6,
}

impl PumpMode {
  pub fn code(&self) -> u8 {
    *self as u8
  }

  pub fn from_code(code: u8) -> Option<Self> {
    Self::from_repr(code)
  }

  /// Display name for a raw mode code. Codes the controller never uses are
  /// kept in state but shown as `"Unknown"`.
  pub fn name_of(code: u8) -> &'static str {
    Self::from_repr(code).map(Into::into).unwrap_or("Unknown")
  }
}

/// First byte of a P0 payload that writes an attribute.
pub const WRITE_ACTION: u8 = 0x11;
/// Size of the attribute read/write payload embedded in control frames.
pub const P0_LEN: usize = 11;

/// Encode the 11-byte P0 payload for writing one attribute value.
pub fn encode_attribute_write(attribute: PumpAttribute, value: u8) -> [u8; P0_LEN] {
  let (type_byte, attr_hi, attr_lo) = attribute.triple();
  let mut p0 = [0u8; P0_LEN];
  p0[0] = WRITE_ACTION;
  p0[7] = type_byte;
  p0[8] = attr_hi;
  p0[9] = attr_lo;
  p0[10] = value;
  p0
}

/// One attribute value reported by the pump inside a control notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeReport {
  pub type_byte: u8,
  pub attr_hi: u8,
  pub attr_lo: u8,
  pub value: u8,
}

impl AttributeReport {
  /// Decode a P0 slice. Reports shorter than the full 11 bytes are dropped
  /// by returning `None`; the pump is the source of truth and occasionally
  /// pads frames oddly.
  pub fn decode(p0: &[u8]) -> Option<Self> {
    if p0.len() < P0_LEN {
      return None;
    }
    Some(Self {
      type_byte: p0[7],
      attr_hi: p0[8],
      attr_lo: p0[9],
      value: p0[10],
    })
  }

  pub fn attribute(&self) -> Option<PumpAttribute> {
    PumpAttribute::from_triple((self.type_byte, self.attr_hi, self.attr_lo))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  pub fn test_mode_name_code_bijection() {
    use std::str::FromStr;
    for mode in PumpMode::iter() {
      let name: &'static str = mode.into();
      assert_eq!(PumpMode::from_str(name).expect("known name"), mode);
      assert_eq!(PumpMode::from_code(mode.code()), Some(mode));
    }
  }

  #[test]
  pub fn test_mode_code_gaps_are_invalid() {
    assert_eq!(PumpMode::from_code(3), None);
    assert_eq!(PumpMode::from_code(5), None);
    assert_eq!(PumpMode::from_code(7), None);
    assert_eq!(PumpMode::name_of(3), "Unknown");
    assert_eq!(PumpMode::name_of(4), "Random");
  }

  #[test]
  pub fn test_attribute_triple_round_trip() {
    for attribute in PumpAttribute::iter() {
      assert_eq!(PumpAttribute::from_triple(attribute.triple()), Some(attribute));
    }
    assert_eq!(PumpAttribute::from_triple((0x02, 0x00, 0x00)), None);
  }

  #[test]
  pub fn test_encode_attribute_write_layout() {
    let p0 = encode_attribute_write(PumpAttribute::Power, 1);
    assert_eq!(p0.len(), P0_LEN);
    assert_eq!(p0[0], WRITE_ACTION);
    assert_eq!(&p0[1..7], &[0; 6]);
    assert_eq!(&p0[7..], &[0x00, 0x00, 0x01, 0x01]);

    let p0 = encode_attribute_write(PumpAttribute::Flow, 75);
    assert_eq!(&p0[7..], &[0x00, 0x80, 0x00, 75]);
  }

  #[test]
  pub fn test_attribute_report_decode() {
    let p0 = encode_attribute_write(PumpAttribute::Mode, 4);
    let report = AttributeReport::decode(&p0).expect("full P0");
    assert_eq!(report.attribute(), Some(PumpAttribute::Mode));
    assert_eq!(report.value, 4);
    assert_eq!(AttributeReport::decode(&p0[..10]), None);
  }
}
