// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Gizwits frame build/parse.
//!
//! Frame layout (big-endian):
//!
//! ```text
//! offset 0 : 00 00 00 03            magic
//! offset 4 : length = 3 + payload   one byte
//! offset 5 : 00                     reserved
//! offset 6 : command                two bytes
//! offset 8 : payload
//! ```

use super::{AttributeReport, ProtocolCommand, P0_LEN};
use crate::core::errors::ProtocolError;
use byteorder::{BigEndian, ByteOrder};

pub const FRAME_MAGIC: [u8; 4] = [0x00, 0x00, 0x00, 0x03];
/// Shortest parseable frame: magic, length, reserved and the command code.
pub const MIN_FRAME_LEN: usize = 8;
/// Inbound control frames below this size carry no attribute report.
pub const CONTROL_REPORT_MIN_LEN: usize = 19;

const HEADER_LEN: usize = 8;
/// Offset of the P0 inside an inbound control frame (header + serial).
const CONTROL_P0_OFFSET: usize = 12;
/// Length-byte values of 253 and up are out of scope for this protocol.
const MAX_PAYLOAD_LEN: usize = 249;

const LOGIN_OK: u8 = 0x00;

/// One protocol frame, command plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  command: ProtocolCommand,
  payload: Vec<u8>,
}

impl Frame {
  pub fn new(command: ProtocolCommand, payload: Vec<u8>) -> Result<Self, ProtocolError> {
    if payload.len() > MAX_PAYLOAD_LEN {
      return Err(ProtocolError::BadLength(payload.len()));
    }
    Ok(Self { command, payload })
  }

  /// The passcode request that opens the authentication handshake.
  pub fn get_passcode() -> Self {
    Self {
      command: ProtocolCommand::GetPasscode,
      payload: Vec::new(),
    }
  }

  /// Login frame echoing the passcode blob verbatim. The blob is opaque and
  /// vendor-defined; never interpret it.
  pub fn login(passcode: &[u8]) -> Result<Self, ProtocolError> {
    Self::new(ProtocolCommand::Login, passcode.to_vec())
  }

  /// Control frame writing one attribute: four-byte big-endian serial number
  /// followed by the P0.
  pub fn control(serial: u32, p0: &[u8; P0_LEN]) -> Self {
    let mut payload = Vec::with_capacity(4 + P0_LEN);
    payload.extend_from_slice(&serial.to_be_bytes());
    payload.extend_from_slice(p0);
    Self {
      command: ProtocolCommand::Control,
      payload,
    }
  }

  pub fn command(&self) -> ProtocolCommand {
    self.command
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut data = Vec::with_capacity(HEADER_LEN + self.payload.len());
    data.extend_from_slice(&FRAME_MAGIC);
    data.push((3 + self.payload.len()) as u8);
    data.push(0x00);
    data.extend_from_slice(&self.command.code().to_be_bytes());
    data.extend_from_slice(&self.payload);
    data
  }

  pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
    if data.len() < MIN_FRAME_LEN {
      return Err(ProtocolError::TooShort(data.len(), MIN_FRAME_LEN));
    }
    let code = BigEndian::read_u16(&data[6..8]);
    let command = ProtocolCommand::from_repr(code).ok_or(ProtocolError::UnknownCommand(code))?;
    Ok(Self {
      command,
      payload: data[8..].to_vec(),
    })
  }
}

/// Typed view of an inbound frame, as far as the session engine cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpNotification {
  /// Opaque passcode blob to echo back in the login frame.
  Passcode { passcode: Vec<u8> },
  /// Login status; zero means authenticated.
  LoginResult { ok: bool, status: u8 },
  /// One attribute value reported by the pump.
  Report(AttributeReport),
  /// Acknowledgement of a control write.
  CommandAck,
}

impl PumpNotification {
  /// Parse an inbound notification. `Ok(None)` means the frame was valid but
  /// carried nothing actionable (empty passcode, truncated report, an echo of
  /// an outbound command).
  pub fn parse(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
    let frame = Frame::decode(data)?;
    let notification = match frame.command() {
      ProtocolCommand::PasscodeResponse if !frame.payload().is_empty() => Some(Self::Passcode {
        passcode: frame.payload().to_vec(),
      }),
      ProtocolCommand::LoginResponse => frame.payload().first().map(|status| Self::LoginResult {
        ok: *status == LOGIN_OK,
        status: *status,
      }),
      ProtocolCommand::Control if data.len() >= CONTROL_REPORT_MIN_LEN => {
        AttributeReport::decode(&data[CONTROL_P0_OFFSET..]).map(Self::Report)
      }
      ProtocolCommand::ControlAck => Some(Self::CommandAck),
      _ => None,
    };
    Ok(notification)
  }
}
