// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Error enums for the codec, the per-pump sessions and the bridge process.
//!
//! No error crosses session boundaries: one pump failing never affects
//! another. The only fatal error is an invalid configuration.

use displaydoc::Display;
use thiserror::Error;

/// Structural errors from the Gizwits frame codec. The codec never performs
/// I/O; a malformed inbound frame is logged at debug level and dropped.
#[derive(Debug, Error, Display, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
  /// Frame too short: got {0} bytes, need at least {1}
  TooShort(usize, usize),
  /// Unknown protocol command 0x{0:04x}
  UnknownCommand(u16),
  /// Payload of {0} bytes does not fit the one-byte frame length field
  BadLength(usize),
}

/// Errors raised on the BLE side of a pump session.
#[derive(Debug, Error, Display, Clone)]
pub enum PumpDeviceError {
  /// BLE transport error: {0}
  BleTransport(String),
  /// Authentication handshake timed out
  AuthTimeout,
  /// Pump is not connected
  NotConnected,
}

/// Process-level errors. `ConfigInvalid` and `BrokerConnect` terminate the
/// process with exit code 1; everything else is handled in place.
#[derive(Debug, Error, Display)]
pub enum BridgeError {
  /// Invalid configuration: {0}
  ConfigInvalid(String),
  /// MQTT broker connection failed: {0}
  BrokerConnect(String),
  /// No usable Bluetooth adapter: {0}
  BleUnavailable(String),
}
