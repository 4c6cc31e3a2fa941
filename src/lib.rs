// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! BLE to MQTT bridge for Jebao DMP series aquarium wave pumps.
//!
//! The pumps speak the Gizwits framed binary protocol over a single GATT
//! characteristic. This crate reverse-engineers that protocol (see
//! [`protocol`]), runs one authenticated session per pump (see [`device`]),
//! supervises all sessions over a shared Bluetooth adapter (see [`bridge`])
//! and mirrors pump state to an MQTT broker using the Home Assistant
//! auto-discovery convention (see [`mqtt`]).

#[macro_use]
extern crate tracing;

pub mod bridge;
pub mod config;
pub mod core;
pub mod device;
pub mod mqtt;
pub mod protocol;
