// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! BLE link layer on top of btleplug.
//!
//! A [`PumpConnector`] produces one connected, subscribed [`PumpLink`] per
//! attempt. The link owns a background task that pumps btleplug value
//! notifications and adapter disconnect events into a broadcast channel;
//! the session consumes that channel and is the only mutator of its state.

use crate::core::errors::PumpDeviceError;
use async_trait::async_trait;
use btleplug::api::{
  BDAddr, Central, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Gizwits primary service advertised by the pumps.
pub const PUMP_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000abf0_0000_1000_8000_00805f9b34fb);
/// The single read/write/notify characteristic everything goes through.
pub const PUMP_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x0000abf7_0000_1000_8000_00805f9b34fb);

/// Substrings (case-insensitive) a pump advertises under.
pub const ADVERTISED_NAME_PATTERNS: [&str; 4] = ["XPG-GAgent", "XPG_GAgent", "Jebao", "Gizwits"];

const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DISCOVERY_POLL_ATTEMPTS: u32 = 20;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// True when an advertisement looks like a Jebao pump, by name pattern or by
/// the Gizwits service UUID.
pub fn is_pump_advertisement(name: &str, services: &[Uuid]) -> bool {
  let lowered = name.to_lowercase();
  ADVERTISED_NAME_PATTERNS
    .iter()
    .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    || services.contains(&PUMP_SERVICE_UUID)
}

/// Events a link delivers to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
  /// Raw frame from the notify characteristic.
  Notification(Vec<u8>),
  /// The GATT link dropped; the link is dead after this.
  Disconnected,
}

/// One open GATT link, already subscribed to the notify characteristic.
#[async_trait]
pub trait PumpLink: Send + Sync {
  fn event_stream(&self) -> broadcast::Receiver<LinkEvent>;
  /// Write without response. Returns once the transport accepts the bytes.
  async fn write(&self, data: &[u8]) -> Result<(), PumpDeviceError>;
  /// Drop the GATT connection, swallowing transport errors.
  async fn close(&self);
}

/// Produces links for one configured pump address.
#[async_trait]
pub trait PumpConnector: Send + Sync {
  async fn open(&self) -> Result<Arc<dyn PumpLink>, PumpDeviceError>;
}

fn ble_error(err: btleplug::Error) -> PumpDeviceError {
  PumpDeviceError::BleTransport(format!("{:?}", err))
}

pub struct BtleplugConnector {
  adapter: Adapter,
  address: BDAddr,
}

impl BtleplugConnector {
  pub fn new(adapter: Adapter, address: BDAddr) -> Self {
    Self { adapter, address }
  }

  /// The pumps do not stay in the adapter cache between runs, so scan until
  /// the configured address shows up.
  async fn find_peripheral(&self) -> Result<Peripheral, PumpDeviceError> {
    if let Err(err) = self.adapter.start_scan(ScanFilter::default()).await {
      warn!("Scan request failed, relying on cached peripherals: {:?}", err);
    }
    let result = async {
      for _ in 0..DISCOVERY_POLL_ATTEMPTS {
        for peripheral in self.adapter.peripherals().await.map_err(ble_error)? {
          if peripheral.address() == self.address {
            return Ok(peripheral);
          }
        }
        sleep(DISCOVERY_POLL_INTERVAL).await;
      }
      Err(PumpDeviceError::BleTransport(format!(
        "device {} not found",
        self.address
      )))
    }
    .await;
    let _ = self.adapter.stop_scan().await;
    result
  }
}

#[async_trait]
impl PumpConnector for BtleplugConnector {
  async fn open(&self) -> Result<Arc<dyn PumpLink>, PumpDeviceError> {
    let peripheral = self.find_peripheral().await?;
    if !peripheral.is_connected().await.map_err(ble_error)? {
      timeout(CONNECT_TIMEOUT, peripheral.connect())
        .await
        .map_err(|_| PumpDeviceError::BleTransport(format!("connect to {} timed out", self.address)))?
        .map_err(ble_error)?;
      peripheral.discover_services().await.map_err(ble_error)?;
    }

    let characteristic = peripheral
      .services()
      .iter()
      .find(|service| service.uuid == PUMP_SERVICE_UUID)
      .and_then(|service| {
        service
          .characteristics
          .iter()
          .find(|characteristic| characteristic.uuid == PUMP_CHARACTERISTIC_UUID)
          .cloned()
      })
      .ok_or_else(|| {
        PumpDeviceError::BleTransport(format!(
          "device {} does not expose the Gizwits characteristic",
          self.address
        ))
      })?;

    peripheral.subscribe(&characteristic).await.map_err(ble_error)?;

    let notifications = peripheral.notifications().await.map_err(ble_error)?;
    let adapter_events = self.adapter.events().await.map_err(ble_error)?;
    Ok(Arc::new(BtleplugLink::new(
      peripheral,
      characteristic,
      notifications,
      adapter_events,
    )))
  }
}

pub struct BtleplugLink {
  peripheral: Peripheral,
  characteristic: Characteristic,
  events: broadcast::Sender<LinkEvent>,
}

impl BtleplugLink {
  fn new(
    peripheral: Peripheral,
    characteristic: Characteristic,
    mut notifications: std::pin::Pin<
      Box<dyn futures::Stream<Item = btleplug::api::ValueNotification> + Send>,
    >,
    mut adapter_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
  ) -> Self {
    let (events, _) = broadcast::channel(256);
    let sender = events.clone();
    let peripheral_id = peripheral.id();
    tokio::spawn(async move {
      loop {
        tokio::select! {
          notification = notifications.next() => {
            match notification {
              Some(notification) if notification.uuid == PUMP_CHARACTERISTIC_UUID => {
                if sender.receiver_count() > 0 {
                  let _ = sender.send(LinkEvent::Notification(notification.value));
                }
              }
              Some(_) => {}
              None => break,
            }
          }
          event = adapter_events.next() => {
            match event {
              Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                let _ = sender.send(LinkEvent::Disconnected);
                break;
              }
              Some(_) => {}
              None => break,
            }
          }
        }
      }
      debug!("Exiting link event loop for {:?}", peripheral_id);
    });
    Self {
      peripheral,
      characteristic,
      events,
    }
  }
}

#[async_trait]
impl PumpLink for BtleplugLink {
  fn event_stream(&self) -> broadcast::Receiver<LinkEvent> {
    self.events.subscribe()
  }

  async fn write(&self, data: &[u8]) -> Result<(), PumpDeviceError> {
    self
      .peripheral
      .write(&self.characteristic, data, WriteType::WithoutResponse)
      .await
      .map_err(ble_error)
  }

  async fn close(&self) {
    if let Err(err) = self.peripheral.disconnect().await {
      debug!("Error disconnecting {:?}: {:?}", self.peripheral.id(), err);
    }
  }
}
