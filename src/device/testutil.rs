// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! In-memory stand-ins for the BLE layer, used by session and bridge tests.

use crate::core::errors::PumpDeviceError;
use crate::device::hardware::{LinkEvent, PumpConnector, PumpLink};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// A fake GATT link. Tests inject inbound frames with [`MockLink::notify`]
/// and inspect outbound writes with [`MockLink::writes`].
pub(crate) struct MockLink {
  events: broadcast::Sender<LinkEvent>,
  writes: Mutex<Vec<Vec<u8>>>,
  write_failure: AtomicBool,
}

impl MockLink {
  pub fn new() -> Arc<Self> {
    let (events, _) = broadcast::channel(64);
    Arc::new(Self {
      events,
      writes: Mutex::new(Vec::new()),
      write_failure: AtomicBool::new(false),
    })
  }

  pub fn notify(&self, data: &[u8]) {
    let _ = self.events.send(LinkEvent::Notification(data.to_vec()));
  }

  /// Simulate a spontaneous GATT drop.
  pub fn drop_link(&self) {
    let _ = self.events.send(LinkEvent::Disconnected);
  }

  pub fn fail_writes(&self, fail: bool) {
    self.write_failure.store(fail, Ordering::SeqCst);
  }

  pub fn writes(&self) -> Vec<Vec<u8>> {
    self.writes.lock().expect("writes mutex poisoned").clone()
  }

  /// Wait until at least `count` writes were accepted; returns the last one.
  pub async fn wait_for_write(&self, count: usize) -> Vec<u8> {
    loop {
      {
        let writes = self.writes.lock().expect("writes mutex poisoned");
        if writes.len() >= count {
          return writes[count - 1].clone();
        }
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
  }
}

#[async_trait]
impl PumpLink for MockLink {
  fn event_stream(&self) -> broadcast::Receiver<LinkEvent> {
    self.events.subscribe()
  }

  async fn write(&self, data: &[u8]) -> Result<(), PumpDeviceError> {
    if self.write_failure.load(Ordering::SeqCst) {
      return Err(PumpDeviceError::BleTransport("injected write failure".to_owned()));
    }
    self
      .writes
      .lock()
      .expect("writes mutex poisoned")
      .push(data.to_vec());
    Ok(())
  }

  async fn close(&self) {
    let _ = self.events.send(LinkEvent::Disconnected);
  }
}

/// Hands out the same [`MockLink`] on every attempt, or fails when told to.
pub(crate) struct MockConnector {
  link: Arc<MockLink>,
  connect_failure: AtomicBool,
}

impl MockConnector {
  pub fn new(link: Arc<MockLink>) -> Self {
    Self {
      link,
      connect_failure: AtomicBool::new(false),
    }
  }

  #[allow(dead_code)]
  pub fn fail_connects(&self, fail: bool) {
    self.connect_failure.store(fail, Ordering::SeqCst);
  }
}

#[async_trait]
impl PumpConnector for MockConnector {
  async fn open(&self) -> Result<Arc<dyn PumpLink>, PumpDeviceError> {
    if self.connect_failure.load(Ordering::SeqCst) {
      return Err(PumpDeviceError::BleTransport("injected connect failure".to_owned()));
    }
    Ok(self.link.clone())
  }
}
