// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Supervisor over every pump session: staggers their use of the shared
//! Bluetooth adapter, routes broker commands to the right session, fans
//! state-change events out to the broker adapter and republishes state on a
//! timer. Holds no state content of its own.

mod command;

pub use command::{parse_entity_command, CommandParseError, PumpCommand};

use crate::core::errors::BridgeError;
use crate::device::config::PumpConfig;
use crate::device::hardware::BtleplugConnector;
use crate::device::session::PumpSession;
use crate::device::PumpEvent;
use crate::mqtt::{BrokerAdapter, BrokerEvent};
use btleplug::api::BDAddr;
use btleplug::platform::Adapter;
use dashmap::DashMap;
use futures::future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Gap between initial connect kick-offs, so pumps do not fight over the
/// single radio.
const STARTUP_STAGGER: Duration = Duration::from_secs(2);
/// Retained state is re-published this often for linked pumps, which keeps
/// broker-side history graphs alive between device-driven changes.
const REPUBLISH_INTERVAL: Duration = Duration::from_secs(60);

/// Build one session per configured pump, in configuration order, each with
/// its ordinal for reconnect staggering.
pub fn build_sessions(
  configs: Vec<PumpConfig>,
  ble_adapter: &Adapter,
  events: mpsc::Sender<PumpEvent>,
) -> Result<Vec<Arc<PumpSession>>, BridgeError> {
  let mut sessions = Vec::with_capacity(configs.len());
  for (pump_index, config) in configs.into_iter().enumerate() {
    let address = BDAddr::from_str(config.mac()).map_err(|err| {
      BridgeError::ConfigInvalid(format!(
        "pump \"{}\" mac {}: {}",
        config.display_name(),
        config.mac(),
        err
      ))
    })?;
    let config = Arc::new(config);
    let connector = Arc::new(BtleplugConnector::new(ble_adapter.clone(), address));
    info!("Configured pump: {} ({})", config.display_name(), config.mac());
    sessions.push(PumpSession::new(config, pump_index, connector, events.clone()));
  }
  Ok(sessions)
}

pub struct PumpSupervisor {
  sessions: Vec<Arc<PumpSession>>,
  by_id: DashMap<String, Arc<PumpSession>>,
  adapter: Arc<dyn BrokerAdapter>,
  pump_events: mpsc::Receiver<PumpEvent>,
  broker_events: mpsc::Receiver<BrokerEvent>,
}

impl PumpSupervisor {
  pub fn new(
    sessions: Vec<Arc<PumpSession>>,
    adapter: Arc<dyn BrokerAdapter>,
    pump_events: mpsc::Receiver<PumpEvent>,
    broker_events: mpsc::Receiver<BrokerEvent>,
  ) -> Self {
    let by_id = DashMap::new();
    for session in &sessions {
      by_id.insert(session.config().id().to_owned(), session.clone());
    }
    Self {
      sessions,
      by_id,
      adapter,
      pump_events,
      broker_events,
    }
  }

  /// Ids of every supervised pump, in configuration order. The adapter
  /// subscribes to the command topics of exactly this set.
  pub fn pump_ids(&self) -> Vec<String> {
    self
      .sessions
      .iter()
      .map(|session| session.config().id().to_owned())
      .collect()
  }

  /// Run until cancelled, then shut everything down cleanly.
  pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BridgeError> {
    self.adapter.connect().await?;

    for (index, session) in self.sessions.iter().enumerate() {
      if index > 0 {
        sleep(STARTUP_STAGGER).await;
      }
      session.start();
    }

    let mut republish = interval_at(Instant::now() + REPUBLISH_INTERVAL, REPUBLISH_INTERVAL);
    republish.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        Some(event) = self.pump_events.recv() => self.handle_pump_event(event).await,
        Some(event) = self.broker_events.recv() => self.handle_broker_event(event).await,
        _ = republish.tick() => self.republish_linked().await,
        _ = cancel.cancelled() => break,
      }
    }

    self.shutdown().await;
    Ok(())
  }

  async fn handle_pump_event(&self, event: PumpEvent) {
    let PumpEvent::StateChanged { pump_id } = event;
    let Some(session) = self.by_id.get(&pump_id).map(|entry| entry.value().clone()) else {
      return;
    };
    self
      .adapter
      .publish_state(session.config(), &session.snapshot())
      .await;
  }

  async fn handle_broker_event(&self, event: BrokerEvent) {
    match event {
      BrokerEvent::Connected => {
        info!("Connected to MQTT broker");
        for session in &self.sessions {
          self.adapter.publish_discovery(session.config()).await;
          self.adapter.publish_state(session.config(), &session.snapshot()).await;
        }
      }
      BrokerEvent::CommandReceived {
        pump_id,
        entity,
        payload,
      } => {
        let Some(session) = self.by_id.get(&pump_id).map(|entry| entry.value().clone()) else {
          warn!("Unknown pump: {}", pump_id);
          return;
        };
        match parse_entity_command(&entity, &payload) {
          Ok(command) => dispatch(session, command),
          Err(CommandParseError::UnknownEntity(entity)) => {
            trace!("Ignoring command for unknown entity {}", entity);
          }
          Err(err) => warn!("[{}] {}", session.config().display_name(), err),
        }
      }
    }
  }

  async fn republish_linked(&self) {
    for session in &self.sessions {
      if session.link_up() {
        self
          .adapter
          .publish_state(session.config(), &session.snapshot())
          .await;
      }
    }
  }

  async fn shutdown(&self) {
    info!("Shutting down...");
    future::join_all(self.sessions.iter().map(|session| session.disconnect())).await;
    // Leave the retained connectivity topics reading OFF.
    for session in &self.sessions {
      self
        .adapter
        .publish_state(session.config(), &session.snapshot())
        .await;
    }
    self.adapter.disconnect().await;
    info!("Bridge stopped");
  }
}

/// Issue a command against a session without blocking the supervisor loop.
/// Failures are logged; nothing propagates across pumps.
fn dispatch(session: Arc<PumpSession>, command: PumpCommand) {
  tokio::spawn(async move {
    let result = match command {
      PumpCommand::Power(on) => session.set_power(on).await,
      PumpCommand::Feed(on) => session.set_feed(on).await,
      PumpCommand::Flow(percent) => session.set_flow(percent).await,
      PumpCommand::Frequency(seconds) => session.set_frequency(seconds).await,
      PumpCommand::Mode(mode) => session.set_mode(mode).await,
    };
    if let Err(err) = result {
      warn!("[{}] Command failed: {}", session.config().display_name(), err);
    }
  });
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::device::state::PumpSnapshot;
  use crate::device::testutil::{MockConnector, MockLink};
  use async_trait::async_trait;
  use std::sync::Mutex;
  use tokio::time::{timeout, Duration};

  #[derive(Default)]
  struct MockBroker {
    state_publishes: Mutex<Vec<(String, PumpSnapshot)>>,
    discovery_publishes: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl BrokerAdapter for MockBroker {
    async fn connect(&self) -> Result<(), BridgeError> {
      Ok(())
    }

    async fn disconnect(&self) {}

    async fn publish_state(&self, config: &PumpConfig, snapshot: &PumpSnapshot) {
      self
        .state_publishes
        .lock()
        .expect("mutex poisoned")
        .push((config.id().to_owned(), snapshot.clone()));
    }

    async fn publish_discovery(&self, config: &PumpConfig) {
      self
        .discovery_publishes
        .lock()
        .expect("mutex poisoned")
        .push(config.id().to_owned());
    }
  }

  const PASSCODE_RESPONSE: [u8; 10] = [0x00, 0x00, 0x00, 0x03, 0x05, 0x00, 0x00, 0x07, 0x12, 0x34];
  const LOGIN_OK: [u8; 9] = [0x00, 0x00, 0x00, 0x03, 0x04, 0x00, 0x00, 0x09, 0x00];

  #[tokio::test(start_paused = true)]
  async fn test_supervisor_connects_publishes_and_dispatches() {
    let (pump_event_tx, pump_event_rx) = mpsc::channel(64);
    let (broker_event_tx, broker_event_rx) = mpsc::channel(64);

    let link = MockLink::new();
    let config = Arc::new(PumpConfig::new("Tank Pump", "AA:BB:CC:DD:EE:FF"));
    let connector = Arc::new(MockConnector::new(link.clone()));
    let session = PumpSession::new(config, 0, connector, pump_event_tx);

    let broker = Arc::new(MockBroker::default());
    let supervisor = PumpSupervisor::new(
      vec![session],
      broker.clone(),
      pump_event_rx,
      broker_event_rx,
    );
    assert_eq!(supervisor.pump_ids(), vec!["tank_pump".to_owned()]);

    let cancel = CancellationToken::new();
    let run = tokio::spawn(supervisor.run(cancel.clone()));

    // The supervisor kicks off the initial connect; walk the handshake.
    link.wait_for_write(1).await;
    link.notify(&PASSCODE_RESPONSE);
    link.wait_for_write(2).await;
    link.notify(&LOGIN_OK);

    // Link-up event fans out as a state publish.
    timeout(Duration::from_secs(5), async {
      loop {
        if !broker.state_publishes.lock().expect("mutex poisoned").is_empty() {
          break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("state publish after login");
    {
      let publishes = broker.state_publishes.lock().expect("mutex poisoned");
      let (pump_id, snapshot) = &publishes[0];
      assert_eq!(pump_id, "tank_pump");
      assert!(snapshot.link_up);
    }

    // Broker connect triggers discovery plus state for every pump.
    broker_event_tx
      .send(BrokerEvent::Connected)
      .await
      .expect("supervisor alive");
    timeout(Duration::from_secs(5), async {
      loop {
        if !broker.discovery_publishes.lock().expect("mutex poisoned").is_empty() {
          break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("discovery publish after broker connect");

    // An inbound command reaches the session as a control write.
    broker_event_tx
      .send(BrokerEvent::CommandReceived {
        pump_id: "tank_pump".to_owned(),
        entity: "flow".to_owned(),
        payload: "42".to_owned(),
      })
      .await
      .expect("supervisor alive");
    let frame = link.wait_for_write(3).await;
    assert_eq!(*frame.last().expect("non-empty"), 42);

    // Unknown entities are dropped without touching the link.
    broker_event_tx
      .send(BrokerEvent::CommandReceived {
        pump_id: "tank_pump".to_owned(),
        entity: "colour".to_owned(),
        payload: "red".to_owned(),
      })
      .await
      .expect("supervisor alive");
    broker_event_tx
      .send(BrokerEvent::CommandReceived {
        pump_id: "missing".to_owned(),
        entity: "power".to_owned(),
        payload: "on".to_owned(),
      })
      .await
      .expect("supervisor alive");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.writes().len(), 3);

    cancel.cancel();
    timeout(Duration::from_secs(5), run)
      .await
      .expect("run should settle")
      .expect("run task should not panic")
      .expect("clean shutdown");
  }
}
