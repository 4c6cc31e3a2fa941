// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Broker adapter: turns supervisor events into retained topic publishes and
//! inbound `{prefix}/{pump_id}/{entity}/set` messages into supervisor calls.
//!
//! After the first CONNACK the rumqttc event loop runs in a background task
//! and handles broker reconnects on its own; command subscriptions are
//! re-issued on every CONNACK since the broker may have lost the session.

pub mod discovery;
pub mod topics;

use crate::config::MqttSettings;
use crate::core::errors::BridgeError;
use crate::device::config::PumpConfig;
use crate::device::state::PumpSnapshot;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// What the adapter reports back to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
  /// CONNACK received; subscriptions are in place. The supervisor responds
  /// by (re)publishing discovery and state for every pump.
  Connected,
  /// A message arrived on a command topic.
  CommandReceived {
    pump_id: String,
    entity: String,
    payload: String,
  },
}

/// Contract between the supervisor and the broker side.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
  /// Establish the initial broker connection. An unreachable broker at
  /// startup is fatal for the process.
  async fn connect(&self) -> Result<(), BridgeError>;
  async fn disconnect(&self);
  async fn publish_state(&self, config: &PumpConfig, snapshot: &PumpSnapshot);
  async fn publish_discovery(&self, config: &PumpConfig);
}

pub struct MqttAdapter {
  settings: MqttSettings,
  pump_ids: Vec<String>,
  client: AsyncClient,
  event_loop: Mutex<Option<EventLoop>>,
  broker_events: mpsc::Sender<BrokerEvent>,
  poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttAdapter {
  pub fn new(
    settings: MqttSettings,
    pump_ids: Vec<String>,
    broker_events: mpsc::Sender<BrokerEvent>,
  ) -> Self {
    let mut options = MqttOptions::new(
      settings.client_id().clone(),
      settings.host().clone(),
      settings.port(),
    );
    options.set_keep_alive(Duration::from_secs(30));
    if let Some(username) = settings.username() {
      options.set_credentials(username.clone(), settings.password().clone().unwrap_or_default());
    }
    let (client, event_loop) = AsyncClient::new(options, 64);
    Self {
      settings,
      pump_ids,
      client,
      event_loop: Mutex::new(Some(event_loop)),
      broker_events,
      poll_task: Mutex::new(None),
    }
  }

  async fn handle_connack(
    client: &AsyncClient,
    settings: &MqttSettings,
    pump_ids: &[String],
    broker_events: &mpsc::Sender<BrokerEvent>,
  ) {
    for pump_id in pump_ids {
      for entity in topics::COMMAND_ENTITIES {
        let topic = topics::command_topic(settings.topic_prefix(), pump_id, entity);
        if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
          error!("MQTT subscribe to {} failed: {}", topic, err);
        }
      }
    }
    if broker_events.send(BrokerEvent::Connected).await.is_err() {
      debug!("Supervisor dropped the broker event channel");
    }
  }

  async fn poll_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    settings: MqttSettings,
    pump_ids: Vec<String>,
    broker_events: mpsc::Sender<BrokerEvent>,
  ) {
    loop {
      match event_loop.poll().await {
        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
          info!("Reconnected to MQTT broker");
          Self::handle_connack(&client, &settings, &pump_ids, &broker_events).await;
        }
        Ok(Event::Incoming(Incoming::Publish(publish))) => {
          let Some((pump_id, entity)) =
            topics::parse_command_topic(settings.topic_prefix(), &publish.topic)
          else {
            continue;
          };
          let payload = String::from_utf8_lossy(&publish.payload).to_string();
          debug!("MQTT message: {} = {}", publish.topic, payload);
          let event = BrokerEvent::CommandReceived {
            pump_id,
            entity,
            payload,
          };
          if broker_events.send(event).await.is_err() {
            debug!("Supervisor gone, stopping MQTT poll loop");
            return;
          }
        }
        Ok(_) => {}
        Err(err) => {
          warn!("MQTT connection error: {}", err);
          if broker_events.is_closed() {
            return;
          }
          sleep(Duration::from_secs(1)).await;
        }
      }
    }
  }
}

#[async_trait]
impl BrokerAdapter for MqttAdapter {
  async fn connect(&self) -> Result<(), BridgeError> {
    let Some(mut event_loop) = self.event_loop.lock().expect("event loop mutex poisoned").take()
    else {
      return Ok(());
    };
    info!(
      "Connecting to MQTT broker at {}:{}",
      self.settings.host(),
      self.settings.port()
    );
    // Drive the loop by hand until the first CONNACK so a dead broker
    // surfaces as a startup error instead of a silent retry loop.
    loop {
      match event_loop.poll().await {
        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
          Self::handle_connack(&self.client, &self.settings, &self.pump_ids, &self.broker_events)
            .await;
          break;
        }
        Ok(_) => {}
        Err(err) => return Err(BridgeError::BrokerConnect(err.to_string())),
      }
    }
    let task = tokio::spawn(Self::poll_loop(
      event_loop,
      self.client.clone(),
      self.settings.clone(),
      self.pump_ids.clone(),
      self.broker_events.clone(),
    ));
    *self.poll_task.lock().expect("poll task mutex poisoned") = Some(task);
    Ok(())
  }

  async fn disconnect(&self) {
    if let Err(err) = self.client.disconnect().await {
      debug!("MQTT disconnect error: {}", err);
    }
    // The poll task has to flush the disconnect packet before it goes away.
    sleep(Duration::from_millis(100)).await;
    if let Some(task) = self.poll_task.lock().expect("poll task mutex poisoned").take() {
      task.abort();
    }
  }

  async fn publish_state(&self, config: &PumpConfig, snapshot: &PumpSnapshot) {
    for (topic, payload) in topics::render_state(self.settings.topic_prefix(), config, snapshot) {
      if let Err(err) = self.client.publish(topic.clone(), QoS::AtLeastOnce, true, payload).await {
        warn!("MQTT publish to {} failed: {}", topic, err);
      }
    }
  }

  async fn publish_discovery(&self, config: &PumpConfig) {
    let documents = discovery::discovery_documents(
      self.settings.discovery_prefix(),
      self.settings.topic_prefix(),
      config,
    );
    for (topic, body) in documents {
      let payload = body.to_string();
      if let Err(err) = self.client.publish(topic.clone(), QoS::AtLeastOnce, true, payload).await {
        warn!("MQTT publish to {} failed: {}", topic, err);
      }
    }
    info!("[{}] Published MQTT discovery", config.display_name());
  }
}
