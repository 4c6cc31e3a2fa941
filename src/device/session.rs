// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! Per-pump session: one BLE link, the authentication handshake, the command
//! path and the reconnect loop.
//!
//! State machine: `Idle → Connecting → Subscribing → AwaitingPasscode →
//! AwaitingLogin → Authenticated → Disconnecting → Idle`. Any failure from
//! `Connecting` through `AwaitingLogin` tears the link down and enters the
//! reconnect loop. Session state is mutated only from the session's own
//! tasks; BLE callbacks arrive already marshalled through the link's event
//! channel.

use crate::core::errors::PumpDeviceError;
use crate::device::config::PumpConfig;
use crate::device::hardware::{LinkEvent, PumpConnector, PumpLink};
use crate::device::state::{PumpSnapshot, PumpState};
use crate::device::PumpEvent;
use crate::protocol::{encode_attribute_write, Frame, PumpAttribute, PumpMode, PumpNotification};
use chrono::{Local, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Overall handshake wait: 50 polls at 100 ms.
const AUTH_POLL_ATTEMPTS: u32 = 50;
const AUTH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reconnect backoff: 5 s doubling to a 5 minute ceiling, plus up to 10%
/// jitter so pumps sharing the adapter do not retry in lockstep.
const INITIAL_RECONNECT_DELAY_SECS: f64 = 5.0;
const MAX_RECONNECT_DELAY_SECS: f64 = 300.0;
/// Extra per-pump startup delay after a shared radio loss.
const RECONNECT_STAGGER_SECS: u64 = 2;

pub(crate) fn next_backoff_delay(delay: f64) -> f64 {
  let jitter = rand::thread_rng().gen_range(0.0..delay * 0.1);
  (delay * 2.0 + jitter).min(MAX_RECONNECT_DELAY_SECS)
}

struct SessionInner {
  state: Mutex<PumpState>,
  link: Mutex<Option<Arc<dyn PumpLink>>>,
  passcode: Mutex<Vec<u8>>,
  command_serial: AtomicU32,
  authenticated: AtomicBool,
  running: AtomicBool,
}

/// Handle to one pump. Cheap to share; all methods are callable from any
/// task, mutation happens behind the inner locks and the event task.
pub struct PumpSession {
  config: Arc<PumpConfig>,
  pump_index: usize,
  connector: Arc<dyn PumpConnector>,
  inner: Arc<SessionInner>,
  events: mpsc::Sender<PumpEvent>,
  connect_lock: tokio::sync::Mutex<()>,
  command_lock: tokio::sync::Mutex<()>,
  reconnect_task: Mutex<Option<JoinHandle<()>>>,
  me: Weak<PumpSession>,
}

impl PumpSession {
  pub fn new(
    config: Arc<PumpConfig>,
    pump_index: usize,
    connector: Arc<dyn PumpConnector>,
    events: mpsc::Sender<PumpEvent>,
  ) -> Arc<Self> {
    Arc::new_cyclic(|me| Self {
      config,
      pump_index,
      connector,
      inner: Arc::new(SessionInner {
        state: Mutex::new(PumpState::new(Local::now().date_naive())),
        link: Mutex::new(None),
        passcode: Mutex::new(Vec::new()),
        command_serial: AtomicU32::new(1),
        authenticated: AtomicBool::new(false),
        running: AtomicBool::new(true),
      }),
      events,
      connect_lock: tokio::sync::Mutex::new(()),
      command_lock: tokio::sync::Mutex::new(()),
      reconnect_task: Mutex::new(None),
      me: me.clone(),
    })
  }

  pub fn config(&self) -> &Arc<PumpConfig> {
    &self.config
  }

  pub fn link_up(&self) -> bool {
    self.lock_state().link_up
  }

  fn name(&self) -> &str {
    self.config.display_name()
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, PumpState> {
    self.inner.state.lock().expect("state mutex poisoned")
  }

  fn current_link(&self) -> Option<Arc<dyn PumpLink>> {
    self.inner.link.lock().expect("link mutex poisoned").clone()
  }

  /// Kick off the initial connect without blocking the caller. A failed
  /// first attempt falls into the reconnect loop like any later loss.
  pub fn start(&self) {
    let Some(session) = self.me.upgrade() else {
      return;
    };
    tokio::spawn(async move {
      let _ = session.connect().await;
    });
  }

  /// Run the connect sequence: open the link, subscribe, request the
  /// passcode and wait up to five seconds for the handshake to finish.
  pub async fn connect(&self) -> Result<(), PumpDeviceError> {
    let _guard = self.connect_lock.lock().await;
    if self.inner.authenticated.load(Ordering::SeqCst) && self.current_link().is_some() {
      return Ok(());
    }

    info!("[{}] Connecting to {}...", self.name(), self.config.mac());
    let link = match self.connector.open().await {
      Ok(link) => link,
      Err(err) => {
        error!("[{}] Connection failed: {}", self.name(), err);
        self.schedule_reconnect();
        return Err(err);
      }
    };
    info!("[{}] Connected", self.name());

    // Subscribe to the event channel before the first write so the passcode
    // response cannot slip past us.
    let events = link.event_stream();
    *self.inner.link.lock().expect("link mutex poisoned") = Some(link.clone());
    if let Some(session) = self.me.upgrade() {
      tokio::spawn(session.run_link_events(link.clone(), events));
    }

    if let Err(err) = link.write(&Frame::get_passcode().encode()).await {
      error!("[{}] Passcode request failed: {}", self.name(), err);
      self.cleanup_connection().await;
      self.schedule_reconnect();
      return Err(err);
    }

    for _ in 0..AUTH_POLL_ATTEMPTS {
      if self.inner.authenticated.load(Ordering::SeqCst) {
        return Ok(());
      }
      sleep(AUTH_POLL_INTERVAL).await;
    }

    warn!("[{}] Authentication timeout", self.name());
    self.cleanup_connection().await;
    self.schedule_reconnect();
    Err(PumpDeviceError::AuthTimeout)
  }

  /// Stop the session: end the reconnect loop, drop the link, back to idle.
  pub async fn disconnect(&self) {
    self.inner.running.store(false, Ordering::SeqCst);
    if let Some(handle) = self
      .reconnect_task
      .lock()
      .expect("reconnect mutex poisoned")
      .take()
    {
      handle.abort();
    }
    self.cleanup_connection().await;
  }

  async fn cleanup_connection(&self) {
    self.inner.authenticated.store(false, Ordering::SeqCst);
    self.lock_state().link_up = false;
    let link = self.inner.link.lock().expect("link mutex poisoned").take();
    if let Some(link) = link {
      link.close().await;
    }
  }

  /// Point-in-time state for publishing. Rolls the daily runtime counter
  /// first so the counter and its date always update together.
  pub fn snapshot(&self) -> PumpSnapshot {
    let now = Utc::now();
    let mut state = self.lock_state();
    state.roll_runtime_day(Local::now().date_naive());
    PumpSnapshot {
      power: state.power,
      feed: state.feed,
      mode: state.mode,
      flow_percent: state.flow_percent,
      frequency_seconds: state.frequency_seconds,
      link_up: state.link_up,
      state_seen: state.state_seen,
      runtime_today_hours: state.published_runtime_hours(now),
    }
  }

  // Command path. None of these touch local state; the pump's own echo
  // notification is the only source of state updates.

  pub async fn set_power(&self, on: bool) -> Result<(), PumpDeviceError> {
    info!("[{}] Setting power: {}", self.name(), if on { "ON" } else { "OFF" });
    self.send_command(PumpAttribute::Power, on as u8).await
  }

  pub async fn set_feed(&self, on: bool) -> Result<(), PumpDeviceError> {
    info!("[{}] Setting feed: {}", self.name(), if on { "ON" } else { "OFF" });
    self.send_command(PumpAttribute::Feed, on as u8).await
  }

  pub async fn set_flow(&self, percent: u8) -> Result<(), PumpDeviceError> {
    let percent = self.config.clamp_flow(percent);
    info!("[{}] Setting flow: {}%", self.name(), percent);
    self.send_command(PumpAttribute::Flow, percent).await
  }

  pub async fn set_frequency(&self, seconds: u8) -> Result<(), PumpDeviceError> {
    let seconds = self.config.clamp_frequency(seconds);
    info!("[{}] Setting frequency: {}s", self.name(), seconds);
    self.send_command(PumpAttribute::Frequency, seconds).await
  }

  pub async fn set_mode(&self, mode: PumpMode) -> Result<(), PumpDeviceError> {
    info!("[{}] Setting mode: {}", self.name(), mode);
    self.send_command(PumpAttribute::Mode, mode.code()).await
  }

  async fn send_command(&self, attribute: PumpAttribute, value: u8) -> Result<(), PumpDeviceError> {
    if !self.inner.authenticated.load(Ordering::SeqCst) {
      warn!("[{}] Cannot send - not connected", self.name());
      return Err(PumpDeviceError::NotConnected);
    }
    let link = self.current_link().ok_or(PumpDeviceError::NotConnected)?;

    // One command in flight per session, in call order. The serial only
    // advances once the transport has accepted the write.
    let _guard = self.command_lock.lock().await;
    let serial = self.inner.command_serial.load(Ordering::SeqCst);
    let frame = Frame::control(serial, &encode_attribute_write(attribute, value));
    if let Err(err) = link.write(&frame.encode()).await {
      error!("[{}] Send failed: {}", self.name(), err);
      return Err(err);
    }
    self
      .inner
      .command_serial
      .store(serial.wrapping_add(1), Ordering::SeqCst);
    Ok(())
  }

  // Inbound side, driven by the link's event channel. One event is fully
  // handled (including the state-change emit) before the next is read.

  async fn run_link_events(
    self: Arc<Self>,
    link: Arc<dyn PumpLink>,
    mut events: broadcast::Receiver<LinkEvent>,
  ) {
    loop {
      match events.recv().await {
        Ok(LinkEvent::Notification(data)) => self.handle_notification(&data).await,
        Ok(LinkEvent::Disconnected) => {
          self.handle_disconnect(&link).await;
          break;
        }
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          warn!("[{}] Dropped {} link events", self.name(), missed);
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  }

  async fn handle_notification(&self, data: &[u8]) {
    let notification = match PumpNotification::parse(data) {
      Ok(Some(notification)) => notification,
      Ok(None) => return,
      Err(err) => {
        debug!("[{}] Dropping malformed frame: {}", self.name(), err);
        return;
      }
    };

    match notification {
      PumpNotification::Passcode { passcode } => {
        debug!("[{}] Received passcode", self.name());
        *self.inner.passcode.lock().expect("passcode mutex poisoned") = passcode;
        self.send_login().await;
      }
      PumpNotification::LoginResult { ok: true, .. } => {
        info!("[{}] Login successful", self.name());
        self.inner.authenticated.store(true, Ordering::SeqCst);
        self.lock_state().link_up = true;
        self.emit_state_changed().await;
      }
      PumpNotification::LoginResult { status, .. } => {
        warn!("[{}] Login failed with status 0x{:02x}", self.name(), status);
      }
      PumpNotification::Report(report) => {
        let Some(attribute) = report.attribute() else {
          debug!(
            "[{}] Report for unknown attribute ({:#04x}, {:#04x}, {:#04x})",
            self.name(),
            report.type_byte,
            report.attr_hi,
            report.attr_lo
          );
          return;
        };
        let changed = {
          let mut state = self.lock_state();
          let changed = state.apply_report(attribute, report.value, Utc::now());
          if changed {
            state.state_seen = true;
          }
          changed
        };
        if changed {
          info!("[{}] {}: {}", self.name(), attribute, describe_value(attribute, report.value));
          self.emit_state_changed().await;
        }
      }
      PumpNotification::CommandAck => {
        debug!("[{}] Command acknowledged", self.name());
      }
    }
  }

  async fn send_login(&self) {
    let Some(link) = self.current_link() else {
      return;
    };
    let passcode = self.inner.passcode.lock().expect("passcode mutex poisoned").clone();
    let frame = match Frame::login(&passcode) {
      Ok(frame) => frame,
      Err(err) => {
        warn!("[{}] Passcode blob unusable: {}", self.name(), err);
        return;
      }
    };
    if let Err(err) = link.write(&frame.encode()).await {
      error!("[{}] Login write failed: {}", self.name(), err);
    }
  }

  async fn handle_disconnect(&self, link: &Arc<dyn PumpLink>) {
    // A teardown or a reconnect may already have replaced this link; a late
    // disconnect event from the old one must not touch the fresh session.
    {
      let mut slot = self.inner.link.lock().expect("link mutex poisoned");
      match &*slot {
        Some(current) if Arc::ptr_eq(current, link) => *slot = None,
        _ => return,
      }
    }
    warn!("[{}] Disconnected", self.name());
    self.inner.authenticated.store(false, Ordering::SeqCst);
    self.lock_state().mark_link_down(Utc::now());
    self.emit_state_changed().await;
    self.schedule_reconnect();
  }

  async fn emit_state_changed(&self) {
    let event = PumpEvent::StateChanged {
      pump_id: self.config.id().to_owned(),
    };
    if self.events.send(event).await.is_err() {
      debug!("[{}] State event receiver dropped", self.name());
    }
  }

  // Reconnect loop. At most one per session; cooperative shutdown through
  // the running flag, checked before every sleep and attempt.

  fn schedule_reconnect(&self) {
    if !self.inner.running.load(Ordering::SeqCst) {
      return;
    }
    let mut slot = self.reconnect_task.lock().expect("reconnect mutex poisoned");
    if slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false) {
      return;
    }
    let Some(session) = self.me.upgrade() else {
      return;
    };
    *slot = Some(tokio::spawn(session.reconnect_loop()));
  }

  async fn reconnect_loop(self: Arc<Self>) {
    let stagger = self.pump_index as u64 * RECONNECT_STAGGER_SECS;
    if stagger > 0 {
      info!("[{}] Staggering reconnect by {}s", self.name(), stagger);
      sleep(Duration::from_secs(stagger)).await;
    }

    let mut delay = INITIAL_RECONNECT_DELAY_SECS;
    let mut attempts = 0u64;
    while !self.inner.authenticated.load(Ordering::SeqCst) {
      attempts += 1;
      info!(
        "[{}] Reconnecting in {:.1}s... (attempt {})",
        self.name(),
        delay,
        attempts
      );
      sleep(Duration::from_secs_f64(delay)).await;

      if !self.inner.running.load(Ordering::SeqCst) {
        info!("[{}] Stopping reconnect - bridge shutting down", self.name());
        break;
      }

      match self.connect().await {
        Ok(()) => {
          info!("[{}] Reconnection successful", self.name());
          break;
        }
        Err(err) => {
          debug!("[{}] Reconnection attempt failed: {}", self.name(), err);
        }
      }

      delay = next_backoff_delay(delay);
    }
    debug!("[{}] Reconnect loop ended", self.name());
  }
}

fn describe_value(attribute: PumpAttribute, value: u8) -> String {
  match attribute {
    PumpAttribute::Power | PumpAttribute::Feed => {
      if value != 0 { "ON" } else { "OFF" }.to_owned()
    }
    PumpAttribute::Mode => PumpMode::name_of(value).to_owned(),
    PumpAttribute::Flow => format!("{}%", value),
    PumpAttribute::Frequency => format!("{}s", value),
  }
}
