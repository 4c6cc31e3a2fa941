// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use crate::protocol::PumpAttribute;
use chrono::{DateTime, NaiveDate, Utc};

/// Synthesized default until the pump reports its real flow.
pub const DEFAULT_FLOW_PERCENT: u8 = 50;
/// Synthesized default until the pump reports its real frequency.
pub const DEFAULT_FREQUENCY_SECONDS: u8 = 8;

/// Mutable per-pump state. Only the owning session mutates it, from its
/// notification handler, the disconnect hook and the publish path.
#[derive(Debug, Clone)]
pub struct PumpState {
  pub power: bool,
  pub feed: bool,
  /// Raw mode code as reported; unknown codes are retained verbatim.
  pub mode: u8,
  pub flow_percent: u8,
  pub frequency_seconds: u8,
  /// True only while the GATT link is connected and authenticated.
  pub link_up: bool,
  /// True once any pump-originated update mutated a value; cleared on link
  /// loss. Gates publishing of everything except connectivity.
  pub state_seen: bool,
  /// Instant of the last observed off-to-on power transition.
  pub power_on_epoch: Option<DateTime<Utc>>,
  /// Accumulated powered-on hours for `runtime_reset_date`.
  pub runtime_today_hours: f64,
  pub runtime_reset_date: NaiveDate,
}

impl PumpState {
  pub fn new(today: NaiveDate) -> Self {
    Self {
      power: false,
      feed: false,
      mode: 0,
      flow_percent: DEFAULT_FLOW_PERCENT,
      frequency_seconds: DEFAULT_FREQUENCY_SECONDS,
      link_up: false,
      state_seen: false,
      power_on_epoch: None,
      runtime_today_hours: 0.0,
      runtime_reset_date: today,
    }
  }

  /// Apply one pump-originated attribute report. Returns true when a value
  /// actually changed; the caller emits a state-change event in that case.
  pub fn apply_report(&mut self, attribute: PumpAttribute, value: u8, now: DateTime<Utc>) -> bool {
    match attribute {
      PumpAttribute::Power => {
        let on = value != 0;
        if self.power != on {
          if on {
            self.power_on_epoch = Some(now);
          } else {
            self.accumulate_runtime(now);
          }
          self.power = on;
          return true;
        }
        // After a reconnect the pump re-reports an unchanged "on"; restart
        // the runtime clock from here, link-down seconds are not counted.
        if on && self.power_on_epoch.is_none() {
          self.power_on_epoch = Some(now);
        }
        false
      }
      PumpAttribute::Feed => {
        let on = value != 0;
        let changed = self.feed != on;
        self.feed = on;
        changed
      }
      PumpAttribute::Mode => {
        let changed = self.mode != value;
        self.mode = value;
        changed
      }
      PumpAttribute::Flow => {
        let changed = self.flow_percent != value;
        self.flow_percent = value;
        changed
      }
      PumpAttribute::Frequency => {
        let changed = self.frequency_seconds != value;
        self.frequency_seconds = value;
        changed
      }
    }
  }

  /// Link loss: close the in-flight powered-on span, drop authentication
  /// visibility. Values themselves stay; the pump re-reports on login.
  pub fn mark_link_down(&mut self, now: DateTime<Utc>) {
    self.accumulate_runtime(now);
    self.link_up = false;
    self.state_seen = false;
  }

  fn accumulate_runtime(&mut self, now: DateTime<Utc>) {
    if let Some(on_since) = self.power_on_epoch.take() {
      let elapsed_hours = (now - on_since).num_milliseconds().max(0) as f64 / 3_600_000.0;
      self.runtime_today_hours += elapsed_hours;
    }
  }

  /// Reset the daily runtime counter when the local date rolled over. Both
  /// fields update together, before the published value is computed.
  pub fn roll_runtime_day(&mut self, today: NaiveDate) {
    if self.runtime_reset_date != today {
      self.runtime_today_hours = 0.0;
      self.runtime_reset_date = today;
    }
  }

  /// Runtime to publish: the accumulated counter plus the active span.
  pub fn published_runtime_hours(&self, now: DateTime<Utc>) -> f64 {
    let mut runtime = self.runtime_today_hours;
    if self.power {
      if let Some(on_since) = self.power_on_epoch {
        runtime += (now - on_since).num_milliseconds().max(0) as f64 / 3_600_000.0;
      }
    }
    runtime
  }
}

/// Immutable copy of the state handed to the broker adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct PumpSnapshot {
  pub power: bool,
  pub feed: bool,
  pub mode: u8,
  pub flow_percent: u8,
  pub frequency_seconds: u8,
  pub link_up: bool,
  pub state_seen: bool,
  pub runtime_today_hours: f64,
}

#[cfg(test)]
mod test {
  use super::*;
  use chrono::{Duration, TimeZone};

  fn start_of_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("valid date")
  }

  fn today() -> NaiveDate {
    start_of_day().date_naive()
  }

  #[test]
  pub fn test_defaults() {
    let state = PumpState::new(today());
    assert!(!state.power);
    assert_eq!(state.flow_percent, 50);
    assert_eq!(state.frequency_seconds, 8);
    assert!(!state.state_seen);
    assert!(state.power_on_epoch.is_none());
  }

  #[test]
  pub fn test_power_cycle_accumulates_runtime() {
    let mut state = PumpState::new(today());
    let on_at = start_of_day();
    assert!(state.apply_report(PumpAttribute::Power, 1, on_at));
    assert_eq!(state.power_on_epoch, Some(on_at));

    let off_at = on_at + Duration::minutes(90);
    assert!(state.apply_report(PumpAttribute::Power, 0, off_at));
    assert!(state.power_on_epoch.is_none());
    assert!((state.runtime_today_hours - 1.5).abs() < 1e-9);
  }

  #[test]
  pub fn test_published_runtime_includes_active_span() {
    let mut state = PumpState::new(today());
    let on_at = start_of_day();
    state.apply_report(PumpAttribute::Power, 1, on_at);
    let runtime = state.published_runtime_hours(on_at + Duration::minutes(30));
    assert!((runtime - 0.5).abs() < 1e-9);
  }

  #[test]
  pub fn test_unchanged_report_is_not_a_change() {
    let mut state = PumpState::new(today());
    assert!(state.apply_report(PumpAttribute::Flow, 75, start_of_day()));
    assert!(!state.apply_report(PumpAttribute::Flow, 75, start_of_day()));
    assert_eq!(state.flow_percent, 75);
  }

  #[test]
  pub fn test_unknown_mode_code_retained() {
    let mut state = PumpState::new(today());
    assert!(state.apply_report(PumpAttribute::Mode, 5, start_of_day()));
    assert_eq!(state.mode, 5);
  }

  #[test]
  pub fn test_link_down_closes_span_and_power_reconfirmation_restarts_it() {
    let mut state = PumpState::new(today());
    let on_at = start_of_day();
    state.apply_report(PumpAttribute::Power, 1, on_at);
    state.state_seen = true;

    let lost_at = on_at + Duration::hours(2);
    state.mark_link_down(lost_at);
    assert!(!state.link_up);
    assert!(!state.state_seen);
    assert!(state.power);
    assert!(state.power_on_epoch.is_none());
    assert!((state.runtime_today_hours - 2.0).abs() < 1e-9);

    // Re-report of the unchanged "on" after reconnect: no event, new epoch.
    let back_at = lost_at + Duration::minutes(10);
    assert!(!state.apply_report(PumpAttribute::Power, 1, back_at));
    assert_eq!(state.power_on_epoch, Some(back_at));
  }

  #[test]
  pub fn test_runtime_monotonic_within_day() {
    let mut state = PumpState::new(today());
    let mut previous = 0.0;
    let mut at = start_of_day();
    for _ in 0..5 {
      state.apply_report(PumpAttribute::Power, 1, at);
      at = at + Duration::minutes(7);
      state.apply_report(PumpAttribute::Power, 0, at);
      at = at + Duration::minutes(3);
      assert!(state.runtime_today_hours >= previous);
      previous = state.runtime_today_hours;
    }
  }

  #[test]
  pub fn test_daily_reset_is_atomic() {
    let mut state = PumpState::new(today());
    state.runtime_today_hours = 5.5;

    state.roll_runtime_day(today());
    assert!((state.runtime_today_hours - 5.5).abs() < 1e-9);

    let tomorrow = today() + Duration::days(1);
    state.roll_runtime_day(tomorrow);
    assert_eq!(state.runtime_today_hours, 0.0);
    assert_eq!(state.runtime_reset_date, tomorrow);
  }
}
