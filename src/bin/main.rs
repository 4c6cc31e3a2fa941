// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

use argh::FromArgs;
use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use jebao_mqtt_bridge::bridge::{build_sessions, PumpSupervisor};
use jebao_mqtt_bridge::config::{self, BridgeConfig};
use jebao_mqtt_bridge::core::errors::BridgeError;
use jebao_mqtt_bridge::device::scanner::scan_for_pumps;
use jebao_mqtt_bridge::mqtt::MqttAdapter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{
  filter::{EnvFilter, LevelFilter},
  layer::SubscriberExt,
  util::SubscriberInitExt,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// MQTT bridge for Jebao DMP series aquarium wave pumps.
#[derive(FromArgs)]
struct CliArguments {
  /// path to the configuration file
  #[argh(option, short = 'c', default = "\"config.yaml\".to_owned()")]
  config: String,

  /// set log level for output
  #[argh(option)]
  log: Option<Level>,

  /// scan for advertising pumps and exit
  #[argh(switch)]
  scan: bool,

  /// scan duration in seconds (default: 10)
  #[argh(option, default = "10")]
  scan_duration: u64,

  /// print version and exit
  #[argh(switch)]
  version: bool,
}

fn setup_console_logging(log_level: Option<Level>) {
  if let Some(level) = log_level {
    tracing_subscriber::registry()
      .with(tracing_subscriber::fmt::layer())
      .with(LevelFilter::from_level(level))
      .init();
  } else {
    tracing_subscriber::registry()
      .with(tracing_subscriber::fmt::layer())
      .with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
      )
      .init();
  }
}

async fn bluetooth_adapter() -> Result<Adapter, BridgeError> {
  let manager = Manager::new()
    .await
    .map_err(|err| BridgeError::BleUnavailable(format!("{:?}", err)))?;
  let adapters = manager
    .adapters()
    .await
    .map_err(|err| BridgeError::BleUnavailable(format!("{:?}", err)))?;
  adapters
    .into_iter()
    .next()
    .ok_or_else(|| BridgeError::BleUnavailable("no Bluetooth LE adapter found".to_owned()))
}

async fn run_scan(duration: Duration) -> Result<(), BridgeError> {
  let adapter = bluetooth_adapter().await?;
  println!("Scanning for Jebao pumps... ({}s)", duration.as_secs());
  println!("Make sure pumps are powered on and not connected to the Jebao app.\n");
  let pumps = scan_for_pumps(&adapter, duration)
    .await
    .map_err(|err| BridgeError::BleUnavailable(err.to_string()))?;
  if pumps.is_empty() {
    println!("No Jebao pumps found. Try a longer scan with --scan-duration 30.");
    return Ok(());
  }
  println!("Found {} pump(s):\n", pumps.len());
  for pump in &pumps {
    match pump.rssi {
      Some(rssi) => println!("  {}  {:>4} dBm  {}", pump.address, rssi, pump.name),
      None => println!("  {}             {}", pump.address, pump.name),
    }
  }
  println!("\nAdd to your config.yaml:\n");
  println!("pumps:");
  for (index, pump) in pumps.iter().enumerate() {
    println!("  - name: \"Wavemaker {}\"", index + 1);
    println!("    mac: \"{}\"", pump.address);
    if index + 1 < pumps.len() {
      println!();
    }
  }
  Ok(())
}

async fn run_bridge(config: BridgeConfig) -> Result<(), BridgeError> {
  let ble_adapter = bluetooth_adapter().await?;

  let (pump_event_sender, pump_event_receiver) = mpsc::channel(256);
  let (broker_event_sender, broker_event_receiver) = mpsc::channel(64);

  let sessions = build_sessions(config.pumps, &ble_adapter, pump_event_sender)?;
  let pump_ids = sessions
    .iter()
    .map(|session| session.config().id().to_owned())
    .collect();
  let adapter = Arc::new(MqttAdapter::new(config.mqtt, pump_ids, broker_event_sender));
  let supervisor = PumpSupervisor::new(sessions, adapter, pump_event_receiver, broker_event_receiver);

  let cancel = CancellationToken::new();
  let signal_cancel = cancel.clone();
  tokio::spawn(async move {
    shutdown_signal().await;
    info!("Shutdown signal received, stopping bridge.");
    signal_cancel.cancel();
  });

  supervisor.run(cancel).await
}

async fn shutdown_signal() {
  #[cfg(unix)]
  {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
      Ok(term) => term,
      Err(err) => {
        error!("Cannot listen for SIGTERM: {}", err);
        let _ = tokio::signal::ctrl_c().await;
        return;
      }
    };
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {}
      _ = term.recv() => {}
    }
  }
  #[cfg(not(unix))]
  {
    let _ = tokio::signal::ctrl_c().await;
  }
}

#[tokio::main]
async fn main() {
  let args: CliArguments = argh::from_env();
  if args.version {
    println!("jebao-mqtt-bridge {}", VERSION);
    return;
  }

  setup_console_logging(args.log);

  if args.scan {
    if let Err(err) = run_scan(Duration::from_secs(args.scan_duration)).await {
      error!("Scan failed: {}", err);
      std::process::exit(1);
    }
    return;
  }

  let path = Path::new(&args.config);
  if !path.exists() {
    error!("Config file not found: {}", path.display());
    info!("Creating example config file...");
    match config::write_example(path) {
      Ok(()) => {
        info!("Example config written to {}", path.display());
        info!("Please edit the config file and restart");
      }
      Err(err) => error!("Could not write example config: {}", err),
    }
    std::process::exit(1);
  }

  let config = match BridgeConfig::load(path) {
    Ok(config) => config,
    Err(err) => {
      error!("{}", err);
      std::process::exit(1);
    }
  };

  if let Err(err) = run_bridge(config).await {
    error!("Bridge error: {}", err);
    std::process::exit(1);
  }
}
