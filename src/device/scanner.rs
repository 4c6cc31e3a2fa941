// Jebao MQTT Bridge Source Code File - See README.md for more info.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project
// root for full license information.

//! One-shot scan for advertising pumps, backing the `--scan` flag.

use crate::core::errors::PumpDeviceError;
use crate::device::hardware::is_pump_advertisement;
use btleplug::api::{BDAddr, Central, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct DiscoveredPump {
  pub address: BDAddr,
  pub name: String,
  pub rssi: Option<i16>,
}

/// Scan for `duration` and return matching devices, strongest signal first.
/// Pumps only accept one central at a time, so anything paired to the vendor
/// app will not show up here.
pub async fn scan_for_pumps(
  adapter: &Adapter,
  duration: Duration,
) -> Result<Vec<DiscoveredPump>, PumpDeviceError> {
  adapter
    .start_scan(ScanFilter::default())
    .await
    .map_err(|err| PumpDeviceError::BleTransport(format!("{:?}", err)))?;
  sleep(duration).await;
  let _ = adapter.stop_scan().await;

  let mut found = Vec::new();
  for peripheral in adapter
    .peripherals()
    .await
    .map_err(|err| PumpDeviceError::BleTransport(format!("{:?}", err)))?
  {
    let Ok(Some(properties)) = peripheral.properties().await else {
      continue;
    };
    let name = properties.local_name.clone().unwrap_or_default();
    if is_pump_advertisement(&name, &properties.services) {
      found.push(DiscoveredPump {
        address: properties.address,
        name,
        rssi: properties.rssi,
      });
    }
  }
  found.sort_by_key(|pump| std::cmp::Reverse(pump.rssi.unwrap_or(i16::MIN)));
  Ok(found)
}
