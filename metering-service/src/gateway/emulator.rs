use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;

use super::{DeviceGateway, DeviceStatus, GatewayError};

/// Stand-in provider for local runs without cloud credentials.
///
/// Counters grow with wall-clock time so consecutive polls produce usable
/// deltas. Relay commands are remembered per device and echoed in status.
#[derive(Default)]
pub struct EmulatedGateway {
    relays: Mutex<HashMap<String, bool>>,
}

impl EmulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status the emulator reports at `now` for a device whose relay is `relay_on`.
    pub fn status_at(now: OffsetDateTime, relay_on: bool) -> DeviceStatus {
        let millis = (now.unix_timestamp_nanos() / 1_000_000) as i64;
        let secs = millis.div_euclid(1000);
        let power = 200 + millis.rem_euclid(150);
        let current = ((power as f64 / 220.0) * 100.0).round() / 100.0;

        let mut status = DeviceStatus::new();
        status.insert("switch_1".to_string(), json!(relay_on));
        status.insert("add_ele".to_string(), json!((secs.rem_euclid(100_000)) as f64 / 50.0));
        status.insert("cur_power".to_string(), json!(power));
        status.insert("cur_voltage".to_string(), json!(220));
        status.insert("cur_current".to_string(), json!(current));
        status.insert("water_total".to_string(), json!((secs.rem_euclid(1_000_000)) as f64 / 10.0));
        status.insert("instantaneous_flow".to_string(), json!((millis.rem_euclid(60)) as f64 / 10.0));
        status.insert("battery_percentage".to_string(), json!(95));
        status
    }
}

#[async_trait]
impl DeviceGateway for EmulatedGateway {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, GatewayError> {
        let relay_on = self
            .relays
            .lock()
            .map(|r| r.get(device_id).copied().unwrap_or(true))
            .unwrap_or(true);
        Ok(Self::status_at(OffsetDateTime::now_utc(), relay_on))
    }

    async fn send_command(
        &self,
        device_id: &str,
        code: &str,
        value: serde_json::Value,
    ) -> Result<bool, GatewayError> {
        let Some(on) = value.as_bool() else {
            return Err(GatewayError::InvalidResponse(format!("emulator only accepts boolean commands, got {value}")));
        };
        tracing::info!(device_id, code, on, "emulated command");
        if let Ok(mut relays) = self.relays.lock() {
            relays.insert(device_id.to_string(), on);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn counters_grow_between_polls() {
        let a = EmulatedGateway::status_at(datetime!(2024-05-01 00:00:00 UTC), true);
        let b = EmulatedGateway::status_at(datetime!(2024-05-01 00:10:00 UTC), true);
        assert!(b["add_ele"].as_f64().unwrap() > a["add_ele"].as_f64().unwrap());
        assert!(b["water_total"].as_f64().unwrap() > a["water_total"].as_f64().unwrap());
        assert_eq!(a["cur_voltage"], json!(220));
    }

    #[tokio::test]
    async fn relay_commands_are_reflected_in_status() {
        let gw = EmulatedGateway::new();
        assert_eq!(gw.device_status("d1").await.unwrap()["switch_1"], json!(true));

        assert!(gw.send_command("d1", "switch_1", json!(false)).await.unwrap());
        assert_eq!(gw.device_status("d1").await.unwrap()["switch_1"], json!(false));
        assert_eq!(gw.device_status("d2").await.unwrap()["switch_1"], json!(true));
    }
}
