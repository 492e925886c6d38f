use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{DeviceGateway, DeviceStatus, GatewayError};

#[derive(Clone)]
struct Script {
    status: Result<DeviceStatus, GatewayError>,
    delay: Duration,
}

/// Test gateway with canned per-device responses and in-flight accounting.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<String, Script>>,
    commands: Mutex<Vec<(String, String, serde_json::Value)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, device_id: &str, status: serde_json::Value) -> &Self {
        self.script(device_id, Ok(to_status(status)), Duration::ZERO)
    }

    pub fn respond_after(&self, device_id: &str, status: serde_json::Value, delay: Duration) -> &Self {
        self.script(device_id, Ok(to_status(status)), delay)
    }

    pub fn fail(&self, device_id: &str, error: GatewayError) -> &Self {
        self.script(device_id, Err(error), Duration::ZERO)
    }

    fn script(&self, device_id: &str, status: Result<DeviceStatus, GatewayError>, delay: Duration) -> &Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(device_id.to_string(), Script { status, delay });
        self
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<(String, String, serde_json::Value)> {
        self.commands.lock().unwrap().clone()
    }
}

/// Decrements the in-flight count even when the call is cancelled by a timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn to_status(value: serde_json::Value) -> DeviceStatus {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => DeviceStatus::new(),
    }
}

#[async_trait]
impl DeviceGateway for ScriptedGateway {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let script = self.scripts.lock().unwrap().get(device_id).cloned();
        match script {
            Some(script) => {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                script.status
            }
            None => Err(GatewayError::Provider {
                code: "2001".to_string(),
                message: format!("device {device_id} offline"),
            }),
        }
    }

    async fn send_command(
        &self,
        device_id: &str,
        code: &str,
        value: serde_json::Value,
    ) -> Result<bool, GatewayError> {
        self.commands
            .lock()
            .unwrap()
            .push((device_id.to_string(), code.to_string(), value));
        Ok(true)
    }
}
