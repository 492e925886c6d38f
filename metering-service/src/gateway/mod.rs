//! IoT provider boundary.
//!
//! A gateway returns a device's current status as a flat `code -> value`
//! map and can send single-code commands (relay on/off). Mapping codes to
//! meter fields happens in `ingest::mapping`, not here.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

pub mod emulator;
#[cfg(test)]
pub mod scripted;
pub mod tuya;

pub use emulator::EmulatedGateway;
pub use tuya::TuyaGateway;

use crate::config::TuyaConfig;

/// Flat provider status: data-point code to raw JSON value.
pub type DeviceStatus = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GatewayError {
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("provider returned {code}: {message}")]
    Provider { code: String, message: String },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("gateway misconfigured: {0}")]
    Config(String),
    #[error("device call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, GatewayError>;

    /// Sends one command; `Ok(false)` means the provider accepted the call but
    /// reported the command as not applied.
    async fn send_command(
        &self,
        device_id: &str,
        code: &str,
        value: serde_json::Value,
    ) -> Result<bool, GatewayError>;
}

/// Tuya client, or the emulator when `tuya.emulator` is set.
pub fn from_config(cfg: &TuyaConfig) -> Result<Arc<dyn DeviceGateway>, GatewayError> {
    if cfg.emulator {
        tracing::warn!("using emulated device gateway");
        return Ok(Arc::new(EmulatedGateway::new()));
    }
    let gateway = TuyaGateway::new(
        &cfg.base_url,
        &cfg.access_id,
        &cfg.access_secret,
        Duration::from_millis(cfg.request_timeout_ms),
    )?;
    Ok(Arc::new(gateway))
}
