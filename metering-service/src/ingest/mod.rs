//! Device poll & ingest: gateway status -> mapped `Reading` -> store.
//!
//! Each run is a [`Pipeline`] of [`DevicePollSource`] -> [`ReadingValidation`]
//! -> [`ReadingStoreSink`], followed by the prepaid [`credit`] checks for the
//! electric meters that reported. Per-device failures end up in the returned
//! [`PollSummary`]; they never abort the batch.

use std::{collections::HashMap, sync::Arc, time::Duration};

use metering_client::domain::{MeterDevice, MeterKind, Reading};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    gateway::{DeviceGateway, GatewayError},
    pipeline::Pipeline,
    sinks::ReadingStoreSink,
    sources::DevicePollSource,
    store::{CreditLedger, DeviceDirectory, ReadingStore, StoreError},
    transform::ReadingValidation,
};

pub mod accumulate;
pub mod credit;
pub mod mapping;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub parallel: usize,
    pub device_timeout: Duration,
    pub dry_run: bool,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            parallel: 3,
            device_timeout: Duration::from_secs(10),
            dry_run: false,
            batch_size: 50,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFailure {
    pub device_id: String,
    pub room_number: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub scanned: usize,
    pub updated: usize,
    pub failed: usize,
    /// Relays switched off for exhausted credit (would-be cuts in dry run).
    pub cut: usize,
    pub low_noti: usize,
    pub critical_noti: usize,
    pub errors: Vec<DeviceFailure>,
}

impl PollSummary {
    pub fn merge(&mut self, other: PollSummary) {
        self.scanned += other.scanned;
        self.updated += other.updated;
        self.failed += other.failed;
        self.cut += other.cut;
        self.low_noti += other.low_noti;
        self.critical_noti += other.critical_noti;
        self.errors.extend(other.errors);
    }
}

/// Polls `devices` once, appends one reading per successful poll, then runs
/// the credit checks on the electric meters that reported.
pub async fn poll_devices<R>(
    store: Arc<R>,
    gateway: Arc<dyn DeviceGateway>,
    devices: Vec<MeterDevice>,
    settings: &PollSettings,
) -> PollSummary
where
    R: ReadingStore + DeviceDirectory + CreditLedger + ?Sized + 'static,
{
    let scanned = devices.len();
    if scanned == 0 {
        return PollSummary::default();
    }
    let rooms: HashMap<String, String> = devices
        .iter()
        .map(|d| (d.device_id.clone(), d.room_number.clone()))
        .collect();
    let electric: Vec<MeterDevice> = devices
        .iter()
        .filter(|d| d.kind == MeterKind::Electric)
        .cloned()
        .collect();

    let sink = ReadingStoreSink::new(store.clone(), settings.batch_size, settings.max_retries, settings.retry_backoff)
        .dry_run(settings.dry_run);
    let tally = sink.tally();

    let pipeline: Pipeline<_, Reading, _> = Pipeline {
        source: DevicePollSource::new(devices, gateway.clone(), store.clone(), settings.parallel, settings.device_timeout),
        transforms: vec![Arc::new(ReadingValidation)],
        sink,
    };

    let mut errors = Vec::new();
    if let Err(e) = pipeline.run().await {
        tracing::error!(error = %e, "ingest pipeline aborted");
        errors.push(DeviceFailure {
            device_id: e.device_id().unwrap_or_default().to_string(),
            room_number: None,
            error: e.to_string(),
        });
    }

    let tally = tally.lock().await;
    errors.extend(tally.failed.iter().map(|(device_id, error)| DeviceFailure {
        device_id: device_id.clone(),
        room_number: rooms.get(device_id).cloned(),
        error: error.clone(),
    }));
    errors.extend(tally.unattributed.iter().map(|error| DeviceFailure {
        device_id: String::new(),
        room_number: None,
        error: error.clone(),
    }));
    let updated = tally.stored.len();
    let reported: Vec<MeterDevice> = electric
        .into_iter()
        .filter(|d| tally.stored.contains(&d.device_id))
        .collect();
    drop(tally);

    let credit = credit::enforce(
        store.as_ref(),
        gateway.as_ref(),
        &reported,
        settings.dry_run,
        OffsetDateTime::now_utc(),
    )
    .await;
    errors.extend(credit.errors);

    PollSummary {
        scanned,
        updated,
        failed: errors.len(),
        cut: credit.cut,
        low_noti: credit.low_noti,
        critical_noti: credit.critical_noti,
        errors,
    }
}

/// Polls every active device of a building.
pub async fn poll_building<S>(
    store: Arc<S>,
    gateway: Arc<dyn DeviceGateway>,
    building_id: i32,
    settings: &PollSettings,
) -> Result<PollSummary, StoreError>
where
    S: ReadingStore + DeviceDirectory + CreditLedger + ?Sized + 'static,
{
    let devices = store.active_devices(building_id).await?;
    tracing::debug!(building_id, devices = devices.len(), "polling building");
    Ok(poll_devices(store, gateway, devices, settings).await)
}

/// On-demand poll of one room's active devices (electric and water).
pub async fn poll_room<S>(
    store: Arc<S>,
    gateway: Arc<dyn DeviceGateway>,
    building_id: i32,
    room_number: &str,
    settings: &PollSettings,
) -> Result<PollSummary, StoreError>
where
    S: ReadingStore + DeviceDirectory + CreditLedger + ?Sized + 'static,
{
    let mut devices = Vec::new();
    for kind in MeterKind::ALL {
        if let Some(device) = store.room_device(building_id, room_number, kind).await? {
            devices.push(device);
        }
    }
    Ok(poll_devices(store, gateway, devices, settings).await)
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("room {0} has no active electric meter")]
    NoDevice(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayOutcome {
    pub device_id: String,
    pub code: String,
    pub on: bool,
    pub accepted: bool,
}

/// Switches the relay of a room's electric meter. The device row is left untouched.
pub async fn set_relay<S>(
    store: &S,
    gateway: &dyn DeviceGateway,
    building_id: i32,
    room_number: &str,
    on: bool,
) -> Result<RelayOutcome, RelayError>
where
    S: DeviceDirectory + ?Sized,
{
    let device = store
        .room_device(building_id, room_number, MeterKind::Electric)
        .await?
        .ok_or_else(|| RelayError::NoDevice(room_number.to_string()))?;
    Ok(switch_relay(gateway, &device, on).await?)
}

/// Sends the relay command for `device` using its mapped relay code.
pub async fn switch_relay(gateway: &dyn DeviceGateway, device: &MeterDevice, on: bool) -> Result<RelayOutcome, GatewayError> {
    let code = mapping::relay_code(&device.dp_map).to_string();
    let accepted = gateway
        .send_command(&device.device_id, &code, serde_json::Value::Bool(on))
        .await?;
    tracing::info!(
        building_id = device.building_id,
        room = %device.room_number,
        device_id = %device.device_id,
        on,
        accepted,
        "relay command sent"
    );

    Ok(RelayOutcome {
        device_id: device.device_id.clone(),
        code,
        on,
        accepted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gateway::scripted::ScriptedGateway, store::MemoryStore};
    use metering_client::domain::{CreditAccount, DataPointMap};
    use serde_json::json;
    use time::macros::datetime;

    fn device(id: &str, room: &str, kind: MeterKind) -> MeterDevice {
        MeterDevice {
            device_id: id.to_string(),
            room_number: room.to_string(),
            building_id: 7,
            kind,
            active: true,
            created_at: datetime!(2024-01-01 00:00 UTC),
            dp_map: DataPointMap::default(),
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            parallel: 2,
            device_timeout: Duration::from_secs(1),
            ..PollSettings::default()
        }
    }

    #[tokio::test]
    async fn poll_building_appends_one_reading_per_successful_device() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        store.add_device(device("w1", "101", MeterKind::Water));
        store.add_device(device("e2", "102", MeterKind::Electric));
        let mut inactive = device("e3", "103", MeterKind::Electric);
        inactive.active = false;
        store.add_device(inactive);

        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 10.5, "cur_power": 120 }));
        gateway.respond("w1", json!({ "water_total": 3200, "instantaneous_flow": 0 }));
        gateway.fail(
            "e2",
            GatewayError::Provider {
                code: "2001".to_string(),
                message: "device offline".to_string(),
            },
        );

        let summary = poll_building(store.clone(), gateway.clone(), 7, &settings()).await.unwrap();

        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.updated, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].device_id, "e2");
        assert_eq!(summary.errors[0].room_number.as_deref(), Some("102"));
        assert!(summary.errors[0].error.contains("device offline"));

        let readings = store.readings();
        assert_eq!(readings.len(), 2);
        let water = readings.iter().find(|r| r.device_id == "w1").unwrap();
        assert_eq!(water.total_liters, Some(3200.0));
        assert_eq!(water.room_number, "101");
        assert_eq!(gateway.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_readings_are_reported_not_stored() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": -4.0 }));

        let summary = poll_building(store.clone(), gateway, 7, &settings()).await.unwrap();

        assert_eq!(summary.updated, 0);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].error.contains("rejected"));
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn dry_run_polls_but_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 1.0 }));

        let settings = PollSettings {
            dry_run: true,
            ..settings()
        };
        let summary = poll_building(store.clone(), gateway, 7, &settings).await.unwrap();

        assert_eq!(summary.updated, 1);
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn poll_room_only_touches_that_room() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        store.add_device(device("e2", "102", MeterKind::Electric));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 1.0 }));
        gateway.respond("e2", json!({ "add_ele": 2.0 }));

        let summary = poll_room(store.clone(), gateway.clone(), 7, "101", &settings()).await.unwrap();

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(gateway.calls(), 1);
        assert_eq!(store.readings()[0].device_id, "e1");
    }

    #[tokio::test]
    async fn set_relay_uses_mapped_code() {
        let store = MemoryStore::new();
        let mut dev = device("e1", "101", MeterKind::Electric);
        dev.dp_map = DataPointMap::default().with_code(metering_client::domain::DataPoint::Relay, "switch", 1.0);
        store.add_device(dev);
        let gateway = ScriptedGateway::new();

        let outcome = set_relay(&store, &gateway, 7, "101", false).await.unwrap();
        assert_eq!(outcome.code, "switch");
        assert!(outcome.accepted);
        assert_eq!(gateway.commands(), vec![("e1".to_string(), "switch".to_string(), json!(false))]);

        let missing = set_relay(&store, &gateway, 7, "999", true).await;
        assert!(matches!(missing, Err(RelayError::NoDevice(_))));
    }

    fn prepaid_room(credit_kwh: f64) -> (Arc<MemoryStore>, Arc<ScriptedGateway>) {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        store.add_occupied_room(7, "101");
        store.set_credit(CreditAccount::new("e1", credit_kwh));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 88.0 }));
        (store, gateway)
    }

    #[tokio::test]
    async fn exhausted_credit_alerts_and_cuts_once() {
        let (store, gateway) = prepaid_room(-0.2);

        let first = poll_building(store.clone(), gateway.clone(), 7, &settings()).await.unwrap();
        assert_eq!(first.updated, 1);
        assert_eq!((first.cut, first.low_noti, first.critical_noti), (1, 1, 1));
        assert_eq!(gateway.commands(), vec![("e1".to_string(), "switch_1".to_string(), json!(false))]);

        let account = store.credit("e1").unwrap();
        assert!(account.is_cut);
        assert!(account.last_cut_at.is_some());
        assert!(account.last_low_notified_at.is_some());
        assert!(account.last_critical_notified_at.is_some());

        let second = poll_building(store.clone(), gateway.clone(), 7, &settings()).await.unwrap();
        assert_eq!((second.cut, second.low_noti, second.critical_noti), (0, 0, 0));
        assert_eq!(gateway.commands().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_counts_cut_without_switching_or_alerting() {
        let (store, gateway) = prepaid_room(0.0);
        let settings = PollSettings {
            dry_run: true,
            ..settings()
        };

        let summary = poll_building(store.clone(), gateway.clone(), 7, &settings).await.unwrap();

        assert_eq!(summary.cut, 1);
        assert_eq!((summary.low_noti, summary.critical_noti), (0, 0));
        assert!(gateway.commands().is_empty());
        assert_eq!(store.credit("e1").unwrap(), CreditAccount::new("e1", 0.0));
        assert!(store.readings().is_empty());
    }

    #[tokio::test]
    async fn low_credit_in_vacant_room_is_not_alerted() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        store.add_room(7, "101");
        store.set_credit(CreditAccount::new("e1", 1.5));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 88.0 }));

        let summary = poll_building(store.clone(), gateway.clone(), 7, &settings()).await.unwrap();

        assert_eq!((summary.cut, summary.low_noti, summary.critical_noti), (0, 0, 0));
        assert_eq!(store.credit("e1").unwrap().last_low_notified_at, None);
    }

    #[tokio::test]
    async fn only_reporting_prepaid_meters_are_checked() {
        let store = Arc::new(MemoryStore::new());
        store.add_device(device("e1", "101", MeterKind::Electric));
        store.add_device(device("e2", "102", MeterKind::Electric));
        store.add_device(device("w1", "101", MeterKind::Water));
        store.add_occupied_room(7, "101");
        store.add_occupied_room(7, "102");
        store.set_credit(CreditAccount::new("e2", 0.0));
        store.set_credit(CreditAccount::new("w1", 0.0));
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.respond("e1", json!({ "add_ele": 1.0 }));
        gateway.respond("w1", json!({ "water_total": 10 }));

        let summary = poll_building(store.clone(), gateway.clone(), 7, &settings()).await.unwrap();

        assert_eq!(summary.updated, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cut, 0);
        assert!(gateway.commands().is_empty());
        assert!(!store.credit("e2").unwrap().is_cut);
    }

    #[test]
    fn summary_serializes_credit_counters() {
        let summary = PollSummary {
            cut: 1,
            low_noti: 2,
            critical_noti: 3,
            ..PollSummary::default()
        };
        let body = serde_json::to_value(&summary).unwrap();
        assert_eq!(body["cut"], 1);
        assert_eq!(body["lowNoti"], 2);
        assert_eq!(body["criticalNoti"], 3);
    }
}
