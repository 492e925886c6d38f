//! Prepaid credit checks run after a poll.
//!
//! Electric meters with a credit account alert their tenant when the balance
//! falls to the low or critical threshold, and get their relay switched off
//! once it is used up. Vacant rooms are never alerted.

use std::collections::{HashMap, HashSet};

use metering_client::domain::{AlertLevel, CreditAccount, MeterDevice};
use time::{Duration, OffsetDateTime};

use super::{switch_relay, DeviceFailure};
use crate::{
    gateway::DeviceGateway,
    store::{CreditLedger, DeviceDirectory, StoreError},
};

/// Minimum gap between two alerts of the same level.
pub fn renotify_after(level: AlertLevel) -> Duration {
    match level {
        AlertLevel::Low => Duration::hours(12),
        AlertLevel::Critical => Duration::hours(6),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditActions {
    pub alerts: Vec<AlertLevel>,
    pub cut: bool,
}

/// What an account calls for at `now`.
pub fn plan(account: &CreditAccount, occupied: bool, now: OffsetDateTime) -> CreditActions {
    let alerts = AlertLevel::ALL
        .into_iter()
        .filter(|&level| {
            occupied
                && account.credit_kwh <= account.threshold(level)
                && account
                    .last_notified_at(level)
                    .map_or(true, |last| now - last > renotify_after(level))
        })
        .collect();

    CreditActions {
        alerts,
        cut: account.credit_kwh <= 0.0 && !account.is_cut,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreditTally {
    pub cut: usize,
    pub low_noti: usize,
    pub critical_noti: usize,
    pub errors: Vec<DeviceFailure>,
}

impl CreditTally {
    fn fail(&mut self, device: &MeterDevice, error: impl ToString) {
        self.errors.push(DeviceFailure {
            device_id: device.device_id.clone(),
            room_number: Some(device.room_number.clone()),
            error: error.to_string(),
        });
    }
}

/// Applies [`plan`] to each device. In dry run nothing is sent or recorded;
/// `cut` then counts the relays that would have been switched off.
pub async fn enforce<S>(
    store: &S,
    gateway: &dyn DeviceGateway,
    devices: &[MeterDevice],
    dry_run: bool,
    now: OffsetDateTime,
) -> CreditTally
where
    S: DeviceDirectory + CreditLedger + ?Sized,
{
    let mut tally = CreditTally::default();
    let mut occupancy: HashMap<i32, HashSet<String>> = HashMap::new();

    for device in devices {
        let account = match store.credit_account(&device.device_id).await {
            Ok(Some(account)) => account,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(device_id = %device.device_id, error = %e, "credit lookup failed");
                tally.fail(device, e);
                continue;
            }
        };

        if !occupancy.contains_key(&device.building_id) {
            match occupied_now(store, device.building_id, now).await {
                Ok(rooms) => {
                    occupancy.insert(device.building_id, rooms);
                }
                Err(e) => {
                    tracing::warn!(building_id = device.building_id, error = %e, "occupancy lookup failed");
                    tally.fail(device, e);
                    continue;
                }
            }
        }
        let occupied = occupancy
            .get(&device.building_id)
            .is_some_and(|rooms| rooms.contains(&device.room_number));

        let actions = plan(&account, occupied, now);

        if !dry_run {
            for level in actions.alerts {
                tracing::warn!(
                    device_id = %device.device_id,
                    building_id = device.building_id,
                    room = %device.room_number,
                    level = level.as_str(),
                    credit_kwh = account.credit_kwh,
                    "prepaid credit running out"
                );
                if let Err(e) = store.record_alert(&device.device_id, level, now).await {
                    tally.fail(device, e);
                    continue;
                }
                metrics::counter!("credit_alerts_total", "level" => level.as_str()).increment(1);
                match level {
                    AlertLevel::Low => tally.low_noti += 1,
                    AlertLevel::Critical => tally.critical_noti += 1,
                }
            }
        }

        if !actions.cut {
            continue;
        }
        if dry_run {
            tracing::info!(device_id = %device.device_id, room = %device.room_number, "credit exhausted, relay would be cut");
            tally.cut += 1;
            continue;
        }
        match switch_relay(gateway, device, false).await {
            Ok(outcome) if outcome.accepted => {
                if let Err(e) = store.record_cut(&device.device_id, now).await {
                    tally.fail(device, e);
                    continue;
                }
                tracing::warn!(device_id = %device.device_id, room = %device.room_number, "credit exhausted, relay cut");
                metrics::counter!("relay_cuts_total").increment(1);
                tally.cut += 1;
            }
            Ok(_) => tally.fail(device, "relay cut not applied by device"),
            Err(e) => tally.fail(device, e),
        }
    }

    tally
}

async fn occupied_now<S>(store: &S, building_id: i32, now: OffsetDateTime) -> Result<HashSet<String>, StoreError>
where
    S: DeviceDirectory + ?Sized,
{
    let rooms = store
        .occupied_rooms(building_id, now, now + Duration::seconds(1))
        .await?;
    Ok(rooms.into_iter().collect())
}
