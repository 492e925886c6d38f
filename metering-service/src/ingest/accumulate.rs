//! Turns a provider status into a `Reading`, deriving cumulative counters
//! from the previous reading when the device does not report a usable one.

use metering_client::domain::{DataPoint, MeterDevice, MeterKind, Reading};
use time::OffsetDateTime;

use super::mapping::{lookup, Lookup};
use crate::gateway::DeviceStatus;

/// Upper bound on the elapsed time credited to one power sample.
pub const MAX_DERIVATION_HOURS: f64 = 2.0;

/// Cumulative kWh after a power sample of `power_w` taken at `at`.
///
/// Elapsed time since the previous counter is capped so a stale previous
/// reading cannot inject an unbounded jump.
pub fn derive_energy(previous: Option<(f64, OffsetDateTime)>, power_w: f64, at: OffsetDateTime) -> f64 {
    let Some((prev_kwh, prev_at)) = previous else {
        return 0.0;
    };
    let hours = ((at - prev_at).as_seconds_f64() / 3600.0).clamp(0.0, MAX_DERIVATION_HOURS);
    (prev_kwh + power_w.max(0.0) / 1000.0 * hours).max(0.0)
}

/// Liters a session counter advanced by since the previous poll.
///
/// A session value lower than the previous one means a new session started.
pub fn session_delta(previous_session: Option<f64>, session: f64) -> f64 {
    match previous_session {
        Some(prev) if session >= prev => session - prev,
        _ => session.max(0.0),
    }
}

/// Cumulative liters given the absolute total and the session counter.
pub fn accumulate_liters(
    previous_total: Option<f64>,
    previous_session: Option<f64>,
    total: Option<f64>,
    session: Option<f64>,
) -> Option<f64> {
    match (total, previous_total, session) {
        (Some(total), None, _) => Some(total),
        (Some(total), Some(prev), _) if total >= prev => Some(total),
        (Some(_), Some(prev), Some(session)) => Some(prev + session_delta(previous_session, session)),
        // Went backwards with nothing to reconcile against: keep what the device says.
        (Some(total), Some(_), None) => Some(total),
        (None, prev, Some(session)) => Some(prev.unwrap_or(0.0) + session_delta(previous_session, session)),
        (None, _, None) => None,
    }
}

/// Builds the reading for one successful poll.
///
/// `previous` is the device's latest stored reading carrying a counter.
pub fn build_reading(
    device: &MeterDevice,
    status: &DeviceStatus,
    previous: Option<&Reading>,
    at: OffsetDateTime,
) -> Reading {
    let mut reading = Reading::blank(&device.device_id, &device.room_number, device.building_id, device.kind, at);
    let map = &device.dp_map;
    let value = |point| lookup(map, status, point).value();

    match device.kind {
        MeterKind::Electric => {
            reading.power_w = value(DataPoint::Power);
            reading.voltage_v = value(DataPoint::Voltage);
            reading.current_a = value(DataPoint::Current);

            let reported = match lookup(map, status, DataPoint::Energy) {
                Lookup::Found { value, .. } if map.energy_cumulative => Some(value),
                _ => None,
            };
            reading.energy_kwh = match (reported, reading.power_w) {
                (Some(kwh), _) => Some(kwh),
                (None, Some(power)) => {
                    let prev = previous.and_then(|p| p.energy_kwh.map(|kwh| (kwh, p.at)));
                    Some(derive_energy(prev, power, at))
                }
                (None, None) => None,
            };
        }
        MeterKind::Water => {
            let session = value(DataPoint::OnceLiters);
            reading.flow_lpm = value(DataPoint::Flow);
            reading.battery_pct = value(DataPoint::Battery);
            reading.session_liters = session;
            reading.total_liters = accumulate_liters(
                previous.and_then(|p| p.total_liters),
                previous.and_then(|p| p.session_liters),
                value(DataPoint::Liters),
                session,
            );
        }
    }

    reading.raw = serde_json::to_value(status).ok();
    reading
}

#[cfg(test)]
mod tests {
    use super::*;
    use metering_client::domain::DataPointMap;
    use serde_json::json;
    use time::macros::datetime;

    fn device(kind: MeterKind, dp_map: DataPointMap) -> MeterDevice {
        MeterDevice {
            device_id: "dev-1".to_string(),
            room_number: "101".to_string(),
            building_id: 1,
            kind,
            active: true,
            created_at: datetime!(2024-01-01 00:00 UTC),
            dp_map,
        }
    }

    fn status(v: serde_json::Value) -> DeviceStatus {
        v.as_object().unwrap().clone().into_iter().collect()
    }

    #[test]
    fn derived_energy_caps_elapsed_time() {
        let prev = Some((10.0, datetime!(2024-05-01 00:00 UTC)));
        let one_hour = derive_energy(prev, 1000.0, datetime!(2024-05-01 01:00 UTC));
        assert!((one_hour - 11.0).abs() < 1e-9);

        // A day-old previous reading still only credits two hours.
        let stale = derive_energy(prev, 1000.0, datetime!(2024-05-02 00:00 UTC));
        assert!((stale - 12.0).abs() < 1e-9);
    }

    #[test]
    fn derived_energy_ignores_clock_skew_and_starts_at_zero() {
        let prev = Some((10.0, datetime!(2024-05-01 02:00 UTC)));
        assert_eq!(derive_energy(prev, 500.0, datetime!(2024-05-01 01:00 UTC)), 10.0);
        assert_eq!(derive_energy(None, 500.0, datetime!(2024-05-01 01:00 UTC)), 0.0);
    }

    #[test]
    fn water_prefers_consistent_total() {
        assert_eq!(accumulate_liters(Some(100.0), Some(3.0), Some(120.0), Some(5.0)), Some(120.0));
        assert_eq!(accumulate_liters(None, None, Some(80.0), None), Some(80.0));
    }

    #[test]
    fn water_uses_session_delta_when_total_goes_backwards() {
        // Total reset to 2, session advanced 3 -> 5.
        assert_eq!(accumulate_liters(Some(100.0), Some(3.0), Some(2.0), Some(5.0)), Some(102.0));
        // New session started: the whole session value counts.
        assert_eq!(accumulate_liters(Some(100.0), Some(8.0), Some(2.0), Some(1.5)), Some(101.5));
    }

    #[test]
    fn water_without_total_accumulates_sessions() {
        assert_eq!(accumulate_liters(Some(50.0), Some(4.0), None, Some(10.0)), Some(56.0));
        assert_eq!(accumulate_liters(None, None, None, Some(10.0)), Some(10.0));
        assert_eq!(accumulate_liters(Some(50.0), None, None, None), None);
    }

    #[test]
    fn electric_reading_uses_trusted_energy_code() {
        let dev = device(MeterKind::Electric, DataPointMap::default());
        let st = status(json!({ "add_ele": 12.5, "cur_power": 300, "cur_voltage": 221, "cur_current": 1.4 }));
        let r = build_reading(&dev, &st, None, datetime!(2024-05-01 00:00 UTC));
        assert_eq!(r.energy_kwh, Some(12.5));
        assert_eq!(r.power_w, Some(300.0));
        assert_eq!(r.voltage_v, Some(221.0));
        assert_eq!(r.current_a, Some(1.4));
        assert_eq!(r.raw.as_ref().unwrap()["add_ele"], json!(12.5));
    }

    #[test]
    fn electric_reading_derives_energy_when_code_untrusted() {
        let map = DataPointMap {
            energy_cumulative: false,
            ..DataPointMap::default()
        };
        let dev = device(MeterKind::Electric, map);
        let mut prev = Reading::blank("dev-1", "101", 1, MeterKind::Electric, datetime!(2024-05-01 00:00 UTC));
        prev.energy_kwh = Some(20.0);

        let st = status(json!({ "add_ele": 999, "cur_power": 2000 }));
        let r = build_reading(&dev, &st, Some(&prev), datetime!(2024-05-01 00:30 UTC));
        assert!((r.energy_kwh.unwrap() - 21.0).abs() < 1e-9);
    }

    #[test]
    fn water_reading_maps_fields() {
        let dev = device(MeterKind::Water, DataPointMap::default());
        let mut prev = Reading::blank("dev-1", "101", 1, MeterKind::Water, datetime!(2024-05-01 00:00 UTC));
        prev.total_liters = Some(300.0);
        prev.session_liters = Some(2.0);

        let st = status(json!({ "water_total": 10, "water_once": 6, "instantaneous_flow": 1.5, "battery_percentage": 80 }));
        let r = build_reading(&dev, &st, Some(&prev), datetime!(2024-05-01 00:10 UTC));
        assert_eq!(r.total_liters, Some(304.0));
        assert_eq!(r.session_liters, Some(6.0));
        assert_eq!(r.flow_lpm, Some(1.5));
        assert_eq!(r.battery_pct, Some(80.0));
        assert_eq!(r.energy_kwh, None);
    }
}
