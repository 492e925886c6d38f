use time::OffsetDateTime;

use super::MeterKind;

/// One immutable meter sample.
///
/// Electric readings use `energy_kwh`/`power_w`/`voltage_v`/`current_a`;
/// water readings use `total_liters`/`session_liters`/`flow_lpm`/`battery_pct`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub room_number: String,
    pub building_id: i32,
    pub at: OffsetDateTime,
    pub kind: MeterKind,
    pub energy_kwh: Option<f64>,
    pub power_w: Option<f64>,
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub total_liters: Option<f64>,
    pub session_liters: Option<f64>,
    pub flow_lpm: Option<f64>,
    pub battery_pct: Option<f64>,
    pub raw: Option<serde_json::Value>,
}

impl Reading {
    /// An empty reading for a device at `at`; callers fill in the fields the
    /// device reported.
    pub fn blank(device_id: &str, room_number: &str, building_id: i32, kind: MeterKind, at: OffsetDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            room_number: room_number.to_string(),
            building_id,
            at,
            kind,
            energy_kwh: None,
            power_w: None,
            voltage_v: None,
            current_a: None,
            total_liters: None,
            session_liters: None,
            flow_lpm: None,
            battery_pct: None,
            raw: None,
        }
    }

    /// Cumulative counter for the reading's kind (kWh or liters).
    pub fn counter(&self) -> Option<f64> {
        match self.kind {
            MeterKind::Electric => self.energy_kwh,
            MeterKind::Water => self.total_liters,
        }
    }

    /// Instantaneous rate for the reading's kind (W or L/min).
    pub fn rate(&self) -> Option<f64> {
        match self.kind {
            MeterKind::Electric => self.power_w,
            MeterKind::Water => self.flow_lpm,
        }
    }

    /// Every numeric field the reading carries, with its column name.
    pub fn numeric_fields(&self) -> [(&'static str, Option<f64>); 8] {
        [
            ("energy_kwh", self.energy_kwh),
            ("power_w", self.power_w),
            ("voltage_v", self.voltage_v),
            ("current_a", self.current_a),
            ("total_liters", self.total_liters),
            ("session_liters", self.session_liters),
            ("flow_lpm", self.flow_lpm),
            ("battery_pct", self.battery_pct),
        ]
    }
}
