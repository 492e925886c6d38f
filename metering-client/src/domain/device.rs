use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::MeterKind;

/// Semantic data points a metering device can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPoint {
    Relay,
    RelayStatus,
    Energy,
    Power,
    Voltage,
    Current,
    Liters,
    OnceLiters,
    Flow,
    Battery,
}

impl DataPoint {
    pub const ELECTRIC: [DataPoint; 6] = [
        DataPoint::Relay,
        DataPoint::RelayStatus,
        DataPoint::Energy,
        DataPoint::Power,
        DataPoint::Voltage,
        DataPoint::Current,
    ];

    pub const WATER: [DataPoint; 4] = [
        DataPoint::Liters,
        DataPoint::OnceLiters,
        DataPoint::Flow,
        DataPoint::Battery,
    ];

    /// Provider codes tried, in order, when a device's map has no entry for
    /// this point (or its configured code is missing from a status payload).
    pub fn default_codes(self) -> &'static [&'static str] {
        match self {
            DataPoint::Relay => &["switch_1", "switch"],
            DataPoint::RelayStatus => &["relay_status"],
            DataPoint::Energy => &["add_ele", "total_forward_energy"],
            DataPoint::Power => &["cur_power"],
            DataPoint::Voltage => &["cur_voltage"],
            DataPoint::Current => &["cur_current"],
            DataPoint::Liters => &["water_total", "total_water"],
            DataPoint::OnceLiters => &["water_once", "once_water"],
            DataPoint::Flow => &["instantaneous_flow", "flow_rate"],
            DataPoint::Battery => &["battery_percentage", "va_battery"],
        }
    }
}

/// A configured provider code for one data point. Accepts either a bare code
/// string or `{ "code": ..., "scale": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataPointSpec {
    Code(String),
    Scaled {
        code: String,
        #[serde(default = "unit_scale")]
        scale: f64,
    },
}

fn unit_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl DataPointSpec {
    pub fn code(&self) -> &str {
        match self {
            DataPointSpec::Code(code) => code,
            DataPointSpec::Scaled { code, .. } => code,
        }
    }

    pub fn scale(&self) -> f64 {
        match self {
            DataPointSpec::Code(_) => 1.0,
            DataPointSpec::Scaled { scale, .. } => *scale,
        }
    }
}

/// Per-device association of semantic data points to provider codes.
///
/// Stored as JSONB on the device row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointMap {
    #[serde(default)]
    pub codes: BTreeMap<DataPoint, DataPointSpec>,
    /// Whether the provider's energy code is a running total that can be
    /// stored as-is. When false, cumulative energy is derived from power.
    #[serde(default = "default_true")]
    pub energy_cumulative: bool,
}

impl Default for DataPointMap {
    fn default() -> Self {
        Self {
            codes: BTreeMap::new(),
            energy_cumulative: true,
        }
    }
}

impl DataPointMap {
    pub fn with_code(mut self, point: DataPoint, code: &str, scale: f64) -> Self {
        let spec = if scale == 1.0 {
            DataPointSpec::Code(code.to_string())
        } else {
            DataPointSpec::Scaled {
                code: code.to_string(),
                scale,
            }
        };
        self.codes.insert(point, spec);
        self
    }

    /// Ordered `(code, scale)` candidates for a point: the configured code
    /// with its scale first, then the provider defaults unscaled (without
    /// repeating the configured one).
    pub fn candidates(&self, point: DataPoint) -> Vec<(&str, f64)> {
        let mut out: Vec<(&str, f64)> = Vec::with_capacity(3);
        if let Some(spec) = self.codes.get(&point) {
            out.push((spec.code(), spec.scale()));
        }
        for code in point.default_codes() {
            if !out.iter().any(|(c, _)| c == code) {
                out.push((*code, 1.0));
            }
        }
        out
    }

    /// Multiplier for the configured code of a point; defaults are unscaled.
    pub fn scale(&self, point: DataPoint) -> f64 {
        self.codes.get(&point).map(DataPointSpec::scale).unwrap_or(1.0)
    }
}

/// One physical IoT meter bound to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterDevice {
    pub device_id: String,
    pub room_number: String,
    pub building_id: i32,
    pub kind: MeterKind,
    pub active: bool,
    pub created_at: OffsetDateTime,
    pub dp_map: DataPointMap,
}
