use metering_client::domain::{DataPoint, DataPointMap};

use crate::gateway::DeviceStatus;

/// Result of resolving one data point against a provider status.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    /// First candidate code present with a numeric value, already scaled.
    Found { code: &'a str, value: f64 },
    NotFound,
}

impl Lookup<'_> {
    pub fn value(&self) -> Option<f64> {
        match self {
            Lookup::Found { value, .. } => Some(*value),
            Lookup::NotFound => None,
        }
    }
}

/// Numbers, numeric strings and booleans are accepted; anything else is skipped.
pub fn numeric(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

/// Tries the configured code, then provider defaults, and returns the first hit.
/// Only the configured code carries a scale.
pub fn lookup<'a>(map: &'a DataPointMap, status: &DeviceStatus, point: DataPoint) -> Lookup<'a> {
    for (code, scale) in map.candidates(point) {
        if let Some(value) = status.get(code).and_then(numeric) {
            return Lookup::Found {
                code,
                value: value * scale,
            };
        }
    }
    Lookup::NotFound
}

/// Code to send relay commands to; falls back to the first provider default.
pub fn relay_code(map: &DataPointMap) -> &str {
    map.candidates(DataPoint::Relay)
        .first()
        .map(|(code, _)| *code)
        .unwrap_or("switch_1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn status(v: serde_json::Value) -> DeviceStatus {
        v.as_object().unwrap().clone().into_iter().collect()
    }

    #[test]
    fn configured_code_wins_over_defaults() {
        let map = DataPointMap::default().with_code(DataPoint::Energy, "total_ele", 0.01);
        let st = status(json!({ "add_ele": 5, "total_ele": 1234 }));
        assert_eq!(
            lookup(&map, &st, DataPoint::Energy),
            Lookup::Found {
                code: "total_ele",
                value: 12.34
            }
        );
    }

    #[test]
    fn default_code_fallback_is_not_scaled() {
        let map = DataPointMap::default().with_code(DataPoint::Energy, "total_ele", 0.01);
        let st = status(json!({ "add_ele": 42.0 }));
        assert_eq!(
            lookup(&map, &st, DataPoint::Energy),
            Lookup::Found {
                code: "add_ele",
                value: 42.0
            }
        );
    }

    #[test]
    fn falls_back_to_default_codes() {
        let map = DataPointMap::default();
        let st = status(json!({ "total_forward_energy": "42.5" }));
        assert_eq!(lookup(&map, &st, DataPoint::Energy).value(), Some(42.5));
    }

    #[test]
    fn skips_non_numeric_values_and_reports_not_found() {
        let map = DataPointMap::default();
        let st = status(json!({ "cur_power": "n/a", "cur_voltage": null }));
        assert_eq!(lookup(&map, &st, DataPoint::Power), Lookup::NotFound);
        assert_eq!(lookup(&map, &st, DataPoint::Voltage), Lookup::NotFound);
        assert_eq!(lookup(&map, &st, DataPoint::Flow), Lookup::NotFound);
    }

    #[test]
    fn booleans_map_to_unit_values() {
        let map = DataPointMap::default();
        let st = status(json!({ "switch_1": true }));
        assert_eq!(lookup(&map, &st, DataPoint::Relay).value(), Some(1.0));
        assert_eq!(relay_code(&map), "switch_1");
    }
}
