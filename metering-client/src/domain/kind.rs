use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Which utility a device meters. Determines the semantic fields and units
/// that apply to its readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    Electric,
    Water,
}

impl MeterKind {
    pub const ALL: [MeterKind; 2] = [MeterKind::Electric, MeterKind::Water];

    pub fn as_str(self) -> &'static str {
        match self {
            MeterKind::Electric => "electric",
            MeterKind::Water => "water",
        }
    }

    /// Unit of the cumulative counter (kWh or liters).
    pub fn quantity_unit(self) -> &'static str {
        match self {
            MeterKind::Electric => "kWh",
            MeterKind::Water => "L",
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown meter kind '{0}'")]
pub struct UnknownMeterKind(pub String);

impl FromStr for MeterKind {
    type Err = UnknownMeterKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "electric" => Ok(MeterKind::Electric),
            "water" => Ok(MeterKind::Water),
            other => Err(UnknownMeterKind(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("Electric".parse::<MeterKind>(), Ok(MeterKind::Electric));
        assert_eq!(" water ".parse::<MeterKind>(), Ok(MeterKind::Water));
        assert!("gas".parse::<MeterKind>().is_err());
    }
}
