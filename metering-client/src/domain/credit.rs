use serde::Serialize;
use time::OffsetDateTime;

pub const DEFAULT_LOW_THRESHOLD_KWH: f64 = 2.0;
pub const DEFAULT_CRITICAL_THRESHOLD_KWH: f64 = 0.5;

/// Prepaid balance of an electric meter together with its alert and cut-off
/// state. The balance itself is maintained by the wallet layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CreditAccount {
    pub device_id: String,
    pub credit_kwh: f64,
    pub threshold_low_kwh: f64,
    pub threshold_critical_kwh: f64,
    pub is_cut: bool,
    pub last_cut_at: Option<OffsetDateTime>,
    pub last_low_notified_at: Option<OffsetDateTime>,
    pub last_critical_notified_at: Option<OffsetDateTime>,
}

impl CreditAccount {
    /// A connected account with default thresholds and no alert history.
    pub fn new(device_id: impl Into<String>, credit_kwh: f64) -> Self {
        Self {
            device_id: device_id.into(),
            credit_kwh,
            threshold_low_kwh: DEFAULT_LOW_THRESHOLD_KWH,
            threshold_critical_kwh: DEFAULT_CRITICAL_THRESHOLD_KWH,
            is_cut: false,
            last_cut_at: None,
            last_low_notified_at: None,
            last_critical_notified_at: None,
        }
    }

    pub fn last_notified_at(&self, level: AlertLevel) -> Option<OffsetDateTime> {
        match level {
            AlertLevel::Low => self.last_low_notified_at,
            AlertLevel::Critical => self.last_critical_notified_at,
        }
    }

    pub fn threshold(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::Low => self.threshold_low_kwh,
            AlertLevel::Critical => self.threshold_critical_kwh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    Critical,
}

impl AlertLevel {
    pub const ALL: [AlertLevel; 2] = [AlertLevel::Low, AlertLevel::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::Critical => "critical",
        }
    }
}
