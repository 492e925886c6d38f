mod credit;
mod device;
mod kind;
mod rate;
mod reading;
mod summary;

pub use credit::{AlertLevel, CreditAccount, DEFAULT_CRITICAL_THRESHOLD_KWH, DEFAULT_LOW_THRESHOLD_KWH};
pub use device::{DataPoint, DataPointMap, DataPointSpec, MeterDevice};
pub use kind::{MeterKind, UnknownMeterKind};
pub use rate::UtilityRate;
pub use reading::Reading;
pub use summary::BillingSummaryRow;
