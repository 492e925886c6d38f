//! Monthly consumption and charges.

pub mod charges;
pub mod consumption;
pub mod period;
pub mod rate;
pub mod series;
pub mod summary;

pub use charges::{room_charges, ChargeLine, ChargeSheet};
pub use consumption::{ConsumptionResult, Method};
pub use period::{BillingMonth, PeriodError};
pub use rate::ResolvedRate;
pub use series::{usage_series, MonthlyUsage};
