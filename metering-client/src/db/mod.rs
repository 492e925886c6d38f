pub mod credit_queries;
pub mod device_queries;
pub mod lock_queries;
pub mod rate_queries;
pub mod reading_queries;
pub mod summary_queries;
