pub mod device_poll;
pub mod reading_csv_file;

pub use device_poll::DevicePollSource;
pub use reading_csv_file::ReadingCsvFileSource;
