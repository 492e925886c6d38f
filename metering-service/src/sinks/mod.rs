pub mod reading_store;

pub use reading_store::{IngestTally, ReadingStoreSink};
