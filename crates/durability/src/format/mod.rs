//! On-media formats owned by the durability layer

pub mod log_record;

pub use log_record::{LogPayload, LogRecord, LogRecordError, RecordKind, LOG_MAGIC};
