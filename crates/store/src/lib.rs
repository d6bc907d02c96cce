pub mod analysis;
pub mod assemble;
pub mod db;
pub mod export;
pub mod graph;
pub mod query;
pub mod retention;
pub mod sampling;
pub mod write;

pub use db::{TraceStore, TraceStoreConfig};
pub use retention::RetentionReport;
pub use write::{ParentRef, StartSpan};
