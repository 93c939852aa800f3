//! Per-model and per-agent health records pushed to an external collector.

pub mod record;
pub mod reporter;

pub use record::{HealthCollector, HealthRecord, HealthSnapshot, RecordKind};
pub use reporter::{ChannelSink, HealthReporter, HealthSink, SinkError, TracingSink};
