mod bridge;
mod logger;
mod serialize;

pub use bridge::{AttackReporter, EventCollector, ReportBridge};
pub use logger::{publish, AttackJsonLogger, LoggerStats};
pub use serialize::SerializedEvent;
