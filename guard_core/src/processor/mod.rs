pub use self::processor::{BatchProcessStats, PacketProcessor, ProcessorStats, ProcessorStatsSnapshot};
pub use self::worker::WorkerPool;

mod processor;
mod worker;
