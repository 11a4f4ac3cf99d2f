//! 被动 TCP 流注入检测核心
//!
//! 报文按流进入连接表，每个方向由有序合并器重排；任何覆盖同一序列区间
//! 却内容不一致的段都会作为攻击事件经报告通道写入 JSON 日志。

pub mod config;
pub mod error;
pub mod memory;
pub mod processor;
pub mod report;
pub mod stream;
pub mod types;
pub mod util;

pub use config::{CollisionPolicy, Config};
pub use error::{ConfigError, EngineError, QuotaScope, Result};
pub use memory::{Page, Pager, PagerConfig};
pub use processor::{BatchProcessStats, PacketProcessor, ProcessorStatsSnapshot, WorkerPool};
pub use report::{AttackJsonLogger, AttackReporter, EventCollector, ReportBridge, SerializedEvent};
pub use stream::{
    CoalesceOptions, Connection, ConnectionOptions, ConnectionTable, InsertStatus, Inserted,
    OrderedCoalesce, TableConfig, TableStatsSnapshot, TcpState,
};
pub use types::{
    AttackKind, DiscardSink, Event, FlowKey, HijackAttack, InjectionAttack, PacketManifest,
    Reassembly, ReassemblySink, Sequence, StreamCollector, TcpIpFlow,
};
pub use util::init_logger;
