mod coalesce;
mod connection;
mod history;
mod overlap;
mod ring;
mod stream;

pub use coalesce::{CoalesceOptions, CoalesceStats, InsertStatus, Inserted, OrderedCoalesce};
pub use connection::{Connection, ConnectionOptions, TcpState};
pub use history::DeliveredHistory;
pub use overlap::{compare, intersect, Conflict, OverlapVerdict};
pub use ring::{BufferedSegment, Ring};
pub use stream::{ConnectionTable, TableConfig, TableStatsSnapshot};
