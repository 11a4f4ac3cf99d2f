use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use fxhash::FxBuildHasher;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

use super::connection::{Connection, ConnectionOptions, TcpState};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::memory::Pager;
use crate::report::AttackReporter;
use crate::types::{FlowKey, PacketManifest, ReassemblySink};

/// 连接表的配置参数
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// 连接空闲超时
    pub stream_timeout: Duration,
    /// 后台清理间隔
    pub cleanup_interval: Duration,
    pub connection: ConnectionOptions,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig::from(&Config::default())
    }
}

impl From<&Config> for TableConfig {
    fn from(config: &Config) -> Self {
        Self {
            stream_timeout: Duration::from_secs(config.stream_timeout),
            cleanup_interval: Duration::from_secs(config.cleanup_interval),
            connection: ConnectionOptions::from(config),
        }
    }
}

#[derive(Debug, Default)]
struct TableStats {
    packets: AtomicU64,
    ignored: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    expired: AtomicU64,
    pages_released: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStatsSnapshot {
    pub packets: u64,
    pub ignored: u64,
    pub created: u64,
    pub closed: u64,
    pub expired: u64,
    pub pages_released: u64,
    pub active: usize,
}

type ConnectionMap = DashMap<FlowKey, Arc<Mutex<Connection>>, FxBuildHasher>;

/// 按规范化流标识索引的并发连接表
///
/// 每个连接有自己的互斥锁，表本身只在创建和删除时短暂加锁。
pub struct ConnectionTable {
    connections: ConnectionMap,
    pager: Arc<Pager>,
    reporter: Arc<dyn AttackReporter>,
    sink: Arc<dyn ReassemblySink>,
    config: TableConfig,
    stats: TableStats,
}

impl ConnectionTable {
    pub fn new(
        pager: Arc<Pager>,
        reporter: Arc<dyn AttackReporter>,
        sink: Arc<dyn ReassemblySink>,
        config: TableConfig,
    ) -> Self {
        info!(
            "初始化连接表: timeout={:?}, cleanup={:?}, ring={}, midstream={}",
            config.stream_timeout,
            config.cleanup_interval,
            config.connection.coalesce.ring_capacity,
            config.connection.allow_midstream
        );
        Self {
            connections: DashMap::with_hasher(FxBuildHasher::default()),
            pager,
            reporter,
            sink,
            config,
            stats: TableStats::default(),
        }
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// 启动后台清理任务，返回的标志置为 false 后任务在下一个周期退出
    pub async fn start_background_tasks(self: Arc<Self>) -> Arc<AtomicBool> {
        info!("启动连接表后台任务");
        let running = Arc::new(AtomicBool::new(true));

        let table = self.clone();
        let cleanup_running = running.clone();
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !cleanup_running.load(Ordering::Relaxed) {
                    debug!("清理任务收到停止信号");
                    break;
                }
                let cleaned = table.cleanup_expired(Instant::now());
                trace!("清理任务执行完成: 清理 {} 个连接", cleaned);
            }
        });

        running
    }

    /// 处理一个报文；报文不属于任何被跟踪的连接时返回 `None`
    pub fn process_packet(&self, p: &PacketManifest) -> Result<Option<TcpState>> {
        self.stats.packets.fetch_add(1, Ordering::Relaxed);
        let key = p.flow.key();

        let connection = match self.connections.get(&key) {
            Some(entry) => entry.value().clone(),
            None => {
                if !self.should_track(p) {
                    self.stats.ignored.fetch_add(1, Ordering::Relaxed);
                    trace!("未跟踪的流，忽略报文: {}", p.flow);
                    return Ok(None);
                }
                self.connections
                    .entry(key)
                    .or_insert_with(|| {
                        self.stats.created.fetch_add(1, Ordering::Relaxed);
                        debug!("新建连接: {}", key);
                        Arc::new(Mutex::new(Connection::new(
                            key,
                            self.pager.clone(),
                            self.reporter.clone(),
                            self.sink.clone(),
                            self.config.connection.clone(),
                        )))
                    })
                    .value()
                    .clone()
            }
        };

        let result = connection.lock().process(p);
        let state = match result {
            Ok(state) => state,
            Err(EngineError::FlowTeardownInProgress) => TcpState::Closed,
            Err(e) => {
                if e.is_expected() {
                    debug!("报文处理被丢弃: {}: {}", p.flow, e);
                } else {
                    warn!("报文处理失败: {}: {}", p.flow, e);
                }
                return Err(e);
            }
        };

        if state == TcpState::Closed {
            let removed = self
                .connections
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &connection));
            if removed.is_some() {
                self.stats.closed.fetch_add(1, Ordering::Relaxed);
                debug!("连接关闭并移出连接表: {}", key);
            }
        }
        Ok(Some(state))
    }

    /// 主动拆除一条连接，返回释放的页数
    pub fn close_connection(&self, key: &FlowKey) -> usize {
        let Some((_, connection)) = self.connections.remove(key) else {
            return 0;
        };
        let released = connection.lock().teardown();
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
        self.stats.pages_released.fetch_add(released as u64, Ordering::Relaxed);
        released
    }

    /// 拆除空闲超时的连接，返回清理的连接数
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let timeout = self.config.stream_timeout;
        let expired: Vec<FlowKey> = self
            .connections
            .iter()
            .filter(|entry| entry.value().lock().is_expired(now, timeout))
            .map(|entry| *entry.key())
            .collect();

        let mut cleaned = 0;
        let mut released = 0;
        for key in expired {
            if let Some((_, connection)) = self
                .connections
                .remove_if(&key, |_, c| c.lock().is_expired(now, timeout))
            {
                released += connection.lock().teardown();
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            self.stats.expired.fetch_add(cleaned as u64, Ordering::Relaxed);
            self.stats.pages_released.fetch_add(released as u64, Ordering::Relaxed);
            info!("清理完成: 清理了 {} 个过期连接, 释放 {} 页", cleaned, released);
        } else {
            trace!("清理完成: 没有过期连接需要清理");
        }
        cleaned
    }

    /// 拆除所有连接，返回释放的页数
    pub fn shutdown(&self) -> usize {
        let keys: Vec<FlowKey> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut released = 0;
        for key in &keys {
            if let Some((_, connection)) = self.connections.remove(key) {
                released += connection.lock().teardown();
            }
        }
        self.stats.pages_released.fetch_add(released as u64, Ordering::Relaxed);
        info!("连接表关闭: 拆除 {} 个连接, 释放 {} 页", keys.len(), released);
        released
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<Mutex<Connection>>> {
        self.connections.get(key).map(|entry| entry.value().clone())
    }

    pub fn stats(&self) -> TableStatsSnapshot {
        TableStatsSnapshot {
            packets: self.stats.packets.load(Ordering::Relaxed),
            ignored: self.stats.ignored.load(Ordering::Relaxed),
            created: self.stats.created.load(Ordering::Relaxed),
            closed: self.stats.closed.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            pages_released: self.stats.pages_released.load(Ordering::Relaxed),
            active: self.connections.len(),
        }
    }

    fn should_track(&self, p: &PacketManifest) -> bool {
        if p.tcp.rst() {
            return false;
        }
        if p.tcp.syn() {
            return !p.tcp.ack_flag();
        }
        self.config.connection.allow_midstream && !p.payload.is_empty()
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .finish()
    }
}
