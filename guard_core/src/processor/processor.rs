use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use log::{debug, trace};
use rayon::prelude::*;

use super::worker::WorkerPool;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::stream::{ConnectionTable, TcpState};
use crate::types::{FlowKey, PacketManifest};

/// 处理器统计信息
#[derive(Debug, Default)]
pub struct ProcessorStats {
    /// 总处理报文数
    pub total_packets: AtomicUsize,
    /// 属于被跟踪连接的报文数
    pub tracked_packets: AtomicUsize,
    /// 未被跟踪而忽略的报文数
    pub ignored_packets: AtomicUsize,
    /// 因页池配额不足被丢弃的乱序段
    pub dropped_segments: AtomicUsize,
    /// 处理失败的报文数
    pub failed_packets: AtomicUsize,
    pub batch_count: AtomicUsize,
    /// 纳秒
    pub total_processing_time: AtomicUsize,
    /// 纳秒
    pub max_latency: AtomicUsize,
}

impl ProcessorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &Result<Option<TcpState>>, processing_time: Duration) {
        let time_ns = processing_time.as_nanos() as usize;
        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time.fetch_add(time_ns, Ordering::Relaxed);
        self.max_latency.fetch_max(time_ns, Ordering::Relaxed);

        match result {
            Ok(Some(_)) => {
                self.tracked_packets.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {
                self.ignored_packets.fetch_add(1, Ordering::Relaxed);
            }
            Err(EngineError::PoolExhausted { .. }) => {
                self.tracked_packets.fetch_add(1, Ordering::Relaxed);
                self.dropped_segments.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failed_packets.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_batch(&self) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        let total_packets = self.total_packets.load(Ordering::Relaxed);
        let total_ns = self.total_processing_time.load(Ordering::Relaxed) as u64;
        let avg_latency = if total_packets > 0 {
            Duration::from_nanos(total_ns / total_packets as u64)
        } else {
            Duration::ZERO
        };
        ProcessorStatsSnapshot {
            total_packets,
            tracked_packets: self.tracked_packets.load(Ordering::Relaxed),
            ignored_packets: self.ignored_packets.load(Ordering::Relaxed),
            dropped_segments: self.dropped_segments.load(Ordering::Relaxed),
            failed_packets: self.failed_packets.load(Ordering::Relaxed),
            batch_count: self.batch_count.load(Ordering::Relaxed),
            total_processing_time: Duration::from_nanos(total_ns),
            avg_latency,
            max_latency: Duration::from_nanos(self.max_latency.load(Ordering::Relaxed) as u64),
        }
    }
}

/// 处理器统计快照
#[derive(Debug, Clone, Default)]
pub struct ProcessorStatsSnapshot {
    pub total_packets: usize,
    pub tracked_packets: usize,
    pub ignored_packets: usize,
    pub dropped_segments: usize,
    pub failed_packets: usize,
    pub batch_count: usize,
    pub total_processing_time: Duration,
    pub avg_latency: Duration,
    pub max_latency: Duration,
}

/// 单个批次的处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchProcessStats {
    pub batch_id: usize,
    pub packets: usize,
    pub flows: usize,
    pub dropped_segments: usize,
    pub failed_packets: usize,
    pub elapsed: Duration,
}

/// 报文入口：单包同步处理、按流分派到工作线程，或整批并行处理
pub struct PacketProcessor {
    table: Arc<ConnectionTable>,
    worker_pool: WorkerPool,
    stats: Arc<ProcessorStats>,
    batch_id_counter: AtomicUsize,
}

impl PacketProcessor {
    pub fn new(table: Arc<ConnectionTable>, num_workers: usize, queue_depth: usize) -> Result<Self> {
        let stats = Arc::new(ProcessorStats::new());
        let worker_pool = WorkerPool::new(table.clone(), stats.clone(), num_workers, queue_depth)?;
        Ok(Self {
            table,
            worker_pool,
            stats,
            batch_id_counter: AtomicUsize::new(0),
        })
    }

    pub fn with_config(table: Arc<ConnectionTable>, config: &Config) -> Result<Self> {
        Self::new(table, config.worker_count(), config.worker_queue_depth)
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    pub fn workers(&self) -> usize {
        self.worker_pool.len()
    }

    /// 在调用线程上直接处理一个报文
    pub fn process_packet(&self, packet: &PacketManifest) -> Result<Option<TcpState>> {
        let start = Instant::now();
        let result = self.table.process_packet(packet);
        self.stats.record(&result, start.elapsed());
        result
    }

    /// 交给负责该流的工作线程处理
    pub fn submit(&self, packet: PacketManifest) -> bool {
        trace!("提交报文: {}, seq={}, len={}", packet.flow, packet.tcp.seq, packet.payload.len());
        self.worker_pool.submit(packet)
    }

    pub fn flush(&self) {
        self.worker_pool.flush();
    }

    /// 按流分组后并行处理，组内保持到达顺序
    pub fn process_batch(&self, packets: Vec<PacketManifest>) -> BatchProcessStats {
        let start = Instant::now();
        let batch_id = self.batch_id_counter.fetch_add(1, Ordering::Relaxed);
        self.stats.record_batch();
        let total = packets.len();

        let mut groups: FxHashMap<FlowKey, Vec<PacketManifest>> = FxHashMap::default();
        for packet in packets {
            groups.entry(packet.flow.key()).or_default().push(packet);
        }
        let flows = groups.len();

        let (dropped_segments, failed_packets) = groups
            .into_par_iter()
            .map(|(_, group)| {
                let mut dropped = 0;
                let mut failed = 0;
                for packet in &group {
                    match self.process_packet(packet) {
                        Ok(_) => {}
                        Err(e) if e.is_expected() => dropped += 1,
                        Err(_) => failed += 1,
                    }
                }
                (dropped, failed)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));

        let elapsed = start.elapsed();
        debug!(
            "批量处理完成: batch_id={}, packets={}, flows={}, dropped={}, failed={}, 处理时间={:?}",
            batch_id, total, flows, dropped_segments, failed_packets, elapsed
        );
        BatchProcessStats {
            batch_id,
            packets: total,
            flows,
            dropped_segments,
            failed_packets,
            elapsed,
        }
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn shutdown(&mut self) {
        self.worker_pool.flush();
        self.worker_pool.shutdown();
    }
}

impl std::fmt::Debug for PacketProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketProcessor")
            .field("workers", &self.worker_pool.len())
            .field("connections", &self.table.connection_count())
            .finish()
    }
}
