//! 传感器入口：按配置组装页池、攻击日志、连接表和报文处理器，
//! 关闭时按相反顺序拆除。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use guard_core::processor::ProcessorStatsSnapshot;
use guard_core::{
    AttackJsonLogger, AttackReporter, BatchProcessStats, Config, ConnectionTable, DiscardSink,
    PacketManifest, PacketProcessor, Pager, PagerConfig, ReassemblySink, Result,
    TableConfig, TableStatsSnapshot, TcpState,
};
use log::{info, warn};
use tokio::runtime::Runtime;

pub use guard_core;

/// 关闭传感器时的汇总
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// 拆除连接时归还页池的页数
    pub pages_released: usize,
    /// 页池停止时仍未归还的页数，正常应为 0
    pub pages_leaked: usize,
    pub events_written: usize,
    pub events_failed: usize,
    pub processor: ProcessorStatsSnapshot,
    pub table: TableStatsSnapshot,
}

pub struct Sensor {
    config: Config,
    runtime: Option<Runtime>,
    pager: Arc<Pager>,
    logger: AttackJsonLogger,
    table: Arc<ConnectionTable>,
    processor: PacketProcessor,
    sweeper: Arc<AtomicBool>,
    stopped: bool,
}

impl Sensor {
    /// 只做检测，不消费重组后的数据
    pub fn start(config: Config) -> Result<Self> {
        Self::with_sink(config, Arc::new(DiscardSink))
    }

    pub fn with_sink(config: Config, sink: Arc<dyn ReassemblySink>) -> Result<Self> {
        config.validate()?;

        let pager = Arc::new(Pager::new(PagerConfig {
            capacity: config.page_pool_capacity,
            page_size: config.page_size,
        })?);
        pager.start();

        let mut logger = AttackJsonLogger::new(&config.log_dir);
        logger.start()?;
        let reporter: Arc<dyn AttackReporter> = Arc::new(logger.bridge());

        let table = Arc::new(ConnectionTable::new(
            pager.clone(),
            reporter,
            sink,
            TableConfig::from(&config),
        ));
        let processor = PacketProcessor::with_config(table.clone(), &config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(num_cpus::get().clamp(1, 2))
            .thread_name("guard-sweeper")
            .enable_all()
            .build()?;
        let sweeper = runtime.block_on(table.clone().start_background_tasks());

        info!(
            "传感器启动: pages={}, per_flow={}, ring={}, workers={}, log_dir={}",
            config.page_pool_capacity,
            config.max_pages_per_flow,
            config.ring_capacity,
            processor.workers(),
            config.log_dir.display()
        );

        Ok(Self {
            config,
            runtime: Some(runtime),
            pager,
            logger,
            table,
            processor,
            sweeper,
            stopped: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    /// 交给对应流的工作线程异步处理
    pub fn submit(&self, packet: PacketManifest) -> bool {
        self.processor.submit(packet)
    }

    /// 在调用线程上同步处理
    pub fn process(&self, packet: &PacketManifest) -> Result<Option<TcpState>> {
        self.processor.process_packet(packet)
    }

    pub fn process_batch(&self, packets: Vec<PacketManifest>) -> BatchProcessStats {
        self.processor.process_batch(packets)
    }

    /// 等待已提交的报文全部处理完
    pub fn flush(&self) {
        self.processor.flush();
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.processor.stats()
    }

    pub fn shutdown(mut self) -> ShutdownReport {
        self.stop()
    }

    fn stop(&mut self) -> ShutdownReport {
        if self.stopped {
            return ShutdownReport::default();
        }
        self.stopped = true;

        self.processor.shutdown();
        self.sweeper.store(false, Ordering::Relaxed);
        let pages_released = self.table.shutdown();
        self.logger.stop();
        let pages_leaked = self.pager.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        if pages_leaked > 0 {
            warn!("传感器关闭时仍有 {} 页未归还", pages_leaked);
        }

        let report = ShutdownReport {
            pages_released,
            pages_leaked,
            events_written: self.logger.written(),
            events_failed: self.logger.failed(),
            processor: self.processor.stats(),
            table: self.table.stats(),
        };
        info!(
            "传感器关闭: 释放 {} 页, 写出 {} 条攻击报告, 处理 {} 个报文",
            report.pages_released, report.events_written, report.processor.total_packets
        );
        report
    }
}

impl Drop for Sensor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("pager", &self.pager)
            .field("table", &self.table)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// 按顺序提交一组报文并等待处理完成，返回提交成功的数量
pub fn replay<I>(sensor: &Sensor, packets: I) -> usize
where
    I: IntoIterator<Item = PacketManifest>,
{
    let submitted = packets
        .into_iter()
        .map(|packet| sensor.submit(packet))
        .filter(|accepted| *accepted)
        .count();
    sensor.flush();
    submitted
}
