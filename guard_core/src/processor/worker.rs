use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};

use super::processor::ProcessorStats;
use crate::error::Result;
use crate::stream::ConnectionTable;
use crate::types::{FlowKey, PacketManifest};

pub(crate) enum Task {
    Packet(Box<PacketManifest>),
    Flush(Sender<()>),
}

/// 固定数量的工作线程，按流哈希分派报文
///
/// 同一条流的报文总是落到同一个线程，保证单流按到达顺序处理。
pub struct WorkerPool {
    workers: Vec<Worker>,
    task_senders: Vec<Sender<Task>>,
}

struct Worker {
    id: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        table: Arc<ConnectionTable>,
        stats: Arc<ProcessorStats>,
        num_workers: usize,
        queue_depth: usize,
    ) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);
        let mut task_senders = Vec::with_capacity(num_workers);

        for id in 0..num_workers {
            let (tx, rx) = bounded::<Task>(queue_depth.max(1));
            task_senders.push(tx);
            workers.push(Worker::new(id, rx, table.clone(), stats.clone())?);
        }

        info!("工作线程池启动: workers={}, queue_depth={}", num_workers, queue_depth);
        Ok(Self { workers, task_senders })
    }

    pub fn len(&self) -> usize {
        self.task_senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_senders.is_empty()
    }

    pub fn worker_for(&self, key: &FlowKey) -> usize {
        (fxhash::hash64(key) % self.task_senders.len().max(1) as u64) as usize
    }

    /// 队列满时阻塞，对上游形成背压
    pub fn submit(&self, packet: PacketManifest) -> bool {
        if self.task_senders.is_empty() {
            warn!("工作线程池已关闭，丢弃报文: {}", packet.flow);
            return false;
        }
        let worker_id = self.worker_for(&packet.flow.key());
        if let Err(e) = self.task_senders[worker_id].send(Task::Packet(Box::new(packet))) {
            warn!("提交任务到工作线程 {} 失败: {}", worker_id, e);
            return false;
        }
        true
    }

    /// 等待所有已提交的报文处理完毕，返回确认完成的工作线程数
    pub fn flush(&self) -> usize {
        let mut acks = Vec::with_capacity(self.task_senders.len());
        for (worker_id, sender) in self.task_senders.iter().enumerate() {
            let (ack_tx, ack_rx) = bounded(1);
            if sender.send(Task::Flush(ack_tx)).is_err() {
                warn!("工作线程 {} 已退出，跳过 flush", worker_id);
                continue;
            }
            acks.push((worker_id, ack_rx));
        }
        await_acks(acks)
    }

    pub fn shutdown(&mut self) {
        self.task_senders.clear();
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if let Err(e) = handle.join() {
                    warn!("等待工作线程 {} 退出失败: {:?}", worker.id, e);
                }
            }
        }
    }
}

impl Worker {
    fn new(
        id: usize,
        rx: Receiver<Task>,
        table: Arc<ConnectionTable>,
        stats: Arc<ProcessorStats>,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(format!("guard-worker-{}", id))
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    match task {
                        Task::Packet(packet) => {
                            let start = Instant::now();
                            let result = table.process_packet(&packet);
                            stats.record(&result, start.elapsed());
                        }
                        Task::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
                debug!("工作线程 {} 退出", id);
            })?;

        Ok(Self { id, handle: Some(handle) })
    }
}

fn await_acks(acks: Vec<(usize, Receiver<()>)>) -> usize {
    let mut confirmed = 0;
    for (worker_id, ack) in acks {
        match ack.recv() {
            Ok(()) => confirmed += 1,
            Err(e) => warn!("工作线程 {} 在 flush 期间退出: {}", worker_id, e),
        }
    }
    confirmed
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("workers", &self.workers.len()).finish()
    }
}
