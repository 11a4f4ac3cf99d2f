use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use super::bridge::ReportBridge;
use super::serialize::SerializedEvent;
use crate::error::Result;
use crate::types::Event;

pub(crate) enum LoggerMessage {
    Event(Box<Event>),
    Stop,
}

impl std::fmt::Debug for LoggerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggerMessage::Event(event) => write!(f, "Event({})", event.type_name()),
            LoggerMessage::Stop => write!(f, "Stop"),
        }
    }
}

#[derive(Debug, Default)]
pub struct LoggerStats {
    pub written: AtomicUsize,
    pub failed: AtomicUsize,
}

/// 把攻击报告逐行写入 `<flow>.attackreport.json`
///
/// 事件经无界队列交给专用线程写盘，文件 IO 慢不会拖住检测路径。
/// `stop` 在队尾放入停止标记后等待线程退出，因此之前入队的事件都会落盘。
pub struct AttackJsonLogger {
    log_dir: PathBuf,
    tx: Sender<LoggerMessage>,
    rx: Option<Receiver<LoggerMessage>>,
    handle: Option<thread::JoinHandle<()>>,
    stats: Arc<LoggerStats>,
}

impl AttackJsonLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            log_dir: log_dir.into(),
            tx,
            rx: Some(rx),
            handle: None,
            stats: Arc::new(LoggerStats::default()),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// 启动写盘线程；重复调用无效果
    pub fn start(&mut self) -> Result<()> {
        let Some(rx) = self.rx.take() else {
            return Ok(());
        };
        let log_dir = self.log_dir.clone();
        let stats = self.stats.clone();
        let handle = thread::Builder::new()
            .name("attack-logger".to_string())
            .spawn(move || receive_reports(rx, log_dir, stats))?;
        self.handle = Some(handle);
        info!("攻击日志线程启动: dir={}", self.log_dir.display());
        Ok(())
    }

    pub fn bridge(&self) -> ReportBridge {
        ReportBridge::new(self.tx.clone())
    }

    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if self.tx.send(LoggerMessage::Stop).is_err() {
            warn!("攻击日志队列已关闭");
        }
        if let Err(e) = handle.join() {
            error!("攻击日志线程异常退出: {:?}", e);
        }
        info!(
            "攻击日志线程已停止: written={}, failed={}",
            self.stats.written.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed)
        );
    }

    pub fn written(&self) -> usize {
        self.stats.written.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.stats.failed.load(Ordering::Relaxed)
    }
}

impl Drop for AttackJsonLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_reports(rx: Receiver<LoggerMessage>, log_dir: PathBuf, stats: Arc<LoggerStats>) {
    while let Ok(message) = rx.recv() {
        match message {
            LoggerMessage::Event(event) => {
                let serialized = SerializedEvent::from(event.as_ref());
                match publish(&log_dir, &serialized) {
                    Ok(()) => {
                        stats.written.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        error!("写入攻击报告失败: flow={}, error={}", serialized.flow, e);
                    }
                }
            }
            LoggerMessage::Stop => {
                debug!("攻击日志线程收到停止信号");
                break;
            }
        }
    }
}

/// 每次写入都重新以追加方式打开文件
pub fn publish(log_dir: &Path, event: &SerializedEvent) -> std::io::Result<()> {
    let line = serde_json::to_string(event)?;
    let path = log_dir.join(format!("{}.attackreport.json", event.file_stem()));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)
}
