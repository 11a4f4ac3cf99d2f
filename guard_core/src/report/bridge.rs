use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{info, warn};
use parking_lot::Mutex;

use super::logger::LoggerMessage;
use crate::types::{AttackKind, Event, HijackAttack, InjectionAttack, Sequence, TcpIpFlow};

/// 检测路径与日志协作者之间的接口
///
/// 实现必须是非阻塞的：检测线程调用 `publish` 后立即返回。
pub trait AttackReporter: Send + Sync {
    fn publish(&self, event: Event);

    fn report_hijack(&self, time: DateTime<Utc>, flow: &TcpIpFlow, seq: u32, ack: u32) {
        info!("上报握手劫持: flow={}, seq={}, ack={}", flow, seq, ack);
        self.publish(Event::Hijack(HijackAttack {
            time,
            flow: *flow,
            seq,
            ack,
        }));
    }

    #[allow(clippy::too_many_arguments)]
    fn report_injection(
        &self,
        kind: AttackKind,
        time: DateTime<Utc>,
        flow: &TcpIpFlow,
        payload: Bytes,
        overlap: Bytes,
        range: (Sequence, Sequence),
        overlap_range: (usize, usize),
    ) {
        info!(
            "上报{}: flow={}, range=[{}, {}), overlap=[{}, {})",
            kind.as_str(),
            flow,
            range.0,
            range.1,
            overlap_range.0,
            overlap_range.1
        );
        self.publish(Event::Injection(InjectionAttack {
            kind,
            time,
            flow: *flow,
            payload,
            overlap,
            start: range.0,
            end: range.1,
            overlap_start: overlap_range.0,
            overlap_end: overlap_range.1,
        }));
    }
}

/// 把事件投递到 JSON 日志线程的队列，队列无界，投递从不阻塞
#[derive(Debug, Clone)]
pub struct ReportBridge {
    tx: Sender<LoggerMessage>,
}

impl ReportBridge {
    pub(crate) fn new(tx: Sender<LoggerMessage>) -> Self {
        Self { tx }
    }
}

impl AttackReporter for ReportBridge {
    fn publish(&self, event: Event) {
        if let Err(e) = self.tx.send(LoggerMessage::Event(Box::new(event))) {
            warn!("攻击日志线程已退出，事件丢失: {}", e);
        }
    }
}

/// 在内存中收集事件，用于嵌入式使用和测试
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl AttackReporter for EventCollector {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}
