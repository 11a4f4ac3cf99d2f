use bytes::Bytes;
use chrono::{DateTime, Utc};
use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::flow::TcpIpFlow;
use super::sequence::Sequence;

/// 已按序拼接好、可交给上层流消费者的一段负载
#[derive(Debug, Clone, PartialEq)]
pub struct Reassembly {
    pub start: Sequence,
    pub end: Sequence,
    pub bytes: Bytes,
    pub seen: DateTime<Utc>,
}

impl Reassembly {
    pub fn new(start: Sequence, bytes: Bytes, seen: DateTime<Utc>) -> Self {
        Self {
            start,
            end: start.add(bytes.len()),
            bytes,
            seen,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// 重组结果的下游消费者
pub trait ReassemblySink: Send + Sync {
    fn reassembled(&self, flow: &TcpIpFlow, reassembly: Reassembly);
}

/// 只做检测、不消费流数据时使用
#[derive(Debug, Default)]
pub struct DiscardSink;

impl ReassemblySink for DiscardSink {
    fn reassembled(&self, _flow: &TcpIpFlow, _reassembly: Reassembly) {}
}

/// 按方向累积重组后的字节流
#[derive(Debug, Default)]
pub struct StreamCollector {
    streams: Mutex<FxHashMap<TcpIpFlow, Vec<u8>>>,
}

impl StreamCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self, flow: &TcpIpFlow) -> Vec<u8> {
        self.streams.lock().get(flow).cloned().unwrap_or_default()
    }

    pub fn total_bytes(&self) -> usize {
        self.streams.lock().values().map(Vec::len).sum()
    }
}

impl ReassemblySink for StreamCollector {
    fn reassembled(&self, flow: &TcpIpFlow, reassembly: Reassembly) {
        self.streams
            .lock()
            .entry(*flow)
            .or_default()
            .extend_from_slice(&reassembly.bytes);
    }
}
