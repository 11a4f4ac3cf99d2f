use bytes::{Buf, BytesMut};

use crate::types::Sequence;

/// 最近已交付字节的连续窗口
///
/// 交付位置不连续时由调用方 `reset`，窗口内的字节总是连续的。
#[derive(Debug)]
pub struct DeliveredHistory {
    start: Sequence,
    data: BytesMut,
    limit: usize,
}

impl DeliveredHistory {
    pub fn new(start: Sequence, limit: usize) -> Self {
        Self {
            start,
            data: BytesMut::with_capacity(limit.min(4096)),
            limit,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.limit == 0 {
            self.start = self.start.add(bytes.len());
            return;
        }
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.advance(excess);
            self.start = self.start.add(excess);
        }
    }

    /// 交付序列出现跳跃时丢弃窗口
    pub fn reset(&mut self, at: Sequence) {
        self.data.clear();
        self.start = at;
    }

    pub fn window(&self) -> (Sequence, &[u8]) {
        (self.start, &self.data[..])
    }

    pub fn end(&self) -> Sequence {
        self.start.add(self.data.len())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
