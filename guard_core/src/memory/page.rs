use bytes::BytesMut;

use crate::types::Sequence;

/// 固定容量的可复用缓冲页
///
/// 页只会在页池空闲队列和某个流的环形槽位之间转移所有权，不可克隆。
#[derive(Debug)]
pub struct Page {
    data: BytesMut,
    capacity: usize,
    start: Option<Sequence>,
}

impl Page {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
            start: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_used(&self) -> bool {
        self.start.is_some()
    }

    pub fn start(&self) -> Option<Sequence> {
        self.start
    }

    pub fn end(&self) -> Option<Sequence> {
        self.start.map(|start| start.add(self.data.len()))
    }

    /// 写入从 start 开始的数据，最多写满一页，返回实际写入的字节数
    pub fn fill(&mut self, start: Sequence, data: &[u8]) -> usize {
        self.data.clear();
        let n = data.len().min(self.capacity);
        self.data.extend_from_slice(&data[..n]);
        self.start = Some(start);
        n
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..]
    }

    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.start = None;
    }
}
