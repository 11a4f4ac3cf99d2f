use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::memory::Page;
use crate::types::Sequence;

/// 缓存在环形槽位中的乱序段，负载可能跨越多页
#[derive(Debug)]
pub struct BufferedSegment {
    pub start: Sequence,
    pub end: Sequence,
    pub seen: DateTime<Utc>,
    pages: Vec<Page>,
}

impl BufferedSegment {
    pub fn new(start: Sequence, seen: DateTime<Utc>, pages: Vec<Page>) -> Self {
        let len: usize = pages.iter().map(Page::len).sum();
        Self {
            start,
            end: start.add(len),
            seen,
            pages,
        }
    }

    pub fn len(&self) -> usize {
        self.end.offset_from(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// 复制 [from, to) 与本段相交部分的字节
    pub fn copy_range(&self, from: Sequence, to: Sequence) -> BytesMut {
        let from = from.later(self.start);
        let to = to.earlier(self.end);
        let mut out = BytesMut::new();
        if !from.is_before(to) {
            return out;
        }
        let mut lo = from.offset_from(self.start);
        let mut hi = to.offset_from(self.start);
        out.reserve(hi - lo);
        for page in &self.pages {
            let len = page.len();
            if lo < len {
                out.extend_from_slice(&page.as_slice()[lo..hi.min(len)]);
            }
            if hi <= len {
                break;
            }
            lo = lo.saturating_sub(len);
            hi -= len;
        }
        out
    }

    /// 从 from 开始到段尾的字节
    pub fn tail_from(&self, from: Sequence) -> Bytes {
        self.copy_range(from, self.end).freeze()
    }

    pub fn into_pages(self) -> Vec<Page> {
        self.pages
    }
}

/// 每个流方向一个的定长环形缓冲，按 `start mod capacity` 定位槽位
#[derive(Debug)]
pub struct Ring {
    slots: Vec<Option<BufferedSegment>>,
    occupied: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, occupied: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn slot_index(&self, seq: Sequence) -> usize {
        seq.0 as usize % self.slots.len()
    }

    pub fn get(&self, index: usize) -> Option<&BufferedSegment> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn take(&mut self, index: usize) -> Option<BufferedSegment> {
        let segment = self.slots.get_mut(index).and_then(Option::take);
        if segment.is_some() {
            self.occupied -= 1;
        }
        segment
    }

    /// 放入槽位，返回被替换的旧段
    pub fn put(&mut self, index: usize, segment: BufferedSegment) -> Option<BufferedSegment> {
        let previous = self.slots[index].replace(segment);
        if previous.is_none() {
            self.occupied += 1;
        }
        previous
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &BufferedSegment)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|seg| (i, seg)))
    }

    pub fn drain(&mut self) -> Vec<BufferedSegment> {
        self.occupied = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
