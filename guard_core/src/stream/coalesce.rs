use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};

use super::history::DeliveredHistory;
use super::overlap::{compare, intersect, Conflict, OverlapVerdict};
use super::ring::{BufferedSegment, Ring};
use crate::config::{CollisionPolicy, Config};
use crate::error::{EngineError, QuotaScope, Result};
use crate::memory::Pager;
use crate::report::AttackReporter;
use crate::types::{AttackKind, PacketManifest, Reassembly, Sequence, TcpIpFlow};

#[derive(Debug, Clone)]
pub struct CoalesceOptions {
    pub ring_capacity: usize,
    pub max_pages_per_flow: usize,
    pub history_bytes: usize,
    pub collision_policy: CollisionPolicy,
}

impl Default for CoalesceOptions {
    fn default() -> Self {
        CoalesceOptions::from(&Config::default())
    }
}

impl From<&Config> for CoalesceOptions {
    fn from(config: &Config) -> Self {
        Self {
            ring_capacity: config.ring_capacity,
            max_pages_per_flow: config.max_pages_per_flow,
            history_bytes: config.history_bytes,
            collision_policy: config.collision_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertStatus {
    /// 无负载（纯 ACK 等）
    Empty,
    /// 整段早于下一个期望序列号，已交付过
    Stale,
    /// 至少有一段数据被交付
    Delivered,
    /// 乱序段已缓存
    Buffered { pages: usize },
    /// 与已缓存段区间完全相同，保留原段
    Duplicate,
    /// 槽位被另一个仍有效的段占用，按策略拒绝新段
    Collision,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    pub status: InsertStatus,
    pub reassemblies: Vec<Reassembly>,
}

impl Inserted {
    fn new(status: InsertStatus, reassemblies: Vec<Reassembly>) -> Self {
        Self { status, reassemblies }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CoalesceStats {
    pub delivered_bytes: u64,
    pub buffered_segments: u64,
    pub stale_segments: u64,
    pub retransmissions: u64,
    pub conflicts: u64,
    pub collisions: u64,
    pub dropped_segments: u64,
}

/// 单个流方向的有序合并器
///
/// 乱序段按 `start mod ring_capacity` 放入环形槽位等待，下一个期望序列号
/// 到达时连续交付。任何与已缓存段或已交付历史重叠的新段都会逐字节比较，
/// 不一致即上报注入事件。下一个期望序列号只会前进。
pub struct OrderedCoalesce {
    flow: TcpIpFlow,
    next_seq: Sequence,
    ring: Ring,
    pager: Arc<Pager>,
    reporter: Arc<dyn AttackReporter>,
    history: DeliveredHistory,
    /// 已推进但因插入失败尚未交给调用方的数据
    pending: Vec<Reassembly>,
    options: CoalesceOptions,
    pages_used: usize,
    closed: bool,
    stats: CoalesceStats,
}

impl OrderedCoalesce {
    pub fn new(
        flow: TcpIpFlow,
        next_seq: Sequence,
        pager: Arc<Pager>,
        reporter: Arc<dyn AttackReporter>,
        options: CoalesceOptions,
    ) -> Self {
        trace!("创建有序合并器: flow={}, next_seq={}, ring={}", flow, next_seq, options.ring_capacity);
        Self {
            flow,
            next_seq,
            ring: Ring::new(options.ring_capacity),
            pager,
            reporter,
            history: DeliveredHistory::new(next_seq, options.history_bytes),
            pending: Vec::new(),
            options,
            pages_used: 0,
            closed: false,
            stats: CoalesceStats::default(),
        }
    }

    pub fn flow(&self) -> &TcpIpFlow {
        &self.flow
    }

    pub fn next_seq(&self) -> Sequence {
        self.next_seq
    }

    pub fn pages_used(&self) -> usize {
        self.pages_used
    }

    pub fn buffered_segments(&self) -> usize {
        self.ring.len()
    }

    /// 缓存中是否有段越过 `seq`
    pub fn has_buffered_after(&self, seq: Sequence) -> bool {
        self.ring.iter().any(|(_, seg)| seq.is_before(seg.end))
    }

    pub fn stats(&self) -> &CoalesceStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 插入一个报文的负载
    ///
    /// `next_hint` 是调用方已知的下一个期望序列号（例如 FIN 占用了一个序列号），
    /// 只在它领先时推进，不会回退。推进后缓存失败时，推进交付的数据保留在
    /// `take_pending` 中，并随下一次 `insert`/`advance` 一起返回。
    pub fn insert(&mut self, p: &PacketManifest, next_hint: Sequence) -> Result<Inserted> {
        if self.closed {
            return Err(EngineError::FlowTeardownInProgress);
        }

        let mut out = std::mem::take(&mut self.pending);
        self.advance_to(next_hint, &mut out);

        if p.payload.is_empty() {
            let status = if out.is_empty() { InsertStatus::Empty } else { InsertStatus::Delivered };
            return Ok(Inserted::new(status, out));
        }

        let (start, end) = p.seq_range();
        if end.is_before_or_eq(self.next_seq) {
            trace!("过期段: flow={}, [{}, {}) next={}", self.flow, start, end, self.next_seq);
            self.stats.stale_segments += 1;
            self.check_history(p, start, end);
            let status = if out.is_empty() { InsertStatus::Stale } else { InsertStatus::Delivered };
            return Ok(Inserted::new(status, out));
        }

        // 头部已交付的部分先与历史比较，剩余部分按顺序处理
        let mut deliver_from = start;
        if start.is_before(self.next_seq) {
            self.check_history(p, start, end);
            deliver_from = self.next_seq;
        }
        self.check_buffered(p, start, end);

        if deliver_from == self.next_seq {
            let offset = deliver_from.offset_from(start);
            self.deliver(p.payload.slice(offset..), deliver_from, p.timestamp, &mut out);
            self.drain(&mut out);
            return Ok(Inserted::new(InsertStatus::Delivered, out));
        }

        let status = match self.buffer(p, start, end) {
            Ok(status) => status,
            Err(e) => {
                if !out.is_empty() {
                    debug!("缓存失败，保留已推进交付的 {} 段数据: flow={}", out.len(), self.flow);
                }
                self.pending = out;
                return Err(e);
            }
        };
        let status = if out.is_empty() { status } else { InsertStatus::Delivered };
        Ok(Inserted::new(status, out))
    }

    /// 不带负载地推进下一个期望序列号，返回因此变得连续的数据
    pub fn advance(&mut self, hint: Sequence) -> Result<Vec<Reassembly>> {
        if self.closed {
            return Err(EngineError::FlowTeardownInProgress);
        }
        let mut out = std::mem::take(&mut self.pending);
        self.advance_to(hint, &mut out);
        Ok(out)
    }

    /// 取出插入失败时滞留的已交付数据
    pub fn take_pending(&mut self) -> Vec<Reassembly> {
        std::mem::take(&mut self.pending)
    }

    /// 拆除：释放环中所有页，之后的插入返回 `FlowTeardownInProgress`
    pub fn close(&mut self) -> usize {
        if self.closed {
            return 0;
        }
        self.closed = true;
        self.pending.clear();
        let released = self.pages_used;
        for segment in self.ring.drain() {
            for page in segment.into_pages() {
                self.pager.release(page);
            }
        }
        self.pages_used = 0;
        debug!("有序合并器关闭: flow={}, 释放页数={}", self.flow, released);
        released
    }

    fn advance_to(&mut self, hint: Sequence, out: &mut Vec<Reassembly>) {
        if !hint.is_after(self.next_seq) {
            return;
        }
        debug!("推进期望序列号: flow={}, {} -> {}", self.flow, self.next_seq, hint);
        self.next_seq = hint;
        self.drain(out);
    }

    fn deliver(&mut self, bytes: Bytes, start: Sequence, seen: DateTime<Utc>, out: &mut Vec<Reassembly>) {
        if bytes.is_empty() {
            return;
        }
        if self.history.end() != start {
            self.history.reset(start);
        }
        self.history.append(&bytes);
        self.next_seq = start.add(bytes.len());
        self.stats.delivered_bytes += bytes.len() as u64;
        out.push(Reassembly::new(start, bytes, seen));
    }

    /// 连续交付所有覆盖下一个期望序列号的缓存段，然后回收过期段
    fn drain(&mut self, out: &mut Vec<Reassembly>) {
        while let Some(index) = self.find_drainable() {
            let Some(segment) = self.ring.take(index) else {
                break;
            };
            let from = self.next_seq;
            let tail = segment.tail_from(from);
            let seen = segment.seen;
            self.release_segment(segment);
            self.deliver(tail, from, seen, out);
        }
        self.release_stale();
    }

    fn find_drainable(&self) -> Option<usize> {
        let next = self.next_seq;
        let covers = |seg: &BufferedSegment| {
            seg.start.is_before_or_eq(next) && next.is_before(seg.end)
        };

        let slot = self.ring.slot_index(next);
        if self.ring.get(slot).is_some_and(covers) {
            return Some(slot);
        }
        self.ring
            .iter()
            .filter(|(_, seg)| covers(*seg))
            .max_by_key(|(_, seg)| seg.end.offset_from(next))
            .map(|(index, _)| index)
    }

    fn release_stale(&mut self) {
        let next = self.next_seq;
        let stale: Vec<usize> = self
            .ring
            .iter()
            .filter(|(_, seg)| seg.end.is_before_or_eq(next))
            .map(|(index, _)| index)
            .collect();
        for index in stale {
            if let Some(segment) = self.ring.take(index) {
                self.release_segment(segment);
            }
        }
    }

    fn release_segment(&mut self, segment: BufferedSegment) {
        self.pages_used -= segment.page_count();
        for page in segment.into_pages() {
            self.pager.release(page);
        }
    }

    fn check_history(&mut self, p: &PacketManifest, start: Sequence, end: Sequence) {
        let (history_start, history) = self.history.window();
        match compare(start, &p.payload, history_start, history) {
            OverlapVerdict::Retransmission => {
                self.stats.retransmissions += 1;
            }
            OverlapVerdict::Conflict(conflict) => {
                self.raise(AttackKind::Injection, p, (start, end), conflict);
            }
            OverlapVerdict::Disjoint => {
                trace!("过期段超出历史窗口，无法比较: flow={}, [{}, {})", self.flow, start, end);
            }
        }
    }

    fn check_buffered(&mut self, p: &PacketManifest, start: Sequence, end: Sequence) {
        let mut conflicts = Vec::new();
        for (_, segment) in self.ring.iter() {
            let Some((from, to)) = intersect((start, end), (segment.start, segment.end)) else {
                continue;
            };
            let occupant = segment.copy_range(from, to);
            match compare(start, &p.payload, from, &occupant) {
                OverlapVerdict::Retransmission => self.stats.retransmissions += 1,
                OverlapVerdict::Conflict(conflict) => conflicts.push(conflict),
                OverlapVerdict::Disjoint => {}
            }
        }
        for conflict in conflicts {
            self.raise(AttackKind::SegmentVeto, p, (start, end), conflict);
        }
    }

    fn raise(&mut self, kind: AttackKind, p: &PacketManifest, range: (Sequence, Sequence), conflict: Conflict) {
        self.stats.conflicts += 1;
        warn!(
            "检测到重叠字节不一致: kind={}, flow={}, range=[{}, {}), overlap=[{}, {})",
            kind.as_str(),
            p.flow,
            range.0,
            range.1,
            conflict.overlap_start,
            conflict.overlap_end
        );
        self.reporter.report_injection(
            kind,
            p.timestamp,
            &p.flow,
            p.payload.clone(),
            conflict.overlap,
            range,
            (conflict.overlap_start, conflict.overlap_end),
        );
    }

    fn buffer(&mut self, p: &PacketManifest, start: Sequence, end: Sequence) -> Result<InsertStatus> {
        let index = self.ring.slot_index(start);
        if let Some(occupant) = self.ring.get(index) {
            if occupant.end.is_before_or_eq(self.next_seq) {
                if let Some(stale) = self.ring.take(index) {
                    self.release_segment(stale);
                }
            } else if occupant.start == start && occupant.end == end {
                trace!("重复缓存段: flow={}, [{}, {})", self.flow, start, end);
                return Ok(InsertStatus::Duplicate);
            } else {
                self.stats.collisions += 1;
                match self.options.collision_policy {
                    CollisionPolicy::RejectNewer => {
                        warn!(
                            "环形槽位冲突，丢弃新段: flow={}, slot={}, 已有 [{}, {}), 新段 [{}, {})",
                            self.flow, index, occupant.start, occupant.end, start, end
                        );
                        self.stats.dropped_segments += 1;
                        return Ok(InsertStatus::Collision);
                    }
                    CollisionPolicy::EvictOlder => {
                        warn!(
                            "环形槽位冲突，淘汰旧段: flow={}, slot={}, 旧段 [{}, {}), 新段 [{}, {})",
                            self.flow, index, occupant.start, occupant.end, start, end
                        );
                        if let Some(evicted) = self.ring.take(index) {
                            self.release_segment(evicted);
                        }
                    }
                }
            }
        }

        let page_size = self.pager.page_size();
        let needed = p.payload.len().div_ceil(page_size);
        if self.pages_used + needed > self.options.max_pages_per_flow {
            self.stats.dropped_segments += 1;
            debug!(
                "流页配额不足，丢弃乱序段: flow={}, 已用={}, 需要={}, 上限={}",
                self.flow, self.pages_used, needed, self.options.max_pages_per_flow
            );
            return Err(EngineError::PoolExhausted {
                scope: QuotaScope::Flow,
                used: self.pages_used,
                limit: self.options.max_pages_per_flow,
            });
        }

        let mut pages = Vec::with_capacity(needed);
        let mut offset = 0;
        while offset < p.payload.len() {
            match self.pager.acquire() {
                Ok(mut page) => {
                    offset += page.fill(start.add(offset), &p.payload[offset..]);
                    pages.push(page);
                }
                Err(e) => {
                    for page in pages {
                        self.pager.release(page);
                    }
                    self.stats.dropped_segments += 1;
                    debug!("页池不足，丢弃乱序段: flow={}, [{}, {}): {}", self.flow, start, end, e);
                    return Err(e);
                }
            }
        }

        let count = pages.len();
        self.pages_used += count;
        self.stats.buffered_segments += 1;
        self.ring.put(index, BufferedSegment::new(start, p.timestamp, pages));
        trace!(
            "缓存乱序段: flow={}, [{}, {}), slot={}, pages={}, 流已用页={}",
            self.flow, start, end, index, count, self.pages_used
        );
        Ok(InsertStatus::Buffered { pages: count })
    }
}

impl Drop for OrderedCoalesce {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for OrderedCoalesce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedCoalesce")
            .field("flow", &self.flow)
            .field("next_seq", &self.next_seq)
            .field("buffered", &self.ring.len())
            .field("pages_used", &self.pages_used)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PagerConfig;
    use crate::report::EventCollector;
    use crate::types::{Event, TCP_ACK};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::net::{IpAddr, Ipv4Addr};

    fn flow() -> TcpIpFlow {
        TcpIpFlow::new(
            IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            1,
            IpAddr::V4(Ipv4Addr::new(2, 3, 4, 5)),
            2,
        )
    }

    fn pager(capacity: usize, page_size: usize) -> Arc<Pager> {
        let pager = Arc::new(Pager::new(PagerConfig { capacity, page_size }).unwrap());
        pager.start();
        pager
    }

    fn coalesce(
        next: u32,
        pager: &Arc<Pager>,
        reporter: &Arc<EventCollector>,
        options: CoalesceOptions,
    ) -> OrderedCoalesce {
        OrderedCoalesce::new(flow(), Sequence(next), pager.clone(), reporter.clone(), options)
    }

    fn options() -> CoalesceOptions {
        CoalesceOptions {
            ring_capacity: 40,
            max_pages_per_flow: 1024,
            history_bytes: 4096,
            collision_policy: CollisionPolicy::RejectNewer,
        }
    }

    fn packet(seq: u32, payload: &[u8]) -> PacketManifest {
        PacketManifest::tcp(flow(), seq, 0, TCP_ACK, payload.to_vec())
    }

    fn concat(reassemblies: &[Reassembly]) -> Vec<u8> {
        reassemblies.iter().flat_map(|r| r.bytes.iter().copied()).collect()
    }

    #[test]
    fn test_out_of_order_segment_is_buffered() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(1, &pager, &reporter, options());

        let result = c.insert(&packet(3, &[1, 2, 3, 4, 5, 6, 7]), Sequence(1)).unwrap();
        assert_eq!(result.status, InsertStatus::Buffered { pages: 1 });
        assert!(result.reassemblies.is_empty());
        assert_eq!(pager.used(), 1);
        assert_eq!(c.pages_used(), 1);
        assert!(reporter.is_empty());

        drop(c);
        assert_eq!(pager.used(), 0);
        pager.stop();
    }

    #[test]
    fn test_in_order_segment_is_delivered_without_pages() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(100, &pager, &reporter, options());

        let result = c.insert(&packet(100, b"hello"), Sequence(100)).unwrap();
        assert_eq!(result.status, InsertStatus::Delivered);
        assert_eq!(result.reassemblies.len(), 1);
        assert_eq!(result.reassemblies[0].start, Sequence(100));
        assert_eq!(result.reassemblies[0].end, Sequence(105));
        assert_eq!(&result.reassemblies[0].bytes[..], b"hello");
        assert_eq!(c.next_seq(), Sequence(105));
        assert_eq!(pager.used(), 0);
    }

    #[test]
    fn test_gap_fill_flushes_buffered_run() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(1, &pager, &reporter, options());

        c.insert(&packet(8, b"World"), Sequence(1)).unwrap();
        c.insert(&packet(13, b"!"), Sequence(1)).unwrap();
        assert_eq!(pager.used(), 2);

        let result = c.insert(&packet(1, b"Hello, "), Sequence(1)).unwrap();
        assert_eq!(concat(&result.reassemblies), b"Hello, World!");
        assert_eq!(c.next_seq(), Sequence(14));
        assert_eq!(pager.used(), 0);
        assert_eq!(c.buffered_segments(), 0);
    }

    #[test]
    fn test_shuffled_segments_reassemble_in_order() {
        let pager = pager(1024, 4);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(1, &pager, &reporter, options());

        let expected: Vec<u8> = (0..140u8).collect();
        let mut segments: Vec<(u32, Vec<u8>)> = expected
            .chunks(7)
            .enumerate()
            .map(|(i, chunk)| (1 + 7 * i as u32, chunk.to_vec()))
            .collect();
        segments.shuffle(&mut StdRng::seed_from_u64(7));

        let mut stream = Vec::new();
        for (seq, payload) in &segments {
            let result = c.insert(&packet(*seq, payload), Sequence(1)).unwrap();
            stream.extend(concat(&result.reassemblies));
        }
        assert_eq!(stream, expected);
        assert!(reporter.is_empty());
        assert_eq!(pager.used(), 0);
    }

    #[test]
    fn test_identical_retransmission_raises_nothing() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(1, &pager, &reporter, options());

        // 缓存中的重传
        c.insert(&packet(10, b"abcdef"), Sequence(1)).unwrap();
        let dup = c.insert(&packet(10, b"abcdef"), Sequence(1)).unwrap();
        assert_eq!(dup.status, InsertStatus::Duplicate);
        assert_eq!(pager.used(), 1);

        // 已交付后的重传
        c.insert(&packet(1, b"123456789"), Sequence(1)).unwrap();
        let stale = c.insert(&packet(1, b"123456789"), Sequence(1)).unwrap();
        assert_eq!(stale.status, InsertStatus::Stale);
        assert!(reporter.is_empty());
        assert_eq!(c.stats().retransmissions, 2);
    }

    #[test]
    fn test_conflicting_buffered_segment_is_segment_veto() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(1, &pager, &reporter, options());

        c.insert(&packet(100, b"AAAAAAAAAA"), Sequence(1)).unwrap();
        let second = c.insert(&packet(100, b"BBBBBBBBBB"), Sequence(1)).unwrap();
        assert_eq!(second.status, InsertStatus::Duplicate);

        let events = reporter.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Injection(attack) => {
                assert_eq!(attack.kind, AttackKind::SegmentVeto);
                assert_eq!(attack.start, Sequence(100));
                assert_eq!(attack.end, Sequence(110));
                assert_eq!(&attack.payload[..], b"BBBBBBBBBB");
                assert_eq!(&attack.overlap[..], b"AAAAAAAAAA");
                assert_eq!((attack.overlap_start, attack.overlap_end), (0, 10));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_conflict_with_delivered_history_is_injection() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(100, &pager, &reporter, options());

        c.insert(&packet(100, b"AAAAAAAAAA"), Sequence(100)).unwrap();
        let result = c.insert(&packet(100, b"BBBBBBBBBB"), Sequence(100)).unwrap();
        assert_eq!(result.status, InsertStatus::Stale);

        let events = reporter.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Injection(attack) => {
                assert_eq!(attack.kind, AttackKind::Injection);
                assert_eq!((attack.start, attack.end), (Sequence(100), Sequence(110)));
                assert_eq!(&attack.payload[..], b"BBBBBBBBBB");
                assert_eq!(&attack.overlap[..], b"AAAAAAAAAA");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_partial_overlap_delivers_new_tail() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(0, &pager, &reporter, options());

        c.insert(&packet(0, b"abcdef"), Sequence(0)).unwrap();
        let result = c.insert(&packet(3, b"dXfghi"), Sequence(0)).unwrap();
        assert_eq!(concat(&result.reassemblies), b"ghi");
        assert_eq!(c.next_seq(), Sequence(9));

        let events = reporter.take();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Injection(attack) => {
                assert_eq!(&attack.overlap[..], b"def");
                assert_eq!((attack.overlap_start, attack.overlap_end), (0, 3));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_in_order_segment_conflicting_with_buffer_is_flagged() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(0, &pager, &reporter, options());

        c.insert(&packet(5, b"56789"), Sequence(0)).unwrap();
        let result = c.insert(&packet(0, b"01234XY"), Sequence(0)).unwrap();
        // 新段先交付，缓存段只交付未覆盖的尾部
        assert_eq!(concat(&result.reassemblies), b"01234XY789");
        assert_eq!(reporter.len(), 1);
        assert_eq!(pager.used(), 0);
    }

    #[test]
    fn test_per_flow_quota_drops_segments() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(
            0,
            &pager,
            &reporter,
            CoalesceOptions { max_pages_per_flow: 3, ..options() },
        );

        for i in 0..3u32 {
            c.insert(&packet(100 + i * 10, b"x"), Sequence(0)).unwrap();
        }
        let err = c.insert(&packet(205, b"y"), Sequence(0)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PoolExhausted { scope: QuotaScope::Flow, used: 3, limit: 3 }
        ));
        assert_eq!(c.pages_used(), 3);
        assert_eq!(c.stats().dropped_segments, 1);
    }

    #[test]
    fn test_failed_buffer_keeps_data_delivered_by_hint() {
        let pager = pager(64, 4);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(
            0,
            &pager,
            &reporter,
            CoalesceOptions { max_pages_per_flow: 3, ..options() },
        );

        c.insert(&packet(10, b"abcd"), Sequence(0)).unwrap();
        // 提示推进到 10 交付 "abcd"，随后 16 字节的乱序段超出流配额
        let err = c.insert(&packet(100, &[b'z'; 16]), Sequence(10)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PoolExhausted { scope: QuotaScope::Flow, used: 0, limit: 3 }
        ));
        assert_eq!(c.next_seq(), Sequence(14));
        assert_eq!(pager.used(), 0);

        let result = c.insert(&packet(14, b"ef"), Sequence(14)).unwrap();
        assert_eq!(result.status, InsertStatus::Delivered);
        assert_eq!(concat(&result.reassemblies), b"abcdef");
        assert!(c.take_pending().is_empty());
    }

    #[test]
    fn test_take_pending_after_failed_buffer() {
        let pager = pager(64, 4);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(
            0,
            &pager,
            &reporter,
            CoalesceOptions { max_pages_per_flow: 3, ..options() },
        );

        c.insert(&packet(10, b"abcd"), Sequence(0)).unwrap();
        assert!(c.insert(&packet(100, &[b'z'; 16]), Sequence(10)).is_err());
        let pending = c.take_pending();
        assert_eq!(concat(&pending), b"abcd");
        assert_eq!(pending[0].start, Sequence(10));
        assert!(c.advance(Sequence(14)).unwrap().is_empty());
    }

    #[test]
    fn test_global_exhaustion_releases_partial_pages() {
        let pager = pager(2, 4);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(0, &pager, &reporter, options());

        // 需要 3 页，只能拿到 2 页
        let err = c.insert(&packet(100, b"0123456789"), Sequence(0)).unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { scope: QuotaScope::Global, .. }));
        assert_eq!(pager.used(), 0);
        assert_eq!(c.pages_used(), 0);
    }

    #[test]
    fn test_large_segment_spans_pages() {
        let pager = pager(16, 4);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(0, &pager, &reporter, options());

        let result = c.insert(&packet(10, b"0123456789"), Sequence(0)).unwrap();
        assert_eq!(result.status, InsertStatus::Buffered { pages: 3 });
        assert_eq!(pager.used(), 3);

        let result = c.insert(&packet(0, b"abcdefghij"), Sequence(0)).unwrap();
        assert_eq!(concat(&result.reassemblies), b"abcdefghij0123456789");
        assert_eq!(pager.used(), 0);
    }

    #[test]
    fn test_slot_collision_policies() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());

        let mut reject = coalesce(0, &pager, &reporter, options());
        reject.insert(&packet(3, b"aaa"), Sequence(0)).unwrap();
        let result = reject.insert(&packet(43, b"bbb"), Sequence(0)).unwrap();
        assert_eq!(result.status, InsertStatus::Collision);
        assert_eq!(reject.buffered_segments(), 1);

        let mut evict = coalesce(
            0,
            &pager,
            &reporter,
            CoalesceOptions { collision_policy: CollisionPolicy::EvictOlder, ..options() },
        );
        evict.insert(&packet(3, b"aaa"), Sequence(0)).unwrap();
        let result = evict.insert(&packet(43, b"bbb"), Sequence(0)).unwrap();
        assert_eq!(result.status, InsertStatus::Buffered { pages: 1 });
        assert_eq!(evict.pages_used(), 1);
        assert_eq!(evict.stats().collisions, 1);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_hint_advances_and_never_regresses() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(10, &pager, &reporter, options());

        c.insert(&packet(20, b"zz"), Sequence(10)).unwrap();
        // 提示领先时推进并交付刚好衔接的缓存段
        let result = c.insert(&packet(0, b""), Sequence(20)).unwrap();
        assert_eq!(result.status, InsertStatus::Delivered);
        assert_eq!(concat(&result.reassemblies), b"zz");
        assert_eq!(c.next_seq(), Sequence(22));

        c.insert(&packet(0, b""), Sequence(5)).unwrap();
        assert_eq!(c.next_seq(), Sequence(22));
    }

    #[test]
    fn test_insert_after_close_is_rejected() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let mut c = coalesce(0, &pager, &reporter, options());

        c.insert(&packet(50, b"abc"), Sequence(0)).unwrap();
        c.insert(&packet(60, b"def"), Sequence(0)).unwrap();
        assert_eq!(c.close(), 2);
        assert_eq!(pager.used(), 0);
        assert!(matches!(
            c.insert(&packet(0, b"x"), Sequence(0)),
            Err(EngineError::FlowTeardownInProgress)
        ));
        assert_eq!(c.close(), 0);
    }

    #[test]
    fn test_wraparound_sequence_space() {
        let pager = pager(1024, 1900);
        let reporter = Arc::new(EventCollector::new());
        let isn = u32::MAX - 3;
        let mut c = coalesce(isn, &pager, &reporter, options());

        c.insert(&packet(isn.wrapping_add(4), b"5678"), Sequence(isn)).unwrap();
        let result = c.insert(&packet(isn, b"1234"), Sequence(isn)).unwrap();
        assert_eq!(concat(&result.reassemblies), b"12345678");
        assert_eq!(c.next_seq(), Sequence(4));
    }
}
