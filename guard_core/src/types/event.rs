use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::flow::TcpIpFlow;
use super::sequence::Sequence;

/// 注入类攻击的细分类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttackKind {
    /// 与已交付字节冲突
    Injection,
    /// 与尚未交付的缓存段冲突，无法判断哪一方被篡改
    SegmentVeto,
}

impl AttackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::Injection => "injection",
            AttackKind::SegmentVeto => "segment veto",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HijackAttack {
    pub time: DateTime<Utc>,
    pub flow: TcpIpFlow,
    pub seq: u32,
    pub ack: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectionAttack {
    pub kind: AttackKind,
    pub time: DateTime<Utc>,
    pub flow: TcpIpFlow,
    /// 新到达段的完整负载
    pub payload: Bytes,
    /// 原占用者在重叠区间内的字节
    pub overlap: Bytes,
    pub start: Sequence,
    pub end: Sequence,
    /// 重叠区间相对 start 的偏移，end 不含
    pub overlap_start: usize,
    pub overlap_end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Hijack(HijackAttack),
    Injection(InjectionAttack),
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Hijack(_) => "hijack",
            Event::Injection(attack) => attack.kind.as_str(),
        }
    }

    pub fn flow(&self) -> &TcpIpFlow {
        match self {
            Event::Hijack(attack) => &attack.flow,
            Event::Injection(attack) => &attack.flow,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Event::Hijack(attack) => attack.time,
            Event::Injection(attack) => attack.time,
        }
    }
}
