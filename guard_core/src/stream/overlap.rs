//! 重叠区间比较
//!
//! 新段与已缓存段或已交付历史在同一序列区间上的字节不一致时，
//! 引擎无法判断哪一方被攻击者篡改，只能如实上报两份字节。

use bytes::Bytes;

use crate::types::Sequence;

/// 两个半开区间的交集
pub fn intersect(
    a: (Sequence, Sequence),
    b: (Sequence, Sequence),
) -> Option<(Sequence, Sequence)> {
    let start = a.0.later(b.0);
    let end = a.1.earlier(b.1);
    if start.is_before(end) {
        Some((start, end))
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// 原占用者在交集内的字节
    pub overlap: Bytes,
    /// 交集相对新段起点的偏移，end 不含
    pub overlap_start: usize,
    pub overlap_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlapVerdict {
    Disjoint,
    Retransmission,
    Conflict(Conflict),
}

/// 逐字节比较新段与占用者在交集上的内容
pub fn compare(
    attempt_start: Sequence,
    attempt: &[u8],
    occupant_start: Sequence,
    occupant: &[u8],
) -> OverlapVerdict {
    let attempt_range = (attempt_start, attempt_start.add(attempt.len()));
    let occupant_range = (occupant_start, occupant_start.add(occupant.len()));
    let Some((start, end)) = intersect(attempt_range, occupant_range) else {
        return OverlapVerdict::Disjoint;
    };

    let len = end.offset_from(start);
    let a = start.offset_from(attempt_start);
    let o = start.offset_from(occupant_start);
    let theirs = &occupant[o..o + len];
    if attempt[a..a + len] == *theirs {
        OverlapVerdict::Retransmission
    } else {
        OverlapVerdict::Conflict(Conflict {
            overlap: Bytes::copy_from_slice(theirs),
            overlap_start: a,
            overlap_end: a + len,
        })
    }
}
