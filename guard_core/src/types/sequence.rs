use std::fmt;

use serde::{Deserialize, Serialize};

/// 32 位 TCP 序列号，比较和运算均按模 2^32 回绕处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(pub u32);

impl Sequence {
    pub const fn new(seq: u32) -> Self {
        Sequence(seq)
    }

    /// 从 self 到 other 的有符号距离
    pub fn difference(self, other: Sequence) -> i32 {
        other.0.wrapping_sub(self.0) as i32
    }

    pub fn add(self, n: usize) -> Sequence {
        Sequence(self.0.wrapping_add(n as u32))
    }

    pub fn is_before(self, other: Sequence) -> bool {
        self.difference(other) > 0
    }

    pub fn is_after(self, other: Sequence) -> bool {
        self.difference(other) < 0
    }

    pub fn is_before_or_eq(self, other: Sequence) -> bool {
        self.difference(other) >= 0
    }

    /// 两者中较靠后的序列号
    pub fn later(self, other: Sequence) -> Sequence {
        if other.is_after(self) {
            other
        } else {
            self
        }
    }

    pub fn earlier(self, other: Sequence) -> Sequence {
        if other.is_before(self) {
            other
        } else {
            self
        }
    }

    /// self 相对于 base 的非负偏移；调用方需保证 self 不早于 base
    pub fn offset_from(self, base: Sequence) -> usize {
        base.difference(self) as u32 as usize
    }
}

impl From<u32> for Sequence {
    fn from(seq: u32) -> Self {
        Sequence(seq)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
