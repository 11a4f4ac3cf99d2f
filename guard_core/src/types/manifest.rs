use std::net::IpAddr;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::flow::TcpIpFlow;
use super::sequence::Sequence;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

#[derive(Debug, Clone, PartialEq)]
pub struct IpHeader {
    pub version: u8,
    pub ttl: u8,
    pub identification: u16,
    pub protocol: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

impl TcpHeader {
    pub fn syn(&self) -> bool {
        self.flags & TCP_SYN != 0
    }

    pub fn ack_flag(&self) -> bool {
        self.flags & TCP_ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.flags & TCP_FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.flags & TCP_RST != 0
    }
}

/// 捕获端交给检测引擎的单个报文记录，引擎只读不改
#[derive(Debug, Clone)]
pub struct PacketManifest {
    pub timestamp: DateTime<Utc>,
    pub flow: TcpIpFlow,
    pub ip: IpHeader,
    pub tcp: TcpHeader,
    pub payload: Bytes,
}

impl PacketManifest {
    /// 根据流方向和 TCP 字段构造报文，IP 头部取常见默认值
    pub fn tcp(
        flow: TcpIpFlow,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        let version = if flow.src_ip.is_ipv4() { 4 } else { 6 };
        Self {
            timestamp: Utc::now(),
            flow,
            ip: IpHeader {
                version,
                ttl: 64,
                identification: 0,
                protocol: 6,
                src_ip: flow.src_ip,
                dst_ip: flow.dst_ip,
            },
            tcp: TcpHeader {
                src_port: flow.src_port,
                dst_port: flow.dst_port,
                seq,
                ack,
                flags,
                window: 65535,
            },
            payload: payload.into(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn seq(&self) -> Sequence {
        Sequence(self.tcp.seq)
    }

    pub fn ack(&self) -> Sequence {
        Sequence(self.tcp.ack)
    }

    /// 负载覆盖的序列号区间 [start, end)
    pub fn seq_range(&self) -> (Sequence, Sequence) {
        let start = self.seq();
        (start, start.add(self.payload.len()))
    }
}
