use std::fmt;
use std::net::IpAddr;

/// 单个方向的 TCP/IP 四元组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpIpFlow {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

/// 规范化后的流标识，连接的两个方向映射到同一个 key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub lower: (IpAddr, u16),
    pub upper: (IpAddr, u16),
}

impl TcpIpFlow {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        Self { src_ip, src_port, dst_ip, dst_port }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }

    pub fn key(&self) -> FlowKey {
        let src = (self.src_ip, self.src_port);
        let dst = (self.dst_ip, self.dst_port);
        if src <= dst {
            FlowKey { lower: src, upper: dst }
        } else {
            FlowKey { lower: dst, upper: src }
        }
    }

    /// 当前方向是否就是规范化后的方向
    pub fn is_canonical(&self) -> bool {
        (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for TcpIpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}-{}:{}", self.lower.0, self.lower.1, self.upper.0, self.upper.1)
    }
}
