use std::sync::Arc;

use bytes::Bytes;
use log::{debug, trace, warn};
use tokio::time::{Duration, Instant};

use super::coalesce::{CoalesceOptions, OrderedCoalesce};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::memory::Pager;
use crate::report::AttackReporter;
use crate::types::{
    AttackKind, FlowKey, PacketManifest, Reassembly, ReassemblySink, Sequence, TcpIpFlow,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Listen,
    SynSent,
    SynReceived,
    Established,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub coalesce: CoalesceOptions,
    /// 没有看到握手的连接也跟踪，各方向以首个数据段为起点
    pub allow_midstream: bool,
}

impl From<&Config> for ConnectionOptions {
    fn from(config: &Config) -> Self {
        Self {
            coalesce: CoalesceOptions::from(config),
            allow_midstream: config.allow_midstream,
        }
    }
}

#[derive(Debug)]
struct Direction {
    coalesce: OrderedCoalesce,
    /// 首个 FIN 段负载末尾的序列号，记录后不再改变
    fin_at: Option<Sequence>,
    fin_done: bool,
}

impl Direction {
    fn new(coalesce: OrderedCoalesce) -> Self {
        Self { coalesce, fin_at: None, fin_done: false }
    }
}

/// 一条 TCP 连接：握手状态机加上两个方向各自的有序合并器
pub struct Connection {
    key: FlowKey,
    state: TcpState,
    client_flow: Option<TcpIpFlow>,
    client_isn: Option<Sequence>,
    server_isn: Option<Sequence>,
    client: Option<Direction>,
    server: Option<Direction>,
    pager: Arc<Pager>,
    reporter: Arc<dyn AttackReporter>,
    sink: Arc<dyn ReassemblySink>,
    options: ConnectionOptions,
    created: Instant,
    last_seen: Instant,
    packets: u64,
    hijacks: u64,
    fin_conflicts: u64,
}

impl Connection {
    pub fn new(
        key: FlowKey,
        pager: Arc<Pager>,
        reporter: Arc<dyn AttackReporter>,
        sink: Arc<dyn ReassemblySink>,
        options: ConnectionOptions,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            state: TcpState::Listen,
            client_flow: None,
            client_isn: None,
            server_isn: None,
            client: None,
            server: None,
            pager,
            reporter,
            sink,
            options,
            created: now,
            last_seen: now,
            packets: 0,
            hijacks: 0,
            fin_conflicts: 0,
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn client_flow(&self) -> Option<TcpIpFlow> {
        self.client_flow
    }

    pub fn client_isn(&self) -> Option<Sequence> {
        self.client_isn
    }

    pub fn server_isn(&self) -> Option<Sequence> {
        self.server_isn
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn hijacks(&self) -> u64 {
        self.hijacks
    }

    /// FIN 位置不一致或越过 FIN 的数据段数
    pub fn fin_conflicts(&self) -> u64 {
        self.fin_conflicts
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn pages_used(&self) -> usize {
        [&self.client, &self.server]
            .into_iter()
            .flatten()
            .map(|d| d.coalesce.pages_used())
            .sum()
    }

    pub fn next_seq(&self, flow: &TcpIpFlow) -> Option<Sequence> {
        let direction = if self.is_client(flow) { &self.client } else { &self.server };
        direction.as_ref().map(|d| d.coalesce.next_seq())
    }

    pub fn process(&mut self, p: &PacketManifest) -> Result<TcpState> {
        if self.state == TcpState::Closed {
            return Err(EngineError::FlowTeardownInProgress);
        }
        self.last_seen = Instant::now();
        self.packets += 1;

        if p.tcp.rst() {
            debug!("收到 RST，拆除连接: {}", self.key);
            self.teardown();
            return Ok(self.state);
        }

        match self.state {
            TcpState::Listen => self.on_listen(p)?,
            TcpState::SynSent => self.on_syn_sent(p),
            TcpState::SynReceived => self.on_syn_received(p)?,
            TcpState::Established | TcpState::Closing => self.on_established(p)?,
            TcpState::Closed => {}
        }
        Ok(self.state)
    }

    /// 释放两个方向占用的所有页，返回释放的页数
    pub fn teardown(&mut self) -> usize {
        let mut released = 0;
        for mut direction in [self.client.take(), self.server.take()].into_iter().flatten() {
            released += direction.coalesce.close();
        }
        if self.state != TcpState::Closed {
            debug!("连接拆除: {}, 释放页数={}", self.key, released);
        }
        self.state = TcpState::Closed;
        released
    }

    fn is_client(&self, flow: &TcpIpFlow) -> bool {
        self.client_flow == Some(*flow)
    }

    fn on_listen(&mut self, p: &PacketManifest) -> Result<()> {
        if p.tcp.syn() && !p.tcp.ack_flag() {
            self.client_flow = Some(p.flow);
            self.client_isn = Some(p.seq());
            self.state = TcpState::SynSent;
            trace!("客户端 SYN: {}, isn={}", p.flow, p.seq());
        } else if self.options.allow_midstream && !p.tcp.syn() && !p.payload.is_empty() {
            debug!("中途接入连接: {}, seq={}", p.flow, p.seq());
            self.client_flow = Some(p.flow);
            self.state = TcpState::Established;
            self.on_data(p)?;
        } else {
            trace!("忽略握手前的报文: {}", p.flow);
        }
        Ok(())
    }

    fn on_syn_sent(&mut self, p: &PacketManifest) {
        let Some(client_isn) = self.client_isn else {
            return;
        };
        if self.is_client(&p.flow) {
            if p.tcp.syn() && !p.tcp.ack_flag() && p.seq() != client_isn {
                debug!("客户端重新发起 SYN: {}, isn {} -> {}", p.flow, client_isn, p.seq());
                self.client_isn = Some(p.seq());
            }
            return;
        }
        if p.tcp.syn() && p.tcp.ack_flag() {
            if p.ack() == client_isn.add(1) {
                self.server_isn = Some(p.seq());
                self.state = TcpState::SynReceived;
                trace!("服务端 SYN-ACK: {}, isn={}", p.flow, p.seq());
            } else {
                debug!("SYN-ACK 确认号不匹配，忽略: {}, ack={}, 期望={}", p.flow, p.ack(), client_isn.add(1));
            }
        }
    }

    fn on_syn_received(&mut self, p: &PacketManifest) -> Result<()> {
        let (Some(client_isn), Some(server_isn)) = (self.client_isn, self.server_isn) else {
            return Ok(());
        };
        if !self.is_client(&p.flow) {
            if p.tcp.syn() && p.tcp.ack_flag() {
                self.check_hijack(p);
            }
            return Ok(());
        }
        if p.tcp.ack_flag()
            && !p.tcp.syn()
            && p.seq() == client_isn.add(1)
            && p.ack() == server_isn.add(1)
        {
            self.establish(client_isn, server_isn);
            if !p.payload.is_empty() || p.tcp.fin() {
                self.on_data(p)?;
            }
        } else {
            trace!("握手第三步不匹配，忽略: {}", p.flow);
        }
        Ok(())
    }

    fn on_established(&mut self, p: &PacketManifest) -> Result<()> {
        if p.tcp.syn() {
            if p.tcp.ack_flag() && !self.is_client(&p.flow) {
                self.check_hijack(p);
            }
            return Ok(());
        }
        self.on_data(p)
    }

    fn establish(&mut self, client_isn: Sequence, server_isn: Sequence) {
        let Some(client_flow) = self.client_flow else {
            return;
        };
        self.client = Some(self.direction(client_flow, client_isn.add(1)));
        self.server = Some(self.direction(client_flow.reverse(), server_isn.add(1)));
        self.state = TcpState::Established;
        debug!("连接建立: {}", self.key);
    }

    fn direction(&self, flow: TcpIpFlow, next: Sequence) -> Direction {
        Direction::new(OrderedCoalesce::new(
            flow,
            next,
            self.pager.clone(),
            self.reporter.clone(),
            self.options.coalesce.clone(),
        ))
    }

    fn check_hijack(&mut self, p: &PacketManifest) {
        let (Some(client_isn), Some(server_isn)) = (self.client_isn, self.server_isn) else {
            return;
        };
        if p.seq() == server_isn && p.ack() == client_isn.add(1) {
            trace!("SYN-ACK 重传: {}", p.flow);
            return;
        }
        self.hijacks += 1;
        warn!(
            "检测到握手劫持: {}, seq={} (记录 {}), ack={} (期望 {})",
            p.flow,
            p.seq(),
            server_isn,
            p.ack(),
            client_isn.add(1)
        );
        self.reporter.report_hijack(p.timestamp, &p.flow, p.tcp.seq, p.tcp.ack);
    }

    fn on_data(&mut self, p: &PacketManifest) -> Result<()> {
        let from_client = self.is_client(&p.flow);
        let missing = if from_client { self.client.is_none() } else { self.server.is_none() };
        if missing {
            if !self.options.allow_midstream {
                trace!("方向尚未建立，忽略: {}", p.flow);
                return Ok(());
            }
            debug!("中途接入方向: {}, seq={}", p.flow, p.seq());
            let direction = self.direction(p.flow, p.seq());
            if from_client {
                self.client = Some(direction);
            } else {
                self.server = Some(direction);
            }
        }

        let slot = if from_client { self.client.as_mut() } else { self.server.as_mut() };
        let Some(direction) = slot else {
            return Ok(());
        };

        let (start, end) = p.seq_range();
        let recorded = direction.fin_at;
        let fin_conflict = match recorded {
            // 越过 FIN 的数据不裁剪，整段作为注入上报并丢弃
            Some(fin_at) if !p.payload.is_empty() && fin_at.is_before(end) => {
                warn!("FIN 之后出现数据: {}, fin={}, range=[{}, {})", p.flow, fin_at, start, end);
                let overlap_start = if start.is_before(fin_at) { fin_at.offset_from(start) } else { 0 };
                self.fin_conflicts += 1;
                self.reporter.report_injection(
                    AttackKind::Injection,
                    p.timestamp,
                    &p.flow,
                    p.payload.clone(),
                    Bytes::new(),
                    (start, end),
                    (overlap_start, p.payload.len()),
                );
                return Ok(());
            }
            Some(fin_at) => p.tcp.fin() && fin_at != end,
            // 缓存中已有越过该位置的数据，FIN 不记录
            None if p.tcp.fin() => {
                let contradicted = direction.coalesce.has_buffered_after(end);
                if !contradicted {
                    direction.fin_at = Some(end);
                }
                contradicted
            }
            None => false,
        };
        if fin_conflict {
            warn!("FIN 位置不一致: {}, 新 FIN {}, 记录 {:?}", p.flow, end, recorded);
            self.fin_conflicts += 1;
            self.reporter.report_injection(
                AttackKind::Injection,
                p.timestamp,
                &p.flow,
                p.payload.clone(),
                Bytes::new(),
                (start, end.add(1)),
                (p.payload.len(), p.payload.len() + 1),
            );
        }

        let hint = direction.coalesce.next_seq();
        let mut delivered: Vec<Reassembly> = match direction.coalesce.insert(p, hint) {
            Ok(inserted) => inserted.reassemblies,
            Err(e) => {
                for reassembly in direction.coalesce.take_pending() {
                    self.sink.reassembled(&p.flow, reassembly);
                }
                return Err(e);
            }
        };

        // FIN 之前的数据全部交付后，FIN 本身占用一个序列号
        if let Some(fin) = direction.fin_at {
            if !direction.fin_done && direction.coalesce.next_seq() == fin {
                delivered.extend(direction.coalesce.advance(fin.add(1))?);
                direction.fin_done = true;
                debug!("方向关闭: {}, fin={}", p.flow, fin);
            }
        }

        for reassembly in delivered {
            self.sink.reassembled(&p.flow, reassembly);
        }

        let client_done = self.client.as_ref().is_some_and(|d| d.fin_done);
        let server_done = self.server.as_ref().is_some_and(|d| d.fin_done);
        if client_done && server_done {
            self.teardown();
        } else if client_done || server_done {
            self.state = TcpState::Closing;
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("client_isn", &self.client_isn)
            .field("server_isn", &self.server_isn)
            .field("pages_used", &self.pages_used())
            .finish()
    }
}
