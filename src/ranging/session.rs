//! 测距 driver
//!
//! 单个 UDP 套接字承载双向探测：本端按固定间隔向 peer 发 Request，
//! 对方回 Reply，RTT 换算为距离采样；同时应答对方发来的 Request。
//! 探测包携带 token 里的 16 字节会话密钥做归属校验，串线的包直接丢弃。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DistanceSample, RangingClient, RangingCommand, RangingEvent, RangingHandle, RemovalReason,
};
use crate::config::VerifierConfig;
use crate::protocol::HandshakeToken;
use crate::{VerifyError, VerifyResult};

/// 握手 token 的内部结构；只有测距层解析它
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct TokenInfo {
    session_id: Uuid,
    /// token 所有者的探测端点
    addr: SocketAddr,
    /// 会话密钥，探测包归属校验用
    key: [u8; 16],
}

impl TokenInfo {
    fn encode(&self) -> VerifyResult<HandshakeToken> {
        Ok(HandshakeToken::from_bytes(serde_json::to_vec(self)?))
    }

    fn decode(token: &HandshakeToken) -> VerifyResult<Self> {
        serde_json::from_slice(token.as_bytes()).map_err(VerifyError::Decoding)
    }
}

/// 探测包
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
enum Probe {
    Request {
        /// 接收方的会话密钥
        to_key: [u8; 16],
        /// 发起方的会话密钥，Reply 按它回填
        from_key: [u8; 16],
        seq: u64,
    },
    Reply {
        to_key: [u8; 16],
        seq: u64,
    },
    Bye {
        to_key: [u8; 16],
    },
}

/// 本地硬件/环境是否支持测距（能否绑定 UDP 探测套接字）
pub fn check_capability() -> bool {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).is_ok()
}

/// 探活链路状态（挂起语义的核心，独立出来便于测试）
#[derive(Debug, Default)]
struct LinkState {
    peer: Option<TokenInfo>,
    suspended: bool,
}

impl LinkState {
    /// 配置 peer；返回需要开始探测的目标（挂起中只保留不探测）
    fn configure(&mut self, peer: TokenInfo) -> Option<TokenInfo> {
        self.peer = Some(peer.clone());
        (!self.suspended).then_some(peer)
    }

    fn suspend(&mut self) {
        self.suspended = true;
    }

    /// 恢复；若挂起前已配置 peer，返回需要重新应用的 token
    fn resume(&mut self) -> Option<TokenInfo> {
        self.suspended = false;
        self.peer.clone()
    }

    fn clear_peer(&mut self) -> Option<TokenInfo> {
        self.peer.take()
    }
}

/// 测距 driver
pub struct RangingSession {
    cfg: VerifierConfig,
    events: mpsc::UnboundedSender<RangingEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    socket: Option<Arc<UdpSocket>>,
    local: Option<TokenInfo>,
    link: LinkState,
    /// 探测发送任务（每次 configure/resume 重建）
    probe_task: Option<JoinHandle<()>>,
    /// 接收任务（整个会话一个）
    recv_task: Option<JoinHandle<()>>,
    /// 在途探测：seq -> 发出时刻
    pending: Arc<DashMap<u64, Instant>>,
}

/// 接收任务发回 driver 的内部消息
enum Internal {
    ByeReceived,
    ProbeTimeout,
    SocketError(String),
}

impl RangingSession {
    /// 启动 driver，返回命令句柄与事件接收端
    pub fn spawn(cfg: VerifierConfig) -> (RangingClient, mpsc::UnboundedReceiver<RangingEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();

        let mut driver = RangingSession {
            cfg,
            events: event_tx,
            internal_tx,
            socket: None,
            local: None,
            link: LinkState::default(),
            probe_task: None,
            recv_task: None,
            pending: Arc::new(DashMap::new()),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => driver.handle_command(cmd).await,
                        None => {
                            driver.teardown();
                            break;
                        }
                    },
                    Some(msg) = internal_rx.recv() => driver.handle_internal(msg),
                }
            }
        });

        (RangingClient { tx: cmd_tx }, event_rx)
    }

    async fn handle_command(&mut self, cmd: RangingCommand) {
        match cmd {
            RangingCommand::Start { reply } => {
                if let Some(local) = &self.local {
                    // 幂等：返回同一个 token
                    let _ = reply.send(local.encode().map(|t| RangingHandle { local_token: t }));
                    return;
                }
                let _ = reply.send(self.start().await);
            }

            RangingCommand::Configure { peer_token } => match TokenInfo::decode(&peer_token) {
                Ok(peer) => {
                    info!(peer_addr = %peer.addr, "ranging configured");
                    if let Some(target) = self.link.configure(peer) {
                        self.restart_probe(target);
                    }
                }
                Err(e) => {
                    warn!("malformed peer ranging token: {}", e);
                    let _ = self.events.send(RangingEvent::Invalidated {
                        reason: format!("malformed peer token: {e}"),
                    });
                }
            },

            RangingCommand::Suspend => {
                self.link.suspend();
                self.stop_probe();
                let _ = self.events.send(RangingEvent::Suspended);
            }

            RangingCommand::Resume => {
                // 用保留的 token 重新配置，协调器不参与
                let retained = self.link.resume();
                let _ = self.events.send(RangingEvent::Resumed);
                if let Some(target) = retained {
                    self.restart_probe(target);
                }
            }

            RangingCommand::Stop => self.teardown(),
        }
    }

    /// 绑定探测套接字并生成本端 token
    async fn start(&mut self) -> VerifyResult<RangingHandle> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(VerifyError::from_bind)?;
        let port = socket.local_addr().map_err(VerifyError::from_bind)?.port();
        let socket = Arc::new(socket);

        let local = TokenInfo {
            session_id: Uuid::new_v4(),
            addr: SocketAddr::new(IpAddr::V4(local_ip()), port),
            key: session_key(),
        };

        info!(addr = %local.addr, "ranging session opened");

        self.recv_task = Some(spawn_recv(
            socket.clone(),
            local.key,
            self.cfg.clone(),
            self.pending.clone(),
            self.events.clone(),
            self.internal_tx.clone(),
        ));
        self.socket = Some(socket);

        let token = local.encode()?;
        self.local = Some(local);
        Ok(RangingHandle { local_token: token })
    }

    /// 重建探测发送任务
    fn restart_probe(&mut self, target: TokenInfo) {
        self.stop_probe();
        let (Some(socket), Some(local)) = (self.socket.clone(), self.local.clone()) else {
            let _ = self.events.send(RangingEvent::Invalidated {
                reason: "configure before start".into(),
            });
            return;
        };
        self.pending.clear();
        self.probe_task = Some(spawn_probe(
            socket,
            local.key,
            target,
            self.cfg.clone(),
            self.pending.clone(),
            self.internal_tx.clone(),
        ));
    }

    fn stop_probe(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ByeReceived => {
                if self.link.clear_peer().is_some() {
                    self.stop_probe();
                    let _ = self.events.send(RangingEvent::PeerRemoved {
                        reason: RemovalReason::PeerEnded,
                    });
                }
            }
            Internal::ProbeTimeout => {
                if self.link.clear_peer().is_some() {
                    self.stop_probe();
                    let _ = self.events.send(RangingEvent::PeerRemoved {
                        reason: RemovalReason::Timeout,
                    });
                }
            }
            Internal::SocketError(reason) => {
                let _ = self.events.send(RangingEvent::Invalidated { reason });
                self.teardown();
            }
        }
    }

    /// 关闭会话：通知 peer、终止任务、释放套接字
    fn teardown(&mut self) {
        if let (Some(socket), Some(peer)) = (&self.socket, &self.link.peer) {
            // 尽力而为的 Bye，让对方立刻收到 PeerEnded 而不是等超时
            if let Ok(bye) = serde_json::to_vec(&Probe::Bye { to_key: peer.key }) {
                let socket = socket.clone();
                let addr = peer.addr;
                tokio::spawn(async move {
                    let _ = socket.send_to(&bye, addr).await;
                });
            }
        }
        self.stop_probe();
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.socket = None;
        self.local = None;
        self.link = LinkState::default();
        self.pending.clear();
    }
}

/// 探测发送任务：按采样间隔发 Request，并检测连续丢包
fn spawn_probe(
    socket: Arc<UdpSocket>,
    local_key: [u8; 16],
    target: TokenInfo,
    cfg: VerifierConfig,
    pending: Arc<DashMap<u64, Instant>>,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.sample_interval);
        let mut seq: u64 = 0;
        // 在途表只保留最近窗口内的探测，零星丢包不会无限累积
        let stale_after = cfg.sample_interval * (cfg.probe_loss_limit + 2);
        loop {
            ticker.tick().await;

            pending.retain(|_, sent| sent.elapsed() < stale_after);
            if pending.len() as u32 > cfg.probe_loss_limit {
                debug!(outstanding = pending.len(), "ranging peer timed out");
                let _ = internal.send(Internal::ProbeTimeout);
                return;
            }

            seq += 1;
            let request = Probe::Request {
                to_key: target.key,
                from_key: local_key,
                seq,
            };
            let Ok(packet) = serde_json::to_vec(&request) else {
                return;
            };
            pending.insert(seq, Instant::now());
            if let Err(e) = socket.send_to(&packet, target.addr).await {
                let _ = internal.send(Internal::SocketError(e.to_string()));
                return;
            }
        }
    })
}

/// 接收任务：应答对方的 Request，用 Reply 计算 RTT 采样
fn spawn_recv(
    socket: Arc<UdpSocket>,
    local_key: [u8; 16],
    cfg: VerifierConfig,
    pending: Arc<DashMap<u64, Instant>>,
    events: mpsc::UnboundedSender<RangingEvent>,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        loop {
            let (n, src) = match socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    let _ = internal.send(Internal::SocketError(e.to_string()));
                    return;
                }
            };
            let Ok(probe) = serde_json::from_slice::<Probe>(&buf[..n]) else {
                debug!(from = %src, "ignoring malformed probe");
                continue;
            };
            match probe {
                Probe::Request { to_key, from_key, seq } if to_key == local_key => {
                    let reply = Probe::Reply {
                        to_key: from_key,
                        seq,
                    };
                    if let Ok(packet) = serde_json::to_vec(&reply) {
                        let _ = socket.send_to(&packet, src).await;
                    }
                }
                Probe::Reply { to_key, seq } if to_key == local_key => {
                    if let Some((_, sent)) = pending.remove(&seq) {
                        let rtt_ms = sent.elapsed().as_secs_f32() * 1000.0;
                        let sample = DistanceSample {
                            distance: rtt_ms * cfg.metres_per_rtt_ms,
                            direction: None,
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let _ = events.send(RangingEvent::Sample { sample });
                    }
                }
                Probe::Bye { to_key } if to_key == local_key => {
                    let _ = internal.send(Internal::ByeReceived);
                }
                // 密钥不匹配：串线的包，丢弃
                _ => {}
            }
        }
    })
}

/// 生成 16 字节会话密钥
fn session_key() -> [u8; 16] {
    let mut key = [0u8; 16];
    rand::rng().fill_bytes(&mut key);
    key
}

/// 探测本机默认路由网卡的 IPv4 地址
///
/// UDP connect 不发包，只让内核完成路由选择；失败回退 loopback。
fn local_ip() -> Ipv4Addr {
    std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|s| {
            s.connect(("8.8.8.8", 80))?;
            s.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::LOCALHOST)
}
