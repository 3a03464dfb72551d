//! LAN 传输 driver
//!
//! 发现：UDP 多播宣告/浏览，按展示名去重，超过存活窗口未宣告判定丢失。
//! 会话：TCP + 长度前缀帧；首帧双方交换明文 Hello（含服务标签与 X25519
//! 公钥），标签不匹配直接断开，匹配则自动接受——不做进一步身份认证，
//! 这是源设计遗留的已知安全缺口。
//! 同一时刻最多一个活跃会话，后到的入站连接被丢弃。

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::crypto::{FrameOpener, FrameSealer, Handshake};
use super::{PeerIdentity, TransportClient, TransportCommand, TransportEvent};
use crate::config::VerifierConfig;
use crate::{VerifyError, VerifyResult};

/// 多播宣告记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Announce {
    service_tag: String,
    peer_id: Uuid,
    name: String,
    /// TCP 会话端口，配合宣告包源 IP 定位 peer
    port: u16,
}

/// 会话首帧（明文）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    service_tag: String,
    peer_id: Uuid,
    name: String,
    #[serde(with = "serde_bytes")]
    pubkey: Vec<u8>,
}

/// 浏览表中的 peer 条目
struct PeerEntry {
    identity: PeerIdentity,
    addr: SocketAddr,
    last_seen: Instant,
}

type PeerTable = Arc<DashMap<String, PeerEntry>>;

/// 会话任务发回 driver 的内部消息
enum Internal {
    SessionReady {
        sid: Uuid,
        peer: PeerIdentity,
        /// 本端是被动接受方（对方发起的连接）
        inbound: bool,
        out_tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    SessionData {
        sid: Uuid,
        bytes: Vec<u8>,
    },
    SessionClosed {
        sid: Uuid,
        reason: Option<String>,
    },
    DialFailed {
        reason: String,
    },
}

/// 当前活跃会话
struct ActiveSession {
    sid: Uuid,
    /// 连接发起方的 peer id，对撞裁决用
    dialer: Uuid,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// LAN 传输 driver
///
/// 经 [`spawn`](LanTransport::spawn) 启动后在独立 task 中消费命令，
/// 生命周期随 [`TransportClient`](super::TransportClient) 全部释放而结束。
pub struct LanTransport {
    cfg: VerifierConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    identity: Option<PeerIdentity>,
    session_port: u16,
    peers: PeerTable,
    active: Option<ActiveSession>,
    tasks: Vec<JoinHandle<()>>,
}

impl LanTransport {
    /// 启动 driver，返回命令句柄与事件接收端
    pub fn spawn(cfg: VerifierConfig) -> (TransportClient, mpsc::UnboundedReceiver<TransportEvent>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();

        let mut driver = LanTransport {
            cfg,
            events: event_tx,
            internal_tx,
            identity: None,
            session_port: 0,
            peers: Arc::new(DashMap::new()),
            active: None,
            tasks: Vec::new(),
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => driver.handle_command(cmd).await,
                        // 所有句柄都释放了，拆除并退出
                        None => {
                            driver.teardown();
                            break;
                        }
                    },
                    Some(msg) = internal_rx.recv() => driver.handle_internal(msg),
                }
            }
        });

        (TransportClient { tx: cmd_tx }, event_rx)
    }

    async fn handle_command(&mut self, cmd: TransportCommand) {
        match cmd {
            TransportCommand::Start {
                display_name,
                reply,
            } => {
                // 幂等：已启动直接返回当前身份
                if let Some(identity) = &self.identity {
                    let _ = reply.send(Ok(identity.clone()));
                    return;
                }
                let _ = reply.send(self.start(display_name).await);
            }

            TransportCommand::Stop => self.teardown(),

            TransportCommand::ConnectTo { peer, timeout } => self.dial(peer, timeout),

            TransportCommand::Send { bytes, reply } => {
                let result = match &self.active {
                    Some(session) => session
                        .out_tx
                        .send(bytes)
                        .map_err(|_| VerifyError::NoActiveConnection),
                    None => Err(VerifyError::NoActiveConnection),
                };
                let _ = reply.send(result);
            }
        }
    }

    /// 绑定套接字并启动宣告/浏览/监听三个子任务
    async fn start(&mut self, display_name: String) -> VerifyResult<PeerIdentity> {
        let identity = PeerIdentity {
            id: Uuid::new_v4(),
            name: display_name,
        };

        // TCP 会话监听器（随机端口，经宣告包告知 peer）
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(VerifyError::from_bind)?;
        self.session_port = listener
            .local_addr()
            .map_err(VerifyError::from_bind)?
            .port();

        // 浏览套接字：固定端口 + 加入多播组
        let browse = bind_browse_socket(self.cfg.discovery_port)?;
        browse
            .join_multicast_v4(self.cfg.multicast_group, Ipv4Addr::UNSPECIFIED)
            .map_err(VerifyError::from_bind)?;

        // 宣告套接字（随机端口即可）
        let advertise = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(VerifyError::from_bind)?;
        // 同机多实例场景（含本地调试）要能收到自己网卡回环的宣告
        let _ = advertise.set_multicast_loop_v4(true);

        info!(
            peer_id = %identity.id,
            name = %identity.name,
            session_port = self.session_port,
            "transport started"
        );

        self.tasks.push(spawn_advertise(
            advertise,
            self.cfg.clone(),
            Announce {
                service_tag: self.cfg.service_tag.clone(),
                peer_id: identity.id,
                name: identity.name.clone(),
                port: self.session_port,
            },
            self.events.clone(),
        ));
        self.tasks.push(spawn_browse(
            browse,
            self.cfg.clone(),
            identity.id,
            self.peers.clone(),
            self.events.clone(),
        ));
        self.tasks.push(spawn_accept(
            listener,
            self.local_hello(&identity),
            self.cfg.service_tag.clone(),
            self.internal_tx.clone(),
        ));

        self.identity = Some(identity.clone());
        Ok(identity)
    }

    fn local_hello(&self, identity: &PeerIdentity) -> Hello {
        Hello {
            service_tag: self.cfg.service_tag.clone(),
            peer_id: identity.id,
            name: identity.name.clone(),
            pubkey: Vec::new(), // 每次握手时填充新生成的公钥
        }
    }

    /// 向已发现的 peer 发起会话邀请
    fn dial(&mut self, peer: PeerIdentity, timeout: Duration) {
        reap_finished(&mut self.tasks);
        let Some(identity) = self.identity.clone() else {
            let _ = self.internal_tx.send(Internal::DialFailed {
                reason: "transport not started".into(),
            });
            return;
        };
        let Some(addr) = self.peers.get(&peer.name).map(|e| e.addr) else {
            let _ = self.internal_tx.send(Internal::DialFailed {
                reason: format!("peer {} not in discovery table", peer.name),
            });
            return;
        };

        let _ = self.events.send(TransportEvent::Connecting { peer });

        let hello = self.local_hello(&identity);
        let tag = self.cfg.service_tag.clone();
        let internal = self.internal_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let dial = async {
                let stream = TcpStream::connect(addr).await?;
                establish(stream, hello, &tag).await
            };
            match tokio::time::timeout(timeout, dial).await {
                Ok(Ok(established)) => run_session(established, false, internal).await,
                Ok(Err(e)) => {
                    let _ = internal.send(Internal::DialFailed {
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    let _ = internal.send(Internal::DialFailed {
                        reason: format!("connect timed out after {:?}", timeout),
                    });
                }
            }
        }));
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::SessionReady {
                sid,
                peer,
                inbound,
                out_tx,
            } => {
                let Some(local) = &self.identity else {
                    return;
                };
                let dialer = if inbound { peer.id } else { local.id };
                if let Some(active) = &self.active {
                    // 双方同时互拨会产生两条交叉连接，两端必须收敛到同一条，
                    // 否则各自保留的恰好是对方刚丢弃的那条，双双断开。
                    // 裁决：保留由 id 较小一端发起的连接。
                    if !glare_prefers(active.dialer, dialer) {
                        warn!(peer = %peer.name, "already in a session, dropping new connection");
                        return;
                    }
                    // 被替换会话的 out_tx 随 active 覆盖而释放，其 SessionClosed
                    // 因 sid 不再匹配被忽略
                    info!(peer = %peer.name, "replacing session after simultaneous dial");
                }
                self.active = Some(ActiveSession {
                    sid,
                    dialer,
                    out_tx,
                });
                let _ = self.events.send(TransportEvent::Connected { peer });
            }

            Internal::SessionData { sid, bytes } => {
                if self.active.as_ref().is_some_and(|s| s.sid == sid) {
                    let _ = self.events.send(TransportEvent::Data { bytes });
                }
            }

            Internal::SessionClosed { sid, reason } => {
                if self.active.as_ref().is_some_and(|s| s.sid == sid) {
                    self.active = None;
                    // 会话结束后发现仍在继续，自然回到扫描子状态
                    let _ = self.events.send(TransportEvent::Disconnected { reason });
                }
            }

            Internal::DialFailed { reason } => {
                let _ = self.events.send(TransportEvent::Disconnected {
                    reason: Some(reason),
                });
            }
        }
    }

    /// 停止宣告/浏览并拆除活跃会话；可重复调用
    fn teardown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // 丢弃 out_tx，会话任务随之关闭 TCP 流
        self.active = None;
        self.peers.clear();
        self.identity = None;
        self.session_port = 0;
    }
}

/// 对撞裁决：两条交叉连接里保留发起方 id 较小的那条
///
/// 两端各自独立套用同一规则即可收敛到同一条连接。
/// 发起方相同（如同一 peer 重复拨入）时保留现有会话。
fn glare_prefers(current_dialer: Uuid, candidate_dialer: Uuid) -> bool {
    candidate_dialer < current_dialer
}

/// 绑定浏览套接字，开启地址复用
///
/// 同一台机器上的多个实例（本地调试的典型场景）要共享固定的发现端口。
fn bind_browse_socket(port: u16) -> VerifyResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(VerifyError::from_bind)?;
    socket
        .set_reuse_address(true)
        .map_err(VerifyError::from_bind)?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(VerifyError::from_bind)?;
    socket
        .set_nonblocking(true)
        .map_err(VerifyError::from_bind)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into()).map_err(VerifyError::from_bind)?;
    UdpSocket::from_std(socket.into()).map_err(VerifyError::from_bind)
}

/// 回收已结束的任务句柄，长尝试期间不无限累积
fn reap_finished(tasks: &mut Vec<JoinHandle<()>>) {
    tasks.retain(|task| !task.is_finished());
}

/// 宣告任务：按固定间隔向多播组发送 Announce
fn spawn_advertise(
    socket: UdpSocket,
    cfg: VerifierConfig,
    announce: Announce,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let target = SocketAddr::from((cfg.multicast_group, cfg.discovery_port));
        let Ok(packet) = serde_json::to_vec(&announce) else {
            return;
        };
        let mut ticker = tokio::time::interval(cfg.advertise_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = socket.send_to(&packet, target).await {
                warn!("advertise failed: {}", e);
                let _ = events.send(TransportEvent::AdvertiseFailed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    })
}

/// 浏览任务：接收宣告、维护 peer 表、按存活窗口清理
fn spawn_browse(
    socket: UdpSocket,
    cfg: VerifierConfig,
    self_id: Uuid,
    peers: PeerTable,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        let mut sweep = tokio::time::interval(cfg.peer_ttl / 2);
        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, src)) => {
                        let Ok(announce) = serde_json::from_slice::<Announce>(&buf[..n]) else {
                            debug!(from = %src, "ignoring malformed announce");
                            continue;
                        };
                        if announce.service_tag != cfg.service_tag || announce.peer_id == self_id {
                            continue;
                        }
                        record_announce(&peers, &events, announce, src);
                    }
                    Err(e) => {
                        warn!("browse failed: {}", e);
                        let _ = events.send(TransportEvent::BrowseFailed {
                            reason: e.to_string(),
                        });
                        return;
                    }
                },
                _ = sweep.tick() => {
                    for peer in expire_peers(&peers, cfg.peer_ttl) {
                        info!(name = %peer.name, "peer lost");
                        let _ = events.send(TransportEvent::PeerLost { peer });
                    }
                }
            }
        }
    })
}

/// 记录一条宣告；新 peer 触发 PeerDiscovered（按展示名去重）
fn record_announce(
    peers: &PeerTable,
    events: &mpsc::UnboundedSender<TransportEvent>,
    announce: Announce,
    src: SocketAddr,
) {
    let addr = SocketAddr::new(src.ip(), announce.port);
    match peers.entry(announce.name.clone()) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            let e = entry.get_mut();
            e.last_seen = Instant::now();
            e.addr = addr;
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let identity = PeerIdentity {
                id: announce.peer_id,
                name: announce.name,
            };
            entry.insert(PeerEntry {
                identity: identity.clone(),
                addr,
                last_seen: Instant::now(),
            });
            info!(name = %identity.name, %addr, "peer discovered");
            let _ = events.send(TransportEvent::PeerDiscovered { peer: identity });
        }
    }
}

/// 清理超过存活窗口的 peer，返回被移除的身份
fn expire_peers(peers: &PeerTable, ttl: Duration) -> Vec<PeerIdentity> {
    let expired: Vec<String> = peers
        .iter()
        .filter(|e| e.value().last_seen.elapsed() > ttl)
        .map(|e| e.key().clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|name| peers.remove(&name).map(|(_, e)| e.identity))
        .collect()
}

/// 监听任务：自动接受入站会话邀请（标签匹配即接受，见模块文档）
fn spawn_accept(
    listener: TcpListener,
    hello: Hello,
    service_tag: String,
    internal: mpsc::UnboundedSender<Internal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    warn!(%addr, "auto-accepting inbound session from unauthenticated peer");
                    let hello = hello.clone();
                    let tag = service_tag.clone();
                    let internal = internal.clone();
                    tokio::spawn(async move {
                        match establish(stream, hello, &tag).await {
                            Ok(established) => run_session(established, true, internal).await,
                            Err(e) => warn!(%addr, "inbound handshake failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

/// 已完成握手的会话
struct Established {
    peer: PeerIdentity,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    sealer: FrameSealer,
    opener: FrameOpener,
}

/// 交换 Hello 并完成 X25519 协商
///
/// 双方各自先写后读，无固定发起顺序。
async fn establish(stream: TcpStream, mut hello: Hello, expected_tag: &str) -> VerifyResult<Established> {
    let handshake = Handshake::generate();
    hello.pubkey = handshake.public_bytes().to_vec();

    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    framed.send(Bytes::from(serde_json::to_vec(&hello)?)).await?;

    let first = framed
        .next()
        .await
        .ok_or(VerifyError::ConnectionLost)??;
    let peer_hello: Hello = serde_json::from_slice(&first)?;
    let peer_pubkey = validate_hello(&peer_hello, expected_tag)?;

    let (sealer, opener) = handshake.complete(peer_pubkey);
    Ok(Established {
        peer: PeerIdentity {
            id: peer_hello.peer_id,
            name: peer_hello.name,
        },
        framed,
        sealer,
        opener,
    })
}

/// 校验对方 Hello：服务标签必须一致，公钥必须是 32 字节
fn validate_hello(hello: &Hello, expected_tag: &str) -> VerifyResult<[u8; 32]> {
    if hello.service_tag != expected_tag {
        return Err(VerifyError::Unknown(format!(
            "service tag mismatch: {}",
            hello.service_tag
        )));
    }
    let pubkey: [u8; 32] = hello
        .pubkey
        .as_slice()
        .try_into()
        .map_err(|_| VerifyError::Unknown("malformed handshake pubkey".into()))?;
    Ok(pubkey)
}

/// 会话任务：封帧发送 + 开帧上报，直到任一方向结束
async fn run_session(
    established: Established,
    inbound: bool,
    internal: mpsc::UnboundedSender<Internal>,
) {
    let Established {
        peer,
        framed,
        mut sealer,
        mut opener,
    } = established;

    let sid = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let _ = internal.send(Internal::SessionReady {
        sid,
        peer: peer.clone(),
        inbound,
        out_tx,
    });

    let (mut sink, mut stream) = framed.split();
    let reason = loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(bytes) => {
                    let sealed = match sealer.seal(&bytes) {
                        Ok(sealed) => sealed,
                        Err(e) => break Some(e.to_string()),
                    };
                    if let Err(e) = sink.send(Bytes::from(sealed)).await {
                        break Some(e.to_string());
                    }
                }
                // driver 拒绝了本会话或正在拆除
                None => {
                    let _ = sink.close().await;
                    debug!(peer = %peer.name, "session released");
                    return;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(buf)) => match opener.open(&buf) {
                    Ok(bytes) => {
                        let _ = internal.send(Internal::SessionData { sid, bytes });
                    }
                    Err(e) => break Some(e.to_string()),
                },
                Some(Err(e)) => break Some(e.to_string()),
                // 对端正常关闭
                None => break None,
            },
        }
    };

    info!(peer = %peer.name, ?reason, "session closed");
    let _ = internal.send(Internal::SessionClosed { sid, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce(name: &str) -> Announce {
        Announce {
            service_tag: "neartrust/1".into(),
            peer_id: Uuid::new_v4(),
            name: name.into(),
            port: 40_000,
        }
    }

    #[test]
    fn announce_roundtrip() {
        let a = announce("Bob");
        let bytes = serde_json::to_vec(&a).unwrap();
        let back: Announce = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.name, "Bob");
        assert_eq!(back.peer_id, a.peer_id);
        assert_eq!(back.port, 40_000);
    }

    #[test]
    fn hello_with_wrong_tag_is_rejected() {
        let hello = Hello {
            service_tag: "someoneelse/9".into(),
            peer_id: Uuid::new_v4(),
            name: "Mallory".into(),
            pubkey: vec![0u8; 32],
        };
        assert!(validate_hello(&hello, "neartrust/1").is_err());
    }

    #[test]
    fn hello_with_short_pubkey_is_rejected() {
        let hello = Hello {
            service_tag: "neartrust/1".into(),
            peer_id: Uuid::new_v4(),
            name: "Eve".into(),
            pubkey: vec![0u8; 16],
        };
        assert!(validate_hello(&hello, "neartrust/1").is_err());
    }

    #[test]
    fn discovery_dedups_by_display_name() {
        let peers: PeerTable = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let src: SocketAddr = "192.168.1.7:56100".parse().unwrap();

        record_announce(&peers, &tx, announce("Bob"), src);
        record_announce(&peers, &tx, announce("Bob"), src);

        assert_eq!(peers.len(), 1);
        assert!(matches!(
            rx.try_recv(),
            Ok(TransportEvent::PeerDiscovered { .. })
        ));
        // 第二条宣告只刷新 last_seen，不再触发事件
        assert!(rx.try_recv().is_err());
    }

    fn driver_with_identity(id: Uuid) -> (LanTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, _internal_rx) = mpsc::unbounded_channel();
        let driver = LanTransport {
            cfg: VerifierConfig::default(),
            events: event_tx,
            internal_tx,
            identity: Some(PeerIdentity {
                id,
                name: "self".into(),
            }),
            session_port: 0,
            peers: Arc::new(DashMap::new()),
            active: None,
            tasks: Vec::new(),
        };
        (driver, event_rx)
    }

    fn ready(
        sid: Uuid,
        peer: &PeerIdentity,
        inbound: bool,
    ) -> (Internal, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Internal::SessionReady {
                sid,
                peer: peer.clone(),
                inbound,
                out_tx,
            },
            out_rx,
        )
    }

    fn is_released(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> bool {
        matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        )
    }

    #[test]
    fn simultaneous_dial_converges_on_lower_id_connection() {
        let (a, b) = {
            let x = Uuid::new_v4();
            let y = Uuid::new_v4();
            if x < y { (x, y) } else { (y, x) }
        };
        let peer_a = PeerIdentity { id: a, name: "A".into() };
        let peer_b = PeerIdentity { id: b, name: "B".into() };
        // X 由 id 较小的 A 发起，Y 由 B 发起
        let sid_x = Uuid::new_v4();
        let sid_y = Uuid::new_v4();

        // A 先收到 Y（入站），后收到 X（出站）：X 替换 Y
        let (mut da, mut ea) = driver_with_identity(a);
        let (ready_y, mut y_rx_a) = ready(sid_y, &peer_b, true);
        let (ready_x, mut x_rx_a) = ready(sid_x, &peer_b, false);
        da.handle_internal(ready_y);
        da.handle_internal(ready_x);

        // B 先收到 X（入站），后收到 Y（出站）：Y 被丢弃
        let (mut db, mut eb) = driver_with_identity(b);
        let (ready_x2, mut x_rx_b) = ready(sid_x, &peer_a, true);
        let (ready_y2, mut y_rx_b) = ready(sid_y, &peer_a, false);
        db.handle_internal(ready_x2);
        db.handle_internal(ready_y2);

        // 两端收敛到同一条连接 X
        assert_eq!(da.active.as_ref().map(|s| s.sid), Some(sid_x));
        assert_eq!(db.active.as_ref().map(|s| s.sid), Some(sid_x));
        assert!(is_released(&mut y_rx_a));
        assert!(is_released(&mut y_rx_b));
        assert!(!is_released(&mut x_rx_a));
        assert!(!is_released(&mut x_rx_b));

        // A 替换时再次上报 Connected，B 只上报一次
        assert!(matches!(ea.try_recv(), Ok(TransportEvent::Connected { .. })));
        assert!(matches!(ea.try_recv(), Ok(TransportEvent::Connected { .. })));
        assert!(matches!(eb.try_recv(), Ok(TransportEvent::Connected { .. })));
        assert!(eb.try_recv().is_err());
    }

    #[test]
    fn duplicate_dial_from_same_peer_keeps_existing_session() {
        let (a, b) = {
            let x = Uuid::new_v4();
            let y = Uuid::new_v4();
            if x < y { (x, y) } else { (y, x) }
        };
        let peer_b = PeerIdentity { id: b, name: "B".into() };
        let (mut da, _ea) = driver_with_identity(a);

        let first = Uuid::new_v4();
        let (ready_1, mut rx_1) = ready(first, &peer_b, true);
        let (ready_2, mut rx_2) = ready(Uuid::new_v4(), &peer_b, true);
        da.handle_internal(ready_1);
        da.handle_internal(ready_2);

        assert_eq!(da.active.as_ref().map(|s| s.sid), Some(first));
        assert!(!is_released(&mut rx_1));
        assert!(is_released(&mut rx_2));
    }

    #[tokio::test]
    async fn discovery_port_is_shared_between_instances() {
        let probe = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        // 地址复用：同机第二个实例也能绑定同一发现端口
        let _first = bind_browse_socket(port).unwrap();
        let _second = bind_browse_socket(port).unwrap();
    }

    #[tokio::test]
    async fn finished_tasks_are_reaped() {
        let mut done = tokio::spawn(async {});
        let _ = (&mut done).await;
        let pending = tokio::spawn(futures::future::pending::<()>());

        let mut tasks = vec![done, pending];
        reap_finished(&mut tasks);
        assert_eq!(tasks.len(), 1);
        tasks[0].abort();
    }

    #[test]
    fn expire_removes_stale_peers_once() {
        let peers: PeerTable = Arc::new(DashMap::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let src: SocketAddr = "192.168.1.7:56100".parse().unwrap();
        record_announce(&peers, &tx, announce("Bob"), src);

        // 存活窗口为零即视为立刻过期
        let lost = expire_peers(&peers, Duration::from_secs(0));
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].name, "Bob");
        assert!(expire_peers(&peers, Duration::from_secs(0)).is_empty());
    }
}
