//! 协议状态机
//!
//! [`Machine`] 是纯状态机：不做任何 I/O，每个输入事件在协调器的互斥锁内
//! 执行，返回一组待执行的 [`Action`]，由协调器在释放锁之后执行。
//! 这保证了所有状态转移串行化——payload 到达和采样到达无论怎样交错，
//! 对"已验证"前置条件的检查/更新都不会竞争。
//!
//! 世代（epoch）令牌：每次 `stop()` 和每次进入终态都会递增 epoch，
//! 携带旧 epoch 的迟到事件被直接丢弃而不是引起状态变化。

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::VerifierConfig;
use crate::events::VerifierEvent;
use crate::graph::VerifiedConnection;
use crate::protocol::{HandshakeToken, LocalUser, VerificationMethod, VerificationPayload};
use crate::ranging::RangingEvent;
use crate::transport::{PeerIdentity, TransportEvent};
use crate::{VerifyError, VerifyResult};

/// 协调器状态
///
/// `Verified`/`TimedOut`/`Error` 是终态；同一次尝试内不可重试，
/// 重试 = 调用方重新 `start()`。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ProximityState {
    Idle,
    Scanning,
    Connecting,
    Measuring,
    Verified,
    TimedOut,
    Error { reason: String },
}

/// 状态机产出的副作用，由协调器在锁外执行
#[derive(Debug)]
pub(crate) enum Action {
    Connect { peer: PeerIdentity },
    SendPayload { payload: VerificationPayload },
    StartRanging { epoch: u64 },
    ConfigureRanging { token: HandshakeToken },
    StopRanging,
    StopTransport,
    DisarmTimeout,
    Emit { event: VerifierEvent },
    NotifyGraph { connection: VerifiedConnection },
}

/// 协议状态机（单写者：协调器）
pub(crate) struct Machine {
    cfg: VerifierConfig,
    pub state: ProximityState,
    pub epoch: u64,
    user: Option<LocalUser>,
    /// 本平台是否具备测距能力
    ranging_capable: bool,
    /// 本次尝试内是否已请求启动测距会话
    ranging_started: bool,
    local_token: Option<HandshakeToken>,
    peer_token: Option<HandshakeToken>,
    ranging_configured: bool,
    /// 本次连接内 payload 是否已发出（每个连接最多发一次）
    payload_sent: bool,
    /// 已连接但在等本端测距 token，token 就绪后补发
    payload_pending: bool,
    peer_payload: Option<VerificationPayload>,
    /// 跨过阈值那一次采样的距离；Some 即"距离事实"已锁存
    within_threshold: Option<f32>,
    last_distance: Option<f32>,
    discovered: Vec<PeerIdentity>,
    connecting_to: Option<PeerIdentity>,
}

impl Machine {
    pub fn new(cfg: VerifierConfig) -> Self {
        Self {
            cfg,
            state: ProximityState::Idle,
            epoch: 0,
            user: None,
            ranging_capable: false,
            ranging_started: false,
            local_token: None,
            peer_token: None,
            ranging_configured: false,
            payload_sent: false,
            payload_pending: false,
            peer_payload: None,
            within_threshold: None,
            last_distance: None,
            discovered: Vec::new(),
            connecting_to: None,
        }
    }

    /// 是否有进行中的验证尝试
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ProximityState::Scanning | ProximityState::Connecting | ProximityState::Measuring
        )
    }

    /// 最近一次采样是否严格小于阈值
    pub fn is_within_range(&self) -> bool {
        self.last_distance
            .is_some_and(|d| d < self.cfg.distance_threshold)
    }

    /// 开始一次新的验证尝试（调用方已确认当前没有活跃尝试）
    pub fn begin(&mut self, user: LocalUser, ranging_capable: bool) -> Vec<Action> {
        self.reset();
        self.epoch += 1;
        self.user = Some(user);
        self.ranging_capable = ranging_capable;
        self.state = ProximityState::Scanning;
        vec![Action::Emit {
            event: VerifierEvent::StateChanged {
                state: self.state.clone(),
            },
        }]
    }

    /// 中止并复位；从任意状态可达，幂等
    pub fn stop(&mut self) -> Vec<Action> {
        self.epoch += 1;
        if self.state == ProximityState::Idle {
            return Vec::new();
        }
        self.reset();
        self.state = ProximityState::Idle;
        vec![
            Action::StopTransport,
            Action::StopRanging,
            Action::DisarmTimeout,
            Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::Idle,
                },
            },
        ]
    }

    fn reset(&mut self) {
        self.user = None;
        self.ranging_capable = false;
        self.ranging_started = false;
        self.local_token = None;
        self.peer_token = None;
        self.ranging_configured = false;
        self.payload_sent = false;
        self.payload_pending = false;
        self.peer_payload = None;
        self.within_threshold = None;
        self.last_distance = None;
        self.discovered.clear();
        self.connecting_to = None;
    }

    pub fn handle_transport(&mut self, epoch: u64, event: TransportEvent) -> Vec<Action> {
        if epoch != self.epoch {
            debug!(?event, "discarding stale transport event");
            return Vec::new();
        }
        match event {
            TransportEvent::PeerDiscovered { peer } => self.on_peer_discovered(peer),
            TransportEvent::PeerLost { peer } => self.on_peer_lost(peer),
            TransportEvent::Connecting { .. } => Vec::new(),
            TransportEvent::Connected { peer } => self.on_connected(peer),
            TransportEvent::Disconnected { reason } => self.on_disconnected(reason),
            TransportEvent::Data { bytes } => self.on_data(&bytes),
            TransportEvent::AdvertiseFailed { reason } | TransportEvent::BrowseFailed { reason } => {
                self.fail(VerifyError::Unknown(format!("discovery failed: {reason}")))
            }
        }
    }

    pub fn handle_ranging(&mut self, epoch: u64, event: RangingEvent) -> Vec<Action> {
        if epoch != self.epoch {
            debug!("discarding stale ranging event");
            return Vec::new();
        }
        match event {
            RangingEvent::Sample { sample } => {
                self.last_distance = Some(sample.distance);
                if self.state == ProximityState::Measuring
                    && self.within_threshold.is_none()
                    && sample.distance < self.cfg.distance_threshold
                {
                    debug!(distance = sample.distance, "distance fact latched");
                    self.within_threshold = Some(sample.distance);
                }
                self.maybe_verify()
            }
            RangingEvent::PeerRemoved { reason } => {
                // 非致命：连接还在，全局超时兜底
                warn!(?reason, "ranging peer removed");
                Vec::new()
            }
            RangingEvent::Suspended | RangingEvent::Resumed => Vec::new(),
            RangingEvent::Invalidated { reason } => vec![Action::Emit {
                event: VerifierEvent::Error {
                    reason: VerifyError::Unknown(format!("ranging invalidated: {reason}")),
                    fatal: false,
                },
            }],
        }
    }

    /// 测距会话启动完成，拿到本端 token
    pub fn ranging_started(&mut self, epoch: u64, token: HandshakeToken) -> Vec<Action> {
        if epoch != self.epoch {
            return Vec::new();
        }
        self.local_token = Some(token);
        let mut actions = Vec::new();
        // 等 token 的 payload 现在可以发了
        if self.state == ProximityState::Measuring && self.payload_pending {
            self.payload_pending = false;
            self.push_send_payload(&mut actions);
        }
        // 对方 token 先到的话，此刻补配置
        if let Some(token) = self.peer_token.clone() {
            if !self.ranging_configured {
                self.ranging_configured = true;
                actions.push(Action::ConfigureRanging { token });
            }
        }
        actions
    }

    /// 测距会话启动失败：降级为无测距（payload 不再等 token）
    pub fn ranging_start_failed(&mut self, epoch: u64, error: VerifyError) -> Vec<Action> {
        if epoch != self.epoch {
            return Vec::new();
        }
        warn!("ranging start failed: {}", error);
        self.ranging_capable = false;
        let mut actions = vec![Action::Emit {
            event: VerifierEvent::Error {
                reason: error,
                fatal: false,
            },
        }];
        if self.state == ProximityState::Measuring && self.payload_pending {
            self.payload_pending = false;
            self.push_send_payload(&mut actions);
        }
        actions
    }

    /// 全局超时触发
    pub fn timeout_fired(&mut self, epoch: u64) -> Vec<Action> {
        if epoch != self.epoch || !self.active() {
            return Vec::new();
        }
        // 已连上后超时不是"没发现 peer"，原因要说清楚卡在了测量阶段
        let reason = if self.state == ProximityState::Measuring {
            VerifyError::Unknown("verification timed out before completion".into())
        } else {
            VerifyError::SearchTimeout
        };
        self.epoch += 1;
        self.state = ProximityState::TimedOut;
        vec![
            Action::StopTransport,
            Action::StopRanging,
            Action::Emit {
                event: VerifierEvent::Error {
                    reason,
                    fatal: true,
                },
            },
            Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::TimedOut,
                },
            },
        ]
    }

    /// UI 主动选择要连接的 peer
    pub fn connect_request(&mut self, peer_name: &str) -> VerifyResult<Vec<Action>> {
        if self.state != ProximityState::Scanning {
            return Err(VerifyError::NotStarted);
        }
        let peer = self
            .discovered
            .iter()
            .find(|p| p.name == peer_name)
            .cloned()
            .ok_or_else(|| VerifyError::Unknown(format!("unknown peer: {peer_name}")))?;
        Ok(self.start_connecting(peer))
    }

    fn on_peer_discovered(&mut self, peer: PeerIdentity) -> Vec<Action> {
        if !self.discovered.iter().any(|p| p.name == peer.name) {
            self.discovered.push(peer.clone());
        }
        let mut actions = vec![Action::Emit {
            event: VerifierEvent::PeerFound { peer: peer.clone() },
        }];
        if self.state == ProximityState::Scanning && self.cfg.auto_connect {
            actions.extend(self.start_connecting(peer));
        }
        actions
    }

    fn start_connecting(&mut self, peer: PeerIdentity) -> Vec<Action> {
        self.state = ProximityState::Connecting;
        self.connecting_to = Some(peer.clone());
        vec![
            Action::Connect { peer },
            Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::Connecting,
                },
            },
        ]
    }

    fn on_peer_lost(&mut self, peer: PeerIdentity) -> Vec<Action> {
        self.discovered.retain(|p| p.name != peer.name);
        let mut actions = vec![Action::Emit {
            event: VerifierEvent::PeerLost {
                peer_name: peer.name.clone(),
            },
        }];
        // 正在连的 peer 消失且尚未连上：退回扫描
        if self.state == ProximityState::Connecting
            && self.connecting_to.as_ref().is_some_and(|p| p.name == peer.name)
        {
            self.connecting_to = None;
            self.state = ProximityState::Scanning;
            actions.push(Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::Scanning,
                },
            });
        }
        actions
    }

    fn on_connected(&mut self, peer: PeerIdentity) -> Vec<Action> {
        // 入站会话可能在 Scanning 就直接连上（自动接受策略）；
        // Measuring 中再次连接 = 传输层换了连接（如对撞裁决后的替换），
        // 按新连接重新走一遍
        let reconnect = match self.state {
            ProximityState::Scanning | ProximityState::Connecting => false,
            ProximityState::Measuring => true,
            _ => return Vec::new(),
        };
        self.state = ProximityState::Measuring;
        self.connecting_to = None;
        // 新连接生命周期：连接级事实全部重新锁存
        self.payload_sent = false;
        self.payload_pending = false;
        self.peer_payload = None;
        self.peer_token = None;
        self.within_threshold = None;
        self.ranging_configured = false;

        let mut actions = vec![Action::Emit {
            event: VerifierEvent::ConnectionEstablished { peer },
        }];
        if !reconnect {
            actions.push(Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::Measuring,
                },
            });
        }

        if !self.ranging_capable {
            // 无测距能力：payload 立即发出（不带 token）
            self.push_send_payload(&mut actions);
            return actions;
        }
        if !self.ranging_started {
            self.ranging_started = true;
            actions.push(Action::StartRanging { epoch: self.epoch });
        }
        if self.local_token.is_some() {
            self.push_send_payload(&mut actions);
        } else {
            // token 尚未就绪：挂起待发，确保每个连接只发一次且尽量带上 token
            self.payload_pending = true;
        }
        actions
    }

    fn on_disconnected(&mut self, reason: Option<String>) -> Vec<Action> {
        match self.state {
            // 连接尚未建立：把拨号失败的具体原因带出去
            ProximityState::Connecting => {
                let reason = reason
                    .map(VerifyError::Unknown)
                    .unwrap_or(VerifyError::ConnectionLost);
                self.fail(reason)
            }
            ProximityState::Measuring => {
                debug!(?reason, "connection lost before verification");
                self.fail(VerifyError::ConnectionLost)
            }
            _ => Vec::new(),
        }
    }

    fn on_data(&mut self, bytes: &[u8]) -> Vec<Action> {
        if self.state != ProximityState::Measuring {
            return Vec::new();
        }
        let payload = match VerificationPayload::decode(bytes) {
            Ok(payload) => payload,
            // 解码失败不拆连接：后续仍可能收到有效 payload
            Err(e) => {
                return vec![Action::Emit {
                    event: VerifierEvent::Error {
                        reason: e,
                        fatal: false,
                    },
                }]
            }
        };

        let mut actions = vec![Action::Emit {
            event: VerifierEvent::PayloadReceived {
                payload: payload.clone(),
            },
        }];
        if let Some(token) = payload.ranging_token.clone() {
            self.peer_token = Some(token.clone());
            // 本端测距就绪才能配置；否则 ranging_started 回调里补
            if self.local_token.is_some() && !self.ranging_configured {
                self.ranging_configured = true;
                actions.push(Action::ConfigureRanging { token });
            }
        }
        self.peer_payload = Some(payload);
        actions.extend(self.maybe_verify());
        actions
    }

    /// 两个独立前置条件（payload 已收 / 已跨阈值）都成立时进入 Verified。
    /// 二者到达顺序任意；转移最多发生一次。
    fn maybe_verify(&mut self) -> Vec<Action> {
        if self.state != ProximityState::Measuring {
            return Vec::new();
        }
        let (Some(peer), Some(distance)) = (self.peer_payload.clone(), self.within_threshold)
        else {
            return Vec::new();
        };

        self.epoch += 1;
        self.state = ProximityState::Verified;
        let local_user_id = self
            .user
            .as_ref()
            .map(|u| u.user_id.clone())
            .unwrap_or_default();

        // 传输会话保留到调用方 stop()，让对端也有机会完成自己的验证
        vec![
            Action::DisarmTimeout,
            Action::StopRanging,
            Action::Emit {
                event: VerifierEvent::VerificationValid {
                    peer: peer.clone(),
                    distance,
                },
            },
            Action::NotifyGraph {
                connection: VerifiedConnection {
                    local_user_id,
                    peer,
                    distance,
                    verified_at: chrono::Utc::now().timestamp(),
                },
            },
            Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: ProximityState::Verified,
                },
            },
        ]
    }

    /// 进入终态 Error；错误恰好上报一次
    fn fail(&mut self, reason: VerifyError) -> Vec<Action> {
        self.epoch += 1;
        self.state = ProximityState::Error {
            reason: reason.to_string(),
        };
        vec![
            Action::StopTransport,
            Action::StopRanging,
            Action::DisarmTimeout,
            Action::Emit {
                event: VerifierEvent::Error {
                    reason,
                    fatal: true,
                },
            },
            Action::Emit {
                event: VerifierEvent::StateChanged {
                    state: self.state.clone(),
                },
            },
        ]
    }

    fn push_send_payload(&mut self, actions: &mut Vec<Action>) {
        if self.payload_sent {
            return;
        }
        let Some(user) = &self.user else {
            return;
        };
        self.payload_sent = true;
        actions.push(Action::SendPayload {
            payload: VerificationPayload {
                id: Uuid::new_v4(),
                user_id: user.user_id.clone(),
                user_name: user.user_name.clone(),
                avatar_ref: user.avatar_ref.clone(),
                timestamp: chrono::Utc::now().timestamp(),
                method: VerificationMethod::Proximity,
                location: user.location,
                distance: self.last_distance,
                ranging_token: self.local_token.clone(),
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranging::DistanceSample;

    fn machine() -> Machine {
        Machine::new(VerifierConfig::default())
    }

    fn user() -> LocalUser {
        LocalUser::new("user-1", "Alice")
    }

    fn peer() -> PeerIdentity {
        PeerIdentity {
            id: Uuid::new_v4(),
            name: "Bob".into(),
        }
    }

    fn token() -> HandshakeToken {
        HandshakeToken::from_bytes(vec![9, 9, 9])
    }

    fn peer_payload(with_token: bool) -> VerificationPayload {
        VerificationPayload {
            id: Uuid::new_v4(),
            user_id: "user-2".into(),
            user_name: "Bob".into(),
            avatar_ref: None,
            timestamp: 0,
            method: VerificationMethod::Proximity,
            location: None,
            distance: None,
            ranging_token: with_token.then(|| HandshakeToken::from_bytes(vec![8, 8])),
        }
    }

    fn sample(distance: f32) -> RangingEvent {
        RangingEvent::Sample {
            sample: DistanceSample {
                distance,
                direction: None,
                timestamp: 0,
            },
        }
    }

    /// 走到 Measuring 且本端 token 已就绪
    fn measuring(m: &mut Machine) -> u64 {
        m.begin(user(), true);
        let epoch = m.epoch;
        m.handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() });
        m.handle_transport(epoch, TransportEvent::Connected { peer: peer() });
        m.ranging_started(epoch, token());
        assert_eq!(m.state, ProximityState::Measuring);
        epoch
    }

    fn data_event(with_token: bool) -> TransportEvent {
        TransportEvent::Data {
            bytes: peer_payload(with_token).encode().unwrap(),
        }
    }

    fn has_verified(actions: &[Action]) -> bool {
        actions.iter().any(|a| {
            matches!(
                a,
                Action::Emit {
                    event: VerifierEvent::VerificationValid { .. }
                }
            )
        })
    }

    #[test]
    fn begin_scans_and_auto_connects_first_peer() {
        let mut m = machine();
        m.begin(user(), true);
        assert_eq!(m.state, ProximityState::Scanning);

        let actions = m.handle_transport(m.epoch, TransportEvent::PeerDiscovered { peer: peer() });
        assert_eq!(m.state, ProximityState::Connecting);
        assert!(actions.iter().any(|a| matches!(a, Action::Connect { .. })));
    }

    #[test]
    fn happy_path_payload_then_sample() {
        let mut m = machine();
        let epoch = measuring(&mut m);

        let actions = m.handle_transport(epoch, data_event(true));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ConfigureRanging { .. })));
        assert_eq!(m.state, ProximityState::Measuring);

        let actions = m.handle_ranging(epoch, sample(0.3));
        assert_eq!(m.state, ProximityState::Verified);
        assert!(has_verified(&actions));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::NotifyGraph { .. })));
        assert!(actions.iter().any(|a| matches!(a, Action::StopRanging)));
        // 验证成立后传输会话保留，等调用方 stop()
        assert!(!actions.iter().any(|a| matches!(a, Action::StopTransport)));
    }

    #[test]
    fn happy_path_sample_then_payload() {
        let mut m = machine();
        let epoch = measuring(&mut m);

        // 距离先跨阈值，payload 后到
        let actions = m.handle_ranging(epoch, sample(0.3));
        assert!(!has_verified(&actions));
        assert_eq!(m.state, ProximityState::Measuring);

        let actions = m.handle_transport(epoch, data_event(false));
        assert_eq!(m.state, ProximityState::Verified);
        assert!(has_verified(&actions));
    }

    #[test]
    fn verified_fires_exactly_once() {
        let mut m = machine();
        let epoch = measuring(&mut m);
        m.handle_transport(epoch, data_event(false));
        let actions = m.handle_ranging(epoch, sample(0.2));
        assert!(has_verified(&actions));

        // 终态后的迟到事件全部被世代令牌丢弃
        assert!(m.handle_ranging(epoch, sample(0.1)).is_empty());
        assert!(m.handle_transport(epoch, data_event(false)).is_empty());
        assert_eq!(m.state, ProximityState::Verified);
    }

    #[test]
    fn threshold_is_strict() {
        let mut m = machine();
        let epoch = measuring(&mut m);
        m.handle_transport(epoch, data_event(false));

        // distance == threshold 不算共处
        let actions = m.handle_ranging(epoch, sample(0.5));
        assert!(!has_verified(&actions));
        assert_eq!(m.state, ProximityState::Measuring);
        assert!(!m.is_within_range());

        let actions = m.handle_ranging(epoch, sample(0.499));
        assert!(has_verified(&actions));
        assert!(m.is_within_range());
    }

    #[test]
    fn timeout_while_scanning() {
        let mut m = machine();
        m.begin(user(), true);
        let epoch = m.epoch;

        let actions = m.timeout_fired(epoch);
        assert_eq!(m.state, ProximityState::TimedOut);
        let fatal_timeouts = actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    Action::Emit {
                        event: VerifierEvent::Error {
                            reason: VerifyError::SearchTimeout,
                            fatal: true
                        }
                    }
                )
            })
            .count();
        assert_eq!(fatal_timeouts, 1);

        // 终态后的重复触发无效果
        assert!(m.timeout_fired(epoch).is_empty());
    }

    #[test]
    fn replacement_connection_relatches_and_resends_payload() {
        let mut m = machine();
        let epoch = measuring(&mut m);
        m.handle_transport(epoch, data_event(false));
        m.handle_ranging(epoch, sample(0.6)); // 未跨阈值，仅记录

        // 传输层换了连接（对撞裁决替换）：连接级事实作废，payload 重发
        let actions = m.handle_transport(epoch, TransportEvent::Connected { peer: peer() });
        assert_eq!(m.state, ProximityState::Measuring);
        let sent = actions.iter().find_map(|a| match a {
            Action::SendPayload { payload } => Some(payload),
            _ => None,
        });
        assert!(sent.is_some_and(|p| p.ranging_token.is_some()));

        // 旧连接收到的 payload 不再算数：只有采样不会验证成立
        let actions = m.handle_ranging(epoch, sample(0.3));
        assert!(!has_verified(&actions));

        // 新连接重新收齐两个事实后验证成立
        let actions = m.handle_transport(epoch, data_event(false));
        assert!(has_verified(&actions));
        assert_eq!(m.state, ProximityState::Verified);
    }

    #[test]
    fn timeout_in_measuring_names_the_stall() {
        let mut m = machine();
        let epoch = measuring(&mut m);

        let actions = m.timeout_fired(epoch);
        assert_eq!(m.state, ProximityState::TimedOut);
        // 已连上之后的超时不能再说"没发现 peer"
        assert!(actions.iter().any(|a| {
            matches!(
                a,
                Action::Emit {
                    event: VerifierEvent::Error {
                        reason: VerifyError::Unknown(_),
                        fatal: true
                    }
                }
            )
        }));
        assert!(!actions.iter().any(|a| {
            matches!(
                a,
                Action::Emit {
                    event: VerifierEvent::Error {
                        reason: VerifyError::SearchTimeout,
                        ..
                    }
                }
            )
        }));
    }

    #[test]
    fn connection_lost_mid_measuring_is_fatal() {
        let mut m = machine();
        let epoch = measuring(&mut m);

        let actions = m.handle_transport(epoch, TransportEvent::Disconnected { reason: None });
        assert!(matches!(m.state, ProximityState::Error { .. }));
        assert!(actions.iter().any(|a| {
            matches!(
                a,
                Action::Emit {
                    event: VerifierEvent::Error {
                        reason: VerifyError::ConnectionLost,
                        fatal: true
                    }
                }
            )
        }));

        // 之后永远不会再验证成立
        assert!(m.handle_ranging(epoch, sample(0.1)).is_empty());
        assert!(m.handle_transport(epoch, data_event(false)).is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let mut m = machine();
        m.begin(user(), true);

        let actions = m.stop();
        assert_eq!(m.state, ProximityState::Idle);
        assert!(!actions.is_empty());

        // 再停一次：仍是 Idle，无动作无错误
        assert!(m.stop().is_empty());
        assert_eq!(m.state, ProximityState::Idle);
    }

    #[test]
    fn events_after_stop_are_discarded() {
        let mut m = machine();
        m.begin(user(), true);
        let epoch = m.epoch;
        m.stop();

        assert!(m
            .handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() })
            .is_empty());
        assert!(m.handle_ranging(epoch, sample(0.1)).is_empty());
        assert_eq!(m.state, ProximityState::Idle);
    }

    #[test]
    fn payload_waits_for_local_ranging_token() {
        let mut m = machine();
        m.begin(user(), true);
        let epoch = m.epoch;
        m.handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() });

        // token 未就绪：连接建立时只请求启动测距，payload 挂起
        let actions = m.handle_transport(epoch, TransportEvent::Connected { peer: peer() });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::StartRanging { .. })));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::SendPayload { .. })));

        // token 就绪后补发，且带上 token
        let actions = m.ranging_started(epoch, token());
        let sent = actions.iter().find_map(|a| match a {
            Action::SendPayload { payload } => Some(payload),
            _ => None,
        });
        assert!(sent.is_some_and(|p| p.ranging_token.is_some()));

        // 不会重复发送
        assert!(m.ranging_started(epoch, token()).is_empty());
    }

    #[test]
    fn peer_token_before_local_ranging_ready_is_deferred() {
        let mut m = machine();
        m.begin(user(), true);
        let epoch = m.epoch;
        m.handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() });
        m.handle_transport(epoch, TransportEvent::Connected { peer: peer() });

        // 对方 token 先到：先存着，不能立刻配置
        let actions = m.handle_transport(epoch, data_event(true));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ConfigureRanging { .. })));

        // 本端测距就绪时补配置
        let actions = m.ranging_started(epoch, token());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ConfigureRanging { .. })));
    }

    #[test]
    fn decode_failure_is_reported_but_not_fatal() {
        let mut m = machine();
        let epoch = measuring(&mut m);

        let actions = m.handle_transport(
            epoch,
            TransportEvent::Data {
                bytes: b"garbage".to_vec(),
            },
        );
        assert_eq!(m.state, ProximityState::Measuring);
        assert!(actions.iter().any(|a| {
            matches!(
                a,
                Action::Emit {
                    event: VerifierEvent::Error { fatal: false, .. }
                }
            )
        }));

        // 连接未拆，之后的有效 payload 仍然生效
        m.handle_transport(epoch, data_event(false));
        let actions = m.handle_ranging(epoch, sample(0.3));
        assert!(has_verified(&actions));
    }

    #[test]
    fn losing_the_connecting_peer_returns_to_scanning() {
        let mut m = machine();
        m.begin(user(), true);
        let epoch = m.epoch;
        m.handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() });
        assert_eq!(m.state, ProximityState::Connecting);

        m.handle_transport(epoch, TransportEvent::PeerLost { peer: peer() });
        assert_eq!(m.state, ProximityState::Scanning);
    }

    #[test]
    fn no_ranging_capability_sends_payload_immediately() {
        let mut m = machine();
        m.begin(user(), false);
        let epoch = m.epoch;
        m.handle_transport(epoch, TransportEvent::PeerDiscovered { peer: peer() });
        let actions = m.handle_transport(epoch, TransportEvent::Connected { peer: peer() });

        let sent = actions.iter().find_map(|a| match a {
            Action::SendPayload { payload } => Some(payload),
            _ => None,
        });
        assert!(sent.is_some_and(|p| p.ranging_token.is_none()));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::StartRanging { .. })));
    }
}
