//! 验证协调器
//!
//! [`VerificationCoordinator`] 驱动一次完整的验证尝试：启动传输与测距
//! 两个子会话，消费它们的事件流，喂给纯状态机 [`state::Machine`]，
//! 并执行状态机产出的副作用。
//!
//! 并发模型：状态机被一把互斥锁保护，每个事件"加锁-转移-解锁"后
//! 才执行副作用，副作用永远不在持锁状态下执行，因此不会死锁，
//! 也不会因为副作用的异步完成顺序打乱状态转移的串行性。

mod state;

pub use state::ProximityState;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::VerifierConfig;
use crate::events::VerifierEvent;
use crate::graph::GraphStore;
use crate::protocol::LocalUser;
use crate::ranging::{self, RangingClient, RangingEvent, RangingSession};
use crate::transport::{LanTransport, TransportClient, TransportEvent};
use crate::VerifyResult;

use state::{Action, Machine};

struct Shared {
    machine: Machine,
    transport: Option<TransportClient>,
    ranging: Option<RangingClient>,
    /// 当前尝试的全局超时武装标志；Disarm 后 pump 的超时分支不再触发
    timeout_armed: Arc<AtomicBool>,
}

struct Core {
    config: VerifierConfig,
    graph: Arc<dyn GraphStore>,
    events_tx: mpsc::UnboundedSender<VerifierEvent>,
    inner: Mutex<Shared>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        // 状态机方法不会 panic；即便锁被毒化也照常恢复内部数据
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 加锁执行一次状态转移，释放锁后执行产出的副作用
    fn dispatch(self: &Arc<Self>, f: impl FnOnce(&mut Machine) -> Vec<Action>) {
        let actions = f(&mut self.lock().machine);
        if !actions.is_empty() {
            self.execute(actions);
        }
    }

    fn execute(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { peer } => {
                    let guard = self.lock();
                    if let Some(transport) = guard.transport.clone() {
                        drop(guard);
                        if let Err(e) = transport.connect_to(peer, self.config.connect_timeout) {
                            warn!("connect request failed: {}", e);
                        }
                    }
                }
                Action::SendPayload { payload } => {
                    let Some(transport) = self.lock().transport.clone() else {
                        continue;
                    };
                    tokio::spawn(async move {
                        let bytes = match payload.encode() {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("payload encoding failed: {}", e);
                                return;
                            }
                        };
                        if let Err(e) = transport.send(bytes).await {
                            warn!("payload send failed: {}", e);
                        }
                    });
                }
                Action::StartRanging { epoch } => {
                    let Some(ranging) = self.lock().ranging.clone() else {
                        continue;
                    };
                    let core = self.clone();
                    tokio::spawn(async move {
                        match ranging.start().await {
                            Ok(handle) => {
                                core.dispatch(|m| m.ranging_started(epoch, handle.local_token))
                            }
                            Err(e) => core.dispatch(|m| m.ranging_start_failed(epoch, e)),
                        }
                    });
                }
                Action::ConfigureRanging { token } => {
                    if let Some(ranging) = self.lock().ranging.clone() {
                        ranging.configure(token);
                    }
                }
                Action::StopRanging => {
                    if let Some(ranging) = self.lock().ranging.take() {
                        ranging.stop();
                    }
                }
                Action::StopTransport => {
                    if let Some(transport) = self.lock().transport.take() {
                        transport.stop();
                    }
                }
                Action::DisarmTimeout => {
                    self.lock().timeout_armed.store(false, Ordering::Relaxed);
                }
                Action::Emit { event } => {
                    let _ = self.events_tx.send(event);
                }
                Action::NotifyGraph { connection } => {
                    self.graph.record_verified_connection(connection);
                }
            }
        }
    }
}

/// 近距离验证协调器
///
/// 整个验证尝试的唯一入口。事件经构造时返回的通道推送，
/// 调用方（UI 壳层）负责消费。
pub struct VerificationCoordinator {
    core: Arc<Core>,
}

impl VerificationCoordinator {
    pub fn new(
        config: VerifierConfig,
        graph: Arc<dyn GraphStore>,
    ) -> (Self, mpsc::UnboundedReceiver<VerifierEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Core {
            inner: Mutex::new(Shared {
                machine: Machine::new(config.clone()),
                transport: None,
                ranging: None,
                timeout_armed: Arc::new(AtomicBool::new(false)),
            }),
            config,
            graph,
            events_tx,
        });
        (Self { core }, events_rx)
    }

    /// 开始一次验证尝试
    ///
    /// 已有活跃尝试时是 no-op（返回 Ok）；从 Idle 或任意终态都可以
    /// 重新开始。权限类失败（如套接字绑定被拒）同步返回错误，
    /// 之后的失败经事件通道异步上报。
    pub async fn start(&self, user: LocalUser) -> VerifyResult<()> {
        if self.core.lock().machine.active() {
            warn!("start ignored: verification attempt already active");
            return Ok(());
        }

        let ranging_capable = ranging::check_capability();
        if !ranging_capable {
            warn!("ranging capability unavailable, payloads will carry no token");
        }

        let (transport, transport_events) = LanTransport::spawn(self.core.config.clone());
        let (ranging_client, ranging_events) = RangingSession::spawn(self.core.config.clone());

        // 绑定失败（典型如权限被拒）在这里同步冒出来
        let identity = transport.start(user.user_name.clone()).await?;
        info!(peer_id = %identity.id, name = %identity.name, "verification attempt starting");

        let armed = Arc::new(AtomicBool::new(true));
        let (epoch, actions) = {
            let mut guard = self.core.lock();
            if guard.machine.active() {
                // 并发 start 竞争失败的一方收尾退出
                transport.stop();
                ranging_client.stop();
                return Ok(());
            }
            let actions = guard.machine.begin(user, ranging_capable);
            guard.transport = Some(transport);
            guard.ranging = Some(ranging_client);
            guard.timeout_armed = armed.clone();
            (guard.machine.epoch, actions)
        };

        spawn_pump(
            self.core.clone(),
            epoch,
            transport_events,
            ranging_events,
            armed,
        );
        self.core.execute(actions);
        Ok(())
    }

    /// 中止当前尝试并复位到 Idle；幂等，且同步生效——
    /// 返回时状态已是 Idle，之后不会再有本次尝试的事件
    pub fn stop(&self) {
        let actions = self.core.lock().machine.stop();
        if !actions.is_empty() {
            info!("verification attempt stopped");
            self.core.execute(actions);
        }
    }

    /// UI 主动连接某个已发现的 peer（`auto_connect` 关闭时使用）
    pub fn connect(&self, peer_name: &str) -> VerifyResult<()> {
        let actions = self.core.lock().machine.connect_request(peer_name)?;
        self.core.execute(actions);
        Ok(())
    }

    /// 当前协调器状态快照
    pub fn state(&self) -> ProximityState {
        self.core.lock().machine.state.clone()
    }

    /// 最近一次距离采样是否严格小于阈值；没有采样时为 false
    pub fn is_within_range(&self) -> bool {
        self.core.lock().machine.is_within_range()
    }

    /// 运行环境挂起通知（如应用退后台），转发给测距会话
    pub fn notify_suspended(&self) {
        if let Some(ranging) = self.core.lock().ranging.clone() {
            ranging.suspend();
        }
    }

    /// 运行环境恢复通知
    pub fn notify_resumed(&self) {
        if let Some(ranging) = self.core.lock().ranging.clone() {
            ranging.resume();
        }
    }
}

/// 事件泵：单任务串行消费两个子会话的事件流和全局超时
///
/// 两个通道都关闭后退出；超时分支只在武装标志有效时参与 select。
fn spawn_pump(
    core: Arc<Core>,
    epoch: u64,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    mut ranging_events: mpsc::UnboundedReceiver<RangingEvent>,
    armed: Arc<AtomicBool>,
) {
    let deadline = tokio::time::Instant::now() + core.config.scan_timeout;
    tokio::spawn(async move {
        let mut transport_open = true;
        let mut ranging_open = true;
        while transport_open || ranging_open {
            tokio::select! {
                event = transport_events.recv(), if transport_open => match event {
                    Some(event) => core.dispatch(|m| m.handle_transport(epoch, event)),
                    None => transport_open = false,
                },
                event = ranging_events.recv(), if ranging_open => match event {
                    Some(event) => core.dispatch(|m| m.handle_ranging(epoch, event)),
                    None => ranging_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if armed.load(Ordering::Relaxed) => {
                    debug!("scan timeout elapsed");
                    armed.store(false, Ordering::Relaxed);
                    core.dispatch(|m| m.timeout_fired(epoch));
                }
            }
        }
        debug!(epoch, "event pump finished");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NullGraphStore;
    use crate::VerifyError;

    fn coordinator() -> (
        VerificationCoordinator,
        mpsc::UnboundedReceiver<VerifierEvent>,
    ) {
        VerificationCoordinator::new(VerifierConfig::default(), Arc::new(NullGraphStore))
    }

    #[test]
    fn starts_idle() {
        let (c, _events) = coordinator();
        assert_eq!(c.state(), ProximityState::Idle);
        assert!(!c.is_within_range());
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let (c, mut events) = coordinator();
        c.stop();
        c.stop();
        assert_eq!(c.state(), ProximityState::Idle);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn connect_requires_an_active_scan() {
        let (c, _events) = coordinator();
        assert!(matches!(
            c.connect("Bob"),
            Err(VerifyError::NotStarted)
        ));
    }
}
