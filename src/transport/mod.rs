//! 传输模块
//!
//! 负责本地 peer 发现（宣告 + 浏览）和与单个 peer 的加密双向会话。
//! [`LanTransport`] 是 driver 任务，[`TransportClient`] 是克隆句柄，
//! 命令经 mpsc 发给 driver，结果经 oneshot 返回；事件从独立通道异步送出。

mod crypto;
mod session;

pub use session::LanTransport;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{VerifyError, VerifyResult};

/// 发现传输分配的 peer 句柄
///
/// `id` 在一次会话生命周期内稳定，每次 `start()` 重新生成，不持久化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
    pub id: Uuid,
    pub name: String,
}

/// 传输层事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 浏览到宣告相同服务标签的 peer（按展示名去重）
    PeerDiscovered { peer: PeerIdentity },
    /// peer 超过存活窗口未再宣告
    PeerLost { peer: PeerIdentity },
    /// 已向 peer 发出会话邀请
    Connecting { peer: PeerIdentity },
    /// 加密会话建立完成
    Connected { peer: PeerIdentity },
    /// 会话断开；`reason` 为 None 表示对端正常关闭
    Disconnected { reason: Option<String> },
    /// 会话收到一帧数据（已解密）
    Data { bytes: Vec<u8> },
    /// 宣告任务运行期失败
    AdvertiseFailed { reason: String },
    /// 浏览任务运行期失败
    BrowseFailed { reason: String },
}

/// driver 命令
pub(crate) enum TransportCommand {
    Start {
        display_name: String,
        reply: oneshot::Sender<VerifyResult<PeerIdentity>>,
    },
    Stop,
    ConnectTo {
        peer: PeerIdentity,
        timeout: Duration,
    },
    Send {
        bytes: Vec<u8>,
        reply: oneshot::Sender<VerifyResult<()>>,
    },
}

/// 传输会话句柄
///
/// 可克隆；driver 退出后所有调用返回 `ChannelClosed`。
#[derive(Clone)]
pub struct TransportClient {
    pub(crate) tx: mpsc::UnboundedSender<TransportCommand>,
}

impl TransportClient {
    /// 开始同时宣告与浏览；幂等，已启动时直接返回当前身份
    pub async fn start(&self, display_name: impl Into<String>) -> VerifyResult<PeerIdentity> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::Start {
                display_name: display_name.into(),
                reply,
            })
            .map_err(|_| VerifyError::ChannelClosed)?;
        rx.await.map_err(|_| VerifyError::ChannelClosed)?
    }

    /// 停止宣告/浏览并拆除活跃会话；任意状态下可重复调用
    pub fn stop(&self) {
        let _ = self.tx.send(TransportCommand::Stop);
    }

    /// 向已发现的 peer 发起会话邀请；结果经 `Connected`/`Disconnected` 事件送达
    pub fn connect_to(&self, peer: PeerIdentity, timeout: Duration) -> VerifyResult<()> {
        self.tx
            .send(TransportCommand::ConnectTo { peer, timeout })
            .map_err(|_| VerifyError::ChannelClosed)
    }

    /// 向当前连接的 peer 发送一帧；无会话时返回 `NoActiveConnection`
    pub async fn send(&self, bytes: Vec<u8>) -> VerifyResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::Send { bytes, reply })
            .map_err(|_| VerifyError::ChannelClosed)?;
        rx.await.map_err(|_| VerifyError::ChannelClosed)?
    }
}
