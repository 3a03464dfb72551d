//! 测距模块
//!
//! 两台设备交换握手 token 后，持续产出彼此间的距离估计。
//! 本实现基于 UDP 往返时延（RTT）换算距离——在没有专用测距硬件的平台上
//! 作为测距通道的等价实现；方向信息不可用（`direction` 恒为 None）。
//!
//! 挂起语义：会话可能被运行环境在协议之外挂起（如退后台）。挂起期间
//! 停止产出采样但保留已配置的 peer token；恢复时用保留的 token 自动
//! 重新配置，不需要协调器重新走发现/握手流程。

mod session;

pub use session::{check_capability, RangingSession};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::HandshakeToken;
use crate::{VerifyError, VerifyResult};

/// 一次距离采样；短暂存在，不持久化
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistanceSample {
    /// 距离估计（米）
    pub distance: f32,
    /// 方向向量；RTT 后端不可用，恒为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<[f32; 3]>,
    /// Unix 时间戳（毫秒）
    pub timestamp: i64,
}

/// 测距 peer 被移除的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalReason {
    /// 对方主动结束了测距会话
    PeerEnded,
    /// 连续多个探测包无回应
    Timeout,
    Other,
}

/// 测距事件
#[derive(Debug)]
pub enum RangingEvent {
    Sample { sample: DistanceSample },
    PeerRemoved { reason: RemovalReason },
    Suspended,
    Resumed,
    /// 会话失效（套接字错误、token 畸形等），需要重新 start
    Invalidated { reason: String },
}

/// `start()` 的返回值：暴露本端握手 token，经传输层发给 peer
#[derive(Debug)]
pub struct RangingHandle {
    pub local_token: HandshakeToken,
}

/// driver 命令
pub(crate) enum RangingCommand {
    Start {
        reply: oneshot::Sender<VerifyResult<RangingHandle>>,
    },
    Configure {
        peer_token: HandshakeToken,
    },
    Suspend,
    Resume,
    Stop,
}

/// 测距会话句柄
#[derive(Clone)]
pub struct RangingClient {
    pub(crate) tx: mpsc::UnboundedSender<RangingCommand>,
}

impl RangingClient {
    /// 打开测距会话并取得本端握手 token
    pub async fn start(&self) -> VerifyResult<RangingHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RangingCommand::Start { reply })
            .map_err(|_| VerifyError::ChannelClosed)?;
        rx.await.map_err(|_| VerifyError::ChannelClosed)?
    }

    /// 提供 peer 的握手 token，开始针对该 peer 产出采样
    pub fn configure(&self, peer_token: HandshakeToken) {
        let _ = self.tx.send(RangingCommand::Configure { peer_token });
    }

    /// 运行环境挂起通知（如退后台）
    pub fn suspend(&self) {
        let _ = self.tx.send(RangingCommand::Suspend);
    }

    /// 运行环境恢复通知；自动用保留的 peer token 重新配置
    pub fn resume(&self) {
        let _ = self.tx.send(RangingCommand::Resume);
    }

    /// 关闭会话；之后不再产出采样
    pub fn stop(&self) {
        let _ = self.tx.send(RangingCommand::Stop);
    }
}
