//! 对外事件类型
//!
//! 协调器推送给 UI / 图存储协作方的高层域事件。
//! 全部可序列化，UI 壳层可以原样转发给前端。

use serde::Serialize;

use crate::coordinator::ProximityState;
use crate::protocol::VerificationPayload;
use crate::transport::PeerIdentity;
use crate::VerifyError;

/// 验证流程事件
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum VerifierEvent {
    /// 协调器状态变化（UI 据此渲染 scanning/measuring/verified）
    StateChanged { state: ProximityState },

    /// 发现了宣告相同服务标签的 peer
    PeerFound { peer: PeerIdentity },

    /// 此前发现的 peer 不再宣告
    PeerLost { peer_name: String },

    /// 与 peer 建立了加密会话
    ConnectionEstablished { peer: PeerIdentity },

    /// 收到对方的验证 payload
    PayloadReceived { payload: VerificationPayload },

    /// 两个前置条件都满足，验证成立（每次尝试最多触发一次）
    VerificationValid {
        peer: VerificationPayload,
        /// 跨过阈值那一次采样的距离（米）
        distance: f32,
    },

    /// 错误上报；`fatal` 为 true 时协调器已进入终态
    Error { reason: VerifyError, fatal: bool },
}
