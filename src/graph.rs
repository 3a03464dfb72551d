//! 社交图协作方接口
//!
//! 验证成立后，协调器把结果交给图存储协作方落库（创建连接记录）。
//! 本子系统自身不做任何持久化。

use serde::Serialize;

use crate::protocol::VerificationPayload;

/// 验证成立的连接记录
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedConnection {
    pub local_user_id: String,
    /// 对方的完整验证 payload
    pub peer: VerificationPayload,
    /// 跨过阈值那一次采样的距离（米）
    pub distance: f32,
    /// Unix 时间戳（秒）
    pub verified_at: i64,
}

/// 图存储协作方
///
/// 由调用方注入实现；本 crate 只保证每次验证尝试最多回调一次。
pub trait GraphStore: Send + Sync {
    fn record_verified_connection(&self, connection: VerifiedConnection);
}

/// 空实现：只通过事件通道消费结果的嵌入方可以用它
pub struct NullGraphStore;

impl GraphStore for NullGraphStore {
    fn record_verified_connection(&self, _connection: VerifiedConnection) {}
}
