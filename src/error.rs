//! 错误处理模块
//!
//! 协议层错误分为致命/非致命两类：致命错误让协调器进入终态，
//! 非致命错误（如 payload 解码失败）只上报、不改变状态。

use serde::Serialize;
use thiserror::Error;

/// 验证子系统统一错误类型
///
/// 注意：使用 `#[from]` 的变体会存储原始错误类型，
/// 但由于 `std::io::Error` 等不实现 `Serialize`，
/// 通过自定义 Serialize 实现统一转为 `{ kind, message }` 格式供 UI 消费。
#[derive(Debug, Error)]
pub enum VerifyError {
    /// 平台拒绝了本地发现/测距所需的访问权限
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 全局超时内未发现任何 peer
    #[error("no peer discovered before the scan timeout")]
    SearchTimeout,

    /// 已连接的 peer 在验证完成前断开
    #[error("peer disconnected before verification completed")]
    ConnectionLost,

    /// 收到的字节无法解析为 VerificationPayload（非致命）
    #[error("payload decoding failed: {0}")]
    Decoding(#[from] serde_json::Error),

    /// 当前没有活跃的传输会话
    #[error("no active connection")]
    NoActiveConnection,

    /// 验证尝试尚未启动
    #[error("verification attempt not started")]
    NotStarted,

    /// 套接字错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 子会话的命令通道已关闭（driver 已退出）
    #[error("sub-session channel closed")]
    ChannelClosed,

    /// 未分类的底层传输/测距错误
    #[error("{0}")]
    Unknown(String),
}

impl VerifyError {
    /// 绑定套接字失败时的归类：权限类错误单独上报，方便 UI 引导用户处理
    pub(crate) fn from_bind(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            VerifyError::PermissionDenied(e.to_string())
        } else {
            VerifyError::Io(e)
        }
    }

    /// 是否为致命错误（致命错误触发终态转移）
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VerifyError::Decoding(_))
    }
}

/// 传递给 UI 协作方的序列化错误格式
impl Serialize for VerifyError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("VerifyError", 2)?;

        let kind = match self {
            VerifyError::PermissionDenied(_) => "PermissionDenied",
            VerifyError::SearchTimeout => "SearchTimeout",
            VerifyError::ConnectionLost => "ConnectionLost",
            VerifyError::Decoding(_) => "Decoding",
            VerifyError::NoActiveConnection => "NoActiveConnection",
            VerifyError::NotStarted => "NotStarted",
            VerifyError::Io(_) => "Io",
            VerifyError::ChannelClosed => "ChannelClosed",
            VerifyError::Unknown(_) => "Unknown",
        };

        state.serialize_field("kind", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

// ============ 便捷类型别名 ============

/// Result 类型别名
pub type VerifyResult<T> = Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoding_is_the_only_non_fatal_kind() {
        let decode_err =
            VerifyError::Decoding(serde_json::from_str::<u32>("not json").unwrap_err());
        assert!(!decode_err.is_fatal());
        assert!(VerifyError::SearchTimeout.is_fatal());
        assert!(VerifyError::ConnectionLost.is_fatal());
        assert!(VerifyError::Unknown("x".into()).is_fatal());
    }

    #[test]
    fn serializes_as_kind_and_message() {
        let v = serde_json::to_value(&VerifyError::SearchTimeout).unwrap();
        assert_eq!(v["kind"], "SearchTimeout");
        assert!(v["message"].as_str().unwrap().contains("scan timeout"));
    }
}
