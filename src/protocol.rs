//! 验证协议类型
//!
//! 定义两台已连接设备间交换的 [`VerificationPayload`] 及其附属类型。
//! 线上编码为 JSON 平铺记录；测距握手 token 作为不透明字节串嵌入 payload，
//! 传输层不解析它。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{VerifyError, VerifyResult};

/// 不透明的测距握手 token
///
/// 只有测距层能解释其内容；其他层只负责原样携带。
/// 用独立类型而不是 `Vec<u8>`，让"缺失 vs 存在"和"畸形 vs 有效"
/// 在类型层面就能区分。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeToken(#[serde(with = "serde_bytes")] Vec<u8>);

impl HandshakeToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// 本机用户身份（由上层联系人/身份提供方注入）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalUser {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    /// 粗粒度地理位置，仅作展示信息，绝不参与信任判定
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            avatar_ref: None,
            location: None,
        }
    }
}

/// 粗粒度地理坐标（信息性字段）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// 验证方式标签，为将来扩展其他验证方式预留
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum VerificationMethod {
    /// 近距离物理共处验证
    Proximity,
}

/// 两个已连接 peer 间交换的验证消息
///
/// 每个连接生命周期内最多发送一次；重连后才会重新发送。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationPayload {
    /// 每个 payload 实例唯一
    pub id: Uuid,
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
    /// Unix 时间戳（秒）
    pub timestamp: i64,
    pub method: VerificationMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    /// 发送时刻本机最近一次的测距值（米），信息性字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    /// 对方启动测距所需的握手 token；本机测距能力未就绪时缺失
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranging_token: Option<HandshakeToken>,
}

impl VerificationPayload {
    /// 编码为传输层字节
    pub fn encode(&self) -> VerifyResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 从传输层字节解码；失败归类为非致命的 `Decoding`
    pub fn decode(bytes: &[u8]) -> VerifyResult<Self> {
        serde_json::from_slice(bytes).map_err(VerifyError::Decoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_payload() -> VerificationPayload {
        VerificationPayload {
            id: Uuid::new_v4(),
            user_id: "user-42".into(),
            user_name: "Alice".into(),
            avatar_ref: Some("avatars/alice.png".into()),
            timestamp: 1_735_000_000,
            method: VerificationMethod::Proximity,
            location: Some(GeoLocation {
                latitude: 31.23,
                longitude: 121.47,
            }),
            distance: Some(0.42),
            ranging_token: Some(HandshakeToken::from_bytes(vec![1, 2, 3, 4])),
        }
    }

    #[test]
    fn payload_roundtrip_all_fields() {
        let payload = full_payload();
        let decoded = VerificationPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn payload_roundtrip_without_optionals() {
        let payload = VerificationPayload {
            avatar_ref: None,
            location: None,
            distance: None,
            ranging_token: None,
            ..full_payload()
        };
        let bytes = payload.encode().unwrap();
        // 缺失的可选字段不应出现在线上编码中
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(raw.get("rangingToken").is_none());
        assert!(raw.get("location").is_none());

        let decoded = VerificationPayload::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn garbage_bytes_fail_as_non_fatal_decoding() {
        let err = VerificationPayload::decode(b"{not json").unwrap_err();
        assert!(!err.is_fatal());
    }
}
