//! neartrust —— 基于物理共处的近距离验证子系统
//!
//! 为社交图谱层提供"两人确实面对面"的验证结论。一次验证尝试由三部分协作：
//!
//! - **传输**（[`transport`]）：局域网内发现 peer 并建立加密会话，
//!   交换验证 payload；
//! - **测距**（[`ranging`]）：交换握手 token 后持续产出距离采样；
//! - **协调器**（[`coordinator`]）：驱动状态机，把"收到对方 payload"和
//!   "距离跨过阈值"两个独立事实合成唯一的验证结论。
//!
//! ```no_run
//! use std::sync::Arc;
//! use neartrust::{LocalUser, NullGraphStore, VerificationCoordinator, VerifierConfig};
//!
//! # async fn demo() -> neartrust::VerifyResult<()> {
//! let (coordinator, mut events) =
//!     VerificationCoordinator::new(VerifierConfig::default(), Arc::new(NullGraphStore));
//! coordinator.start(LocalUser::new("user-1", "Alice")).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod graph;
pub mod protocol;
pub mod ranging;
pub mod transport;

pub use config::{VerifierConfig, SERVICE_TAG};
pub use coordinator::{ProximityState, VerificationCoordinator};
pub use error::{VerifyError, VerifyResult};
pub use events::VerifierEvent;
pub use graph::{GraphStore, NullGraphStore, VerifiedConnection};
pub use protocol::{GeoLocation, HandshakeToken, LocalUser, VerificationPayload};
pub use ranging::{DistanceSample, RangingClient, RangingEvent};
pub use transport::{PeerIdentity, TransportClient, TransportEvent};

use tracing_subscriber::EnvFilter;

/// 初始化日志（嵌入方也可以自行配置 tracing，不调用这里）
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "neartrust=debug".into()),
        )
        .init();
}
