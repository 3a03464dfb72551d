//! 验证器配置
//!
//! 一次验证尝试的所有配置常量。阈值/超时在尝试的生命周期内固定不变，
//! 修改配置只影响之后构造的协调器。

use std::net::Ipv4Addr;
use std::time::Duration;

/// 服务发现标签：只与宣告相同标签的 peer 建立会话
pub const SERVICE_TAG: &str = "neartrust/1";

/// 发现用多播组（本地管理地址段 239/8）
const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 77, 18, 42);
/// 发现用多播端口
const DISCOVERY_PORT: u16 = 56_100;

/// 验证器配置
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// 服务标签，宣告与过滤都使用它
    pub service_tag: String,
    /// 共处判定距离阈值（米），判定使用严格小于
    pub distance_threshold: f32,
    /// 全局扫描超时：超过仍未连接则本次尝试失败
    pub scan_timeout: Duration,
    /// 单次 connect 邀请的超时
    pub connect_timeout: Duration,
    /// 发现多播组
    pub multicast_group: Ipv4Addr,
    /// 发现多播端口
    pub discovery_port: u16,
    /// 宣告间隔
    pub advertise_interval: Duration,
    /// peer 存活窗口：超过该时长未再收到宣告则判定丢失
    pub peer_ttl: Duration,
    /// 测距采样间隔
    pub sample_interval: Duration,
    /// 连续丢失多少个探测回包后判定测距 peer 超时
    pub probe_loss_limit: u32,
    /// RTT(ms) 到距离(m) 的换算系数
    pub metres_per_rtt_ms: f32,
    /// 是否自动连接第一个发现的 peer（否则等 UI 调 `connect`）
    pub auto_connect: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            service_tag: SERVICE_TAG.to_string(),
            distance_threshold: 0.5,
            scan_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            multicast_group: MULTICAST_GROUP,
            discovery_port: DISCOVERY_PORT,
            advertise_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(3),
            sample_interval: Duration::from_millis(250),
            probe_loss_limit: 8,
            metres_per_rtt_ms: 0.1,
            auto_connect: true,
        }
    }
}

impl VerifierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_tag(mut self, tag: impl Into<String>) -> Self {
        self.service_tag = tag.into();
        self
    }

    pub fn with_distance_threshold(mut self, metres: f32) -> Self {
        self.distance_threshold = metres;
        self
    }

    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_auto_connect(mut self, auto: bool) -> Self {
        self.auto_connect = auto;
        self
    }

    /// 改用自定义多播组/端口（多实例测试或与其他应用冲突时）
    pub fn with_discovery_endpoint(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_group = group;
        self.discovery_port = port;
        self
    }
}
