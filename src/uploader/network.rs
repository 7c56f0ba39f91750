// 网络自适应策略
//
// 连接类型 -> 压缩质量 + 并发上限：
//
// | 连接     | 质量   | 并发 |
// |----------|--------|------|
// | wifi     | high   | 3    |
// | 4g       | medium | 2    |
// | 3g / 2g  | low    | 1    |
// | none     | -      | 0    |
// | 其他     | medium | 1    |
//
// 连接变化通过推送订阅获得（不轮询），每次变化立即通知调度器

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    #[serde(rename = "wifi")]
    Wifi,
    #[serde(rename = "4g")]
    Cellular4g,
    #[serde(rename = "3g")]
    Cellular3g,
    #[serde(rename = "2g")]
    Cellular2g,
    #[serde(rename = "none")]
    None,
    #[serde(rename = "unknown")]
    Unknown,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Wifi => "wifi",
            NetworkType::Cellular4g => "4g",
            NetworkType::Cellular3g => "3g",
            NetworkType::Cellular2g => "2g",
            NetworkType::None => "none",
            NetworkType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkType {
    type Err = std::convert::Infallible;

    /// 无法识别的类型按 unknown 处理
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "wifi" => NetworkType::Wifi,
            "4g" => NetworkType::Cellular4g,
            "3g" => NetworkType::Cellular3g,
            "2g" => NetworkType::Cellular2g,
            "none" => NetworkType::None,
            _ => NetworkType::Unknown,
        })
    }
}

/// 传输质量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    High,
    Medium,
    Low,
}

impl NetworkQuality {
    /// 对应的图片压缩质量
    pub fn compression_quality(&self) -> u8 {
        match self {
            NetworkQuality::High => 95,
            NetworkQuality::Medium => 80,
            NetworkQuality::Low => 50,
        }
    }
}

/// 当前网络策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub network_type: NetworkType,
    /// 断网时为 None
    pub quality: Option<NetworkQuality>,
    /// 并发上限
    pub concurrency: usize,
}

impl NetworkPolicy {
    pub fn for_network(network_type: NetworkType) -> Self {
        let (quality, concurrency) = match network_type {
            NetworkType::Wifi => (Some(NetworkQuality::High), 3),
            NetworkType::Cellular4g => (Some(NetworkQuality::Medium), 2),
            NetworkType::Cellular3g | NetworkType::Cellular2g => (Some(NetworkQuality::Low), 1),
            NetworkType::None => (None, 0),
            NetworkType::Unknown => (Some(NetworkQuality::Medium), 1),
        };
        Self {
            network_type,
            quality,
            concurrency,
        }
    }

    pub fn for_state(state: ConnectivityState) -> Self {
        if state.is_connected {
            Self::for_network(state.network_type)
        } else {
            Self::for_network(NetworkType::None)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.concurrency > 0
    }
}

/// 连接状态通知
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
    pub is_connected: bool,
    pub network_type: NetworkType,
}

impl ConnectivityState {
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            is_connected: network_type != NetworkType::None,
            network_type,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            network_type: NetworkType::None,
        }
    }
}

/// 连接状态来源（由平台层实现）
pub trait ConnectivitySource: Send + Sync {
    /// 当前连接状态
    fn current(&self) -> ConnectivityState;
    /// 订阅连接变化
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;
}

/// 手动设置的连接状态，基于 watch 通道
#[derive(Debug)]
pub struct ManualConnectivity {
    sender: watch::Sender<ConnectivityState>,
}

impl ManualConnectivity {
    pub fn new(network_type: NetworkType) -> Self {
        let (sender, _) = watch::channel(ConnectivityState::connected(network_type));
        Self { sender }
    }

    pub fn set(&self, state: ConnectivityState) {
        self.sender.send_replace(state);
    }

    pub fn set_network(&self, network_type: NetworkType) {
        self.set(ConnectivityState::connected(network_type));
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn current(&self) -> ConnectivityState {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.sender.subscribe()
    }
}

/// 策略变化的接收方
#[async_trait]
pub trait PolicyListener: Send + Sync {
    async fn on_policy_changed(&self, old: NetworkPolicy, new: NetworkPolicy);
}

/// 网络策略适配器
///
/// 持有唯一的"当前策略"，调度器在启动每个传输时读取
pub struct NetworkStrategyAdapter {
    source: Arc<dyn ConnectivitySource>,
    policy: RwLock<NetworkPolicy>,
    started: AtomicBool,
}

impl NetworkStrategyAdapter {
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        let policy = NetworkPolicy::for_state(source.current());
        info!(
            "网络策略初始化: type={}, quality={:?}, concurrency={}",
            policy.network_type, policy.quality, policy.concurrency
        );
        Self {
            source,
            policy: RwLock::new(policy),
            started: AtomicBool::new(false),
        }
    }

    pub fn current_policy(&self) -> NetworkPolicy {
        *self.policy.read()
    }

    /// 根据新的连接状态重新计算策略
    ///
    /// 策略有变化时返回 (旧策略, 新策略)
    pub fn apply_state(&self, state: ConnectivityState) -> Option<(NetworkPolicy, NetworkPolicy)> {
        let new = NetworkPolicy::for_state(state);
        let mut policy = self.policy.write();
        if *policy == new {
            return None;
        }
        let old = std::mem::replace(&mut *policy, new);
        Some((old, new))
    }

    /// 订阅连接变化，只能启动一次
    pub fn start(
        self: &Arc<Self>,
        listener: Arc<dyn PolicyListener>,
        cancel_token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("网络策略适配器已经启动，忽略重复订阅");
            return None;
        }

        let adapter = Arc::clone(self);
        let mut rx = self.source.subscribe();

        Some(tokio::spawn(async move {
            // 订阅之前可能已经发生过变化
            let initial = *rx.borrow_and_update();
            if let Some((old, new)) = adapter.apply_state(initial) {
                listener.on_policy_changed(old, new).await;
            }

            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("连接状态来源已关闭");
                            break;
                        }
                    }
                    _ = cancel_token.cancelled() => break,
                }

                let state = *rx.borrow_and_update();
                if let Some((old, new)) = adapter.apply_state(state) {
                    info!(
                        "网络变化: {} -> {}, 并发上限 {} -> {}",
                        old.network_type, new.network_type, old.concurrency, new.concurrency
                    );
                    listener.on_policy_changed(old, new).await;
                }
            }
            debug!("网络策略监听退出");
        }))
    }
}
