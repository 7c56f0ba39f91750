//! 上传事件类型定义

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::uploader::{NetworkQuality, NetworkType, UploadStatus};

/// 默认广播通道容量
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// 上传任务事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建
    Created {
        task_id: String,
        local_path: String,
        size_bytes: u64,
        priority: u8,
    },
    /// 进度更新
    Progress { task_id: String, progress: u8 },
    /// 状态变更
    StatusChanged {
        task_id: String,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 任务完成
    Completed { task_id: String },
    /// 任务失败
    Failed { task_id: String, error: String },
    /// 任务暂停
    Paused { task_id: String },
    /// 任务恢复
    Resumed { task_id: String },
    /// 任务删除
    Deleted { task_id: String },
    /// 已安排自动重试
    RetryScheduled {
        task_id: String,
        retry_count: u32,
        delay_ms: u64,
    },
    /// 网络策略变化
    NetworkPolicyChanged {
        network_type: NetworkType,
        quality: Option<NetworkQuality>,
        concurrency: usize,
    },
}

impl UploadEvent {
    /// 事件关联的任务ID
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { task_id, .. }
            | UploadEvent::Progress { task_id, .. }
            | UploadEvent::StatusChanged { task_id, .. }
            | UploadEvent::Completed { task_id }
            | UploadEvent::Failed { task_id, .. }
            | UploadEvent::Paused { task_id }
            | UploadEvent::Resumed { task_id }
            | UploadEvent::Deleted { task_id }
            | UploadEvent::RetryScheduled { task_id, .. } => Some(task_id),
            UploadEvent::NetworkPolicyChanged { .. } => None,
        }
    }
}

/// 事件总线
///
/// 没有订阅者时发布直接丢弃；订阅者处理过慢会丢失旧事件
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: UploadEvent) {
        if self.sender.send(event).is_err() {
            trace!("没有事件订阅者，事件已丢弃");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
