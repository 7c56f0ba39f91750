// 中断任务恢复
//
// 进程重启后，传输句柄不可能存活，所有 uploading 状态的任务都是孤立的。
// 由 UI 层决定全部恢复（-> pending）还是全部暂停（-> paused），
// 绝不能继续停留在 uploading

use async_trait::async_trait;
use tracing::info;

use crate::uploader::{TaskQueue, UploadStatus};

/// 用户对中断任务的选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// 重新排队
    Resume,
    /// 暂停，等待手动恢复
    Pause,
}

/// 中断任务提示（由 UI 层实现）
#[async_trait]
pub trait RecoveryPrompt: Send + Sync {
    /// 提示发现 `count` 个中断的上传任务，返回对全部任务的处理方式
    async fn decide(&self, count: usize) -> RecoveryDecision;
}

/// 总是恢复
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysResume;

#[async_trait]
impl RecoveryPrompt for AlwaysResume {
    async fn decide(&self, _count: usize) -> RecoveryDecision {
        RecoveryDecision::Resume
    }
}

/// 总是暂停
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysPause;

#[async_trait]
impl RecoveryPrompt for AlwaysPause {
    async fn decide(&self, _count: usize) -> RecoveryDecision {
        RecoveryDecision::Pause
    }
}

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 处理的任务ID
    pub task_ids: Vec<String>,
    /// 用户的选择；没有中断任务时为 None（不会弹出提示）
    pub decision: Option<RecoveryDecision>,
}

/// 检查并处理中断的任务
///
/// 必须在调度开始之前调用
pub async fn check_interrupted_tasks(
    queue: &TaskQueue,
    prompt: &dyn RecoveryPrompt,
) -> RecoveryReport {
    let interrupted: Vec<String> = queue
        .tasks_with_status(UploadStatus::Uploading)
        .into_iter()
        .map(|t| t.task_id)
        .collect();

    if interrupted.is_empty() {
        return RecoveryReport {
            task_ids: interrupted,
            decision: None,
        };
    }

    info!("发现 {} 个中断的上传任务", interrupted.len());

    let decision = prompt.decide(interrupted.len()).await;
    let target = match decision {
        RecoveryDecision::Resume => UploadStatus::Pending,
        RecoveryDecision::Pause => UploadStatus::Paused,
    };

    let task_ids = queue.update_many_status(&interrupted, target).await;

    info!(
        "中断任务处理完成: {} 个任务 -> {}",
        task_ids.len(),
        target
    );

    RecoveryReport {
        task_ids,
        decision: Some(decision),
    }
}
