// 上传任务定义
//
// 状态机：
//   pending   --(调度)-->        uploading --(成功)--> completed
//   uploading --(中止/暂停)-->   paused    --(恢复)--> pending
//   uploading --(传输/服务器错误)--> failed --(重试扫描)--> pending
//   uploading --(崩溃恢复)-->    pending

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, UploadError};

/// 默认优先级
pub const DEFAULT_PRIORITY: u8 = 5;
/// 最低优先级
pub const MIN_PRIORITY: u8 = 1;
/// 最高优先级
pub const MAX_PRIORITY: u8 = 10;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Paused => "paused",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    /// 状态机是否允许 self -> next
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Pending, Uploading) | (Pending, Paused) => true,
            (Uploading, Completed) | (Uploading, Paused) | (Uploading, Failed) => true,
            // 崩溃恢复：孤立的 uploading 任务重新排队
            (Uploading, Pending) => true,
            (Paused, Pending) => true,
            (Failed, Pending) => true,
            (Pending, _) | (Uploading, _) | (Paused, _) | (Failed, _) => false,
            (Completed, _) => false,
        }
    }

    /// 已完成或失败（不再被调度循环处理）
    pub fn is_finished(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 文件信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件大小（字节）
    pub size_bytes: u64,
    /// 拍摄/创建时间 (Unix 毫秒)
    pub created_at: i64,
}

impl FileInfo {
    pub fn new(local_path: impl Into<PathBuf>, size_bytes: u64, created_at: i64) -> Self {
        Self {
            local_path: local_path.into(),
            size_bytes,
            created_at,
        }
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadTask {
    /// 任务ID
    pub task_id: String,
    /// 文件信息
    pub file_info: FileInfo,
    /// 任务状态
    pub upload_status: UploadStatus,
    /// 进度 0-100
    pub progress: u8,
    /// 优先级 1-10（10 最高）
    pub priority: u8,
    /// 创建时间 (Unix 毫秒)
    pub created_at: i64,
    /// 最后更新时间 (Unix 毫秒)
    pub last_updated_at: i64,
    /// 自动重试次数
    #[serde(default)]
    pub retry_count: u32,
    /// 最近一次失败原因
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 最近一次失败不可自动重试（如参数错误）
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub non_retriable: bool,
}

impl UploadTask {
    /// 创建新的上传任务，优先级被限制在 1-10
    pub fn new(task_id: String, file_info: FileInfo, priority: u8, now: i64) -> Self {
        Self {
            task_id,
            file_info,
            upload_status: UploadStatus::Pending,
            progress: 0,
            priority: priority.clamp(MIN_PRIORITY, MAX_PRIORITY),
            created_at: now,
            last_updated_at: now,
            retry_count: 0,
            error: None,
            non_retriable: false,
        }
    }

    /// 按状态机转换状态
    ///
    /// 返回 `Ok(false)` 表示已经处于目标状态
    pub fn transition(&mut self, next: UploadStatus, now: i64) -> Result<bool> {
        if self.upload_status == next {
            return Ok(false);
        }
        if !self.upload_status.can_transition_to(next) {
            return Err(UploadError::InvalidTransition {
                from: self.upload_status,
                to: next,
            });
        }

        match next {
            UploadStatus::Completed => {
                self.progress = 100;
                self.error = None;
                self.non_retriable = false;
            }
            UploadStatus::Pending | UploadStatus::Uploading => {
                self.error = None;
                self.non_retriable = false;
            }
            UploadStatus::Paused | UploadStatus::Failed => {}
        }

        self.upload_status = next;
        self.last_updated_at = now;
        Ok(true)
    }

    /// 更新进度，不回退
    ///
    /// 返回是否发生了变化
    pub fn apply_progress(&mut self, progress: u8, now: i64) -> bool {
        let progress = progress.min(100);
        if progress <= self.progress {
            return false;
        }
        self.progress = progress;
        self.last_updated_at = now;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.upload_status == UploadStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(priority: u8) -> UploadTask {
        UploadTask::new(
            "t1".to_string(),
            FileInfo::new("./photos/a.jpg", 1024, 1),
            priority,
            100,
        )
    }

    #[test]
    fn test_task_creation() {
        let task = sample_task(DEFAULT_PRIORITY);

        assert_eq!(task.upload_status, UploadStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.created_at, 100);
        assert_eq!(task.last_updated_at, 100);
    }

    #[test]
    fn test_priority_clamped() {
        assert_eq!(sample_task(0).priority, MIN_PRIORITY);
        assert_eq!(sample_task(42).priority, MAX_PRIORITY);
        assert_eq!(sample_task(7).priority, 7);
    }

    #[test]
    fn test_status_transitions() {
        let mut task = sample_task(5);

        assert!(task.transition(UploadStatus::Uploading, 200).unwrap());
        assert_eq!(task.last_updated_at, 200);

        assert!(task.transition(UploadStatus::Paused, 300).unwrap());
        assert!(task.transition(UploadStatus::Pending, 400).unwrap());
        assert!(task.transition(UploadStatus::Uploading, 500).unwrap());

        task.error = Some("Network error".to_string());
        assert!(task.transition(UploadStatus::Failed, 600).unwrap());
        assert_eq!(task.error.as_deref(), Some("Network error"));

        assert!(task.transition(UploadStatus::Pending, 700).unwrap());
        assert!(task.error.is_none());

        assert!(task.transition(UploadStatus::Uploading, 800).unwrap());
        assert!(task.transition(UploadStatus::Completed, 900).unwrap());
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut task = sample_task(5);

        let err = task.transition(UploadStatus::Completed, 1).unwrap_err();
        assert_eq!(
            err,
            UploadError::InvalidTransition {
                from: UploadStatus::Pending,
                to: UploadStatus::Completed
            }
        );

        task.transition(UploadStatus::Uploading, 2).unwrap();
        task.transition(UploadStatus::Completed, 3).unwrap();
        for next in [
            UploadStatus::Pending,
            UploadStatus::Uploading,
            UploadStatus::Paused,
            UploadStatus::Failed,
        ] {
            assert!(task.transition(next, 4).is_err());
        }
    }

    #[test]
    fn test_same_status_is_noop() {
        let mut task = sample_task(5);
        assert!(!task.transition(UploadStatus::Pending, 999).unwrap());
        assert_eq!(task.last_updated_at, 100);
    }

    #[test]
    fn test_progress_never_regresses() {
        let mut task = sample_task(5);

        assert!(task.apply_progress(40, 1));
        assert!(!task.apply_progress(30, 2));
        assert_eq!(task.progress, 40);

        assert!(task.apply_progress(250, 3));
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&UploadStatus::Uploading).unwrap();
        assert_eq!(json, "\"uploading\"");
        let status: UploadStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(status, UploadStatus::Failed);
    }
}
