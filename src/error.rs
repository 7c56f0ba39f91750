// 上传错误类型
//
// 所有库层错误统一为 UploadError，应用层（main / 配置加载）使用 anyhow

use crate::uploader::UploadStatus;
use thiserror::Error;

/// 上传子系统错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    /// 任务输入不合法
    #[error("任务参数无效: {0}")]
    Validation(String),
    /// 网络错误 / 超时
    #[error("传输错误: {0}")]
    Transport(String),
    /// 非 2xx 状态码或无法解析的响应
    #[error("服务器错误: status={status}, {message}")]
    Server { status: u16, message: String },
    /// 图片压缩 / 缩略图失败
    #[error("图片处理失败: {0}")]
    Codec(String),
    /// 上传被主动中止
    #[error("上传已取消")]
    Cancelled,
    /// 存储读写失败
    #[error("持久化失败: {0}")]
    Persistence(String),
    /// 任务不存在
    #[error("任务不存在: {0}")]
    TaskNotFound(String),
    /// 状态机不允许的转换
    #[error("非法状态转换: {from} -> {to}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },
}

impl UploadError {
    /// 失败后是否可由重试扫描重新调度
    ///
    /// 传输错误和服务器错误统一视为可重试，不区分临时/永久失败
    pub fn is_retriable(&self) -> bool {
        matches!(self, UploadError::Transport(_) | UploadError::Server { .. })
    }

    /// 是否为主动中止
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        UploadError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        UploadError::Persistence(format!("序列化失败: {}", e))
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
