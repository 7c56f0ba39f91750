//! 上传传输层
//!
//! - 进度以百分比通过 mpsc 通道推送（同一个传输内保证有序）
//! - 取消通过 CancellationToken 表达，被取消时返回 `UploadError::Cancelled`
//! - `HttpTransport`：reqwest multipart，文件内容流式读取并统计已发送字节

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, UploadError};

/// 默认请求超时（秒）
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// 上传请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// 服务器地址
    pub url: String,
    /// 待上传文件
    pub file_path: PathBuf,
    /// 文件字段名
    pub file_field: String,
    /// 其他表单字段
    pub form: Vec<(String, String)>,
}

/// 服务器响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 传输接口
#[async_trait]
pub trait Transport: Send + Sync {
    /// 上传文件
    ///
    /// 网络层失败返回 `Transport` 错误；收到任何 HTTP 响应（包括非 2xx）都返回 Ok
    async fn upload(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel_token: CancellationToken,
    ) -> Result<TransportResponse>;
}

/// 基于 reqwest 的 HTTP 传输
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel_token: CancellationToken,
    ) -> Result<TransportResponse> {
        let file = tokio::fs::File::open(&request.file_path)
            .await
            .map_err(|e| {
                UploadError::Transport(format!("无法打开 {:?}: {}", request.file_path, e))
            })?;
        let total = file
            .metadata()
            .await
            .map_err(|e| UploadError::Transport(format!("无法读取文件元数据: {}", e)))?
            .len();

        // 按已读取（即已交给 HTTP 层）的字节数计算进度
        let sent = Arc::new(AtomicU64::new(0));
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                let done = sent.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
                let _ = progress.send(percent(done, total));
            }
            chunk
        });

        let file_name = request
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(file_name)
            .mime_str(guess_mime(&request.file_path))
            .map_err(|e| UploadError::Transport(format!("构造表单失败: {}", e)))?;

        let mut form = Form::new();
        for (key, value) in request.form {
            form = form.text(key, value);
        }
        let form = form.part(request.file_field, part);

        debug!("发送上传请求: url={}, size={}", request.url, total);

        let send = self.client.post(&request.url).multipart(form).send();
        let response = tokio::select! {
            result = send => result.map_err(|e| UploadError::Transport(e.to_string()))?,
            _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            result = response.text() => result.map_err(|e| UploadError::Transport(e.to_string()))?,
            _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
        };

        Ok(TransportResponse { status, body })
    }
}

/// 已发送字节换算为百分比
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("heic") => "image/heic",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
