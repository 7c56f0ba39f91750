// 单个任务的上传流水线
//
// 1. 判断是否需要压缩：文件 > 阈值，或当前网络质量不是 high
// 2. 压缩（质量 high→95 / medium→80 / low→50），失败时退回原文件
// 3. 尽力生成缩略图（质量 30），失败只记录日志
// 4. 上传（可能被压缩过的）文件，进度通过通道推送
// 5. 删除压缩产生的文件，不论上传成功与否

use serde::Deserialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ImageCodec;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::transport::{Transport, TransportResponse, UploadRequest};
use crate::uploader::{NetworkQuality, UploadTask};

/// 错误信息中保留的响应体长度
const MAX_ERROR_BODY_CHARS: usize = 200;

/// 服务器返回的上传结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerReply {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 实际上传的文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpload {
    pub file_path: PathBuf,
    pub compressed: bool,
    pub thumbnail: Option<PathBuf>,
}

/// 上传流水线
pub struct UploadPipeline {
    codec: Arc<dyn ImageCodec>,
    transport: Arc<dyn Transport>,
    config: UploadConfig,
}

impl UploadPipeline {
    pub fn new(
        codec: Arc<dyn ImageCodec>,
        transport: Arc<dyn Transport>,
        config: UploadConfig,
    ) -> Self {
        Self {
            codec,
            transport,
            config,
        }
    }

    /// 是否需要压缩
    pub fn needs_compression(&self, size_bytes: u64, quality: NetworkQuality) -> bool {
        size_bytes > self.config.compress_threshold_bytes || quality != NetworkQuality::High
    }

    /// 压缩 + 缩略图
    pub async fn prepare(&self, task: &UploadTask, quality: NetworkQuality) -> PreparedUpload {
        let original = &task.file_info.local_path;

        let (file_path, compressed) =
            if self.needs_compression(task.file_info.size_bytes, quality) {
                let level = quality.compression_quality();
                match self.codec.compress(original, level).await {
                    Ok(path) => {
                        debug!("任务 {} 已压缩 (quality={})", task.task_id, level);
                        (path, true)
                    }
                    Err(e) => {
                        warn!("任务 {} 压缩失败，使用原文件上传: {}", task.task_id, e);
                        (original.clone(), false)
                    }
                }
            } else {
                (original.clone(), false)
            };

        let thumbnail = match self
            .codec
            .thumbnail(original, self.config.thumbnail_quality)
            .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("任务 {} 缩略图生成失败: {}", task.task_id, e);
                None
            }
        };

        PreparedUpload {
            file_path,
            compressed,
            thumbnail,
        }
    }

    /// 执行完整流水线
    pub async fn run(
        &self,
        task: &UploadTask,
        quality: NetworkQuality,
        progress: mpsc::UnboundedSender<u8>,
        cancel_token: CancellationToken,
    ) -> Result<ServerReply> {
        let prepared = self.prepare(task, quality).await;
        let result = self
            .transfer(task, &prepared, progress, cancel_token)
            .await;
        discard_compressed(&prepared).await;
        result
    }

    async fn transfer(
        &self,
        task: &UploadTask,
        prepared: &PreparedUpload,
        progress: mpsc::UnboundedSender<u8>,
        cancel_token: CancellationToken,
    ) -> Result<ServerReply> {
        if cancel_token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let request = UploadRequest {
            url: self.config.server_url.clone(),
            file_path: prepared.file_path.clone(),
            file_field: self.config.form_field.clone(),
            form: vec![
                ("taskId".to_string(), task.task_id.clone()),
                (
                    "originalSize".to_string(),
                    task.file_info.size_bytes.to_string(),
                ),
                ("compressed".to_string(), prepared.compressed.to_string()),
                ("createdAt".to_string(), task.file_info.created_at.to_string()),
            ],
        };

        let response = self
            .transport
            .upload(request, progress, cancel_token)
            .await?;
        let reply = interpret_response(&response)?;

        info!(
            "任务 {} 上传成功: status={}, url={:?}",
            task.task_id, response.status, reply.url
        );
        Ok(reply)
    }
}

/// 删除压缩产生的文件，原文件不动
async fn discard_compressed(prepared: &PreparedUpload) {
    if !prepared.compressed {
        return;
    }
    match tokio::fs::remove_file(&prepared.file_path).await {
        Ok(()) => debug!("已删除压缩文件 {:?}", prepared.file_path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("删除压缩文件失败 {:?}: {}", prepared.file_path, e),
    }
}

/// 将 HTTP 响应转换为上传结果
///
/// 非 2xx、无法解析的响应体、`success: false` 一律视为服务器错误
pub fn interpret_response(response: &TransportResponse) -> Result<ServerReply> {
    if !response.is_success() {
        return Err(UploadError::Server {
            status: response.status,
            message: truncate(&response.body),
        });
    }

    let reply: ServerReply =
        serde_json::from_str(&response.body).map_err(|e| UploadError::Server {
            status: response.status,
            message: format!("响应无法解析: {}", e),
        })?;

    if reply.success == Some(false) {
        return Err(UploadError::Server {
            status: response.status,
            message: reply
                .message
                .clone()
                .unwrap_or_else(|| "服务器拒绝上传".to_string()),
        });
    }

    Ok(reply)
}

fn truncate(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JpegCodec;
    use crate::uploader::test_support::{MockCodec, MockOutcome, MockTransport};
    use crate::uploader::FileInfo;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn task(size: u64) -> UploadTask {
        UploadTask::new(
            "t1".to_string(),
            FileInfo::new("/photos/big.jpg", size, 7),
            5,
            0,
        )
    }

    fn pipeline(codec: Arc<MockCodec>, transport: Arc<MockTransport>) -> UploadPipeline {
        UploadPipeline::new(codec, transport, UploadConfig::default())
    }

    #[test]
    fn test_needs_compression_rules() {
        let p = pipeline(Arc::new(MockCodec::new()), Arc::new(MockTransport::new()));

        assert!(!p.needs_compression(5 * MB, NetworkQuality::High));
        assert!(!p.needs_compression(10 * MB, NetworkQuality::High));
        assert!(p.needs_compression(10 * MB + 1, NetworkQuality::High));
        assert!(p.needs_compression(1, NetworkQuality::Medium));
        assert!(p.needs_compression(1, NetworkQuality::Low));
    }

    #[tokio::test]
    async fn test_prepare_compresses_on_cellular() {
        let codec = Arc::new(MockCodec::new());
        let p = pipeline(codec.clone(), Arc::new(MockTransport::new()));

        let prepared = p.prepare(&task(MB), NetworkQuality::Low).await;

        assert!(prepared.compressed);
        assert_eq!(codec.compress_qualities(), vec![50]);
        assert_eq!(codec.thumbnail_qualities(), vec![30]);
        assert_ne!(prepared.file_path, PathBuf::from("/photos/big.jpg"));
    }

    #[tokio::test]
    async fn test_prepare_falls_back_to_original() {
        let codec = Arc::new(MockCodec::new());
        codec.fail_compress(true);
        codec.fail_thumbnail(true);
        let p = pipeline(codec.clone(), Arc::new(MockTransport::new()));

        let prepared = p.prepare(&task(20 * MB), NetworkQuality::High).await;

        assert!(!prepared.compressed);
        assert_eq!(prepared.file_path, PathBuf::from("/photos/big.jpg"));
        assert_eq!(prepared.thumbnail, None);
        assert_eq!(codec.compress_qualities(), vec![95]);
    }

    #[tokio::test]
    async fn test_run_sends_form_and_progress() {
        let codec = Arc::new(MockCodec::new());
        let transport = Arc::new(MockTransport::new());
        let p = pipeline(codec, transport.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let reply = p
            .run(&task(MB), NetworkQuality::High, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.success, Some(true));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].file_path, PathBuf::from("/photos/big.jpg"));
        assert!(requests[0]
            .form
            .contains(&("taskId".to_string(), "t1".to_string())));

        let mut seen = Vec::new();
        while let Some(p) = rx.recv().await {
            seen.push(p);
        }
        assert_eq!(seen, vec![50, 100]);
    }

    #[tokio::test]
    async fn test_run_cancelled_before_transfer() {
        let transport = Arc::new(MockTransport::new());
        let p = pipeline(Arc::new(MockCodec::new()), transport.clone());
        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = p.run(&task(MB), NetworkQuality::High, tx, token).await;

        assert_eq!(result, Err(UploadError::Cancelled));
        assert!(transport.requests().is_empty());
    }

    fn photo_task(dir: &std::path::Path) -> UploadTask {
        let path = dir.join("photo.png");
        RgbImage::from_fn(32, 24, |x, y| Rgb([x as u8, y as u8, 128]))
            .save(&path)
            .unwrap();
        UploadTask::new("t1".to_string(), FileInfo::new(path.clone(), MB, 0), 5, 0)
    }

    #[tokio::test]
    async fn test_compressed_file_removed_after_transfer() {
        let temp_dir = TempDir::new().unwrap();
        let out_dir = temp_dir.path().join("processed");
        let task = photo_task(temp_dir.path());
        let transport = Arc::new(MockTransport::new());
        let p = UploadPipeline::new(
            Arc::new(JpegCodec::new(&out_dir, 16)),
            transport.clone(),
            UploadConfig::default(),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        p.run(&task, NetworkQuality::Medium, tx, CancellationToken::new())
            .await
            .unwrap();

        let sent = transport.requests()[0].file_path.clone();
        assert!(sent.starts_with(&out_dir));
        assert!(!sent.exists());
        assert!(task.file_info.local_path.exists());

        // 上传失败同样清理
        transport.set_outcome(MockOutcome::Status(500));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = p
            .run(&task, NetworkQuality::Low, tx, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(UploadError::Server { status: 500, .. })));
        assert!(!transport.requests()[1].file_path.exists());
    }

    #[tokio::test]
    async fn test_original_kept_when_not_compressed() {
        let temp_dir = TempDir::new().unwrap();
        let task = photo_task(temp_dir.path());
        let transport = Arc::new(MockTransport::new());
        let p = UploadPipeline::new(
            Arc::new(JpegCodec::new(temp_dir.path().join("processed"), 16)),
            transport.clone(),
            UploadConfig::default(),
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        p.run(&task, NetworkQuality::High, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.requests()[0].file_path, task.file_info.local_path);
        assert!(task.file_info.local_path.exists());
    }

    #[test]
    fn test_interpret_response() {
        let ok = TransportResponse {
            status: 200,
            body: r#"{"success":true,"url":"https://cdn/p.jpg"}"#.to_string(),
        };
        assert_eq!(
            interpret_response(&ok).unwrap().url.as_deref(),
            Some("https://cdn/p.jpg")
        );

        let not_2xx = TransportResponse {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(
            interpret_response(&not_2xx),
            Err(UploadError::Server {
                status: 503,
                message: "unavailable".to_string()
            })
        );

        let malformed = TransportResponse {
            status: 200,
            body: "<html>".to_string(),
        };
        assert!(matches!(
            interpret_response(&malformed),
            Err(UploadError::Server { status: 200, .. })
        ));

        let rejected = TransportResponse {
            status: 200,
            body: r#"{"success":false,"message":"quota"}"#.to_string(),
        };
        assert_eq!(
            interpret_response(&rejected),
            Err(UploadError::Server {
                status: 200,
                message: "quota".to_string()
            })
        );
    }
}
