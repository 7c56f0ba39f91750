// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::codec::DEFAULT_THUMBNAIL_MAX_DIMENSION;
use crate::transport::DEFAULT_REQUEST_TIMEOUT_SECS;
use crate::uploader::{
    BackoffPolicy, NetworkType, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_JITTER_MS,
    DEFAULT_BACKOFF_MAX_MS, DEFAULT_MAX_RETRIES, DEFAULT_QUEUE_KEY,
};

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 图片处理配置
    #[serde(default)]
    pub codec: CodecConfig,
    /// 网络配置
    #[serde(default)]
    pub network: NetworkConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 20MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    20 * 1024 * 1024 // 20MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// multipart 中文件字段名
    #[serde(default = "default_form_field")]
    pub form_field: String,
    /// 自动重试上限
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 最大退避延迟（毫秒）
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// 随机抖动上限（毫秒）
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,
    /// 超过此大小的文件总是压缩（字节，默认 10MB）
    #[serde(default = "default_compress_threshold_bytes")]
    pub compress_threshold_bytes: u64,
    /// 缩略图质量
    #[serde(default = "default_thumbnail_quality")]
    pub thumbnail_quality: u8,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:8080/upload".to_string()
}

fn default_form_field() -> String {
    "file".to_string()
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_backoff_jitter_ms() -> u64 {
    DEFAULT_BACKOFF_JITTER_MS
}

fn default_compress_threshold_bytes() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_thumbnail_quality() -> u8 {
    30
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            form_field: default_form_field(),
            max_retry_count: default_max_retry_count(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            compress_threshold_bytes: default_compress_threshold_bytes(),
            thumbnail_quality: default_thumbnail_quality(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl UploadConfig {
    /// 转换为重试退避策略
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: self.backoff_base_ms,
            max_ms: self.backoff_max_ms,
            jitter_ms: self.backoff_jitter_ms,
            max_retries: self.max_retry_count,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 数据目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// 上传队列存储键
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
    /// 写入失败后的重试间隔（毫秒）
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_queue_key() -> String {
    DEFAULT_QUEUE_KEY.to_string()
}

fn default_flush_interval_ms() -> u64 {
    2000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue_key: default_queue_key(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

/// 图片处理配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// 压缩图和缩略图输出目录
    #[serde(default = "default_codec_output_dir")]
    pub output_dir: PathBuf,
    /// 缩略图最长边（像素）
    #[serde(default = "default_thumbnail_max_dimension")]
    pub thumbnail_max_dimension: u32,
}

fn default_codec_output_dir() -> PathBuf {
    PathBuf::from("data/processed")
}

fn default_thumbnail_max_dimension() -> u32 {
    DEFAULT_THUMBNAIL_MAX_DIMENSION
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            output_dir: default_codec_output_dir(),
            thumbnail_max_dimension: default_thumbnail_max_dimension(),
        }
    }
}

/// 网络配置
///
/// 没有平台连接通知时使用的固定网络类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_network_type")]
    pub network_type: NetworkType,
}

fn default_network_type() -> NetworkType {
    NetworkType::Wifi
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network_type: default_network_type(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.upload.server_url.trim().is_empty() {
            anyhow::bail!("upload.server_url 不能为空");
        }
        if self.upload.backoff_max_ms < self.upload.backoff_base_ms {
            anyhow::bail!(
                "upload.backoff_max_ms ({}) 不能小于 upload.backoff_base_ms ({})",
                self.upload.backoff_max_ms,
                self.upload.backoff_base_ms
            );
        }
        if self.storage.queue_key.trim().is_empty() {
            anyhow::bail!("storage.queue_key 不能为空");
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {:#}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_retry_count, 5);
        assert_eq!(config.upload.compress_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.upload.thumbnail_quality, 30);
        assert_eq!(config.storage.queue_key, "upload_task_queue");
        assert_eq!(config.network.network_type, NetworkType::Wifi);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let config = UploadConfig {
            backoff_base_ms: 500,
            max_retry_count: 2,
            ..UploadConfig::default()
        };
        let policy = config.backoff_policy();
        assert_eq!(policy.base_ms, 500);
        assert_eq!(policy.max_ms, 30_000);
        assert_eq!(policy.max_retries, 2);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            server_url = "https://photos.example.com/api/upload"

            [network]
            network_type = "4g"
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.server_url, "https://photos.example.com/api/upload");
        assert_eq!(config.upload.backoff_base_ms, 1000);
        assert_eq!(config.network.network_type, NetworkType::Cellular4g);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conf").join("app.toml");

        let mut config = AppConfig::default();
        config.upload.server_url = "http://10.0.0.2/upload".to_string();
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");
        tokio::fs::write(
            &path,
            "[upload]\nbackoff_base_ms = 5000\nbackoff_max_ms = 1000\n",
        )
        .await
        .unwrap();

        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.toml");

        let config = AppConfig::load_or_default(&path).await;

        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }
}
