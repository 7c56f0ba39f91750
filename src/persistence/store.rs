//! 键值存储
//!
//! 上传队列整体序列化为一个 blob，保存在单个键下
//!
//! ## 文件结构
//!
//! ```text
//! data/
//! └── {key}.json    # 值（原始字节，通常为 JSON）
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::{Result, UploadError};

/// 键值存储接口
///
/// `get` 返回 `Ok(None)` 表示键不存在，这是首次运行的正常状态，不算错误
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

// ============================================================================
// 文件存储
// ============================================================================

/// 基于本地文件的存储，每个键一个文件
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// 获取键对应的文件路径：`{dir}/{key}.json`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("存储键不存在: {}", key);
                Ok(None)
            }
            Err(e) => Err(UploadError::Persistence(format!(
                "读取 {:?} 失败: {}",
                path, e
            ))),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(key);
        // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
        let temp_path = path.with_extension("json.tmp");

        tokio::fs::write(&temp_path, value).await.map_err(|e| {
            UploadError::Persistence(format!("写入 {:?} 失败: {}", temp_path, e))
        })?;
        tokio::fs::rename(&temp_path, &path).await.map_err(|e| {
            UploadError::Persistence(format!("重命名 {:?} 失败: {}", temp_path, e))
        })?;

        debug!("已保存存储键: {:?} ({} 字节)", path, value.len());
        Ok(())
    }
}

// ============================================================================
// 内存存储
// ============================================================================

/// 内存存储，可模拟写入失败
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Vec<u8>>,
    fail_writes: AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让后续写入全部失败（或恢复正常）
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// 直接写入原始字节，不经过失败开关
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.entries.insert(key.to_string(), value);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(UploadError::Persistence("模拟写入失败".to_string()));
        }
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
