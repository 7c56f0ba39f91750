//! 持久化模块
//!
//! 上传队列以单个 blob 的形式保存在键值存储中：
//! - `KvStore`：get/set 接口，由外部实现注入
//! - `FileKvStore`：本地文件实现，临时文件 + 原子重命名
//! - `MemoryKvStore`：内存实现，用于测试和嵌入
//!
//! ## 使用示例
//!
//! ```ignore
//! use photo_uploader::persistence::{FileKvStore, KvStore};
//!
//! let store = FileKvStore::new("data");
//! store.set("upload_task_queue", b"[]").await?;
//! let blob = store.get("upload_task_queue").await?;
//! ```

pub mod store;

pub use store::{FileKvStore, KvStore, MemoryKvStore};
