// Photo Uploader Library
// 照片上传任务队列与调度核心库

// 图片压缩 / 缩略图
pub mod codec;

// 时钟等公共组件
pub mod common;

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// UI 事件
pub mod events;

// 日志
pub mod logging;

// 键值存储
pub mod persistence;

// HTTP 传输
pub mod transport;

// 上传队列与调度
pub mod uploader;

// 导出常用类型
pub use codec::{ImageCodec, JpegCodec};
pub use common::{Clock, SystemClock};
pub use config::AppConfig;
pub use error::{Result, UploadError};
pub use events::{EventBus, UploadEvent};
pub use persistence::{FileKvStore, KvStore, MemoryKvStore};
pub use transport::{HttpTransport, Transport};
pub use uploader::{
    check_interrupted_tasks, FileInfo, ManualConnectivity, NetworkStrategyAdapter, NetworkType,
    TaskQueue, UploadOrchestrator, UploadPipeline, UploadStatus, UploadTask,
};
