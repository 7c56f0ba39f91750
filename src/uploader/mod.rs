// 上传模块
//
// - task: 任务数据结构与状态机
// - queue: 持久化的优先级任务队列
// - network: 网络类型 -> 压缩质量 / 并发上限
// - retry: 失败重试的指数退避
// - pipeline: 压缩 -> 缩略图 -> 上传
// - orchestrator: 固定上限的 worker 池
// - recovery: 启动时处理中断的任务

pub mod network;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use network::{
    ConnectivitySource, ConnectivityState, ManualConnectivity, NetworkPolicy, NetworkQuality,
    NetworkStrategyAdapter, NetworkType, PolicyListener,
};
pub use orchestrator::{OrchestratorStats, ScheduledRetry, UploadOrchestrator};
pub use pipeline::{PreparedUpload, ServerReply, UploadPipeline};
pub use queue::{TaskQueue, DEFAULT_QUEUE_KEY};
pub use recovery::{
    check_interrupted_tasks, AlwaysPause, AlwaysResume, RecoveryDecision, RecoveryPrompt,
    RecoveryReport,
};
pub use retry::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_JITTER_MS, DEFAULT_BACKOFF_MAX_MS,
    DEFAULT_MAX_RETRIES,
};
pub use task::{
    FileInfo, UploadStatus, UploadTask, DEFAULT_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
};
