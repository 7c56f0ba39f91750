use anyhow::Context;
use chrono::{DateTime, Utc};
use photo_uploader::{
    check_interrupted_tasks,
    config::LogConfig,
    logging,
    uploader::{AlwaysResume, UploadStatus},
    AppConfig, EventBus, FileInfo, FileKvStore, HttpTransport, JpegCodec, ManualConnectivity,
    NetworkStrategyAdapter, SystemClock, TaskQueue, UploadEvent, UploadOrchestrator,
    UploadPipeline,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONFIG_PATH: &str = "config/app.toml";

/// 等待重试触发的额外余量
const RETRY_WAIT_MARGIN: Duration = Duration::from_millis(100);

/// 加载日志配置
///
/// 日志初始化之前执行，失败时静默使用默认配置
async fn load_log_config() -> LogConfig {
    let Ok(content) = tokio::fs::read_to_string(CONFIG_PATH).await else {
        return LogConfig::default();
    };
    toml::from_str::<toml::Value>(&content)
        .ok()
        .and_then(|config| config.get("log").cloned())
        .and_then(|table| table.try_into::<LogConfig>().ok())
        .unwrap_or_default()
}

async fn file_info(path: &str) -> anyhow::Result<FileInfo> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("无法读取文件 {}", path))?;
    if !metadata.is_file() {
        anyhow::bail!("不是普通文件: {}", path);
    }
    let created_at = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
        .unwrap_or_else(|_| Utc::now().timestamp_millis());
    Ok(FileInfo::new(path, metadata.len(), created_at))
}

/// 控制台版本的 UI：把事件写进日志
async fn log_events(mut rx: broadcast::Receiver<UploadEvent>) {
    loop {
        match rx.recv().await {
            Ok(UploadEvent::Progress { task_id, progress }) => {
                debug!("[{}] {}%", task_id, progress)
            }
            Ok(UploadEvent::Completed { task_id }) => info!("[{}] 上传完成", task_id),
            Ok(UploadEvent::Failed { task_id, error }) => warn!("[{}] 上传失败: {}", task_id, error),
            Ok(event) => match event.task_id() {
                Some(task_id) => debug!("[{}] {:?}", task_id, event),
                None => debug!("事件: {:?}", event),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("事件处理过慢，丢弃 {} 条", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = load_log_config().await;
    let _log_guard = logging::init_logging(&log_config);

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let shutdown = CancellationToken::new();

    let store = Arc::new(FileKvStore::new(&config.storage.data_dir));
    let queue = Arc::new(
        TaskQueue::init(
            store,
            config.storage.queue_key.clone(),
            Arc::new(SystemClock),
            EventBus::default(),
        )
        .await
        .context("加载上传队列失败")?,
    );
    let flush_monitor = queue.start_flush_monitor(
        Duration::from_millis(config.storage.flush_interval_ms),
        shutdown.clone(),
    );
    tokio::spawn(log_events(queue.events().subscribe()));

    let connectivity = Arc::new(ManualConnectivity::new(config.network.network_type));
    let network = Arc::new(NetworkStrategyAdapter::new(connectivity));
    let transport = Arc::new(
        HttpTransport::new(config.upload.request_timeout()).context("创建 HTTP 客户端失败")?,
    );
    let codec = Arc::new(JpegCodec::new(
        &config.codec.output_dir,
        config.codec.thumbnail_max_dimension,
    ));
    let pipeline = UploadPipeline::new(codec, transport, config.upload.clone());
    let orchestrator = UploadOrchestrator::new(
        queue.clone(),
        network,
        pipeline,
        config.upload.backoff_policy(),
    );

    // 调度开始前处理上次中断的任务
    let report = check_interrupted_tasks(&queue, &AlwaysResume).await;
    if !report.task_ids.is_empty() {
        info!("已恢复 {} 个中断的任务", report.task_ids.len());
    }

    orchestrator.watch_network();

    for path in std::env::args().skip(1) {
        match file_info(&path).await {
            Ok(info) => {
                orchestrator.enqueue(info, None).await?;
            }
            Err(e) => warn!("跳过 {}: {:#}", path, e),
        }
    }

    orchestrator.start_upload_queue();

    let run = async {
        loop {
            orchestrator.wait_idle().await;
            let scheduled = orchestrator.retry_failed_tasks();
            let Some(longest) = scheduled.iter().map(|r| r.delay).max() else {
                break;
            };
            tokio::time::sleep(longest + RETRY_WAIT_MARGIN).await;
        }
    };

    tokio::select! {
        _ = run => info!("没有可处理的任务"),
        _ = tokio::signal::ctrl_c() => info!("收到 Ctrl+C，开始关闭..."),
    }

    orchestrator.shutdown();
    shutdown.cancel();
    if let Err(e) = flush_monitor.await {
        warn!("后台刷写任务异常退出: {}", e);
    }
    queue.flush().await.context("保存上传队列失败")?;

    let tasks = queue.get_all_tasks();
    let count = |status: UploadStatus| tasks.iter().filter(|t| t.upload_status == status).count();
    info!(
        "退出: 完成 {}, 失败 {}, 暂停 {}, 未开始 {}",
        count(UploadStatus::Completed),
        count(UploadStatus::Failed),
        count(UploadStatus::Paused),
        count(UploadStatus::Pending)
    );

    Ok(())
}
