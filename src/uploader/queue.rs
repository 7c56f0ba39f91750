// 上传任务队列
//
// 负责任务的：
// - 创建与删除
// - 状态 / 进度更新
// - 按优先级 + FIFO 选择下一个任务
// - 整体持久化（单个键下的 JSON blob）
//
// 持久化失败不会打断触发它的操作：队列被标记为 dirty，
// 由后台刷写任务定期重试，直到写入成功

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::Clock;
use crate::error::{Result, UploadError};
use crate::events::{EventBus, ProgressThrottler, UploadEvent};
use crate::persistence::KvStore;
use crate::uploader::{FileInfo, UploadStatus, UploadTask, DEFAULT_PRIORITY};

/// 默认存储键
pub const DEFAULT_QUEUE_KEY: &str = "upload_task_queue";

/// 进度持久化粒度（百分比）
const PROGRESS_PERSIST_STEP: u8 = 10;

/// 上传任务队列
pub struct TaskQueue {
    /// 键值存储
    store: Arc<dyn KvStore>,
    /// 队列所在的存储键
    key: String,
    /// 时钟
    clock: Arc<dyn Clock>,
    /// 事件总线
    events: EventBus,
    /// 进度事件节流
    progress_throttler: ProgressThrottler,
    /// 所有任务，按创建顺序排列
    tasks: RwLock<Vec<UploadTask>>,
    /// 内存状态版本号，每次需要持久化的修改 +1
    generation: AtomicU64,
    /// 已写入存储的版本号（同时作为写入互斥锁）
    persisted_generation: Mutex<u64>,
    /// 内存与存储是否不一致
    dirty: AtomicBool,
}

impl TaskQueue {
    /// 从存储加载队列
    ///
    /// 键不存在或内容无法解析时从空队列开始；存储读取失败向上传播
    pub async fn init(
        store: Arc<dyn KvStore>,
        key: impl Into<String>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Result<Self> {
        let key = key.into();

        let tasks: Vec<UploadTask> = match store.get(&key).await? {
            None => {
                info!("未找到持久化的上传队列，使用空队列: key={}", key);
                Vec::new()
            }
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!("上传队列数据无法解析，使用空队列: key={}, 错误: {}", key, e);
                    Vec::new()
                }
            },
        };

        info!("上传队列加载完成: {} 个任务", tasks.len());

        Ok(Self {
            store,
            key,
            clock,
            events,
            progress_throttler: ProgressThrottler::default(),
            tasks: RwLock::new(tasks),
            generation: AtomicU64::new(0),
            persisted_generation: Mutex::new(0),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// 内存状态是否有尚未写入存储的修改
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// 生成任务ID：毫秒时间戳 + 随机后缀
    fn generate_task_id(&self, tasks: &[UploadTask]) -> String {
        loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let id = format!("{}-{}", self.now(), &suffix[..8]);
            if !tasks.iter().any(|t| t.task_id == id) {
                return id;
            }
        }
    }

    fn mark_changed(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
    }

    // ========================================================================
    // 创建 / 查询
    // ========================================================================

    /// 添加任务，返回任务ID
    ///
    /// 只校验结构：路径不能为空。优先级默认为 5，超出 1-10 会被截断
    pub async fn add_task(&self, file_info: FileInfo, priority: Option<u8>) -> Result<String> {
        if file_info.local_path.as_os_str().is_empty() {
            return Err(UploadError::Validation("本地文件路径为空".to_string()));
        }

        let task = {
            let mut tasks = self.tasks.write();
            let task_id = self.generate_task_id(&tasks);
            let task = UploadTask::new(
                task_id,
                file_info,
                priority.unwrap_or(DEFAULT_PRIORITY),
                self.now(),
            );
            tasks.push(task.clone());
            task
        };
        self.mark_changed();

        info!(
            "创建上传任务: id={}, path={:?}, size={}, priority={}",
            task.task_id, task.file_info.local_path, task.file_info.size_bytes, task.priority
        );

        self.persist_task_queue().await;

        self.events.publish(UploadEvent::Created {
            task_id: task.task_id.clone(),
            local_path: task.file_info.local_path.to_string_lossy().to_string(),
            size_bytes: task.file_info.size_bytes,
            priority: task.priority,
        });

        Ok(task.task_id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        self.tasks
            .read()
            .iter()
            .find(|t| t.task_id == task_id)
            .cloned()
    }

    pub fn get_all_tasks(&self) -> Vec<UploadTask> {
        self.tasks.read().clone()
    }

    /// 所有未结束（非 completed / failed）的任务
    pub fn get_pending_tasks(&self) -> Vec<UploadTask> {
        self.tasks
            .read()
            .iter()
            .filter(|t| !t.upload_status.is_finished())
            .cloned()
            .collect()
    }

    /// 指定状态的任务
    pub fn tasks_with_status(&self, status: UploadStatus) -> Vec<UploadTask> {
        self.tasks
            .read()
            .iter()
            .filter(|t| t.upload_status == status)
            .cloned()
            .collect()
    }

    /// 下一个待上传任务：优先级降序，同优先级按创建时间升序
    pub fn get_next_pending_task(&self) -> Option<UploadTask> {
        let tasks = self.tasks.read();
        select_next_pending(&tasks).map(|idx| tasks[idx].clone())
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.read().iter().any(|t| t.is_pending())
    }

    /// 取出下一个待上传任务并标记为 uploading
    ///
    /// 选择和状态转换在同一把写锁内完成，多个 worker 不会拿到同一个任务
    pub async fn claim_next_pending_task(&self) -> Option<UploadTask> {
        let claimed = {
            let mut tasks = self.tasks.write();
            let idx = select_next_pending(&tasks)?;
            let now = self.now();
            let task = &mut tasks[idx];
            // pending -> uploading 总是合法
            task.transition(UploadStatus::Uploading, now).ok()?;
            task.clone()
        };
        self.mark_changed();

        debug!(
            "调度任务: id={}, priority={}",
            claimed.task_id, claimed.priority
        );

        self.persist_task_queue().await;
        self.events.publish(UploadEvent::StatusChanged {
            task_id: claimed.task_id.clone(),
            old_status: UploadStatus::Pending,
            new_status: UploadStatus::Uploading,
        });

        Some(claimed)
    }

    // ========================================================================
    // 状态 / 进度更新
    // ========================================================================

    /// 更新任务状态，状态变化时立即持久化
    ///
    /// 返回旧状态
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: UploadStatus,
    ) -> Result<UploadStatus> {
        self.update_task_status_with(task_id, status, |_| {}).await
    }

    /// 标记任务失败并记录原因
    pub async fn fail_task(&self, task_id: &str, error: &UploadError) -> Result<UploadStatus> {
        let message = error.to_string();
        let non_retriable = !error.is_retriable();
        self.update_task_status_with(task_id, UploadStatus::Failed, |task| {
            task.error = Some(message);
            task.non_retriable = non_retriable;
        })
        .await
    }

    /// 认领后未开始传输的任务放回队列：uploading -> pending
    ///
    /// 任务已被暂停、取消或不在 uploading 状态时返回 `Ok(false)`
    pub async fn release_claimed_task(&self, task_id: &str) -> Result<bool> {
        {
            let mut tasks = self.tasks.write();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
            if task.upload_status != UploadStatus::Uploading {
                return Ok(false);
            }
            task.transition(UploadStatus::Pending, self.now())?;
        }
        self.mark_changed();
        debug!("任务放回队列: {}", task_id);

        self.persist_task_queue().await;
        self.events.publish(UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: UploadStatus::Uploading,
            new_status: UploadStatus::Pending,
        });
        Ok(true)
    }

    /// 重试扫描专用：failed -> pending，retry_count + 1
    ///
    /// 任务已不在 failed 状态（被删除、被手动重试）时返回 `Ok(false)`
    pub async fn requeue_failed_task(&self, task_id: &str) -> Result<bool> {
        let retry_count = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
            if task.upload_status != UploadStatus::Failed {
                return Ok(false);
            }
            task.transition(UploadStatus::Pending, self.now())?;
            task.retry_count += 1;
            task.retry_count
        };
        self.mark_changed();

        info!("失败任务重新排队: id={}, retry_count={}", task_id, retry_count);

        self.persist_task_queue().await;
        self.events.publish(UploadEvent::StatusChanged {
            task_id: task_id.to_string(),
            old_status: UploadStatus::Failed,
            new_status: UploadStatus::Pending,
        });
        Ok(true)
    }

    async fn update_task_status_with<F>(
        &self,
        task_id: &str,
        status: UploadStatus,
        apply: F,
    ) -> Result<UploadStatus>
    where
        F: FnOnce(&mut UploadTask),
    {
        let (old_status, changed) = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
            let old_status = task.upload_status;
            let changed = task.transition(status, self.now())?;
            if changed {
                apply(task);
            }
            (old_status, changed)
        };

        if changed {
            self.mark_changed();
            debug!("任务状态变更: id={}, {} -> {}", task_id, old_status, status);

            self.persist_task_queue().await;
            self.events.publish(UploadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status,
                new_status: status,
            });
            if status.is_finished() {
                self.progress_throttler.forget(task_id);
            }
        }

        Ok(old_status)
    }

    /// 批量转换状态，只持久化一次
    ///
    /// 不满足状态机的任务会被跳过，返回实际转换的任务ID
    pub async fn update_many_status(
        &self,
        task_ids: &[String],
        status: UploadStatus,
    ) -> Vec<String> {
        let changed: Vec<(String, UploadStatus)> = {
            let mut tasks = self.tasks.write();
            let now = self.now();
            tasks
                .iter_mut()
                .filter(|t| task_ids.contains(&t.task_id))
                .filter_map(|t| {
                    let old = t.upload_status;
                    match t.transition(status, now) {
                        Ok(true) => Some((t.task_id.clone(), old)),
                        Ok(false) => None,
                        Err(e) => {
                            warn!("批量状态转换跳过任务 {}: {}", t.task_id, e);
                            None
                        }
                    }
                })
                .collect()
        };

        if !changed.is_empty() {
            self.mark_changed();
            self.persist_task_queue().await;
            for (task_id, old_status) in &changed {
                self.events.publish(UploadEvent::StatusChanged {
                    task_id: task_id.clone(),
                    old_status: *old_status,
                    new_status: status,
                });
            }
        }

        changed.into_iter().map(|(id, _)| id).collect()
    }

    /// 更新进度
    ///
    /// 进度只增不减；只有在 10 的整数倍或 100 时才写存储，
    /// 崩溃恢复后的进度误差最多 9%
    pub async fn update_task_progress(&self, task_id: &str, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        let changed = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .iter_mut()
                .find(|t| t.task_id == task_id)
                .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
            task.apply_progress(progress, self.now())
        };

        if !changed {
            return Ok(());
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        if progress % PROGRESS_PERSIST_STEP == 0 || progress == 100 {
            self.dirty.store(true, Ordering::SeqCst);
            self.persist_task_queue().await;
        }

        if self.progress_throttler.should_emit(task_id, progress) {
            self.events.publish(UploadEvent::Progress {
                task_id: task_id.to_string(),
                progress,
            });
        }
        Ok(())
    }

    // ========================================================================
    // 删除
    // ========================================================================

    /// 删除单个任务
    pub async fn remove_task(&self, task_id: &str) -> Result<UploadTask> {
        let removed = {
            let mut tasks = self.tasks.write();
            let idx = tasks
                .iter()
                .position(|t| t.task_id == task_id)
                .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
            tasks.remove(idx)
        };
        self.mark_changed();

        info!("删除上传任务: {}", task_id);

        self.persist_task_queue().await;
        self.progress_throttler.forget(task_id);
        self.events.publish(UploadEvent::Deleted {
            task_id: task_id.to_string(),
        });
        Ok(removed)
    }

    /// 批量删除，只持久化一次；不存在的ID被忽略
    pub async fn delete_tasks(&self, task_ids: &[String]) -> usize {
        let removed = self.remove_where(|t| task_ids.contains(&t.task_id));
        if !removed.is_empty() {
            info!("批量删除上传任务: {} 个", removed.len());
            self.after_removal(&removed).await;
        }
        removed.len()
    }

    /// 清理已完成任务，返回清理数量
    pub async fn clean_completed_tasks(&self) -> usize {
        let removed = self.remove_where(|t| t.upload_status == UploadStatus::Completed);
        if !removed.is_empty() {
            info!("已清理 {} 个已完成的上传任务", removed.len());
            self.after_removal(&removed).await;
        }
        removed.len()
    }

    fn remove_where<P>(&self, predicate: P) -> Vec<String>
    where
        P: Fn(&UploadTask) -> bool,
    {
        let mut tasks = self.tasks.write();
        let mut removed = Vec::new();
        tasks.retain(|t| {
            if predicate(t) {
                removed.push(t.task_id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    async fn after_removal(&self, removed: &[String]) {
        self.mark_changed();
        self.persist_task_queue().await;
        for task_id in removed {
            self.progress_throttler.forget(task_id);
            self.events.publish(UploadEvent::Deleted {
                task_id: task_id.clone(),
            });
        }
    }

    // ========================================================================
    // 持久化
    // ========================================================================

    /// 将整个队列写入存储
    ///
    /// 失败只记录日志并标记 dirty，由后台刷写任务重试
    pub async fn persist_task_queue(&self) {
        if let Err(e) = self.flush().await {
            warn!("上传队列持久化失败，等待后台重试: {}", e);
        }
    }

    /// 将整个队列写入存储，失败时返回错误
    ///
    /// 快照在持有写入锁之后获取，先获得锁的写入一定不会覆盖更新的快照
    pub async fn flush(&self) -> Result<()> {
        let mut persisted = self.persisted_generation.lock().await;

        let generation = self.generation.load(Ordering::SeqCst);
        if generation == *persisted && !self.is_dirty() {
            return Ok(());
        }

        let bytes = {
            let tasks = self.tasks.read();
            serde_json::to_vec(&*tasks)?
        };

        match self.store.set(&self.key, &bytes).await {
            Ok(()) => {
                *persisted = generation;
                // 写入期间又有新修改时保持 dirty
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.dirty.store(false, Ordering::SeqCst);
                }
                debug!("上传队列已持久化: {} 字节", bytes.len());
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// 启动后台刷写任务：dirty 时按固定间隔重试写入
    pub fn start_flush_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            info!("上传队列后台刷写任务已启动，间隔 {:?}", interval);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel_token.cancelled() => {
                        debug!("上传队列后台刷写任务退出");
                        break;
                    }
                }

                if !queue.is_dirty() {
                    continue;
                }

                match queue.flush().await {
                    Ok(()) => info!("上传队列补写成功"),
                    Err(e) => warn!("上传队列补写失败: {}", e),
                }
            }

            // 退出前最后尝试一次
            if queue.is_dirty() {
                if let Err(e) = queue.flush().await {
                    warn!("退出前上传队列写入失败: {}", e);
                }
            }
        })
    }
}

/// 选择下一个 pending 任务的下标
///
/// 优先级降序；同优先级 createdAt 升序；完全相同时保持插入顺序
fn select_next_pending(tasks: &[UploadTask]) -> Option<usize> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_pending())
        .min_by(|(ia, a), (ib, b)| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(ia.cmp(ib))
        })
        .map(|(idx, _)| idx)
}
