// 上传调度器
//
// 固定上限的 worker 池：每个 worker 循环 "认领 -> 上传 -> 认领"，
// 上限由当前网络策略决定，随网络变化动态调整
//
// 取消与完成的竞争：任务登记在 `active` 表中，谁先把它从表里移除，
// 谁负责最终的状态转换；另一方的结果直接丢弃。
// 中止方同时接管 worker 名额并立即释放，被中止的 worker 传输结束后直接退出

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, UploadError};
use crate::events::UploadEvent;
use crate::uploader::pipeline::{ServerReply, UploadPipeline};
use crate::uploader::{
    BackoffPolicy, FileInfo, NetworkPolicy, NetworkStrategyAdapter, PolicyListener, TaskQueue,
    UploadStatus, UploadTask,
};

/// 正在传输的任务
#[derive(Debug)]
struct ActiveUpload {
    cancel_token: CancellationToken,
    /// 启动顺序，缩减并发时先中止最晚启动的
    seq: u64,
}

/// 暂停原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseCause {
    /// 用户操作，只能手动恢复
    User,
    /// 断网，恢复连接后自动恢复
    Network,
    /// 并发上限下降，立即重新排队
    Preempted,
}

/// 调度器状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    pub active_uploads: usize,
    pub concurrency: usize,
    pub running: bool,
    pub pending: usize,
}

/// 已安排的自动重试
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRetry {
    pub task_id: String,
    /// 安排时的重试次数，重试真正触发时 +1
    pub retry_count: u32,
    pub delay: Duration,
}

/// 上传调度器
pub struct UploadOrchestrator {
    me: Weak<UploadOrchestrator>,
    queue: Arc<TaskQueue>,
    network: Arc<NetworkStrategyAdapter>,
    pipeline: UploadPipeline,
    backoff: BackoffPolicy,
    rng: Mutex<StdRng>,
    /// task_id -> 正在传输的任务
    active: DashMap<String, ActiveUpload>,
    /// 存活的 worker 数
    workers: AtomicUsize,
    next_seq: AtomicU64,
    running: watch::Sender<bool>,
    /// 全部暂停后不再自动启动，直到显式启动或全部恢复
    held: AtomicBool,
    /// 因断网暂停的任务
    network_paused: DashSet<String>,
    /// 已安排但尚未触发的重试
    retry_scheduled: DashSet<String>,
    cancel_token: CancellationToken,
}

impl UploadOrchestrator {
    pub fn new(
        queue: Arc<TaskQueue>,
        network: Arc<NetworkStrategyAdapter>,
        pipeline: UploadPipeline,
        backoff: BackoffPolicy,
    ) -> Arc<Self> {
        Self::with_rng(queue, network, pipeline, backoff, StdRng::from_entropy())
    }

    /// 指定随机数生成器（用于确定性的退避抖动）
    pub fn with_rng(
        queue: Arc<TaskQueue>,
        network: Arc<NetworkStrategyAdapter>,
        pipeline: UploadPipeline,
        backoff: BackoffPolicy,
        rng: StdRng,
    ) -> Arc<Self> {
        let (running, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            network,
            pipeline,
            backoff,
            rng: Mutex::new(rng),
            active: DashMap::new(),
            workers: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            running,
            held: AtomicBool::new(false),
            network_paused: DashSet::new(),
            retry_scheduled: DashSet::new(),
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// 订阅网络策略变化
    pub fn watch_network(&self) -> Option<JoinHandle<()>> {
        let this = self.me.upgrade()?;
        self.network.start(this, self.cancel_token.child_token())
    }

    fn publish(&self, event: UploadEvent) {
        self.queue.events().publish(event);
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub fn active_uploads(&self) -> usize {
        self.active.len()
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            active_uploads: self.active_uploads(),
            concurrency: self.network.current_policy().concurrency,
            running: self.is_running(),
            pending: self.queue.tasks_with_status(UploadStatus::Pending).len(),
        }
    }

    /// 等待队列空闲（没有正在传输的任务，也没有待上传任务）
    pub async fn wait_idle(&self) {
        let mut rx = self.running.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ========================================================================
    // 调度
    // ========================================================================

    /// 添加任务；队列运行中时立即尝试调度
    pub async fn enqueue(&self, file_info: FileInfo, priority: Option<u8>) -> Result<String> {
        let task_id = self.queue.add_task(file_info, priority).await?;
        if self.is_running() {
            self.fill_slots();
        }
        Ok(task_id)
    }

    /// 启动上传队列，按当前并发上限填满 worker
    pub fn start_upload_queue(&self) {
        if self.cancel_token.is_cancelled() {
            warn!("调度器已关闭，忽略启动请求");
            return;
        }
        self.held.store(false, Ordering::SeqCst);

        if !self.running.send_replace(true) {
            info!(
                "启动上传队列: 并发上限 {}",
                self.network.current_policy().concurrency
            );
        }
        self.fill_slots();
        self.maybe_finish();
    }

    /// 重试、网络恢复等自动触发的启动；全部暂停期间不生效
    fn kick(&self) {
        if self.held.load(Ordering::SeqCst) {
            debug!("上传已全部暂停，忽略自动启动");
            return;
        }
        self.start_upload_queue();
    }

    fn fill_slots(&self) {
        if !self.is_running() || self.cancel_token.is_cancelled() {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };

        let bound = self.network.current_policy().concurrency;
        let mut budget = self.queue.tasks_with_status(UploadStatus::Pending).len();

        while budget > 0 {
            let current = self.workers.load(Ordering::SeqCst);
            if current >= bound {
                break;
            }
            if self
                .workers
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                budget -= 1;
                let worker = Arc::clone(&this);
                tokio::spawn(async move { worker.worker_loop().await });
            }
        }
    }

    /// worker 数超过上限时退出一个
    fn try_retire(&self) -> bool {
        let bound = self.network.current_policy().concurrency;
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w > bound).then(|| w - 1)
            })
            .is_ok()
    }

    fn maybe_finish(&self) {
        if self.workers.load(Ordering::SeqCst) == 0
            && self.active.is_empty()
            && !self.queue.has_pending()
            && self.running.send_replace(false)
        {
            info!("上传队列已空闲");
        }
    }

    async fn worker_loop(self: Arc<Self>) {
        loop {
            if self.cancel_token.is_cancelled() || !self.is_running() {
                break;
            }
            if self.try_retire() {
                debug!("worker 超出并发上限，退出");
                self.after_worker_exit();
                return;
            }
            let Some(task) = self.queue.claim_next_pending_task().await else {
                break;
            };
            if !self.process_task(task).await {
                // 名额已由中止方释放
                self.after_worker_exit();
                return;
            }
        }

        self.workers.fetch_sub(1, Ordering::SeqCst);
        self.after_worker_exit();
    }

    fn after_worker_exit(&self) {
        // 退出期间可能有新任务加入
        self.fill_slots();
        self.maybe_finish();
    }

    /// 返回 worker 是否仍持有名额
    async fn process_task(&self, task: UploadTask) -> bool {
        let task_id = task.task_id.clone();
        let token = self.cancel_token.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.active.insert(
            task_id.clone(),
            ActiveUpload {
                cancel_token: token.clone(),
                seq,
            },
        );

        // 认领之后、登记之前可能已经断网或被暂停
        let policy = self.network.current_policy();
        let quality = match policy.quality {
            Some(quality) if policy.is_connected() => quality,
            _ => {
                if let Err(e) = self.abort_upload(&task_id, PauseCause::Network).await {
                    warn!("断网暂停任务 {} 失败: {}", task_id, e);
                }
                return false;
            }
        };
        if !self.is_running() {
            // 认领期间队列被全部暂停或关闭
            let owned = self.active.remove_if(&task_id, |_, a| a.seq == seq).is_some();
            if owned {
                if let Err(e) = self.queue.release_claimed_task(&task_id).await {
                    warn!("任务 {} 放回队列失败: {}", task_id, e);
                }
            }
            return owned;
        }
        match self.queue.get_task(&task_id) {
            Some(t) if t.upload_status == UploadStatus::Uploading => {}
            _ => {
                debug!("任务 {} 已不在上传状态，跳过", task_id);
                return self.active.remove_if(&task_id, |_, a| a.seq == seq).is_some();
            }
        }
        // 认领期间并发上限可能已下降
        if self.active.len() > policy.concurrency {
            self.preempt_excess(policy.concurrency).await;
            if !self.active.get(&task_id).is_some_and(|a| a.seq == seq) {
                return false;
            }
        }

        info!(
            "开始上传: id={}, path={:?}, network={}",
            task_id, task.file_info.local_path, policy.network_type
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let consume_progress = async {
            while let Some(progress) = progress_rx.recv().await {
                if token.is_cancelled() {
                    continue;
                }
                if let Err(e) = self.queue.update_task_progress(&task_id, progress).await {
                    debug!("更新进度失败: id={}, {}", task_id, e);
                }
            }
        };
        let upload = self
            .pipeline
            .run(&task, quality, progress_tx, token.clone());

        let (result, ()) = tokio::join!(upload, consume_progress);
        self.finish_task(&task_id, seq, result).await
    }

    async fn finish_task(&self, task_id: &str, seq: u64, result: Result<ServerReply>) -> bool {
        if self.active.remove_if(task_id, |_, a| a.seq == seq).is_none() {
            debug!("任务 {} 已被中止，丢弃上传结果", task_id);
            return false;
        }

        match result {
            Ok(_) => match self
                .queue
                .update_task_status(task_id, UploadStatus::Completed)
                .await
            {
                Ok(_) => {
                    info!("上传完成: {}", task_id);
                    self.publish(UploadEvent::Completed {
                        task_id: task_id.to_string(),
                    });
                }
                Err(e) => warn!("标记任务 {} 完成失败: {}", task_id, e),
            },
            Err(e) if e.is_cancelled() => {
                // 只有调度器关闭会走到这里，保留 uploading 交给下次启动的恢复流程
                info!("任务 {} 随调度器关闭中断", task_id);
            }
            Err(e) => {
                error!("上传失败: id={}, {}", task_id, e);
                match self.queue.fail_task(task_id, &e).await {
                    Ok(_) => self.publish(UploadEvent::Failed {
                        task_id: task_id.to_string(),
                        error: e.to_string(),
                    }),
                    Err(e) => warn!("标记任务 {} 失败状态出错: {}", task_id, e),
                }
            }
        }
        true
    }

    // ========================================================================
    // 暂停 / 恢复
    // ========================================================================

    /// 从 active 表取走任务：取消传输并释放它占用的 worker 名额
    fn take_active(&self, task_id: &str) -> bool {
        match self.active.remove(task_id) {
            Some((_, upload)) => {
                upload.cancel_token.cancel();
                self.workers.fetch_sub(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// 中止正在传输的任务并转为 paused
    ///
    /// 任务不在传输中时返回 `Ok(false)`
    async fn abort_upload(&self, task_id: &str, cause: PauseCause) -> Result<bool> {
        if !self.take_active(task_id) {
            return Ok(false);
        }

        self.queue
            .update_task_status(task_id, UploadStatus::Paused)
            .await?;
        self.after_pause(task_id, cause).await?;
        Ok(true)
    }

    async fn after_pause(&self, task_id: &str, cause: PauseCause) -> Result<()> {
        match cause {
            PauseCause::User => {
                self.network_paused.remove(task_id);
                self.publish(UploadEvent::Paused {
                    task_id: task_id.to_string(),
                });
            }
            PauseCause::Network => {
                self.network_paused.insert(task_id.to_string());
                self.publish(UploadEvent::Paused {
                    task_id: task_id.to_string(),
                });
            }
            PauseCause::Preempted => {
                self.queue
                    .update_task_status(task_id, UploadStatus::Pending)
                    .await?;
                info!("并发上限下降，任务 {} 重新排队", task_id);
            }
        }
        Ok(())
    }

    /// 暂停 pending / uploading 的任务，返回是否发生了变化
    async fn pause_one(&self, task_id: &str, cause: PauseCause) -> Result<bool> {
        if self.abort_upload(task_id, cause).await? {
            return Ok(true);
        }

        let old = self
            .queue
            .update_task_status(task_id, UploadStatus::Paused)
            .await?;
        if old == UploadStatus::Paused {
            return Ok(false);
        }
        // 已认领但 worker 可能刚刚登记
        self.take_active(task_id);
        self.after_pause(task_id, cause).await?;
        Ok(true)
    }

    async fn pause_uploading(&self, cause: PauseCause) -> Vec<String> {
        let mut paused = Vec::new();
        for task in self.queue.tasks_with_status(UploadStatus::Uploading) {
            match self.pause_one(&task.task_id, cause).await {
                Ok(true) => paused.push(task.task_id),
                Ok(false) => {}
                Err(e) => warn!("暂停任务 {} 失败: {}", task.task_id, e),
            }
        }
        paused
    }

    /// 暂停单个任务
    ///
    /// 传输中的任务会被中止；已经暂停时什么也不做；已结束的任务返回错误
    pub async fn pause_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .queue
            .get_task(task_id)
            .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;

        match task.upload_status {
            UploadStatus::Completed | UploadStatus::Failed => {
                Err(UploadError::InvalidTransition {
                    from: task.upload_status,
                    to: UploadStatus::Paused,
                })
            }
            UploadStatus::Paused => {
                // 用户明确暂停的任务不随网络恢复
                self.network_paused.remove(task_id);
                Ok(())
            }
            UploadStatus::Pending | UploadStatus::Uploading => {
                if self.pause_one(task_id, PauseCause::User).await? {
                    info!("任务已暂停: {}", task_id);
                    self.fill_slots();
                }
                Ok(())
            }
        }
    }

    /// 恢复已暂停的任务（重新排队）
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .queue
            .get_task(task_id)
            .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;

        if task.upload_status != UploadStatus::Paused {
            return Err(UploadError::InvalidTransition {
                from: task.upload_status,
                to: UploadStatus::Pending,
            });
        }

        self.queue
            .update_task_status(task_id, UploadStatus::Pending)
            .await?;
        self.network_paused.remove(task_id);
        self.publish(UploadEvent::Resumed {
            task_id: task_id.to_string(),
        });
        info!("任务已恢复: {}", task_id);

        self.start_upload_queue();
        Ok(())
    }

    /// 暂停所有正在传输的任务，返回暂停数量
    ///
    /// 同时停止调度，未开始的任务保持 pending，直到 `resume_all_uploads`
    /// 或 `start_upload_queue`
    pub async fn pause_all_uploads(&self) -> usize {
        self.held.store(true, Ordering::SeqCst);
        self.running.send_replace(false);
        let paused = self.pause_uploading(PauseCause::User).await;
        info!("已暂停 {} 个上传任务", paused.len());
        paused.len()
    }

    /// 恢复所有已暂停的任务，返回恢复数量
    pub async fn resume_all_uploads(&self) -> usize {
        let ids: Vec<String> = self
            .queue
            .tasks_with_status(UploadStatus::Paused)
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        self.held.store(false, Ordering::SeqCst);
        let resumed = self.resume_many(&ids).await;
        info!("已恢复 {} 个上传任务", resumed);
        self.start_upload_queue();
        resumed
    }

    async fn resume_network_paused(&self) -> usize {
        let ids: Vec<String> = self
            .network_paused
            .iter()
            .map(|id| id.key().clone())
            .collect();
        self.resume_many(&ids).await
    }

    async fn resume_many(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let resumed = self
            .queue
            .update_many_status(ids, UploadStatus::Pending)
            .await;
        for task_id in ids {
            self.network_paused.remove(task_id);
        }
        for task_id in &resumed {
            self.publish(UploadEvent::Resumed {
                task_id: task_id.clone(),
            });
        }
        if !resumed.is_empty() {
            self.kick();
        }
        resumed.len()
    }

    /// 取消任务：中止传输并从队列中删除
    pub async fn cancel_task(&self, task_id: &str) -> Result<UploadTask> {
        self.take_active(task_id);
        self.network_paused.remove(task_id);
        let removed = self.queue.remove_task(task_id).await?;
        info!("任务已取消: {}", task_id);
        self.fill_slots();
        Ok(removed)
    }

    /// 按并发上限中止最晚启动的任务
    async fn preempt_excess(&self, bound: usize) {
        let mut running: Vec<(String, u64)> = self
            .active
            .iter()
            .map(|e| (e.key().clone(), e.value().seq))
            .collect();
        if running.len() <= bound {
            return;
        }
        running.sort_by(|a, b| b.1.cmp(&a.1));
        let excess = running.len() - bound;

        for (task_id, _) in running.into_iter().take(excess) {
            if let Err(e) = self.abort_upload(&task_id, PauseCause::Preempted).await {
                warn!("中止任务 {} 失败: {}", task_id, e);
            }
        }
    }

    // ========================================================================
    // 重试
    // ========================================================================

    /// 扫描失败任务并按退避延迟安排重试
    ///
    /// 达到重试上限的任务保持 failed；已安排过的任务不会重复安排
    pub fn retry_failed_tasks(&self) -> Vec<ScheduledRetry> {
        let failed = self.queue.tasks_with_status(UploadStatus::Failed);
        let candidates = self.backoff.select_candidates(&failed);

        let scheduled: Vec<ScheduledRetry> = {
            let mut rng = self.rng.lock();
            candidates
                .into_iter()
                .filter(|t| !self.retry_scheduled.contains(&t.task_id))
                .filter_map(|t| {
                    self.backoff
                        .delay(t.retry_count, &mut *rng)
                        .map(|delay| ScheduledRetry {
                            task_id: t.task_id.clone(),
                            retry_count: t.retry_count,
                            delay,
                        })
                })
                .collect()
        };

        let exhausted = failed
            .iter()
            .filter(|t| !self.backoff.allows(t.retry_count))
            .count();
        if exhausted > 0 {
            debug!("{} 个失败任务已达到重试上限", exhausted);
        }

        let Some(this) = self.me.upgrade() else {
            return Vec::new();
        };

        for retry in &scheduled {
            self.retry_scheduled.insert(retry.task_id.clone());
            info!(
                "安排重试: id={}, retry_count={}, 延迟 {:?}",
                retry.task_id, retry.retry_count, retry.delay
            );
            self.publish(UploadEvent::RetryScheduled {
                task_id: retry.task_id.clone(),
                retry_count: retry.retry_count,
                delay_ms: retry.delay.as_millis() as u64,
            });

            let orchestrator = Arc::clone(&this);
            let task_id = retry.task_id.clone();
            let delay = retry.delay;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = orchestrator.cancel_token.cancelled() => {
                        orchestrator.retry_scheduled.remove(&task_id);
                        return;
                    }
                }
                orchestrator.retry_scheduled.remove(&task_id);

                match orchestrator.queue.requeue_failed_task(&task_id).await {
                    Ok(true) => orchestrator.kick(),
                    Ok(false) => debug!("任务 {} 已不在失败状态，跳过重试", task_id),
                    Err(e) => debug!("重试任务 {} 跳过: {}", task_id, e),
                }
            });
        }

        scheduled
    }

    /// 手动重试单个失败任务，不计入自动重试次数
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .queue
            .get_task(task_id)
            .ok_or_else(|| UploadError::TaskNotFound(task_id.to_string()))?;
        if task.upload_status != UploadStatus::Failed {
            return Err(UploadError::InvalidTransition {
                from: task.upload_status,
                to: UploadStatus::Pending,
            });
        }

        self.queue
            .update_task_status(task_id, UploadStatus::Pending)
            .await?;
        info!("手动重试任务: {}", task_id);
        self.start_upload_queue();
        Ok(())
    }

    /// 关闭调度器
    ///
    /// 中止所有传输；正在传输的任务保持 uploading，下次启动时由恢复流程处理
    pub fn shutdown(&self) {
        if self.cancel_token.is_cancelled() {
            return;
        }
        info!("关闭上传调度器: {} 个任务传输中", self.active_uploads());
        self.cancel_token.cancel();
        self.running.send_replace(false);
    }
}

#[async_trait]
impl PolicyListener for UploadOrchestrator {
    async fn on_policy_changed(&self, old: NetworkPolicy, new: NetworkPolicy) {
        self.publish(UploadEvent::NetworkPolicyChanged {
            network_type: new.network_type,
            quality: new.quality,
            concurrency: new.concurrency,
        });

        if !new.is_connected() {
            let paused = self.pause_uploading(PauseCause::Network).await;
            if !paused.is_empty() {
                warn!("网络断开，已暂停 {} 个上传任务", paused.len());
            }
            return;
        }

        if self.active_uploads() > new.concurrency {
            self.preempt_excess(new.concurrency).await;
        }

        if !old.is_connected() {
            let resumed = self.resume_network_paused().await;
            info!("网络恢复 ({}), 自动恢复 {} 个任务", new.network_type, resumed);
            if self.queue.has_pending() {
                self.kick();
            }
        } else {
            self.fill_slots();
        }
    }
}
