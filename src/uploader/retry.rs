// 重试退避
//
// 失败任务只由重试扫描重新调度：
// - 只选择 retry_count < 上限 的失败任务
// - 按 retry_count 升序（重试次数少的先调度，避免被反复失败的任务拖住）
// - 延迟 = min(base * 2^retry_count, max) + [0, jitter) 随机抖动

use rand::Rng;
use std::time::Duration;

use crate::uploader::{UploadStatus, UploadTask};

/// 自动重试上限
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// 初始退避延迟（毫秒）
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1000;

/// 最大退避延迟（毫秒）
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// 随机抖动上限（毫秒，不含）
pub const DEFAULT_BACKOFF_JITTER_MS: u64 = 1000;

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter_ms: DEFAULT_BACKOFF_JITTER_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// 是否还能自动重试
    pub fn allows(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// 不含抖动的延迟
    ///
    /// # 延迟序列（默认配置）
    /// - retry_count=0: 1000ms
    /// - retry_count=1: 2000ms
    /// - retry_count=3: 8000ms
    /// - 最大: 30000ms
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// 含抖动的延迟；超过重试上限时返回 None
    pub fn delay<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Option<Duration> {
        if !self.allows(retry_count) {
            return None;
        }
        let jitter = if self.jitter_ms > 0 {
            rng.gen_range(0..self.jitter_ms)
        } else {
            0
        };
        Some(Duration::from_millis(
            self.base_delay_ms(retry_count).saturating_add(jitter),
        ))
    }

    /// 选择可以自动重试的失败任务，按 retry_count 升序、创建时间升序排列
    ///
    /// 因不可重试错误失败的任务不参与
    pub fn select_candidates<'a>(&self, tasks: &'a [UploadTask]) -> Vec<&'a UploadTask> {
        let mut candidates: Vec<&UploadTask> = tasks
            .iter()
            .filter(|t| {
                t.upload_status == UploadStatus::Failed
                    && !t.non_retriable
                    && self.allows(t.retry_count)
            })
            .collect();
        candidates.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then(a.created_at.cmp(&b.created_at))
        });
        candidates
    }
}
