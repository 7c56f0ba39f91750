//! 进度事件节流器
//!
//! 按任务控制进度事件的发布频率，避免事件风暴
//! 100% 进度不受节流限制

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
#[derive(Debug)]
pub struct ProgressThrottler {
    /// task_id -> 上次发布时间
    last_emit: DashMap<String, Instant>,
    /// 节流间隔
    interval: Duration,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: DashMap::new(),
            interval,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布该任务的进度事件
    ///
    /// 距离上次发布超过节流间隔，或进度达到 100 时返回 true
    pub fn should_emit(&self, task_id: &str, progress: u8) -> bool {
        let now = Instant::now();

        if progress >= 100 {
            self.last_emit.insert(task_id.to_string(), now);
            return true;
        }

        match self.last_emit.get_mut(task_id) {
            Some(mut last) => {
                if now.duration_since(*last) >= self.interval {
                    *last = now;
                    true
                } else {
                    false
                }
            }
            None => {
                self.last_emit.insert(task_id.to_string(), now);
                true
            }
        }
    }

    /// 任务结束后清理记录
    pub fn forget(&self, task_id: &str) {
        self.last_emit.remove(task_id);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttler_basic() {
        let throttler = ProgressThrottler::with_millis(100);

        // 第一次应该发布
        assert!(throttler.should_emit("a", 10));
        // 立即再次调用，不应该发布
        assert!(!throttler.should_emit("a", 20));
        // 其他任务不受影响
        assert!(throttler.should_emit("b", 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttler_after_interval() {
        let throttler = ProgressThrottler::with_millis(50);

        assert!(throttler.should_emit("a", 1));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(throttler.should_emit("a", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_always_emitted() {
        let throttler = ProgressThrottler::with_millis(1000);

        assert!(throttler.should_emit("a", 90));
        assert!(throttler.should_emit("a", 100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget() {
        let throttler = ProgressThrottler::with_millis(1000);

        throttler.should_emit("a", 5);
        assert!(!throttler.should_emit("a", 6));

        throttler.forget("a");
        assert!(throttler.should_emit("a", 7));
    }
}
