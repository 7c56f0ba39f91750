//! 测试用的传输层、编解码器和存储

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::codec::ImageCodec;
use crate::error::{Result, UploadError};
use crate::persistence::{KvStore, MemoryKvStore};
use crate::transport::{Transport, TransportResponse, UploadRequest};

/// 传输何时返回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldMode {
    /// 立即返回
    Immediate,
    /// 等待 `release` 或取消
    Hold,
    /// 等待 `release`，忽略取消
    HoldIgnoringCancel,
}

/// 传输结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Success,
    Status(u16),
    Body(String),
    Error(UploadError),
}

pub struct MockTransport {
    mode: Mutex<HoldMode>,
    outcome: Mutex<MockOutcome>,
    per_file: DashMap<PathBuf, MockOutcome>,
    requests: Mutex<Vec<UploadRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Semaphore,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            mode: Mutex::new(HoldMode::Immediate),
            outcome: Mutex::new(MockOutcome::Success),
            per_file: DashMap::new(),
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gate: Semaphore::new(0),
        }
    }

    pub fn holding() -> Self {
        let transport = Self::new();
        transport.set_mode(HoldMode::Hold);
        transport
    }

    pub fn set_mode(&self, mode: HoldMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_outcome(&self, outcome: MockOutcome) {
        *self.outcome.lock() = outcome;
    }

    pub fn set_outcome_for(&self, path: impl Into<PathBuf>, outcome: MockOutcome) {
        self.per_file.insert(path.into(), outcome);
    }

    /// 放行 n 个被挂起的传输
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn requests(&self) -> Vec<UploadRequest> {
        self.requests.lock().clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: mpsc::UnboundedSender<u8>,
        cancel_token: CancellationToken,
    ) -> Result<TransportResponse> {
        self.requests.lock().push(request.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let _ = progress.send(50);

        let mode = *self.mode.lock();
        match mode {
            HoldMode::Immediate => {}
            HoldMode::Hold => {
                tokio::select! {
                    permit = self.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                    }
                    _ = cancel_token.cancelled() => return Err(UploadError::Cancelled),
                }
            }
            HoldMode::HoldIgnoringCancel => {
                if let Ok(permit) = self.gate.acquire().await {
                    permit.forget();
                }
            }
        }

        let outcome = self
            .per_file
            .get(&request.file_path)
            .map(|o| o.value().clone())
            .unwrap_or_else(|| self.outcome.lock().clone());

        match outcome {
            MockOutcome::Success => {
                let _ = progress.send(100);
                Ok(TransportResponse {
                    status: 200,
                    body: r#"{"success":true,"url":"https://photos.example/p.jpg"}"#.to_string(),
                })
            }
            MockOutcome::Status(status) => Ok(TransportResponse {
                status,
                body: format!("status {}", status),
            }),
            MockOutcome::Body(body) => Ok(TransportResponse { status: 200, body }),
            MockOutcome::Error(e) => Err(e),
        }
    }
}

/// 记录调用参数的编解码器，不读写文件
#[derive(Default)]
pub struct MockCodec {
    compress_calls: Mutex<Vec<u8>>,
    thumbnail_calls: Mutex<Vec<u8>>,
    fail_compress: AtomicBool,
    fail_thumbnail: AtomicBool,
}

impl MockCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_compress(&self, fail: bool) {
        self.fail_compress.store(fail, Ordering::SeqCst);
    }

    pub fn fail_thumbnail(&self, fail: bool) {
        self.fail_thumbnail.store(fail, Ordering::SeqCst);
    }

    pub fn compress_qualities(&self) -> Vec<u8> {
        self.compress_calls.lock().clone()
    }

    pub fn thumbnail_qualities(&self) -> Vec<u8> {
        self.thumbnail_calls.lock().clone()
    }
}

fn derived_path(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    path.with_file_name(format!("{}-{}.jpg", stem, suffix))
}

#[async_trait]
impl ImageCodec for MockCodec {
    async fn compress(&self, path: &Path, quality: u8) -> Result<PathBuf> {
        self.compress_calls.lock().push(quality);
        if self.fail_compress.load(Ordering::SeqCst) {
            return Err(UploadError::Codec("mock compress failure".to_string()));
        }
        Ok(derived_path(path, &format!("q{}", quality)))
    }

    async fn thumbnail(&self, path: &Path, quality: u8) -> Result<PathBuf> {
        self.thumbnail_calls.lock().push(quality);
        if self.fail_thumbnail.load(Ordering::SeqCst) {
            return Err(UploadError::Codec("mock thumbnail failure".to_string()));
        }
        Ok(derived_path(path, "thumb"))
    }
}

type WritePredicate = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// 可以挂起指定写入的存储
pub struct GatedStore {
    inner: Arc<MemoryKvStore>,
    hold_when: Mutex<Option<WritePredicate>>,
    holding: AtomicBool,
    gate: Semaphore,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryKvStore>) -> Self {
        Self {
            inner,
            hold_when: Mutex::new(None),
            holding: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    /// 下一次满足条件的写入挂起，直到 `open`
    pub fn hold_next_write_when(&self, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *self.hold_when.lock() = Some(Box::new(predicate));
    }

    pub fn is_holding(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl KvStore for GatedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let hold = {
            let mut predicate = self.hold_when.lock();
            if predicate.as_ref().is_some_and(|f| f(value)) {
                *predicate = None;
                true
            } else {
                false
            }
        };
        if hold {
            self.holding.store(true, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            self.holding.store(false, Ordering::SeqCst);
        }
        self.inner.set(key, value).await
    }
}
