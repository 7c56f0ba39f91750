//! 日志系统
//!
//! 控制台 + 文件双输出。文件按启动时间命名，超过大小上限后滚动：
//! `photo-uploader.YYYY-MM-DD-HHMMSS.log`、`photo-uploader.YYYY-MM-DD-HHMMSS_1.log` ...
//! 启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "photo-uploader.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

struct RollingState {
    /// 启动时间（YYYY-MM-DD-HHMMSS）
    started_at: String,
    log_dir: PathBuf,
    file: Option<File>,
    /// 0 为首个文件，之后每次滚动 +1
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingState {
    fn file_path(&self) -> PathBuf {
        let name = if self.index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.started_at, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.started_at, self.index, LOG_FILE_SUFFIX
            )
        };
        self.log_dir.join(name)
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path())?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 单条超过上限的日志直接写入空文件，不无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            if let Some(mut file) = self.file.take() {
                file.flush()?;
            }
            self.index += 1;
            self.open()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct RollingFileWriter {
    state: Arc<Mutex<RollingState>>,
}

impl RollingFileWriter {
    pub fn new(log_dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let mut state = RollingState {
            started_at: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            log_dir: log_dir.into(),
            file: None,
            index: 0,
            max_file_size: max_file_size.max(1),
            written: 0,
        };
        state.open()?;
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// 当前写入的文件
    pub fn current_path(&self) -> PathBuf {
        self.state.lock().file_path()
    }
}

impl Write for RollingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志守卫，drop 时刷新文件写入线程
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化全局日志
///
/// 文件输出不可用时退回仅控制台输出；`RUST_LOG` 优先于配置中的级别
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()));

    let writer = if config.enabled {
        fs::create_dir_all(&config.log_dir)
            .and_then(|_| RollingFileWriter::new(&config.log_dir, config.max_file_size))
            .map_err(|e| eprintln!("日志文件不可用 {:?}: {}，仅输出到控制台", config.log_dir, e))
            .ok()
    } else {
        None
    };

    let Some(writer) = writer else {
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init();
        info!("日志系统初始化完成（仅控制台）");
        return LogGuard { _file_guard: None };
    };

    let log_path = writer.current_path();
    let (non_blocking, guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_writer(non_blocking);

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!(
        "日志系统初始化完成: 文件={:?}, 级别={}, 保留 {} 天, 单文件上限 {:.1}MB",
        log_path,
        config.level,
        config.retention_days,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(guard),
    }
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 日期取自文件名；文件名无法解析时按修改时间判断
fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败 {:?}: {}", log_dir, e);
            return 0;
        }
    };

    let retention = chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match date_from_filename(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("删除过期日志 {:?}", path);
            }
            Err(e) => warn!("删除过期日志失败 {:?}: {}", path, e),
        }
    }

    removed
}

/// `photo-uploader.YYYY-MM-DD-HHMMSS[_N].log` -> YYYY-MM-DD
fn date_from_filename(name: &str) -> Option<NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_mtime(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_date_from_filename() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(
            date_from_filename("photo-uploader.2024-03-09-101500.log"),
            Some(date)
        );
        assert_eq!(
            date_from_filename("photo-uploader.2024-03-09-101500_3.log"),
            Some(date)
        );
        assert_eq!(date_from_filename("photo-uploader.garbage.log"), None);
        assert_eq!(date_from_filename("other.2024-03-09.log"), None);
    }

    #[test]
    fn test_rolling_writer_rotates_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = RollingFileWriter::new(temp_dir.path(), 16).unwrap();
        let first = writer.current_path();

        writer.write_all(b"0123456789").unwrap();
        assert_eq!(writer.current_path(), first);

        writer.write_all(b"0123456789").unwrap();
        let second = writer.current_path();
        assert_ne!(second, first);
        assert!(second.to_string_lossy().ends_with("_1.log"));
        writer.flush().unwrap();

        assert_eq!(fs::read(&first).unwrap().len(), 10);
        assert_eq!(fs::read(&second).unwrap().len(), 10);
    }

    #[test]
    fn test_cleanup_removes_only_expired_logs() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        for name in [
            "photo-uploader.2024-01-01-080000.log",
            "photo-uploader.2024-01-01-080000_1.log",
            "photo-uploader.2024-01-09-080000.log",
            "unrelated.2024-01-01.log",
        ] {
            fs::write(dir.join(name), b"x").unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert_eq!(cleanup_old_logs(dir, 7, today), 2);

        assert!(dir.join("photo-uploader.2024-01-09-080000.log").exists());
        assert!(dir.join("unrelated.2024-01-01.log").exists());
        assert!(!dir.join("photo-uploader.2024-01-01-080000.log").exists());
    }
}
