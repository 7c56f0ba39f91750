//! 图片编解码
//!
//! 上传前的压缩和缩略图生成。解码 / 编码是 CPU 密集操作，
//! 在 `spawn_blocking` 中执行，不阻塞调度线程

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, DynamicImage};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, UploadError};

/// 默认缩略图最长边（像素）
pub const DEFAULT_THUMBNAIL_MAX_DIMENSION: u32 = 256;

/// 图片编解码接口
#[async_trait]
pub trait ImageCodec: Send + Sync {
    /// 按质量（1-100）重新编码，返回新文件路径
    async fn compress(&self, path: &Path, quality: u8) -> Result<PathBuf>;
    /// 生成缩略图，返回新文件路径
    async fn thumbnail(&self, path: &Path, quality: u8) -> Result<PathBuf>;
}

/// 基于 `image` crate 的 JPEG 编码器
#[derive(Debug, Clone)]
pub struct JpegCodec {
    /// 输出目录
    output_dir: PathBuf,
    /// 缩略图最长边
    thumbnail_max_dimension: u32,
}

impl JpegCodec {
    pub fn new(output_dir: impl Into<PathBuf>, thumbnail_max_dimension: u32) -> Self {
        Self {
            output_dir: output_dir.into(),
            thumbnail_max_dimension: thumbnail_max_dimension.max(1),
        }
    }

    /// 输出文件名：`{原文件名}-{随机8位}-{后缀}.jpg`，避免不同目录下同名文件互相覆盖
    fn output_path(&self, source: &Path, suffix: &str) -> PathBuf {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let unique = Uuid::new_v4().simple().to_string();
        self.output_dir
            .join(format!("{}-{}-{}.jpg", stem, &unique[..8], suffix))
    }

    async fn run_blocking<F>(&self, job: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Result<PathBuf> + Send + 'static,
    {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| UploadError::Codec(format!("创建输出目录失败: {}", e)))?;

        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| UploadError::Codec(format!("图片处理任务异常退出: {}", e)))?
    }
}

#[async_trait]
impl ImageCodec for JpegCodec {
    async fn compress(&self, path: &Path, quality: u8) -> Result<PathBuf> {
        let source = path.to_path_buf();
        let target = self.output_path(path, &format!("q{}", quality));

        let out = self
            .run_blocking(move || {
                let img = open_image(&source)?;
                write_jpeg(&img, &target, quality)?;
                Ok(target)
            })
            .await?;

        debug!("压缩完成: {:?} -> {:?} (quality={})", path, out, quality);
        Ok(out)
    }

    async fn thumbnail(&self, path: &Path, quality: u8) -> Result<PathBuf> {
        let source = path.to_path_buf();
        let target = self.output_path(path, "thumb");
        let max = self.thumbnail_max_dimension;

        let out = self
            .run_blocking(move || {
                let img = open_image(&source)?;
                write_jpeg(&img.thumbnail(max, max), &target, quality)?;
                Ok(target)
            })
            .await?;

        debug!("缩略图生成完成: {:?} -> {:?}", path, out);
        Ok(out)
    }
}

fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| UploadError::Codec(format!("无法读取图片 {:?}: {}", path, e)))
}

fn write_jpeg(img: &DynamicImage, target: &Path, quality: u8) -> Result<()> {
    let file = File::create(target)
        .map_err(|e| UploadError::Codec(format!("无法创建 {:?}: {}", target, e)))?;
    let mut writer = BufWriter::new(file);

    // JPEG 不支持透明通道，统一转为 RGB8
    let rgb = img.to_rgb8();
    JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|e| UploadError::Codec(format!("JPEG 编码失败: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn write_sample_png(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("sample.png");
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        });
        img.save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn test_compress_writes_jpeg() {
        let temp_dir = TempDir::new().unwrap();
        let source = write_sample_png(temp_dir.path(), 64, 48);
        let codec = JpegCodec::new(temp_dir.path().join("out"), 16);

        let out = codec.compress(&source, 50).await.unwrap();

        assert!(out.starts_with(temp_dir.path().join("out")));
        assert_eq!(out.extension().unwrap(), "jpg");
        let decoded = image::open(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[tokio::test]
    async fn test_thumbnail_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let source = write_sample_png(temp_dir.path(), 100, 40);
        let codec = JpegCodec::new(temp_dir.path().join("out"), 20);

        let out = codec.thumbnail(&source, 30).await.unwrap();

        let decoded = image::open(&out).unwrap();
        assert!(decoded.width() <= 20);
        assert!(decoded.height() <= 20);
    }

    #[tokio::test]
    async fn test_missing_source_is_codec_error() {
        let temp_dir = TempDir::new().unwrap();
        let codec = JpegCodec::new(temp_dir.path(), DEFAULT_THUMBNAIL_MAX_DIMENSION);

        let result = codec.compress(&temp_dir.path().join("nope.jpg"), 80).await;
        assert!(matches!(result, Err(UploadError::Codec(_))));
    }
}
