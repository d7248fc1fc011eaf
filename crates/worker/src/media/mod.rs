//! 媒体处理抽象：探测、截帧与转码

mod ffmpeg;
mod progress;

use std::path::Path;

use async_trait::async_trait;
use transcoder_core::{models::MediaInfo, models::OutputSpec, TranscoderResult};

pub use ffmpeg::{build_transcode_args, parse_probe_output, FfmpegToolkit};
pub use progress::{parse_progress_line, TranscodeProgress};

/// 转码进度回调，参数为 0.0..=1.0 的完成比例
pub type ProgressFn<'a> = dyn Fn(f64) + Send + Sync + 'a;

#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn analyze(&self, input: &Path) -> TranscoderResult<MediaInfo>;

    /// 在 `at_seconds` 处截取一帧 JPEG 写入 `output`
    async fn preview(&self, input: &Path, at_seconds: f64, output: &Path) -> TranscoderResult<()>;

    /// `duration_seconds` 未知时不上报进度
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        spec: &OutputSpec,
        duration_seconds: Option<f64>,
        on_progress: &ProgressFn<'_>,
    ) -> TranscoderResult<()>;
}
