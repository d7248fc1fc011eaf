//! # Transcoder Worker
//!
//! 由实例守护进程按任务启动的子进程：下载输入、分析、生成预览、
//! 按输出规格调用 ffmpeg 转码并上传结果，全程把状态写回数据库。

pub mod classifier;
pub mod download;
pub mod media;
pub mod pipeline;
pub mod upload;

pub use classifier::{ContentClassifier, HttpClassifier};
pub use download::InputDownloader;
pub use media::{FfmpegToolkit, MediaToolkit};
pub use pipeline::{JobPipeline, PipelineRepositories, PipelineSettings, WorkerContext};
pub use upload::OutputUploader;
