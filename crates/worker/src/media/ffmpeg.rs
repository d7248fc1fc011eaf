use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;
use transcoder_core::{
    config::MediaConfig,
    models::{MediaInfo, OutputSpec, StreamInfo},
    TranscoderError, TranscoderResult,
};

use super::progress::{parse_progress_line, TranscodeProgress};
use super::{MediaToolkit, ProgressFn};

/// 调用 ffmpeg / ffprobe 命令行
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegToolkit {
    pub fn new(config: &MediaConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    index: u32,
    #[serde(default)]
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

/// "30000/1001" 或 "29.97"
fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.split_once('/') {
        Some((num, den)) => {
            let den: f64 = den.parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num.parse::<f64>().ok()? / den
        }
        None => value.parse().ok()?,
    };
    (rate > 0.0).then_some(rate)
}

/// 解析 `ffprobe -print_format json -show_format -show_streams` 的输出
pub fn parse_probe_output(stdout: &[u8]) -> TranscoderResult<MediaInfo> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| TranscoderError::Media(format!("解析ffprobe输出失败: {e}")))?;

    let format = probe.format.unwrap_or_default();
    let streams = probe
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            index: s.index,
            frame_rate: s
                .avg_frame_rate
                .as_deref()
                .and_then(parse_frame_rate)
                .or_else(|| s.r_frame_rate.as_deref().and_then(parse_frame_rate)),
            sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            codec_type: s.codec_type,
            codec_name: s.codec_name,
            width: s.width,
            height: s.height,
            channels: s.channels,
        })
        .collect();

    Ok(MediaInfo {
        duration_seconds: format.duration.and_then(|d| d.parse().ok()),
        format_name: format.format_name,
        size_bytes: format.size.and_then(|s| s.parse().ok()),
        bit_rate: format.bit_rate.and_then(|b| b.parse().ok()),
        streams,
    })
}

/// 由输出规格生成 ffmpeg 参数，进度写到 stdout
pub fn build_transcode_args(input: &Path, output: &Path, spec: &OutputSpec) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(input.to_string_lossy().into_owned());

    match (&spec.video, &spec.audio) {
        (None, Some(_)) => args.push("-vn".to_string()),
        (Some(_), None) => args.push("-an".to_string()),
        _ => {}
    }

    if let Some(video) = &spec.video {
        args.extend(["-c:v".to_string(), video.codec.clone()]);
        if video.width.is_some() || video.height.is_some() {
            let dimension = |d: Option<u32>| d.map(|v| v.to_string()).unwrap_or_else(|| "-2".to_string());
            args.extend([
                "-vf".to_string(),
                format!("scale={}:{}", dimension(video.width), dimension(video.height)),
            ]);
        }
        if let Some(bitrate) = &video.bitrate {
            args.extend(["-b:v".to_string(), bitrate.clone()]);
        }
        if let Some(fps) = video.fps {
            args.extend(["-r".to_string(), fps.to_string()]);
        }
    }

    if let Some(audio) = &spec.audio {
        args.extend(["-c:a".to_string(), audio.codec.clone()]);
        if let Some(bitrate) = &audio.bitrate {
            args.extend(["-b:a".to_string(), bitrate.clone()]);
        }
        if let Some(channels) = audio.channels {
            args.extend(["-ac".to_string(), channels.to_string()]);
        }
        if let Some(rate) = audio.sample_rate {
            args.extend(["-ar".to_string(), rate.to_string()]);
        }
    }

    args.extend(spec.extra_args.iter().cloned());
    args.extend([
        "-f".to_string(),
        spec.format.clone(),
        "-progress".to_string(),
        "pipe:1".to_string(),
    ]);
    args.push(output.to_string_lossy().into_owned());
    args
}

fn failure(tool: &str, code: Option<i32>, stderr: &[u8]) -> TranscoderError {
    let stderr = String::from_utf8_lossy(stderr);
    let detail = stderr.trim().lines().last().unwrap_or("").to_string();
    TranscoderError::Media(format!("{tool} exited with code {code:?}: {detail}"))
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn analyze(&self, input: &Path) -> TranscoderResult<MediaInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TranscoderError::Media(format!("启动ffprobe失败: {e}")))?;

        if !output.status.success() {
            return Err(failure("ffprobe", output.status.code(), &output.stderr));
        }
        parse_probe_output(&output.stdout)
    }

    async fn preview(&self, input: &Path, at_seconds: f64, output: &Path) -> TranscoderResult<()> {
        let result = Command::new(&self.ffmpeg)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-ss"])
            .arg(format!("{at_seconds:.3}"))
            .arg("-i")
            .arg(input)
            .args(["-frames:v", "1", "-q:v", "2"])
            .arg(output)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TranscoderError::Media(format!("启动ffmpeg失败: {e}")))?;

        if !result.status.success() {
            return Err(failure("ffmpeg", result.status.code(), &result.stderr));
        }
        Ok(())
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        spec: &OutputSpec,
        duration_seconds: Option<f64>,
        on_progress: &ProgressFn<'_>,
    ) -> TranscoderResult<()> {
        let args = build_transcode_args(input, output, spec);
        debug!("执行转码: {} {}", self.ffmpeg, args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TranscoderError::Media(format!("启动ffmpeg失败: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscoderError::Media("无法获取ffmpeg stdout".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscoderError::Media("无法获取ffmpeg stderr".to_string()))?;

        let progress_task = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut current = TranscodeProgress::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if let (Some(snapshot), Some(duration)) =
                    (parse_progress_line(&line, &mut current), duration_seconds)
                {
                    on_progress(snapshot.fraction(duration));
                }
            }
        };
        let stderr_task = async {
            let mut buffer = Vec::new();
            let _ = stderr.read_to_end(&mut buffer).await;
            buffer
        };
        let ((), stderr_bytes) = tokio::join!(progress_task, stderr_task);

        let status = child
            .wait()
            .await
            .map_err(|e| TranscoderError::Media(format!("等待ffmpeg结束失败: {e}")))?;
        if !status.success() {
            return Err(failure("ffmpeg", status.code(), &stderr_bytes));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use transcoder_core::models::{AudioSpec, VideoSpec};

    #[test]
    fn test_parse_probe_output() {
        let stdout = br#"{
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "avg_frame_rate": "30000/1001"},
                {"index": 1, "codec_type": "audio", "codec_name": "aac", "sample_rate": "48000", "channels": 2, "avg_frame_rate": "0/0"}
            ],
            "format": {"format_name": "mov,mp4,m4a", "duration": "12.500000", "size": "1048576", "bit_rate": "671088"}
        }"#;

        let info = parse_probe_output(stdout).unwrap();
        assert_eq!(info.duration_seconds, Some(12.5));
        assert_eq!(info.size_bytes, Some(1_048_576));
        assert!(info.has_video() && info.has_audio());
        let video = &info.streams[0];
        assert_eq!(video.width, Some(1920));
        assert!((video.frame_rate.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(info.streams[1].sample_rate, Some(48_000));
        assert_eq!(info.streams[1].frame_rate, None);
    }

    #[test]
    fn test_parse_probe_output_rejects_garbage() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(TranscoderError::Media(_))
        ));
    }

    #[test]
    fn test_transcode_args() {
        let spec = OutputSpec {
            video: Some(VideoSpec {
                codec: "libx264".to_string(),
                height: Some(720),
                bitrate: Some("2M".to_string()),
                ..Default::default()
            }),
            audio: Some(AudioSpec {
                codec: "aac".to_string(),
                channels: Some(2),
                ..Default::default()
            }),
            extra_args: vec!["-preset".to_string(), "fast".to_string()],
            ..OutputSpec::new("mp4")
        };
        let args = build_transcode_args(
            &PathBuf::from("/tmp/in.mov"),
            &PathBuf::from("/tmp/out.mp4"),
            &spec,
        );
        let joined = args.join(" ");

        assert!(joined.contains("-i /tmp/in.mov"));
        assert!(joined.contains("-c:v libx264 -vf scale=-2:720 -b:v 2M"));
        assert!(joined.contains("-c:a aac -ac 2"));
        assert!(joined.contains("-preset fast -f mp4 -progress pipe:1"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));
        assert!(!args.contains(&"-vn".to_string()));
    }

    #[test]
    fn test_audio_only_output_drops_video() {
        let spec = OutputSpec {
            audio: Some(AudioSpec {
                codec: "libmp3lame".to_string(),
                ..Default::default()
            }),
            ..OutputSpec::new("mp3")
        };
        let args = build_transcode_args(Path::new("in.wav"), Path::new("out.mp3"), &spec);
        assert!(args.contains(&"-vn".to_string()));
        assert!(!args.contains(&"-c:v".to_string()));
    }
}
