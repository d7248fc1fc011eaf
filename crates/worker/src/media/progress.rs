/// ffmpeg `-progress` 输出的累积状态
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    pub out_time_ms: i64,
    pub speed: Option<f64>,
    pub finished: bool,
}

impl TranscodeProgress {
    /// 相对总时长的完成比例
    pub fn fraction(&self, duration_seconds: f64) -> f64 {
        if duration_seconds <= 0.0 {
            return 0.0;
        }
        (self.out_time_ms as f64 / 1_000.0 / duration_seconds).clamp(0.0, 1.0)
    }
}

/// 解析一行 `key=value`，遇到 `progress=` 行时返回一个完整快照
pub fn parse_progress_line(line: &str, current: &mut TranscodeProgress) -> Option<TranscodeProgress> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // ffmpeg 的 out_time_ms 实际单位是微秒
        "out_time_us" | "out_time_ms" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1_000;
            }
        }
        "speed" => {
            current.speed = value.strip_suffix('x').and_then(|s| s.trim().parse().ok());
        }
        "progress" => {
            current.finished = value == "end";
            return Some(current.clone());
        }
        _ => {}
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_block_parsing() {
        let mut current = TranscodeProgress::default();
        let lines = ["frame=120", "out_time_us=5000000", "speed=2.5x", "progress=continue"];
        let snapshots: Vec<_> = lines
            .iter()
            .filter_map(|line| parse_progress_line(line, &mut current))
            .collect();

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].out_time_ms, 5_000);
        assert_eq!(snapshots[0].speed, Some(2.5));
        assert!(!snapshots[0].finished);
        assert!((snapshots[0].fraction(10.0) - 0.5).abs() < f64::EPSILON);

        parse_progress_line("speed=N/A", &mut current);
        let last = parse_progress_line("progress=end", &mut current).unwrap();
        assert!(last.finished);
        assert_eq!(last.speed, None);
    }

    #[test]
    fn test_fraction_is_clamped() {
        let progress = TranscodeProgress {
            out_time_ms: 12_000,
            ..Default::default()
        };
        assert_eq!(progress.fraction(10.0), 1.0);
        assert_eq!(progress.fraction(0.0), 0.0);
    }
}
