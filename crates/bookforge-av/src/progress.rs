//! Parser for ffmpeg `-progress` output.
//!
//! ffmpeg writes blocks of `key=value` lines, each terminated by a
//! `progress=continue` or `progress=end` line. Only the output position is
//! needed to derive a completion fraction.

/// Accumulates `-progress` lines for one ffmpeg run.
#[derive(Debug, Clone)]
pub struct FfmpegProgress {
    duration_secs: Option<f64>,
    out_time_us: Option<i64>,
    last_fraction: f64,
}

impl FfmpegProgress {
    /// `duration_secs` is the length of the media being written.
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            out_time_us: None,
            last_fraction: 0.0,
        }
    }

    /// Feed one line. Returns the completion fraction (0.0..=1.0) at the end
    /// of each block; the value never decreases across calls.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.split_once('=')?;
        let value = value.trim();
        match key.trim() {
            // `out_time_ms` is microseconds too (long-standing ffmpeg quirk).
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_us = Some(us);
                }
                None
            }
            "out_time" => {
                if self.out_time_us.is_none() {
                    self.out_time_us = parse_clock(value).map(|s| (s * 1_000_000.0) as i64);
                }
                None
            }
            "progress" => {
                let fraction = if value == "end" {
                    1.0
                } else {
                    match (self.out_time_us, self.duration_secs) {
                        (Some(us), Some(dur)) => (us as f64 / 1_000_000.0 / dur).clamp(0.0, 1.0),
                        _ => self.last_fraction,
                    }
                };
                self.out_time_us = None;
                self.last_fraction = self.last_fraction.max(fraction);
                Some(self.last_fraction)
            }
            _ => None,
        }
    }
}

/// Parse `HH:MM:SS.micro` into seconds.
fn parse_clock(s: &str) -> Option<f64> {
    let mut parts = s.splitn(3, ':');
    let h: f64 = parts.next()?.parse().ok()?;
    let m: f64 = parts.next()?.parse().ok()?;
    let sec: f64 = parts.next()?.parse().ok()?;
    Some(h * 3600.0 + m * 60.0 + sec)
}
