//! Best-effort progress parsing for external tool output.
//!
//! ffmpeg reports `frame= 123 fps= 25 ... time=00:00:04.92 bitrate=...` and
//! Real-ESRGAN prints tqdm bars such as ` 45%|████▌     | 450/1000`. Lines
//! that carry no progress information are classified as [`Observation::Log`]
//! and forwarded to observers unchanged.

/// Extract the whitespace-delimited value following `key`.
pub fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)?;
    let after_key = line[start + key.len()..].trim_start();
    let end = after_key
        .find(char::is_whitespace)
        .unwrap_or(after_key.len());
    let value = &after_key[..end];
    (!value.is_empty()).then_some(value)
}

/// True for ffmpeg status lines (video lines carry `frame=`, audio-only lines
/// only `time=` and `bitrate=`).
pub fn is_progress_line(line: &str) -> bool {
    line.contains("frame=") || (line.contains("time=") && line.contains("bitrate="))
}

pub fn parse_frame(line: &str) -> Option<u64> {
    extract_value(line, "frame=")?.parse().ok()
}

/// Parse the first `NN%` (or `NN.N%`) token on the line.
pub fn parse_percent(line: &str) -> Option<u8> {
    let idx = line.find('%')?;
    let head = &line[..idx];
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map_or(0, |(i, c)| i + c.len_utf8());
    let number = &head[start..];
    if number.is_empty() {
        return None;
    }
    let value: f64 = number.parse().ok()?;
    if !(0.0..=100.0).contains(&value) {
        return None;
    }
    Some(value.floor() as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// A stage-local percentage, 0 to 100.
    Percent(u8),
    /// The tool reports activity but no usable percentage.
    Indeterminate,
    /// Not a progress line.
    Log,
}

/// Turns a tool's output lines into a monotonic 0-100 stage percentage.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    frame_estimate: Option<u64>,
    last: u8,
}

impl ProgressTracker {
    /// `frame_estimate` converts `frame=N` into a percentage; with `None`,
    /// frame counters are reported as indeterminate.
    pub fn new(frame_estimate: Option<u64>) -> Self {
        Self {
            frame_estimate: frame_estimate.filter(|n| *n > 0),
            last: 0,
        }
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    pub fn observe(&mut self, line: &str) -> Observation {
        let raw = if let Some(pct) = parse_percent(line) {
            Some(pct)
        } else if is_progress_line(line) {
            match (parse_frame(line), self.frame_estimate) {
                (Some(frame), Some(estimate)) => {
                    Some((frame.saturating_mul(100) / estimate).min(100) as u8)
                }
                _ => return Observation::Indeterminate,
            }
        } else {
            None
        };

        match raw {
            Some(pct) => {
                self.last = self.last.max(pct.min(100));
                Observation::Percent(self.last)
            }
            None => Observation::Log,
        }
    }
}

/// Map a stage percentage into a slice of the overall job progress.
pub fn map_into_range(pct: u8, start: u8, end: u8) -> u8 {
    let span = f64::from(end.saturating_sub(start));
    let mapped = f64::from(start) + span * f64::from(pct.min(100)) / 100.0;
    (mapped as u8).clamp(start, end)
}
