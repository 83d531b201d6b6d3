// SRT subtitle format
use super::{total_millis, SubtitleFormatter};
use crate::models::Segment;

pub struct SrtFormatter;

impl SubtitleFormatter for SrtFormatter {
    fn format(&self, segments: &[Segment]) -> String {
        segments
            .iter()
            .enumerate()
            .map(|(i, segment)| {
                format!(
                    "{}\n{} --> {}\n{}\n",
                    i + 1,
                    format_timestamp(segment.start),
                    format_timestamp(segment.end),
                    segment.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn extension(&self) -> &'static str {
        "srt"
    }

    fn content_type(&self) -> &'static str {
        "application/x-subrip"
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total_ms = total_millis(seconds);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}
