// WebVTT subtitle format
use super::{total_millis, SubtitleFormatter};
use crate::models::Segment;

pub struct VttFormatter;

impl SubtitleFormatter for VttFormatter {
    fn format(&self, segments: &[Segment]) -> String {
        let mut output = String::from("WEBVTT\n\n");

        for segment in segments {
            output.push_str(&format!(
                "{} --> {}\n{}\n\n",
                format_timestamp(segment.start),
                format_timestamp(segment.end),
                segment.text
            ));
        }

        output
    }

    fn extension(&self) -> &'static str {
        "vtt"
    }

    fn content_type(&self) -> &'static str {
        "text/vtt"
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total_ms = total_millis(seconds);
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}
