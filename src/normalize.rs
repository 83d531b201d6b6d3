// Segment normalization
//
// Merges fragmentary sub-word chunks into sentence-level segments. The
// rule-based merge always works; when an LLM is configured it can take over
// merging (falling back to the rules on any failure) and is the only path
// for translation, which has no correct fallback.

use std::sync::{Arc, OnceLock};

use log::warn;
use regex::Regex;
use thiserror::Error;

use crate::models::Segment;
use crate::providers::llm::LlmClient;
use crate::providers::ProviderError;

/// A silence longer than this between chunks starts a new segment.
pub const MAX_GAP_SECONDS: f64 = 1.5;

/// Segments never grow past this many characters.
pub const MAX_LENGTH_CHARS: usize = 200;

/// Sentence-terminal punctuation, CJK and ASCII.
const TERMINAL_PUNCTUATION: [char; 6] = ['。', '！', '？', '.', '!', '?'];

/// CJK characters and fullwidth punctuation; spaces between any two of
/// these are artifacts of transcription chunking, not words.
const CJK_SPACING_PATTERN: &str = "([\\x{4e00}-\\x{9fa5}，。！？、：；“”‘’（）【】])\\s+([\\x{4e00}-\\x{9fa5}，。！？、：；“”‘’（）【】])";

/// Errors from the normalization stage that fail the task.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("translation requested but no LLM is configured")]
    TranslateUnavailable,

    #[error("translation failed: {0}")]
    Provider(#[from] ProviderError),
}

/// Language-aware join of two text pieces: a single space between
/// alphanumeric tails/heads, nothing otherwise.
pub fn smart_join(left: &str, right: &str) -> String {
    let needs_space = matches!(
        (left.chars().last(), right.chars().next()),
        (Some(l), Some(r)) if l.is_ascii_alphanumeric() && r.is_ascii_alphanumeric()
    );

    if needs_space {
        format!("{} {}", left, right)
    } else {
        format!("{}{}", left, right)
    }
}

/// Collapse whitespace between CJK characters. Iterates because overlapping
/// matches ("老 高 咱") leave residue in a single pass.
pub fn clean_cjk_spacing(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(CJK_SPACING_PATTERN).expect("static pattern compiles"));

    let mut current = text.to_string();
    loop {
        let next = re.replace_all(&current, "$1$2").into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Rule-based merge of time-ordered chunks into sentence-level segments.
///
/// A new segment starts when the speaker changes, the running text ends in
/// sentence-terminal punctuation, the joined text would exceed
/// [`MAX_LENGTH_CHARS`], or the gap to the next chunk exceeds
/// [`MAX_GAP_SECONDS`]. Each merged segment spans from its first chunk's
/// start to its last chunk's end.
pub fn merge_chunks(chunks: &[Segment]) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    let mut current: Option<Segment> = None;

    for chunk in chunks {
        let text = chunk.text.trim();
        if text.is_empty() {
            continue;
        }

        match current.as_mut() {
            None => {
                current = Some(Segment {
                    start: chunk.start,
                    end: chunk.end,
                    text: text.to_string(),
                    speaker: chunk.speaker.clone(),
                });
            }
            Some(seg) => {
                let joined = smart_join(&seg.text, text);
                let boundary = seg.speaker != chunk.speaker
                    || seg.text.ends_with(TERMINAL_PUNCTUATION)
                    || joined.chars().count() > MAX_LENGTH_CHARS
                    || chunk.start - seg.end > MAX_GAP_SECONDS;

                if boundary {
                    if let Some(done) = current.take() {
                        merged.push(finalize(done));
                    }
                    current = Some(Segment {
                        start: chunk.start,
                        end: chunk.end,
                        text: text.to_string(),
                        speaker: chunk.speaker.clone(),
                    });
                } else {
                    seg.text = joined;
                    seg.end = chunk.end;
                }
            }
        }
    }

    if let Some(done) = current {
        merged.push(finalize(done));
    }

    merged
}

fn finalize(mut segment: Segment) -> Segment {
    segment.text = clean_cjk_spacing(segment.text.trim());
    segment
}

/// Normalizer facade over the rule-based merge and the optional LLM.
pub struct SegmentNormalizer {
    llm: Option<Arc<LlmClient>>,
}

impl SegmentNormalizer {
    pub fn new(llm: Option<Arc<LlmClient>>) -> Self {
        Self { llm }
    }

    pub fn llm_available(&self) -> bool {
        self.llm.is_some()
    }

    /// Merge chunks into sentence-level segments. With `llm_assist` and a
    /// configured LLM the model does the merging; any failure there falls
    /// back to the rules, so this never fails the task.
    pub async fn merge(&self, chunks: &[Segment], llm_assist: bool) -> Vec<Segment> {
        if llm_assist {
            if let Some(llm) = &self.llm {
                match llm.merge_segments(chunks).await {
                    Ok(segments) => return segments,
                    Err(e) => {
                        warn!("llm merge failed, falling back to rule-based merge: {}", e);
                    }
                }
            }
        }

        merge_chunks(chunks)
    }

    /// Translate segments into `target_language`. Unlike merging there is no
    /// fallback: a failure here fails the task.
    pub async fn translate(
        &self,
        segments: &[Segment],
        target_language: &str,
    ) -> Result<Vec<Segment>, NormalizeError> {
        let llm = self
            .llm
            .as_ref()
            .ok_or(NormalizeError::TranslateUnavailable)?;
        Ok(llm.translate_segments(segments, target_language).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, start: f64, end: f64) -> Segment {
        Segment {
            start,
            end,
            text: text.to_string(),
            speaker: None,
        }
    }

    fn spoken(text: &str, start: f64, end: f64, speaker: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.to_string(),
            speaker: Some(speaker.to_string()),
        }
    }

    #[test]
    fn smart_join_spacing() {
        assert_eq!(smart_join("Hello", "world"), "Hello world");
        assert_eq!(smart_join("你好", "世界"), "你好世界");
        assert_eq!(smart_join("Hello", "大家好"), "Hello大家好");
        assert_eq!(smart_join("你好,", "我是"), "你好,我是");
    }

    #[test]
    fn merges_mixed_script_chunks() {
        let chunks = vec![
            chunk("Hello", 0.0, 1.5),
            chunk("大家好,", 0.3, 1.8),
            chunk("我是 老", 0.56, 2.06),
            chunk("高 咱", 0.76, 2.26),
            chunk("们 今天", 0.98, 2.48),
            chunk("来 讲", 1.28, 2.78),
            chunk("一个话题。", 2.8, 4.0),
            chunk("那就是", 4.5, 5.5),
        ];

        let merged = merge_chunks(&chunks);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "Hello大家好,我是老高咱们今天来讲一个话题。");
        assert_eq!(merged[0].start, 0.0);
        assert_eq!(merged[0].end, 4.0);
        assert_eq!(merged[1].text, "那就是");
        assert_eq!(merged[1].start, 4.5);
        assert_eq!(merged[1].end, 5.5);
    }

    #[test]
    fn merge_is_idempotent() {
        let chunks = vec![
            chunk("Hello", 0.0, 1.5),
            chunk("大家好,", 0.3, 1.8),
            chunk("我是 老", 0.56, 2.06),
            chunk("一个话题。", 2.8, 4.0),
            chunk("那就是", 4.5, 5.5),
        ];

        let once = merge_chunks(&chunks);
        let twice = merge_chunks(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn splits_on_speaker_change() {
        let chunks = vec![
            spoken("How are", 0.0, 0.5, "Speaker 0"),
            spoken("you", 0.6, 0.9, "Speaker 0"),
            spoken("Fine", 1.0, 1.4, "Speaker 1"),
        ];

        let merged = merge_chunks(&chunks);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "How are you");
        assert_eq!(merged[0].speaker.as_deref(), Some("Speaker 0"));
        assert_eq!(merged[1].speaker.as_deref(), Some("Speaker 1"));
    }

    #[test]
    fn splits_on_long_gap() {
        let chunks = vec![chunk("first", 0.0, 1.0), chunk("second", 3.0, 4.0)];
        let merged = merge_chunks(&chunks);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn splits_when_joined_text_would_be_too_long() {
        let long_a = "a".repeat(150);
        let long_b = "b".repeat(100);
        let chunks = vec![chunk(&long_a, 0.0, 1.0), chunk(&long_b, 1.1, 2.0)];
        let merged = merge_chunks(&chunks);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text.chars().count(), 150);
    }

    #[test]
    fn skips_chunks_that_are_empty_after_trim() {
        let chunks = vec![chunk("  ", 0.0, 0.5), chunk("text", 0.6, 1.0)];
        let merged = merge_chunks(&chunks);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "text");
        assert_eq!(merged[0].start, 0.6);
    }

    #[test]
    fn cjk_cleanup_removes_residue_across_overlaps() {
        assert_eq!(clean_cjk_spacing("老 高 咱 们"), "老高咱们");
        assert_eq!(clean_cjk_spacing("你好， 世界"), "你好，世界");
        // Latin words keep their spaces.
        assert_eq!(clean_cjk_spacing("Hello world"), "Hello world");
        assert_eq!(clean_cjk_spacing("mixed 中文 text"), "mixed 中文 text");
    }

    #[test]
    fn cjk_cleanup_is_idempotent_and_preserves_characters() {
        let input = "我 是 老 高，today we talk 一 个 话 题。";
        let once = clean_cjk_spacing(input);
        let twice = clean_cjk_spacing(&once);
        assert_eq!(once, twice);

        // Every non-space character survives in order.
        let stripped: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        let result_stripped: String = once.chars().filter(|c| !c.is_whitespace()).collect();
        assert_eq!(stripped, result_stripped);
    }

    #[tokio::test]
    async fn normalizer_without_llm_uses_rules() {
        let normalizer = SegmentNormalizer::new(None);
        let merged = normalizer
            .merge(&[chunk("Hello", 0.0, 1.0), chunk("world", 1.1, 2.0)], true)
            .await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "Hello world");
    }

    #[tokio::test]
    async fn translate_without_llm_is_an_error() {
        let normalizer = SegmentNormalizer::new(None);
        let result = normalizer.translate(&[chunk("hi", 0.0, 1.0)], "fr").await;
        assert!(matches!(result, Err(NormalizeError::TranslateUnavailable)));
    }
}
