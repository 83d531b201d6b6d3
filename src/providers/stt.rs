// Sync STT provider adapter
//
// Client for the synchronous speech-to-text service with diarization. The
// service groups words into utterances when it can; when it does not, the
// adapter rebuilds segments from the raw word stream.

use log::debug;
use serde::Deserialize;

use super::{ProviderError, TranscriptResult};
use crate::models::Segment;

/// Engine tag recorded on tasks routed here.
pub const ENGINE: &str = "stt";

/// A pause between consecutive words longer than this starts a new segment.
const WORD_GAP_SECONDS: f64 = 1.0;

/// Client for the sync STT service.
pub struct SttClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
pub struct ListenResponse {
    pub metadata: ListenMetadata,
    pub results: ListenResults,
}

#[derive(Debug, Deserialize)]
pub struct ListenMetadata {
    /// Media duration in seconds.
    pub duration: f64,
}

#[derive(Debug, Deserialize)]
pub struct ListenResults {
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub utterances: Option<Vec<Utterance>>,
}

#[derive(Debug, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    #[serde(default)]
    pub detected_language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
pub struct Word {
    pub word: String,
    #[serde(default)]
    pub punctuated_word: Option<String>,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub speaker: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct Utterance {
    pub start: f64,
    pub end: f64,
    pub transcript: String,
    #[serde(default)]
    pub speaker: Option<i64>,
}

impl SttClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    /// Transcribe the media behind `media_url` synchronously.
    pub async fn transcribe_url(
        &self,
        media_url: &str,
        language: Option<&str>,
        detect_language: bool,
    ) -> Result<TranscriptResult, ProviderError> {
        let mut query: Vec<(&str, String)> = vec![
            ("model", self.model.clone()),
            ("diarize", "true".to_string()),
            ("detect_language", detect_language.to_string()),
            ("punctuate", "true".to_string()),
            ("utterances", "true".to_string()),
        ];
        if let Some(lang) = language {
            query.push(("language", lang.to_string()));
        }

        debug!("stt request for {} (model {})", media_url, self.model);

        let response = self
            .http
            .post(format!("{}/v1/listen", self.base_url))
            .header("Authorization", format!("Token {}", self.api_key))
            .query(&query)
            .json(&serde_json::json!({ "url": media_url }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw: serde_json::Value = response.json().await?;
        parse_payload(raw)
    }
}

/// Turn a full STT payload into a [`TranscriptResult`].
///
/// Shared between the synchronous call path and the webhook callback, which
/// delivers the identical document.
pub fn parse_payload(raw: serde_json::Value) -> Result<TranscriptResult, ProviderError> {
    let parsed: ListenResponse = serde_json::from_value(raw.clone())?;
    let chunks = extract_segments(&parsed);
    let language = parsed
        .results
        .channels
        .first()
        .and_then(|c| c.detected_language.clone());

    Ok(TranscriptResult {
        chunks,
        duration_sec: parsed.metadata.duration,
        language,
        // Speech-to-text always runs the model; there is no free path here.
        is_generated: true,
        raw,
    })
}

/// Prefer provider utterances (already grouped by semantics and speaker);
/// fall back to walking the word stream.
fn extract_segments(response: &ListenResponse) -> Vec<Segment> {
    if let Some(utterances) = &response.results.utterances {
        if !utterances.is_empty() {
            return utterances
                .iter()
                .filter(|u| !u.transcript.trim().is_empty())
                .map(|u| Segment {
                    start: u.start,
                    end: u.end,
                    text: u.transcript.trim().to_string(),
                    speaker: u.speaker.map(speaker_label),
                })
                .collect();
        }
    }

    let words = response
        .results
        .channels
        .first()
        .and_then(|c| c.alternatives.first())
        .map(|a| a.words.as_slice())
        .unwrap_or(&[]);

    segments_from_words(words)
}

/// Rebuild segments from a flat word stream: a new segment starts when the
/// speaker changes or the inter-word gap exceeds [`WORD_GAP_SECONDS`].
fn segments_from_words(words: &[Word]) -> Vec<Segment> {
    struct Building {
        parts: Vec<String>,
        start: f64,
        end: f64,
        speaker: Option<i64>,
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut current: Option<Building> = None;

    for word in words {
        let text = word
            .punctuated_word
            .as_deref()
            .unwrap_or(&word.word)
            .to_string();

        let boundary = current.as_ref().map_or(false, |b| {
            b.speaker != word.speaker || word.start - b.end > WORD_GAP_SECONDS
        });
        if boundary {
            if let Some(b) = current.take() {
                push_segment(&mut segments, b.parts, b.start, b.end, b.speaker);
            }
        }

        match current.as_mut() {
            Some(b) => {
                b.parts.push(text);
                b.end = word.end;
            }
            None => {
                current = Some(Building {
                    parts: vec![text],
                    start: word.start,
                    end: word.end,
                    speaker: word.speaker,
                });
            }
        }
    }

    if let Some(b) = current {
        push_segment(&mut segments, b.parts, b.start, b.end, b.speaker);
    }

    segments
}

fn push_segment(
    segments: &mut Vec<Segment>,
    parts: Vec<String>,
    start: f64,
    end: f64,
    speaker: Option<i64>,
) {
    let text = parts.join(" ");
    if text.trim().is_empty() {
        return;
    }
    segments.push(Segment {
        start,
        end,
        text,
        speaker: speaker.map(speaker_label),
    });
}

fn speaker_label(id: i64) -> String {
    format!("Speaker {}", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn word(text: &str, start: f64, end: f64, speaker: Option<i64>) -> serde_json::Value {
        json!({"word": text, "punctuated_word": text, "start": start, "end": end, "speaker": speaker})
    }

    #[test]
    fn utterances_are_preferred_over_words() {
        let raw = json!({
            "metadata": {"duration": 12.5},
            "results": {
                "channels": [{"alternatives": [{"words": [word("ignored", 0.0, 1.0, None)]}]}],
                "utterances": [
                    {"start": 0.0, "end": 4.2, "transcript": "Hello there.", "speaker": 0},
                    {"start": 4.5, "end": 9.0, "transcript": "General greeting.", "speaker": 1}
                ]
            }
        });

        let result = parse_payload(raw).unwrap();
        assert!(result.is_generated);
        assert_eq!(result.duration_sec, 12.5);
        assert_eq!(result.chunks.len(), 2);
        assert_eq!(result.chunks[0].speaker.as_deref(), Some("Speaker 0"));
        assert_eq!(result.chunks[1].text, "General greeting.");
    }

    #[test]
    fn word_stream_splits_on_gap_and_speaker() {
        let raw = json!({
            "metadata": {"duration": 20.0},
            "results": {
                "channels": [{"alternatives": [{"words": [
                    word("Hello", 0.0, 0.4, Some(0)),
                    word("world.", 0.5, 0.9, Some(0)),
                    // > 1s pause starts a new segment
                    word("Anyway,", 2.5, 3.0, Some(0)),
                    // speaker change starts a new segment
                    word("hi.", 3.1, 3.4, Some(1))
                ]}]}],
                "utterances": []
            }
        });

        let result = parse_payload(raw).unwrap();
        let texts: Vec<&str> = result.chunks.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello world.", "Anyway,", "hi."]);
        assert_eq!(result.chunks[0].start, 0.0);
        assert_eq!(result.chunks[0].end, 0.9);
        assert_eq!(result.chunks[2].speaker.as_deref(), Some("Speaker 1"));
    }

    #[test]
    fn falls_back_to_raw_word_without_punctuation() {
        let raw = json!({
            "metadata": {"duration": 1.0},
            "results": {
                "channels": [{"alternatives": [{"words": [
                    {"word": "plain", "start": 0.0, "end": 0.5}
                ]}]}]
            }
        });

        let result = parse_payload(raw).unwrap();
        assert_eq!(result.chunks[0].text, "plain");
        assert_eq!(result.chunks[0].speaker, None);
    }

    #[tokio::test]
    async fn request_carries_required_query_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .and(query_param("punctuate", "true"))
            .and(query_param("utterances", "true"))
            .and(query_param("diarize", "true"))
            .and(query_param("language", "es"))
            .and(body_json(json!({"url": "https://cdn.example/file.mp3"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "metadata": {"duration": 61.0},
                "results": {
                    "channels": [],
                    "utterances": [
                        {"start": 0.0, "end": 2.0, "transcript": "Hola."}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let client = SttClient::new(server.uri(), "key".into(), "nova-2".into());
        let result = client
            .transcribe_url("https://cdn.example/file.mp3", Some("es"), false)
            .await
            .unwrap();
        assert_eq!(result.duration_sec, 61.0);
        assert_eq!(result.chunks[0].text, "Hola.");
    }

    #[tokio::test]
    async fn api_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/listen"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unsupported media"))
            .mount(&server)
            .await;

        let client = SttClient::new(server.uri(), "key".into(), "nova-2".into());
        let err = client
            .transcribe_url("https://cdn.example/file.bin", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
        assert!(!err.is_retryable());
    }
}
