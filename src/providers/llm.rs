// LLM adapter for segment merge and translation
//
// Sends segments to a chat-completion endpoint as a compact JSON array and
// expects a JSON object back. Merge failures are recoverable (the caller
// falls back to the rule-based merge); translation failures are not.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ProviderError;
use crate::models::Segment;

const MERGE_TEMPERATURE: f64 = 0.1;
const TRANSLATE_TEMPERATURE: f64 = 0.3;

const MERGE_SYSTEM_PROMPT: &str = "You merge fragmentary subtitle pieces into complete sentences.\n\
Input is a JSON array of fragments [{\"i\",\"s\",\"e\",\"t\",\"sp\"}] where i is the index, \
s/e are start/end seconds, t is the text and sp the speaker (may be null).\n\
Rules:\n\
- Merge fragments into complete sentences by semantics and punctuation.\n\
- Preserve time ordering; each merged segment starts at its first fragment's start and ends at its last fragment's end.\n\
- Never merge across speaker boundaries.\n\
Respond with JSON only: {\"segments\":[{\"start\",\"end\",\"text\",\"speaker\"}]}";

const TRANSLATE_SYSTEM_PROMPT: &str = "You translate subtitle segments.\n\
Input is a JSON array of fragments [{\"i\",\"s\",\"e\",\"t\",\"sp\"}].\n\
Rules:\n\
- Keep every timestamp and speaker exactly as given; only rewrite the text.\n\
- If a segment is already in the target language, return it unchanged.\n\
Respond with JSON only: {\"segments\":[{\"start\",\"end\",\"text\",\"speaker\"}]}";

/// Client for the chat-completion endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct CompactFragment<'a> {
    i: usize,
    s: f64,
    e: f64,
    t: &'a str,
    sp: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct SegmentsEnvelope {
    segments: Vec<Segment>,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    /// Merge fragments into sentence-level segments.
    pub async fn merge_segments(&self, segments: &[Segment]) -> Result<Vec<Segment>, ProviderError> {
        let content = self
            .chat(MERGE_SYSTEM_PROMPT, segments, MERGE_TEMPERATURE)
            .await?;
        parse_segments_response(&content)
    }

    /// Translate segments into `target_language`, keeping timing and speakers.
    pub async fn translate_segments(
        &self,
        segments: &[Segment],
        target_language: &str,
    ) -> Result<Vec<Segment>, ProviderError> {
        let prompt = format!("{TRANSLATE_SYSTEM_PROMPT}\nTarget language: {target_language}");
        let content = self.chat(&prompt, segments, TRANSLATE_TEMPERATURE).await?;
        parse_segments_response(&content)
    }

    async fn chat(
        &self,
        system_prompt: &str,
        segments: &[Segment],
        temperature: f64,
    ) -> Result<String, ProviderError> {
        let payload = encode_fragments(segments);
        debug!("llm request with {} fragments", segments.len());

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": payload}
            ],
            "temperature": temperature,
            "response_format": {"type": "json_object"}
        });

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
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

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("no choices in completion".into()))
    }
}

fn encode_fragments(segments: &[Segment]) -> String {
    let compact: Vec<CompactFragment> = segments
        .iter()
        .enumerate()
        .map(|(i, s)| CompactFragment {
            i,
            s: s.start,
            e: s.end,
            t: &s.text,
            sp: s.speaker.as_deref(),
        })
        .collect();
    serde_json::to_string(&compact).unwrap_or_else(|_| "[]".into())
}

/// Parse the model's `{"segments": [...]}` reply, rejecting empty or
/// malformed output so the caller can decide on a fallback.
fn parse_segments_response(content: &str) -> Result<Vec<Segment>, ProviderError> {
    let envelope: SegmentsEnvelope = serde_json::from_str(content.trim())?;

    let segments: Vec<Segment> = envelope
        .segments
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();

    if segments.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "model returned no segments".into(),
        ));
    }

    for s in &segments {
        if s.start < 0.0 || s.end < s.start {
            return Err(ProviderError::InvalidResponse(format!(
                "model returned inverted timestamps ({} > {})",
                s.start, s.end
            )));
        }
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn seg(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.to_string(),
            speaker: None,
        }
    }

    #[test]
    fn fragments_are_encoded_compactly() {
        let mut with_speaker = seg(1.0, 2.0, "hi");
        with_speaker.speaker = Some("Speaker 1".to_string());
        let encoded = encode_fragments(&[seg(0.0, 1.0, "a"), with_speaker]);
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value[0]["i"], 0);
        assert_eq!(value[0]["t"], "a");
        assert_eq!(value[1]["sp"], "Speaker 1");
    }

    #[test]
    fn parses_valid_reply() {
        let content = r#"{"segments":[{"start":0.0,"end":4.0,"text":"Hello world.","speaker":null}]}"#;
        let segments = parse_segments_response(content).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "Hello world.");
    }

    #[test]
    fn empty_or_malformed_replies_are_rejected() {
        assert!(parse_segments_response(r#"{"segments":[]}"#).is_err());
        assert!(parse_segments_response("not json").is_err());
        assert!(parse_segments_response(
            r#"{"segments":[{"start":5.0,"end":1.0,"text":"backwards"}]}"#
        )
        .is_err());
        // Whitespace-only text does not survive.
        assert!(parse_segments_response(r#"{"segments":[{"start":0,"end":1,"text":"  "}]}"#)
            .is_err());
    }

    #[tokio::test]
    async fn merge_round_trips_through_chat_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content":
                    "{\"segments\":[{\"start\":0.0,\"end\":2.0,\"text\":\"Hello world.\"}]}"
                }}]
            })))
            .mount(&server)
            .await;

        let client = LlmClient::new(server.uri(), "key".into(), "test-model".into());
        let merged = client
            .merge_segments(&[seg(0.0, 1.0, "Hello"), seg(1.0, 2.0, "world.")])
            .await
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].text, "Hello world.");
    }
}
