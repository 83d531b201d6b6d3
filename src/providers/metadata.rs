// Platform metadata adapter
//
// Resolves a platform video id to its duration and display metadata. Used
// by admission for duration-based trial gating, so lookups fail closed.

use serde::Deserialize;
use url::Url;

use super::ProviderError;

/// Client for the platform metadata service.
pub struct MetadataClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

/// Resolved video metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoMetadata {
    pub duration_seconds: u64,
    pub title: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl MetadataClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Resolve metadata for a platform video id.
    pub async fn resolve(&self, video_id: &str) -> Result<VideoMetadata, ProviderError> {
        let response = self
            .http
            .get(format!("{}/v1/video", self.base_url))
            .header("x-api-key", &self.api_key)
            .query(&[("id", video_id)])
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

        Ok(response.json().await?)
    }
}

/// Extract the video id out of the URL shapes the platform hands out.
pub fn extract_video_id(source_url: &str) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").to_string();

    match host.as_str() {
        "youtu.be" => url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .filter(|id| !id.is_empty())
            .map(String::from),
        "youtube.com" | "m.youtube.com" | "music.youtube.com" => {
            let mut segments = url.path_segments()?;
            match segments.next() {
                Some("watch") => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                Some("shorts") | Some("embed") | Some("live") => segments
                    .next()
                    .filter(|id| !id.is_empty())
                    .map(String::from),
                _ => None,
            }
        }
        _ => None,
    }
}
