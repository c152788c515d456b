//! Image descriptions from a generative model.
//!
//! [`GeminiDescriber`] calls the `generateContent` REST method with the image
//! inline (base64) and a fixed prompt asking for alt text plus three tags.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::client::task::{FileRef, FALLBACK_CONTENT_TYPE};
use crate::config::AiConfig;

/// Prompt sent alongside every image.
pub const DESCRIBE_PROMPT: &str = "Analyze this image. Provide a concise, 1-sentence description \
suitable for an alt tag, followed by 3 key tags describing the visual content.";

/// Answer used when the model returns no text.
pub const NO_ANALYSIS: &str = "No analysis available.";

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("API Key not configured")]
    NotConfigured,

    #[error("Failed to analyze image with Gemini.")]
    Failed,
}

/// Produces a short description of an image.
pub trait ImageDescriber: Send + Sync + 'static {
    fn describe<'a>(
        &'a self,
        file: &'a FileRef,
    ) -> Pin<Box<dyn Future<Output = Result<String, DescribeError>> + Send + 'a>>;
}

// -- Wire types ----------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateContentResponse {
    /// Concatenated text of the first candidate.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

// -- Gemini client -------------------------------------------------------------

pub struct GeminiDescriber {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl GeminiDescriber {
    /// Build a describer, or `None` when no API key is configured.
    pub fn from_config(config: &AiConfig) -> anyhow::Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone().filter(|k| !k.trim().is_empty()) else {
            warn!("API_KEY is not set. Image descriptions are disabled.");
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;
        let url = format!(
            "{}/models/{}:generateContent",
            config.endpoint.trim_end_matches('/'),
            config.model
        );
        Ok(Some(Self {
            client,
            url,
            api_key,
        }))
    }

    async fn generate(&self, file: &FileRef) -> Result<String, DescribeError> {
        let mime_type = if file.content_type.is_empty() {
            FALLBACK_CONTENT_TYPE
        } else {
            file.content_type.as_str()
        };
        let request = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![
                    RequestPart::Inline {
                        inline_data: InlineData {
                            mime_type,
                            data: STANDARD.encode(&file.data),
                        },
                    },
                    RequestPart::Text {
                        text: DESCRIBE_PROMPT,
                    },
                ],
            }],
        };

        let resp = self
            .client
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Image analysis request failed: {}", e);
                DescribeError::Failed
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!("Image analysis returned HTTP {}: {}", status, body);
            return Err(DescribeError::Failed);
        }

        let parsed: GenerateContentResponse = resp.json().await.map_err(|e| {
            error!("Image analysis response unreadable: {}", e);
            DescribeError::Failed
        })?;

        let text = parsed.text();
        debug!("Described {} ({} chars)", file.name, text.len());
        if text.trim().is_empty() {
            Ok(NO_ANALYSIS.to_string())
        } else {
            Ok(text)
        }
    }
}

impl ImageDescriber for GeminiDescriber {
    fn describe<'a>(
        &'a self,
        file: &'a FileRef,
    ) -> Pin<Box<dyn Future<Output = Result<String, DescribeError>> + Send + 'a>> {
        Box::pin(self.generate(file))
    }
}
