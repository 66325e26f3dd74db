use crate::analyzer::{Analyzer, Pacing};
use crate::analyzers::{encode_for_upload_async, prompt};
use crate::config::AppConfig;
use crate::error::{AnalysisError, AppError};
use crate::metadata::{AnalysisResult, Language};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

/// Gemini `generateContent` analyzer with a fixed delay between calls.
pub struct GeminiAnalyzer {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    delay: Duration,
}

impl GeminiAnalyzer {
    pub fn new(config: &AppConfig, api_key: String) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            model: config.model.clone(),
            delay: Duration::from_secs_f64(config.fixed_delay_secs.max(0.0)),
        })
    }
}

fn collect_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect::<Vec<_>>()
        .join("");
    (!text.trim().is_empty()).then_some(text)
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(
        &self,
        identity: &str,
        language: Language,
    ) -> Result<AnalysisResult, AnalysisError> {
        log::info!("Analyzing photo with {}: {}", self.model, identity);
        let image_b64 = encode_for_upload_async(identity).await?;

        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt::prompt_for(language) },
                    { "inline_data": { "mime_type": "image/jpeg", "data": image_b64 } }
                ]
            }]
        });

        let response = self
            .http_client
            .post(format!("{}/models/{}:generateContent", self.base_url, self.model))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnalysisError::Auth(error_text),
                StatusCode::NOT_FOUND => AnalysisError::ModelNotFound(self.model.clone()),
                StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited,
                _ => AnalysisError::Api(status.as_u16(), error_text),
            });
        }

        let generated: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Api(status.as_u16(), format!("unreadable body: {}", e)))?;
        let text = collect_text(generated).ok_or(AnalysisError::EmptyResponse)?;

        Ok(prompt::parse_response(&text, identity, &self.model))
    }

    fn pacing(&self) -> Pacing {
        Pacing::Fixed(self.delay)
    }
}
