use crate::analyzer::{Analyzer, Pacing};
use crate::analyzers::{encode_for_upload_async, prompt};
use crate::config::AppConfig;
use crate::error::{AnalysisError, AppError};
use crate::metadata::{AnalysisResult, Language};
use crate::rate_limiter::AdaptiveRateLimiter;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

/// Analyzer for OpenAI-compatible chat completion endpoints (Qwen by default).
pub struct OpenAiCompatAnalyzer {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    rate_limiter: Arc<AdaptiveRateLimiter>,
}

impl OpenAiCompatAnalyzer {
    pub fn new(config: &AppConfig, api_key: String) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        log::debug!("OpenAI-compatible analyzer for {} at {}", config.model, base_url);

        Ok(Self {
            http_client,
            base_url,
            api_key,
            model: config.model.clone(),
            rate_limiter: Arc::new(AdaptiveRateLimiter::from_config(&config.rate_limit)),
        })
    }

    fn status_error(&self, status: StatusCode, body: String) -> AnalysisError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnalysisError::Auth(body),
            StatusCode::NOT_FOUND => AnalysisError::ModelNotFound(self.model.clone()),
            StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => AnalysisError::Timeout,
            _ => AnalysisError::Api(status.as_u16(), body),
        }
    }
}

#[async_trait]
impl Analyzer for OpenAiCompatAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(
        &self,
        identity: &str,
        language: Language,
    ) -> Result<AnalysisResult, AnalysisError> {
        log::info!("Analyzing photo with {}: {} ({})", self.model, identity, language.as_str());
        let image_b64 = encode_for_upload_async(identity).await?;

        let body = json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt::prompt_for(language) },
                    {
                        "type": "image_url",
                        "image_url": { "url": format!("data:image/jpeg;base64,{}", image_b64) }
                    }
                ]
            }]
        });

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self.status_error(status, error_text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Api(status.as_u16(), format!("unreadable body: {}", e)))?;
        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(AnalysisError::EmptyResponse)?;

        Ok(prompt::parse_response(&text, identity, &self.model))
    }

    fn pacing(&self) -> Pacing {
        Pacing::Adaptive(self.rate_limiter.clone())
    }

    async fn set_rate_limit_delay(&self, seconds: f64) {
        self.rate_limiter.set_delay(seconds).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer_at(base_url: &str) -> OpenAiCompatAnalyzer {
        let config = AppConfig {
            model: "qwen-vl-max".into(),
            base_url: Some(base_url.into()),
            ..AppConfig::default()
        };
        OpenAiCompatAnalyzer::new(&config, "key".into()).unwrap()
    }

    fn analyzer() -> OpenAiCompatAnalyzer {
        analyzer_at("http://localhost:9999/v1/")
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        assert_eq!(analyzer().base_url, "http://localhost:9999/v1");
    }

    #[test]
    fn test_status_mapping() {
        let a = analyzer();
        assert!(matches!(a.status_error(StatusCode::UNAUTHORIZED, String::new()), AnalysisError::Auth(_)));
        assert!(matches!(a.status_error(StatusCode::NOT_FOUND, String::new()), AnalysisError::ModelNotFound(_)));
        assert!(matches!(a.status_error(StatusCode::TOO_MANY_REQUESTS, String::new()), AnalysisError::RateLimited));
        assert!(matches!(a.status_error(StatusCode::BAD_GATEWAY, String::new()), AnalysisError::Api(502, _)));
    }

    #[test]
    fn test_pacing_is_adaptive() {
        assert!(matches!(analyzer().pacing(), Pacing::Adaptive(_)));
    }

    #[tokio::test]
    async fn test_scheduler_hints_leave_pacing_to_the_limiter() {
        let a = analyzer();
        a.set_concurrency_limit(64);
        a.set_batch_size(1);
        a.set_rate_limit_delay(3.0).await;
        match a.pacing() {
            Pacing::Adaptive(limiter) => assert_eq!(limiter.current_delay().await, 3.0),
            _ => panic!("expected adaptive pacing"),
        }
    }

    #[tokio::test]
    async fn test_missing_image_fails_before_network() {
        let err = analyzer().analyze("/no/such/photo.jpg", Language::En).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Image(_)));
    }

    #[tokio::test]
    async fn test_unusable_endpoint_makes_analyzer_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let photo = dir.path().join("red.png");
        image::RgbImage::from_pixel(8, 8, image::Rgb([200, 0, 0])).save(&photo).unwrap();

        let err = analyzer_at("ftp://localhost/v1")
            .analyze(&photo.to_string_lossy(), Language::En)
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "{:?}", err);
    }
}
