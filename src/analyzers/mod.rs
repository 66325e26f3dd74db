pub mod gemini;
pub mod mock;
pub mod openai_compat;
pub mod prompt;

use crate::analyzer::Analyzer;
use crate::config::AppConfig;
use crate::error::{AnalysisError, AppError};
use base64::{engine::general_purpose, Engine};
use image::imageops::FilterType;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

const MAX_UPLOAD_SIDE: u32 = 2048;
const JPEG_QUALITY: u8 = 85;

/// Loads an image, flattens it to RGB, caps its longest side and returns it
/// as base64-encoded JPEG.
pub fn encode_for_upload(path: &Path) -> Result<String, AnalysisError> {
    if !path.exists() {
        return Err(AnalysisError::Image(format!("image not found: {}", path.display())));
    }
    let img = image::open(path)
        .map_err(|e| AnalysisError::Image(format!("{}: {}", path.display(), e)))?;

    let img = if img.width().max(img.height()) > MAX_UPLOAD_SIDE {
        img.resize(MAX_UPLOAD_SIDE, MAX_UPLOAD_SIDE, FilterType::Lanczos3)
    } else {
        img
    };
    let rgb = img.into_rgb8();

    let mut buffer = Cursor::new(Vec::new());
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    encoder
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ColorType::Rgb8)
        .map_err(|e| AnalysisError::Image(e.to_string()))?;
    Ok(general_purpose::STANDARD.encode(buffer.into_inner()))
}

/// Runs `encode_for_upload` off the async runtime.
pub async fn encode_for_upload_async(identity: &str) -> Result<String, AnalysisError> {
    let path = identity.to_string();
    tokio::task::spawn_blocking(move || encode_for_upload(Path::new(&path)))
        .await
        .map_err(|e| AnalysisError::Image(format!("encoder task failed: {}", e)))?
}

/// Picks an analyzer implementation from the configured model name.
pub fn create_analyzer(config: &AppConfig) -> Result<Arc<dyn Analyzer>, AppError> {
    let model = config.model.as_str();
    let lower = model.to_lowercase();

    let analyzer: Arc<dyn Analyzer> = if lower.starts_with("mock") {
        Arc::new(mock::MockAnalyzer::new(model))
    } else if lower.starts_with("gemini") {
        let api_key = config.api_key_for_model().ok_or_else(|| {
            AppError::Infrastructure(
                "API key required for Gemini models; set google_api_key or GOOGLE_API_KEY".into(),
            )
        })?;
        Arc::new(gemini::GeminiAnalyzer::new(config, api_key)?)
    } else if lower.starts_with("qwen") {
        let api_key = config.api_key_for_model().ok_or_else(|| {
            AppError::Infrastructure(
                "API key required for Qwen models; set qwen_api_key, QWEN_API_KEY or DASHSCOPE_API_KEY"
                    .into(),
            )
        })?;
        Arc::new(openai_compat::OpenAiCompatAnalyzer::new(config, api_key)?)
    } else {
        return Err(AppError::Infrastructure(format!(
            "unrecognized model '{}'; supported: gemini-*, qwen-*, mock",
            model
        )));
    };

    log::info!("Using analyzer for model {}", analyzer.model());
    Ok(analyzer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_factory_picks_mock() {
        let config = AppConfig {
            model: "mock-gemini".into(),
            ..AppConfig::default()
        };
        let analyzer = create_analyzer(&config).unwrap();
        assert_eq!(analyzer.model(), "mock-gemini");
    }

    #[test]
    fn test_factory_requires_key_for_remote_models() {
        let config = AppConfig {
            model: "qwen-vl-max".into(),
            api_key: None,
            qwen_api_key: None,
            ..AppConfig::default()
        };
        let err = create_analyzer(&config).err().unwrap();
        assert!(matches!(err, AppError::Infrastructure(_)));
    }

    #[test]
    fn test_factory_rejects_unknown_model() {
        let config = AppConfig {
            model: "gpt-4o".into(),
            ..AppConfig::default()
        };
        assert!(matches!(
            create_analyzer(&config).err().unwrap(),
            AppError::Infrastructure(_)
        ));
    }

    #[test]
    fn test_encode_downsizes_large_images() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wide.png");
        image::RgbaImage::from_pixel(3000, 10, image::Rgba([0, 0, 255, 128]))
            .save(&path)
            .unwrap();

        let encoded = encode_for_upload(&path).unwrap();
        let bytes = general_purpose::STANDARD.decode(encoded).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 2048);
    }

    #[test]
    fn test_encode_missing_file() {
        let err = encode_for_upload(Path::new("/definitely/missing.jpg")).unwrap_err();
        assert!(matches!(err, AnalysisError::Image(_)));
    }
}
