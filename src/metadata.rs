// src/metadata.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque path identifying one source image.
pub type PhotoIdentity = String;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PhotoMetadata {
    pub path: PhotoIdentity,
    pub filename: String,
    pub size: u64,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<String>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub date_taken: Option<String>,
    pub gps_latitude: Option<f64>,
    pub gps_longitude: Option<f64>,
    /// SHA-256 of the file contents, lowercase hex.
    pub file_hash: String,
}

/// One model's structured judgment about one photo.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalysisResult {
    pub photo_path: PhotoIdentity,
    pub llm_model: String,
    pub description: String,
    pub people: Vec<String>,
    pub locations: Vec<String>,
    pub objects: Vec<String>,
    pub tags: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Result carrying only free text, used when the model's reply has no usable JSON.
    pub fn description_only(photo_path: &str, llm_model: &str, text: &str) -> Self {
        Self {
            photo_path: photo_path.to_string(),
            llm_model: llm_model.to_string(),
            description: text.trim().to_string(),
            people: Vec::new(),
            locations: Vec::new(),
            objects: Vec::new(),
            tags: Vec::new(),
            generated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    En,
    Zh,
    Auto,
}

impl Language {
    /// Lenient parse; unknown names fall back to English.
    pub fn normalize(language: &str) -> Self {
        match language.trim().to_lowercase().as_str() {
            "en" | "english" | "eng" => Language::En,
            "zh" | "chinese" | "cn" | "zh-cn" | "zh_cn" => Language::Zh,
            "auto" | "automatic" => Language::Auto,
            _ => Language::En,
        }
    }

    pub fn resolve(self) -> Self {
        match self {
            Language::Auto => Language::En,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Zh => "zh",
            Language::Auto => "auto",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_photos: i64,
    pub total_analyses: i64,
    pub models_used: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SearchHit {
    pub path: PhotoIdentity,
    pub filename: String,
    pub llm_model: String,
    pub description: String,
    pub people: Vec<String>,
    pub locations: Vec<String>,
    pub objects: Vec<String>,
    pub tags: Vec<String>,
    pub created_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
}
