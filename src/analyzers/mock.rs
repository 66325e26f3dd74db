use crate::analyzer::Analyzer;
use crate::error::AnalysisError;
use crate::metadata::{AnalysisResult, Language};
use async_trait::async_trait;
use chrono::Utc;
use std::path::Path;

struct Fixture {
    description: &'static str,
    people: &'static [&'static str],
    locations: &'static [&'static str],
    objects: &'static [&'static str],
    tags: &'static [&'static str],
}

const FIXTURES: &[(&str, Fixture)] = &[
    (
        "warm.jpeg",
        Fixture {
            description: "A warm and cozy indoor scene with soft lighting",
            people: &["person sitting", "family member"],
            locations: &["living room", "home", "indoors"],
            objects: &["sofa", "lamp", "book", "blanket"],
            tags: &["cozy", "warm", "home", "comfort", "relaxing"],
        },
    ),
    (
        "beach_sunset.jpg",
        Fixture {
            description: "A beautiful sunset at the beach with golden sand and orange sky",
            people: &["couple walking", "children playing"],
            locations: &["beach", "ocean", "shoreline"],
            objects: &["sun", "waves", "sand", "umbrella"],
            tags: &["sunset", "beach", "ocean", "evening", "vacation"],
        },
    ),
    (
        "mountain_hike.png",
        Fixture {
            description: "People hiking on a mountain trail with scenic views",
            people: &["hikers", "tourists"],
            locations: &["mountain", "trail", "forest"],
            objects: &["backpack", "trees", "rocks", "sky"],
            tags: &["hiking", "mountain", "nature", "outdoor", "adventure"],
        },
    ),
    (
        "birthday_party.jpeg",
        Fixture {
            description: "A birthday party celebration with cake and balloons",
            people: &["family", "friends", "children"],
            locations: &["living room", "indoors", "home"],
            objects: &["cake", "balloons", "candles", "gifts"],
            tags: &["birthday", "party", "celebration", "family", "cake"],
        },
    ),
];

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Offline analyzer answering from canned fixtures keyed by file name.
pub struct MockAnalyzer {
    model: String,
}

impl MockAnalyzer {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Analyzer for MockAnalyzer {
    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(
        &self,
        identity: &str,
        language: Language,
    ) -> Result<AnalysisResult, AnalysisError> {
        let filename = Path::new(identity)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| identity.to_string());
        log::debug!("Mock analysis of {} ({})", identity, language.as_str());

        let result = match FIXTURES.iter().find(|(name, _)| *name == filename) {
            Some((_, fixture)) => AnalysisResult {
                photo_path: identity.to_string(),
                llm_model: self.model.clone(),
                description: fixture.description.to_string(),
                people: owned(fixture.people),
                locations: owned(fixture.locations),
                objects: owned(fixture.objects),
                tags: owned(fixture.tags),
                generated_at: Utc::now(),
            },
            None => AnalysisResult {
                photo_path: identity.to_string(),
                llm_model: self.model.clone(),
                description: format!("A photo titled {}", filename),
                people: Vec::new(),
                locations: vec!["unknown".to_string()],
                objects: Vec::new(),
                tags: vec!["photo".to_string(), "image".to_string()],
                generated_at: Utc::now(),
            },
        };
        Ok(result)
    }
}
