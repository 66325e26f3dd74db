use crate::metadata::{AnalysisResult, Language};
use chrono::Utc;
use serde::Deserialize;

const PROMPT_EN: &str = r#"Analyze this photo and provide a detailed description. Include:
1. Main scene description (what is happening in the photo)
2. People (if any): approximate number, age range, activities
3. Locations: indoor/outdoor, specific places if recognizable
4. Objects: main objects in the scene
5. Tags: 5-10 relevant keywords for searching

Return the analysis in this exact JSON format:
{
    "description": "detailed scene description",
    "people": ["person1", "person2", ...],
    "locations": ["location1", "location2", ...],
    "objects": ["object1", "object2", ...],
    "tags": ["tag1", "tag2", ...]
}"#;

const PROMPT_ZH: &str = r#"分析这张照片并提供详细描述。包括：
1. 主要场景描述（照片中发生了什么）
2. 人物（如果有）：大致数量、年龄范围、活动
3. 地点：室内/室外、如果可识别则说明具体地点
4. 物体：场景中的主要物体
5. 标签：5-10个相关搜索关键词

请严格按照以下JSON格式返回分析结果：
{
    "description": "详细的场景描述",
    "people": ["人物1", "人物2", ...],
    "locations": ["地点1", "地点2", ...],
    "objects": ["物体1", "物体2", ...],
    "tags": ["标签1", "标签2", ...]
}"#;

pub fn prompt_for(language: Language) -> &'static str {
    match language.resolve() {
        Language::Zh => PROMPT_ZH,
        _ => PROMPT_EN,
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ModelPayload {
    description: String,
    people: Vec<String>,
    locations: Vec<String>,
    objects: Vec<String>,
    tags: Vec<String>,
}

/// The span from the first `{` to the last `}`, if any.
fn json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Builds a result from raw model text.
///
/// Text without a parseable JSON object degrades to a description-only result.
pub fn parse_response(text: &str, identity: &str, model: &str) -> AnalysisResult {
    let Some(span) = json_span(text) else {
        log::warn!("No JSON found in response for {}", identity);
        return AnalysisResult::description_only(identity, model, text);
    };

    match serde_json::from_str::<ModelPayload>(span) {
        Ok(payload) => AnalysisResult {
            photo_path: identity.to_string(),
            llm_model: model.to_string(),
            description: payload.description,
            people: payload.people,
            locations: payload.locations,
            objects: payload.objects,
            tags: payload.tags,
            generated_at: Utc::now(),
        },
        Err(e) => {
            log::error!("Failed to parse JSON response for {}: {}", identity, e);
            AnalysisResult::description_only(identity, model, text)
        }
    }
}
