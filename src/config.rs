use serde::Deserialize;
use std::collections::HashSet;
use config::{Config, ConfigError, Environment, File};

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub initial_delay: f64,
    pub min_delay: f64,
    pub max_delay: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            initial_delay: 1.0,
            min_delay: 0.1,
            max_delay: 60.0,
        }
    }
}

/// Bounds on how many scan tasks the serving layer remembers.
#[derive(Debug, Deserialize, Clone)]
pub struct TaskRetentionConfig {
    pub max_tasks: usize,
    pub max_age_secs: u64,
}

impl Default for TaskRetentionConfig {
    fn default() -> Self {
        Self {
            max_tasks: 100,
            max_age_secs: 86_400,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub model: String,
    pub language: String,
    pub api_key: Option<String>,
    pub google_api_key: Option<String>,
    pub qwen_api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub store_batch_size: usize,
    pub rate_limit: RateLimitConfig,
    pub fixed_delay_secs: f64,
    pub request_timeout_secs: u64,
    pub run_deadline_secs: Option<u64>,
    pub allowed_extensions: HashSet<String>,
    pub recursive: bool,
    pub skip_existing: bool,
    pub web_port: u16,
    pub static_directory: String,
    pub log_level: String,
    pub task_retention: TaskRetentionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "photo_hub.db".into(),
            model: "mock".into(),
            language: "auto".into(),
            api_key: None,
            google_api_key: None,
            qwen_api_key: None,
            base_url: None,
            max_concurrent: 5,
            batch_size: 10,
            store_batch_size: 50,
            rate_limit: RateLimitConfig::default(),
            fixed_delay_secs: 1.0,
            request_timeout_secs: 60,
            run_deadline_secs: None,
            allowed_extensions: ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            recursive: true,
            skip_existing: true,
            web_port: 8000,
            static_directory: "./static".into(),
            log_level: "info".into(),
            task_retention: TaskRetentionConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let env = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let defaults = AppConfig::default();

        let s = Config::builder()
            .set_default("db_path", defaults.db_path)?
            .set_default("model", defaults.model)?
            .set_default("language", defaults.language)?
            .set_default("max_concurrent", defaults.max_concurrent as u64)?
            .set_default("batch_size", defaults.batch_size as u64)?
            .set_default("store_batch_size", defaults.store_batch_size as u64)?
            .set_default("rate_limit.initial_delay", defaults.rate_limit.initial_delay)?
            .set_default("rate_limit.min_delay", defaults.rate_limit.min_delay)?
            .set_default("rate_limit.max_delay", defaults.rate_limit.max_delay)?
            .set_default("fixed_delay_secs", defaults.fixed_delay_secs)?
            .set_default("request_timeout_secs", defaults.request_timeout_secs)?
            .set_default(
                "allowed_extensions",
                defaults.allowed_extensions.into_iter().collect::<Vec<_>>(),
            )?
            .set_default("recursive", defaults.recursive)?
            .set_default("skip_existing", defaults.skip_existing)?
            .set_default("web_port", defaults.web_port as u64)?
            .set_default("static_directory", defaults.static_directory)?
            .set_default("log_level", defaults.log_level)?
            .set_default("task_retention.max_tasks", defaults.task_retention.max_tasks as u64)?
            .set_default("task_retention.max_age_secs", defaults.task_retention.max_age_secs)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("PHOTO_HUB")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;
        config.fill_keys_from_env();
        config.validate()?;
        Ok(config)
    }

    fn fill_keys_from_env(&mut self) {
        if self.google_api_key.is_none() {
            self.google_api_key = std::env::var("GOOGLE_API_KEY").ok();
        }
        if self.qwen_api_key.is_none() {
            self.qwen_api_key = std::env::var("QWEN_API_KEY")
                .or_else(|_| std::env::var("DASHSCOPE_API_KEY"))
                .ok();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Message("max_concurrent must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be at least 1".into()));
        }
        if self.store_batch_size == 0 {
            return Err(ConfigError::Message("store_batch_size must be at least 1".into()));
        }
        let rl = &self.rate_limit;
        if rl.min_delay < 0.0 || rl.min_delay > rl.max_delay {
            return Err(ConfigError::Message(format!(
                "invalid rate limit bounds: min_delay={} max_delay={}",
                rl.min_delay, rl.max_delay
            )));
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url)
                .map_err(|e| ConfigError::Message(format!("invalid base_url {}: {}", base_url, e)))?;
        }
        Ok(())
    }

    /// API key for the configured model family, falling back to the generic key.
    pub fn api_key_for_model(&self) -> Option<String> {
        let model = self.model.to_lowercase();
        let specific = if model.starts_with("gemini") {
            self.google_api_key.clone()
        } else if model.starts_with("qwen") {
            self.qwen_api_key.clone()
        } else {
            None
        };
        specific.or_else(|| self.api_key.clone())
    }
}
