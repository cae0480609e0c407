use anyhow::Result;

/// Application configuration loaded from environment variables.
/// Secrets and env-specific values only; prompts and extraction behavior
/// are compiled in.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,

    // LLM analysis
    pub anthropic_api_key: String,
    pub claude_model: String,

    // Geocoding (absent key disables geocoding)
    pub geocode_api_key: Option<String>,
    pub geocode_base_url: Option<String>,

    // API server
    pub api_host: String,
    pub api_port: u16,
}

const DEFAULT_CLAUDE_MODEL: &str = "claude-sonnet-4-20250514";

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")?,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")?,
            claude_model: std::env::var("CLAUDE_MODEL")
                .unwrap_or_else(|_| DEFAULT_CLAUDE_MODEL.to_string()),
            geocode_api_key: std::env::var("GEOCODE_API_KEY").ok(),
            geocode_base_url: std::env::var("GEOCODE_BASE_URL").ok(),
            api_host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
        };

        config.log_keys();
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            format!("{}...({} chars)", &val[..n], val.len())
        }

        tracing::debug!(
            anthropic_api_key = %preview(&self.anthropic_api_key),
            claude_model = %self.claude_model,
            geocoding = self.geocode_api_key.is_some(),
            "Config loaded"
        );
    }
}
