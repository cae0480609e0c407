use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClaudeError>;

#[derive(Debug, Error)]
pub enum ClaudeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Claude API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("response contained no structured output block")]
    MissingStructuredOutput,

    #[error("response contained no text")]
    EmptyResponse,

    #[error("failed to decode structured output: {0}")]
    Decode(String),

    #[error("API key is not a valid header value")]
    InvalidApiKey,

    #[error("{0} environment variable not set")]
    MissingEnv(&'static str),
}

impl From<reqwest::Error> for ClaudeError {
    fn from(err: reqwest::Error) -> Self {
        ClaudeError::Network(err.to_string())
    }
}
