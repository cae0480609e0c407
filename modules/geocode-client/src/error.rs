use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeocodeError>;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// The provider answered 200 but refused the request
    /// (e.g. OVER_QUERY_LIMIT, REQUEST_DENIED).
    #[error("Geocoding rejected: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for GeocodeError {
    fn from(err: reqwest::Error) -> Self {
        GeocodeError::Network(err.to_string())
    }
}
