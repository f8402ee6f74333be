use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No endpoints configured for this pool.")]
    EmptyPool,

    #[error("Invalid configuration for {key}: {message}")]
    Config { key: String, message: String },

    #[error("Identity provider error: {message}")]
    Identity {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Service returned {status}: {message}")]
    Service {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid endpoint address: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn config(key: &str, message: impl ToString) -> Self {
        Self::Config {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn identity(message: impl ToString) -> Self {
        Self::Identity {
            message: message.to_string(),
            source: None,
        }
    }

    pub(crate) fn identity_from(
        message: impl ToString,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Identity {
            message: message.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether the error came back from the completion service itself.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self, Self::Service { .. })
    }
}
