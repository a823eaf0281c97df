//! Error types for Signloom

use thiserror::Error;

/// Result type alias using Signloom's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Signloom error types with helpful messages
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors (E100-E199)
    #[error("No route registered for '{0}'. Register a handler before dispatching.")]
    RouteNotFound(String),

    #[error("Circuit open for route '{route}'. Retry after {retry_after_ms} ms.")]
    CircuitOpen { route: String, retry_after_ms: u64 },

    // Execution errors (E200-E299)
    #[error("Attempt timed out after {0} ms")]
    Timeout(u64),

    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    // Cache errors (E300-E399)
    #[error("Cache operation failed: {0}")]
    Cache(String),

    // Config errors (E400-E499)
    #[error("Configuration error: {0}")]
    Config(String),

    // Input errors (E500-E599)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Lifecycle errors (E600-E699)
    #[error("Dispatcher is shutting down; no new requests accepted")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotFound(_) => "E100",
            Self::CircuitOpen { .. } => "E101",
            Self::Timeout(_) => "E200",
            Self::Handler { .. } => "E201",
            Self::Cache(_) => "E300",
            Self::Config(_) => "E400",
            Self::InvalidRequest(_) => "E500",
            Self::ShuttingDown => "E600",
            Self::Io(_) => "E900",
        }
    }

    /// Whether the dispatcher may retry the failed attempt.
    ///
    /// Route resolution and circuit rejections are terminal for the current
    /// call; timeouts and handler failures go back through the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Handler { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::RouteNotFound("translate:text".into()).code(), "E100");
        assert_eq!(
            Error::CircuitOpen {
                route: "translate:text".into(),
                retry_after_ms: 500
            }
            .code(),
            "E101"
        );
        assert_eq!(Error::Timeout(100).code(), "E200");
        assert_eq!(Error::ShuttingDown.code(), "E600");
    }

    #[test]
    fn test_retryability() {
        assert!(Error::Timeout(100).is_retryable());
        assert!(
            Error::Handler {
                handler: "translator".into(),
                message: "boom".into()
            }
            .is_retryable()
        );
        assert!(!Error::RouteNotFound("x".into()).is_retryable());
        assert!(
            !Error::CircuitOpen {
                route: "x".into(),
                retry_after_ms: 1
            }
            .is_retryable()
        );
        assert!(!Error::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_display_mentions_route() {
        let err = Error::RouteNotFound("translate:text".into());
        assert!(err.to_string().contains("translate:text"));
    }
}
