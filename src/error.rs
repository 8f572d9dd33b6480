//! Error types for loadflow.

use thiserror::Error;

/// Result type alias for loadflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for loadflow.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors (malformed file, unsupported format).
    #[error("configuration error: {0}")]
    Config(String),

    /// Flow or config validation failure (spec §6, §8).
    #[error("validation error: {0}")]
    Validation(String),

    /// Transport-level network failure (connect/send/read).
    #[error("network error: {0}")]
    Network(String),

    /// HTTP request error from the underlying client.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// DNS resolution failure.
    #[error("DNS resolution failed for {hostname}: {error}")]
    DnsResolution {
        /// Hostname that failed to resolve
        hostname: String,
        /// Resolver error details
        error: String,
    },

    /// Operation timed out.
    #[error("operation timed out after {duration}")]
    Timeout {
        /// Timeout duration, formatted for display
        duration: String,
    },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics/Prometheus error.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),

    /// Generic error with added context.
    #[error("{context}: {source}")]
    WithContext {
        /// Context message
        context: String,
        /// Underlying error
        source: Box<Error>,
    },
}

impl From<prometheus::Error> for Error {
    fn from(err: prometheus::Error) -> Self {
        Error::Metrics(err.to_string())
    }
}

impl Error {
    /// Attaches additional context to an error.
    pub fn context<S: Into<String>>(self, context: S) -> Self {
        Error::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Creates a configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Error::Config(message.into())
    }

    /// Whether this error should abort the whole run rather than just the
    /// current request/iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Internal(_) | Error::Validation(_))
    }

    /// Whether a request that failed with this error is worth retrying, per
    /// the request executor's retry policy (spec §4.5): connect failures and
    /// timeouts are retryable, 4xx application errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout { .. } | Error::DnsResolution { .. } => true,
            Error::HttpRequest(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Adds `.context(...)` to any `Result<T, Error>`.
pub trait ResultExt<T> {
    /// Adds static context to the error.
    fn context<C: Into<String>>(self, context: C) -> Result<T>;

    /// Adds context computed lazily, only on error.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_context_wraps() {
        let err = Error::Config("bad field".to_string());
        let wrapped = err.context("loading container config");
        assert!(matches!(wrapped, Error::WithContext { .. }));
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(!Error::Validation("bad flow".to_string()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(Error::Internal("panic".to_string()).is_fatal());
        assert!(!Error::Network("timeout".to_string()).is_fatal());
    }
}
