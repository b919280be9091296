//! Error types for voxcompose.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    Configuration { key: String, message: String },

    #[error("Configuration error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Backend errors surfaced outside the model client
    #[error("Request rejected by backend (HTTP {status}): {body}")]
    RequestRejected { status: u16, body: String },

    #[error("Model backend failed after {attempts} attempts: {last_error}")]
    TerminalFailure { attempts: u32, last_error: String },

    #[error("Unexpected response format: {message}")]
    ResponseFormat { message: String },

    // Pipeline errors
    #[error("Refinement failed for {range}: {source}")]
    Merge {
        /// Human-readable failed chunk range, e.g. "chunk 2" or "chunks 2-4".
        range: String,
        /// Zero-based indices of the failed chunks.
        failed: Vec<usize>,
        /// Last underlying chunk error.
        #[source]
        source: Box<VoxError>,
    },

    #[error("Refinement cancelled")]
    Cancelled,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxError {
    /// Shorthand for an invalid configuration value.
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        VoxError::Configuration {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = VoxError::ConfigFileNotFound {
            path: "/path/to/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/config.toml"
        );
    }

    #[test]
    fn test_configuration_display() {
        let error = VoxError::config("refine.overlap_size", "must be smaller than max_chunk_size");
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for refine.overlap_size: must be smaller than max_chunk_size"
        );
    }

    #[test]
    fn test_request_rejected_display() {
        let error = VoxError::RequestRejected {
            status: 401,
            body: "unauthorized".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Request rejected by backend (HTTP 401): unauthorized"
        );
    }

    #[test]
    fn test_terminal_failure_display() {
        let error = VoxError::TerminalFailure {
            attempts: 3,
            last_error: "HTTP 503".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Model backend failed after 3 attempts: HTTP 503"
        );
    }

    #[test]
    fn test_merge_display_names_range_and_last_error() {
        let error = VoxError::Merge {
            range: "chunk 2".to_string(),
            failed: vec![1],
            source: Box::new(VoxError::TerminalFailure {
                attempts: 3,
                last_error: "HTTP 500: boom".to_string(),
            }),
        };
        assert_eq!(
            error.to_string(),
            "Refinement failed for chunk 2: Model backend failed after 3 attempts: HTTP 500: boom"
        );
        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_cancelled_display() {
        assert_eq!(VoxError::Cancelled.to_string(), "Refinement cancelled");
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoxError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_error = toml::from_str::<toml::Value>("invalid = toml = syntax").unwrap_err();
        let error: VoxError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_source_chain_io() {
        let io_error = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let error: VoxError = io_error.into();

        let error_trait: &dyn std::error::Error = &error;
        assert!(error_trait.source().is_some());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoxError>();
        assert_sync::<VoxError>();
    }
}
