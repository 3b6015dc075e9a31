//! Error types for Mailhook

use thiserror::Error;

/// Main error type for Mailhook
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias for Mailhook
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::Validation("bad address".to_string()).to_string(),
            "Validation error: bad address"
        );
    }
}
