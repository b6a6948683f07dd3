//! Token environment error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Required tool or module not found: {0}")]
    ResourceUnavailable(String),

    #[error("Token initialization failed: {0}")]
    TokenInitFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Key read failed: {0}")]
    KeyReadFailed(String),

    #[error("Command failed ({command}): {stderr}")]
    ToolFailed { command: String, stderr: String },

    #[error("Command timed out after {seconds}s: {command}")]
    Timeout { command: String, seconds: u64 },

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TokenError::ResourceUnavailable("libsofthsm2.so".to_string());
        assert!(err.to_string().contains("libsofthsm2.so"));

        let err = TokenError::ToolFailed {
            command: "pkcs11-tool --keypairgen".to_string(),
            stderr: "CKR_PIN_INCORRECT".to_string(),
        };
        assert!(err.to_string().contains("pkcs11-tool"));
        assert!(err.to_string().contains("CKR_PIN_INCORRECT"));

        let err = TokenError::Timeout {
            command: "softhsm2-util --init-token".to_string(),
            seconds: 120,
        };
        assert!(err.to_string().contains("120"));
        assert!(err.to_string().contains("softhsm2-util"));
    }

    #[test]
    fn test_error_variants_display() {
        let errors: Vec<TokenError> = vec![
            TokenError::ResourceUnavailable("missing".to_string()),
            TokenError::TokenInitFailed("init failed".to_string()),
            TokenError::KeyGenerationFailed("keygen failed".to_string()),
            TokenError::KeyReadFailed("read failed".to_string()),
            TokenError::AssertionFailed("bad output".to_string()),
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TokenError = io_err.into();
        assert!(matches!(err, TokenError::Io(_)));
    }
}
