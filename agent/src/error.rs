use thiserror::Error;

/// Problems with the agent's settings; these abort startup before any socket is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the '{0}' setting is required")]
    Missing( &'static str ),
    #[error("'{value}' is not a valid number for '{name}'")]
    InvalidNumber {
        name: &'static str,
        value: String
    },
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern {
        pattern: String,
        reason: String
    },
    #[error("invalid collector address '{0}'")]
    InvalidAddress( String ),
    #[error("'{name}' must not contain '|' (got '{value}')")]
    InvalidProjectField {
        name: &'static str,
        value: String
    },
    #[error("failed to start the agent: {0}")]
    Startup( String )
}
