//! Error handling for the MCP gateway client
//!
//! Protocol failures live in [`McpError`]; this module wraps them together
//! with the I/O and configuration failures of the surrounding application.

use thiserror::Error;

use crate::mcp::errors::McpError;

/// Application result type alias
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Main application error enum
#[derive(Error, Debug)]
pub enum AppError {
    /// Gateway session errors
    #[error(transparent)]
    Mcp(#[from] McpError),

    /// I/O operation errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// JSON errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// TOML encoding errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// Generic application errors
    #[error("Application error: {message}")]
    Application { message: String },
}

impl AppError {
    /// Create a new Application error
    pub fn application<S: Into<String>>(message: S) -> Self {
        Self::Application {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Mcp(err) => err.is_retryable(),
            AppError::Io(_) => false,
            AppError::Config(_) => false,
            AppError::Serde(_) => false,
            AppError::Toml(_) => false,
            AppError::Application { .. } => true,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AppError::Mcp(McpError::Cancelled { .. }) => ErrorSeverity::Low,
            AppError::Mcp(McpError::Configuration { .. }) => ErrorSeverity::Critical,
            AppError::Mcp(err) if err.closes_session() => ErrorSeverity::High,
            AppError::Mcp(_) => ErrorSeverity::Medium,
            AppError::Io(_) => ErrorSeverity::High,
            AppError::Config(_) => ErrorSeverity::Critical,
            AppError::Serde(_) => ErrorSeverity::Medium,
            AppError::Toml(_) => ErrorSeverity::Medium,
            AppError::Application { .. } => ErrorSeverity::Medium,
        }
    }

    /// Process exit code for the command-line caller
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) | AppError::Toml(_) => 78,
            AppError::Mcp(McpError::Configuration { .. } | McpError::Validation { .. }) => 64,
            AppError::Mcp(McpError::Transport { .. } | McpError::Handshake { .. }) => 69,
            _ => 1,
        }
    }
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Convert severity to string for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "LOW",
            ErrorSeverity::Medium => "MEDIUM",
            ErrorSeverity::High => "HIGH",
            ErrorSeverity::Critical => "CRITICAL",
        }
    }
}
