//! MCP gateway client
//!
//! Client side of the session protocol spoken with an MCP gateway: open a
//! session, call named tools with JSON arguments, fold streamed events into a
//! single result and tear the session down.
//!
//! # Architecture
//!
//! - **Session**: lifecycle state machine and tool calls
//! - **Codec / event stream reader**: pure framing, no I/O
//! - **Transport**: HTTP exchange with the gateway
//! - **Configuration**: defaults, TOML file, `MCP_*` environment

pub mod config;
pub mod error;
pub mod mcp;

pub use config::ClientConfig;
pub use error::{AppError, AppResult};
pub use mcp::{McpError, McpResult, Session, ToolCallResult};

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the logging system with structured logging
///
/// Log levels come from `RUST_LOG`. Output goes to stderr so that tool
/// results on stdout stay machine-readable.
pub fn initialize_logging() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_gateway_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}
