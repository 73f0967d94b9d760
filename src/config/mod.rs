//! Configuration management module
//!
//! Client settings are layered, later layers winning:
//! - built-in defaults
//! - a TOML file (`./mcp-client.toml` or `<config_dir>/mcp-client/config.toml`)
//! - `MCP_*` environment variables

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};
use url::Url;

use crate::error::{AppError, AppResult};
use crate::mcp::{
    codec::Envelope,
    errors::{McpError, McpResult},
    protocol::{Implementation, ProtocolVersion},
    transport::TransportConfig,
};

/// Configuration file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "./mcp-client.toml";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "MCP";

/// Variable names understood by the gateway's example clients, mapped onto
/// configuration keys
const ENV_ALIASES: [(&str, &str); 3] = [
    ("MCP_HOST", "endpoint"),
    ("MCP_CALL_TOOL", "default_tool"),
    ("MCP_CALL_TOOL_ARGS", "default_arguments"),
];

/// Smallest accepted `max_message_size`
const MIN_MESSAGE_SIZE: usize = 1024;

/// Gateway client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Gateway endpoint URL
    pub endpoint: String,
    /// Request envelope spoken on the wire
    pub mode: Envelope,
    /// Extra headers sent with every request (e.g. `x-mcp-servers`)
    pub headers: HashMap<String, String>,
    /// TCP/TLS connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Time allowed until response headers arrive, in milliseconds
    pub request_timeout_ms: u64,
    /// Longest silence tolerated inside an event stream, in milliseconds
    pub read_timeout_ms: u64,
    /// Overall deadline of one tool call, in milliseconds
    pub call_timeout_ms: u64,
    /// Largest accepted body or single event, in bytes
    pub max_message_size: usize,
    /// Event name that ends a tool call's stream
    pub terminal_event: String,
    /// Protocol revision requested in the session handshake
    pub protocol_version: ProtocolVersion,
    /// Client identity sent in the session handshake
    pub client_info: Implementation,
    /// Tool invoked by [`crate::mcp::Session::call_default_tool`]
    pub default_tool: Option<String>,
    /// Arguments for the default tool: a table, or a JSON-encoded string
    pub default_arguments: Value,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8811/mcp".to_string(),
            mode: Envelope::default(),
            headers: HashMap::new(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            call_timeout_ms: 300_000,
            max_message_size: 4 * 1024 * 1024,
            terminal_event: crate::mcp::sse::TERMINAL_EVENT.to_string(),
            protocol_version: ProtocolVersion::default(),
            client_info: Implementation::default(),
            default_tool: None,
            default_arguments: Value::Object(Default::default()),
        }
    }
}

impl ClientConfig {
    /// Load configuration from default locations
    ///
    /// Search order for the file:
    /// 1. ./mcp-client.toml
    /// 2. ~/.config/mcp-client/config.toml
    ///
    /// Environment variables are applied on top in every case.
    pub fn load() -> AppResult<Self> {
        info!("Loading client configuration");

        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        let file = if local.is_file() {
            Some(local)
        } else {
            Self::get_user_config_path().filter(|path| path.is_file())
        };

        match &file {
            Some(path) => info!("Using configuration file {}", path.display()),
            None => debug!("No configuration file found, using defaults"),
        }

        Self::from_sources(file.as_deref(), None)
    }

    /// Load configuration from a specific file plus the process environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_sources(Some(path.as_ref()), None)
    }

    /// Build configuration from explicit sources
    ///
    /// `env` replaces the process environment when given.
    pub fn from_sources(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> AppResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            debug!("Reading configuration from: {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env.clone()),
        );

        for (var, key) in ENV_ALIASES {
            let value = match &env {
                Some(vars) => vars.get(var).cloned(),
                None => std::env::var(var).ok(),
            };
            if let Some(value) = value {
                debug!("Applying {} to {}", var, key);
                builder = builder.set_override(key, value)?;
            }
        }

        let mut config: ClientConfig = builder.build()?.try_deserialize()?;

        if let Value::String(encoded) = &config.default_arguments {
            config.default_arguments = serde_json::from_str(encoded).map_err(|e| {
                AppError::application(format!("default_arguments is not valid JSON: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> McpResult<()> {
        let url = Url::parse(&self.endpoint).map_err(|e| {
            McpError::configuration(format!("endpoint '{}' is not a URL: {}", self.endpoint, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::configuration(format!(
                "endpoint must use http or https, got '{}'",
                url.scheme()
            )));
        }

        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("read_timeout_ms", self.read_timeout_ms),
            ("call_timeout_ms", self.call_timeout_ms),
        ] {
            if value == 0 {
                return Err(McpError::configuration(format!("{} must be greater than 0", name)));
            }
        }

        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(McpError::configuration(format!(
                "max_message_size must be at least {} bytes",
                MIN_MESSAGE_SIZE
            )));
        }

        if self.terminal_event.trim().is_empty() {
            return Err(McpError::configuration("terminal_event cannot be empty"));
        }

        if !self.protocol_version.is_supported() {
            return Err(McpError::configuration(format!(
                "protocol_version {} is not supported",
                self.protocol_version
            )));
        }

        if !matches!(self.default_arguments, Value::Object(_) | Value::Null) {
            return Err(McpError::configuration(
                "default_arguments must be a JSON object",
            ));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Settings handed to the HTTP transport
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            endpoint: self.endpoint.clone(),
            connect_timeout: self.connect_timeout(),
            request_timeout: self.request_timeout(),
            max_message_size: self.max_message_size,
            headers: self.headers.clone(),
        }
    }

    /// Get user configuration file path
    fn get_user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut path| {
            path.push("mcp-client");
            path.push("config.toml");
            path
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_sources(None, env(&[])).unwrap();
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.mode, Envelope::Session);
        assert_eq!(config.terminal_event, "done");
    }

    #[test]
    fn test_gateway_example_variables() {
        let config = ClientConfig::from_sources(
            None,
            env(&[
                ("MCP_HOST", "http://gateway:8811/mcp"),
                ("MCP_CALL_TOOL", "search"),
                ("MCP_CALL_TOOL_ARGS", r#"{"query": "Docker"}"#),
                ("MCP_MODE", "gateway"),
            ]),
        )
        .unwrap();

        assert_eq!(config.endpoint, "http://gateway:8811/mcp");
        assert_eq!(config.default_tool.as_deref(), Some("search"));
        assert_eq!(config.default_arguments, json!({"query": "Docker"}));
        assert_eq!(config.mode, Envelope::Gateway);
    }

    #[test]
    fn test_file_then_environment() {
        let file = toml_file(
            r#"
endpoint = "http://file-host:8811/mcp"
mode = "gateway"
read_timeout_ms = 1500
default_tool = "query"

[headers]
x-mcp-servers = "postgres"

[default_arguments]
sql = "SELECT datname FROM pg_database;"
"#,
        );

        let config = ClientConfig::from_sources(
            Some(file.path()),
            env(&[("MCP_HOST", "http://env-host:8811/mcp"), ("MCP_READ_TIMEOUT_MS", "2500")]),
        )
        .unwrap();

        assert_eq!(config.endpoint, "http://env-host:8811/mcp");
        assert_eq!(config.mode, Envelope::Gateway);
        assert_eq!(config.read_timeout(), Duration::from_millis(2500));
        assert_eq!(config.headers.get("x-mcp-servers").map(String::as_str), Some("postgres"));
        assert_eq!(config.default_arguments["sql"], "SELECT datname FROM pg_database;");
    }

    #[test]
    fn test_invalid_arguments_json() {
        let err = ClientConfig::from_sources(None, env(&[("MCP_CALL_TOOL_ARGS", "{not json")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Application { .. }));

        let err = ClientConfig::from_sources(None, env(&[("MCP_CALL_TOOL_ARGS", "[1, 2]")]))
            .unwrap_err();
        assert!(matches!(err, AppError::Mcp(McpError::Configuration { .. })));
    }

    #[test]
    fn test_validation() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.endpoint = "gateway:8811".to_string();
        assert!(config.validate().is_err());

        let config = ClientConfig {
            call_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            terminal_event: " ".to_string(),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            protocol_version: ProtocolVersion::new("1999-01-01"),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_required_file() {
        let result = ClientConfig::from_sources(Some(Path::new("/nonexistent/mcp.toml")), env(&[]));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ClientConfig {
            endpoint: "https://gateway.internal/mcp".to_string(),
            default_tool: Some("fetch".to_string()),
            default_arguments: json!({"url": "https://example.org"}),
            ..ClientConfig::default()
        };
        config.save_to_file(&path).unwrap();

        let reloaded = ClientConfig::from_sources(Some(&path), env(&[])).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_transport_config() {
        let config = ClientConfig {
            request_timeout_ms: 1234,
            ..ClientConfig::default()
        };
        let transport = config.transport_config();
        assert_eq!(transport.endpoint, config.endpoint);
        assert_eq!(transport.request_timeout, Duration::from_millis(1234));
    }
}
