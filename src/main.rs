use mcp_gateway_client::{
    config::ClientConfig,
    error::{AppError, AppResult},
    initialize_logging,
    mcp::{Envelope, Session},
};
use serde_json::Value;
use std::{env, path::PathBuf, process, time::Instant};
use tracing::{debug, error, info};

/// Parsed command line
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config_path: Option<PathBuf>,
    gateway: bool,
    health: bool,
    tool: Option<String>,
    arguments: Option<String>,
}

#[tokio::main]
async fn main() {
    // Parse command line arguments first (before logging to avoid noise)
    let args: Vec<String> = env::args().skip(1).collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        process::exit(0);
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        process::exit(0);
    }

    if let Err(e) = initialize_logging() {
        eprintln!("warning: logging disabled: {}", e);
    }

    if let Err(e) = run(&args).await {
        error!("{}", e);
        eprintln!("error: {}", e);
        process::exit(e.exit_code());
    }
}

async fn run(args: &[String]) -> AppResult<()> {
    let cli = parse_args(args)?;
    debug!("Command line: {:?}", cli);

    let mut config = match &cli.config_path {
        Some(path) => ClientConfig::load_from_file(path)?,
        None => ClientConfig::load()?,
    };
    if cli.gateway {
        config.mode = Envelope::Gateway;
    }

    if cli.health {
        let session = Session::new(config)?;
        if session.health_check().await? {
            println!("healthy");
            return Ok(());
        }
        println!("unhealthy");
        return Err(AppError::application("Gateway health check failed"));
    }

    let tool = cli
        .tool
        .or_else(|| config.default_tool.clone())
        .ok_or_else(|| AppError::application("No tool given; pass TOOL or set MCP_CALL_TOOL"))?;
    let arguments: Value = match &cli.arguments {
        Some(raw) => serde_json::from_str(raw)?,
        None => config.default_arguments.clone(),
    };

    info!("Calling '{}' on {}", tool, config.endpoint);
    let started = Instant::now();
    let name = tool.clone();
    let result = Session::scoped(config, move |session| async move {
        session.call_tool(&name, arguments).await
    })
    .await?;
    info!("Tool call finished in {:?}", started.elapsed());

    match result.first_text() {
        Some(text) => println!("{}", text),
        None => println!("{}", serde_json::to_string_pretty(&result.content)?),
    }

    if result.is_error {
        return Err(AppError::application(format!("Tool '{}' reported an error", tool)));
    }
    Ok(())
}

fn parse_args(args: &[String]) -> AppResult<CliArgs> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--gateway" => cli.gateway = true,
            "--health" => cli.health = true,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::application("--config requires a path"))?;
                cli.config_path = Some(PathBuf::from(path));
            }
            other if other.starts_with("--config=") => {
                cli.config_path = Some(PathBuf::from(&other["--config=".len()..]));
            }
            other if other.starts_with('-') && other.len() > 1 => {
                return Err(AppError::application(format!("Unknown option: {}", other)));
            }
            positional => {
                if cli.tool.is_none() {
                    cli.tool = Some(positional.to_string());
                } else if cli.arguments.is_none() {
                    cli.arguments = Some(positional.to_string());
                } else {
                    return Err(AppError::application(format!(
                        "Unexpected argument: {}",
                        positional
                    )));
                }
            }
        }
    }

    Ok(cli)
}

fn print_help() {
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    println!("{}", env!("CARGO_PKG_DESCRIPTION"));
    println!();
    println!("USAGE:");
    println!("    mcp-call [OPTIONS] [TOOL] [ARGS_JSON]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help           Print this help message and exit");
    println!("    -V, --version        Print version information and exit");
    println!("        --gateway        Use the plain gateway envelope instead of JSON-RPC");
    println!("        --config <PATH>  Read configuration from PATH");
    println!("        --health         Probe the gateway health endpoint and exit");
    println!();
    println!("ENVIRONMENT:");
    println!("    MCP_HOST             Gateway endpoint (default http://localhost:8811/mcp)");
    println!("    MCP_CALL_TOOL        Tool called when TOOL is omitted");
    println!("    MCP_CALL_TOOL_ARGS   JSON arguments used when ARGS_JSON is omitted");
    println!("    MCP_MODE             Envelope: session or gateway");
    println!("    RUST_LOG             Set logging level (debug, info, warn, error)");
    println!();
    println!("EXAMPLES:");
    println!("    mcp-call search '{{\"query\": \"Docker\"}}'");
    println!("    mcp-call --gateway query '{{\"sql\": \"SELECT datname FROM pg_database;\"}}'");
    println!(
        "    MCP_CALL_TOOL=fetch MCP_CALL_TOOL_ARGS='{}' mcp-call",
        r#"{"url": "https://example.org"}"#
    );
}
