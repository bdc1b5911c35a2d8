//! # tidewire CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Start a server with defaults, a config file, or a bind override
//! tidewire serve
//! tidewire serve -c tidewire.toml -b 0.0.0.0:8080
//!
//! # Make an RPC call (outputs raw JSON)
//! tidewire call http://127.0.0.1:8080 echo -a '{"msg": "hi"}'
//! tidewire call --stream http://127.0.0.1:8080 _info
//!
//! # Print a handshake token
//! tidewire token http://127.0.0.1:8080
//!
//! # Print an example config file
//! tidewire config > tidewire.toml
//! ```
//!
//! All server URLs must include the `http://` or `https://` prefix.

use anyhow::Result;
use argh::FromArgs;
use tidewire_client::{RpcClient, StreamClient};
use tidewire_common::TidewireConfig;
use tidewire_server::RpcServer;

/// Validates that a URL string starts with http:// or https://
fn validate_http_url(url: &str, description: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Invalid {}: '{}' must start with http:// or https://",
            description,
            url
        ))
    }
}

/// Maps an http(s) base URL onto the ws(s) URL of the stream endpoint.
fn stream_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws}{path}")
}

#[derive(FromArgs)]
/// tidewire - authenticated, rate-limited RPC over WebSocket and HTTP
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Token(TokenArgs),
    Config(ConfigArgs),
}

/// Arguments for running a server.
///
/// Settings come from the config file when given, then `TIDEWIRE_*`
/// environment variables, then `--bind`.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// start a tidewire server
struct ServeArgs {
    /// path to a TOML config file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// address to bind to, overriding the config
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

/// Arguments for making a single RPC call.
///
/// The result is printed as raw JSON on stdout so it can be piped into
/// other tools. Errors go to stderr with a non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call an RPC method on a server
struct CallArgs {
    /// address of the server, e.g. http://127.0.0.1:8080
    #[argh(positional)]
    server_address: String,

    /// name of the method to call
    #[argh(positional)]
    method: String,

    /// JSON arguments for the method, defaults to `{}`
    #[argh(option, short = 'a', long = "args", default = "\"{}\".into()")]
    args: String,

    /// send the call over a stream connection instead of HTTP
    #[argh(switch)]
    stream: bool,

    /// stream endpoint path, used with --stream
    #[argh(option, default = "\"/rpc\".into()")]
    stream_path: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "token")]
/// fetch a handshake token from a server
struct TokenArgs {
    /// address of the server, e.g. http://127.0.0.1:8080
    #[argh(positional)]
    server_address: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "config")]
/// print an example configuration file
struct ConfigArgs {}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep stdout clean for commands whose output is piped.
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Call(args) => run_call(args).await,
        Commands::Token(args) => {
            validate_http_url(&args.server_address, "server address")?;
            let client = RpcClient::new(&args.server_address)?;
            println!("{}", client.fetch_token().await?);
            Ok(())
        }
        Commands::Config(_) => {
            print!("{}", TidewireConfig::example_config());
            Ok(())
        }
    }
}

fn load_config(args: &ServeArgs) -> Result<TidewireConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config from {}", path);
            TidewireConfig::from_file(path)?
        }
        None => TidewireConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    Ok(config)
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", config.bind_address, e))?;

    tracing::info!(
        "Limits: {} connections per IP, {} messages per {}ms window",
        config.max_connections_per_ip,
        config.max_messages_per_window,
        config.rate_limit_window_ms
    );

    let server = RpcServer::new(config)?;
    tidewire_cli::register_builtin_methods(&server.registry()).await;
    server.run(addr).await?;
    Ok(())
}

/// Executes the `call` subcommand and prints the raw JSON result.
async fn run_call(args: CallArgs) -> Result<()> {
    validate_http_url(&args.server_address, "server address")?;

    let args_value: serde_json::Value = serde_json::from_str(&args.args)
        .map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;

    let client = RpcClient::new(&args.server_address)?;
    let result = if args.stream {
        let token = client.fetch_token().await?;
        let url = stream_url(client.base_url(), &args.stream_path);
        let stream = StreamClient::connect(&url, &token).await?;
        let result = stream.call_json(&args.method, args_value).await;
        stream.close().await?;
        result?
    } else {
        client.call(&args.method, args_value).await?
    };

    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
