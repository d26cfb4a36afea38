use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use perch::gateway::{
    bridge_stream, BridgeMessage, ClientOptions, EventFrame, GatewayClient, StreamBridge,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "Perch CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the browser-facing server (health, RPC passthrough, per-conversation SSE streams).
    Serve {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 3210)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Send one request to the gateway and print the response payload as JSON.
    Rpc {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Gateway method, e.g. "health" or "chat.send".
        method: String,

        /// Request params as a JSON document (default: {}).
        params: Option<String>,

        /// Request timeout in milliseconds (default from config).
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Print gateway events until Ctrl+C. With a session key, print the stream
    /// messages a browser would receive for that conversation.
    Watch {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        session_key: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Serve { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match cli.command {
        Some(Commands::Version) => {
            println!("perch {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Rpc {
            config,
            method,
            params,
            timeout_ms,
        }) => {
            if let Err(e) = run_rpc(config, method, params, timeout_ms).await {
                eprintln!("rpc failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Watch {
            config,
            session_key,
        }) => {
            if let Err(e) = run_watch(config, session_key).await {
                eprintln!("watch failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn client_from(config_path: Option<PathBuf>) -> anyhow::Result<(perch::config::Config, GatewayClient)> {
    let (config, path) = perch::config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    let options = ClientOptions::from_config(&config)?;
    Ok((config, GatewayClient::new(options)))
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, _) = perch::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting server on {}:{} (gateway {})",
        config.server.bind,
        config.server.port,
        perch::config::resolve_gateway_url(&config)
    );
    perch::server::run_server(config).await
}

async fn run_rpc(
    config_path: Option<PathBuf>,
    method: String,
    params: Option<String>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let params: serde_json::Value = match params {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("params must be JSON: {}", e))?,
        None => serde_json::json!({}),
    };
    let (_, client) = client_from(config_path)?;
    let result = client
        .rpc(&method, params, timeout_ms.map(Duration::from_millis))
        .await;
    client.destroy();
    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn print_event(event: &EventFrame) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => log::warn!("unprintable event {}: {}", event.name, e),
    }
}

/// Write each message as a JSON line until the stream ends or `stop` completes.
/// Returns how many messages were written.
async fn print_until<S, F, W>(mut stream: S, stop: F, mut out: W) -> anyhow::Result<usize>
where
    S: futures_util::Stream<Item = BridgeMessage> + Unpin,
    F: std::future::Future,
    W: std::io::Write,
{
    tokio::pin!(stop);
    let mut written = 0;
    loop {
        tokio::select! {
            _ = &mut stop => break,
            next = stream.next() => match next {
                Some(message) => {
                    writeln!(out, "{}", serde_json::to_string(&message)?)?;
                    written += 1;
                }
                None => break,
            },
        }
    }
    Ok(written)
}

async fn run_watch(config_path: Option<PathBuf>, session_key: Option<String>) -> anyhow::Result<()> {
    let (config, client) = client_from(config_path)?;
    client.ensure_connected().await?;

    match session_key {
        Some(key) => {
            let (bridge, rx) = StreamBridge::channel(client.router(), key);
            let stream = Box::pin(bridge_stream(
                bridge,
                rx,
                config.server.stream_idle_timeout(),
            ));
            print_until(stream, tokio::signal::ctrl_c(), std::io::stdout()).await?;
        }
        None => {
            let _subscription = client.subscribe_all(print_event);
            let _ = tokio::signal::ctrl_c().await;
        }
    }

    client.destroy();
    Ok(())
}
