//! wsmc - carry game connections over WebSocket

mod config;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::{ConnectOverrides, FileConfig, ServeOverrides, TunnelOverrides};
use wsmc_client::{ClientError, StatusLog, TunnelClient};
use wsmc_proto::ServerAddress;
use wsmc_server::TunnelServer;

/// wsmc - tunnel game connections through WebSocket-capable proxies
#[derive(Parser, Debug)]
#[command(name = "wsmc")]
#[command(about = "Tunnel game connections over WebSocket", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "WSMC_LOG_LEVEL")]
    log_level: Option<String>,

    /// YAML configuration file
    #[arg(short, long, global = true, env = "WSMC_CONFIG")]
    config: Option<PathBuf>,

    /// Runtime worker threads (defaults to the number of cores)
    #[arg(long, global = true)]
    worker_threads: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept legacy and WebSocket clients and relay them to a game server
    Serve(ServeArgs),

    /// Tunnel local game clients through a WebSocket connection string
    Connect(ConnectArgs),

    /// Show how a connection string is interpreted
    Parse {
        /// Connection string, e.g. wss://sni@proxy.example:443/mc.example
        connection: String,

        /// Print the descriptor as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Largest accepted WebSocket frame payload in bytes
    #[arg(long)]
    max_frame_payload: Option<usize>,

    /// Hex-dump every payload at trace level
    #[arg(long)]
    dump_bytes: bool,
}

impl From<&TunnelArgs> for TunnelOverrides {
    fn from(args: &TunnelArgs) -> Self {
        Self {
            max_frame_payload_length: args.max_frame_payload,
            dump_bytes: args.dump_bytes,
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Primary listen address (legacy and WebSocket)
    #[arg(short, long, env = "WSMC_BIND")]
    bind: Option<SocketAddr>,

    /// Game server the primary stream is relayed to
    #[arg(long, env = "WSMC_BACKEND")]
    backend: Option<String>,

    /// Only accept upgrades for this request target
    #[arg(long)]
    endpoint: Option<String>,

    /// Refuse connections that are not WebSocket upgrades
    #[arg(long)]
    disable_legacy: bool,

    /// Ignore multiplexing requests from clients
    #[arg(long)]
    no_multiplexing: bool,

    /// Directory of <hostname>.crt/<hostname>.key pairs for the secure listener
    #[arg(long, env = "WSMC_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Secure listener address
    #[arg(long)]
    secure_bind: Option<SocketAddr>,

    #[command(flatten)]
    tunnel: TunnelArgs,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Connection string, e.g. wss://sni@proxy.example:443/mc.example
    connection: String,

    /// Local address game clients connect to
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Accept any server certificate
    #[arg(long)]
    insecure: bool,

    /// Refuse plain host:port connection strings
    #[arg(long)]
    disable_legacy: bool,

    /// Write the connection status history to this JSON file
    #[arg(long)]
    status_file: Option<PathBuf>,

    #[command(flatten)]
    tunnel: TunnelArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let log_level = cli
        .log_level
        .clone()
        .or_else(|| file.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_logging(&log_level)?;

    if let Commands::Parse { connection, json } = &cli.command {
        return print_parsed(connection, *json);
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    match cli.worker_threads.or(file.worker_threads) {
        Some(0) => anyhow::bail!("--worker-threads must be greater than zero"),
        Some(threads) => {
            builder.worker_threads(threads);
        }
        None => {}
    }
    let runtime = builder.build().context("Failed to build async runtime")?;

    runtime.block_on(async move {
        match cli.command {
            Commands::Serve(args) => run_serve(&file, args).await,
            Commands::Connect(args) => run_connect(&file, args).await,
            Commands::Parse { .. } => Ok(()),
        }
    })
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

fn print_parsed(connection: &str, json: bool) -> Result<()> {
    let address = ServerAddress::parse(connection)
        .ok_or_else(|| anyhow!("Not a valid connection string: {}", connection))?;

    match address.descriptor() {
        Some(descriptor) if json => {
            let rendered =
                serde_json::to_string_pretty(descriptor).context("Failed to render descriptor")?;
            println!("{}", rendered);
        }
        Some(descriptor) => {
            println!("{}", descriptor);
            println!("Dial: {}", descriptor.dial_address());
        }
        None => println!("plain connection to {}", address.dial_address()),
    }
    Ok(())
}

async fn run_serve(file: &FileConfig, args: ServeArgs) -> Result<()> {
    let overrides = ServeOverrides {
        bind: args.bind,
        backend: args.backend,
        endpoint: args.endpoint,
        disable_legacy: args.disable_legacy,
        no_multiplexing: args.no_multiplexing,
        secure_bind: args.secure_bind,
        cert_dir: args.cert_dir,
        tunnel: TunnelOverrides::from(&args.tunnel),
    };
    let config = file.server_config(&overrides)?;

    info!("🚀 Starting wsmc server {}", env!("GIT_TAG"));
    info!("Backend: {}", config.backend_addr);
    if let Some(endpoint) = &config.endpoint {
        info!("Endpoint: {}", endpoint);
    }
    if config.disable_legacy {
        info!("Legacy connections are disabled");
    }

    let server = TunnelServer::new(config);
    let registry = server.registry();
    let listener = server.bind().await.context("Failed to start server")?;

    tokio::select! {
        result = server.serve(listener) => {
            if let Err(e) = result {
                error!("Server stopped unexpectedly: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down ({} active connections)", registry.len());
        }
    }

    Ok(())
}

async fn run_connect(file: &FileConfig, args: ConnectArgs) -> Result<()> {
    let overrides = ConnectOverrides {
        listen: args.listen,
        insecure: args.insecure,
        disable_legacy: args.disable_legacy,
        status_file: args.status_file,
        tunnel: TunnelOverrides::from(&args.tunnel),
    };
    let settings = file.connect_settings(&overrides)?;

    // Reject typos before any game client connects
    let address = ServerAddress::parse(&args.connection)
        .ok_or_else(|| anyhow!("Not a valid connection string: {}", args.connection))?;
    if address.is_vanilla() && settings.client.disable_legacy {
        return Err(ClientError::LegacyDisabled.into());
    }
    if settings.client.insecure_skip_verify {
        warn!("⚠️  Certificate verification is disabled");
    }

    let status = StatusLog::new();
    let client = Arc::new(TunnelClient::new(settings.client).with_status_log(status.clone()));
    let connection: Arc<str> = Arc::from(args.connection.as_str());
    let status_file: Option<Arc<PathBuf>> = settings.status_file.map(Arc::new);

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.listen))?;
    info!("Listening for game clients on {}", settings.listen);
    info!("Tunnelling to {}", address.dial_address());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept local connection: {}", e);
                        continue;
                    }
                };

                let client = client.clone();
                let connection = connection.clone();
                let status_file = status_file.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay_local(&client, &connection, socket, peer).await {
                        error!("Connection from {} failed: {:#}", peer, e);
                    }
                    if let Some(path) = status_file {
                        save_status(client.status(), &path);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    if let Some(path) = &status_file {
        save_status(&status, path);
    }
    Ok(())
}

/// Carry one local game connection, resolving the connection string afresh
async fn relay_local(
    client: &TunnelClient,
    connection: &str,
    mut socket: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let _ = socket.set_nodelay(true);

    let address = ServerAddress::parse(connection)
        .ok_or_else(|| anyhow!("Not a valid connection string: {}", connection))?;

    match address.descriptor() {
        Some(descriptor) => {
            debug!("Tunnelling {} via {}", peer, descriptor.target_uri());
            let session = client.connect(descriptor.clone()).await?;
            let (reader, writer) = socket.into_split();
            let stats = session.run(reader, writer).await?;
            debug!(
                "Tunnel for {} finished (sent={} received={})",
                peer, stats.bytes_sent, stats.bytes_received
            );
        }
        None => {
            if client.config().disable_legacy {
                return Err(ClientError::LegacyDisabled.into());
            }
            let target = address.dial_address();
            debug!("Relaying {} directly to {}", peer, target);
            let mut upstream = TcpStream::connect(&target)
                .await
                .with_context(|| format!("Failed to connect to {}", target))?;
            let _ = upstream.set_nodelay(true);
            let (sent, received) = tokio::io::copy_bidirectional(&mut socket, &mut upstream)
                .await
                .context("Direct relay failed")?;
            debug!(
                "Direct relay for {} finished (sent={} received={})",
                peer, sent, received
            );
        }
    }
    Ok(())
}

fn save_status(status: &StatusLog, path: &Path) {
    if let Err(e) = status.save(path) {
        warn!("Failed to write status file {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::try_parse_from([
            "wsmc",
            "--log-level",
            "debug",
            "serve",
            "--backend",
            "127.0.0.1:25566",
            "--endpoint",
            "/mc",
            "--no-multiplexing",
            "--max-frame-payload",
            "4096",
        ])
        .unwrap();

        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.backend.as_deref(), Some("127.0.0.1:25566"));
                assert_eq!(args.endpoint.as_deref(), Some("/mc"));
                assert!(args.no_multiplexing);
                assert!(!args.disable_legacy);
                assert_eq!(args.tunnel.max_frame_payload, Some(4096));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_connect_flags() {
        let cli = Cli::try_parse_from([
            "wsmc",
            "connect",
            "wss://front.example@edge.example/mc",
            "--listen",
            "127.0.0.1:25570",
            "--insecure",
            "--worker-threads",
            "2",
        ])
        .unwrap();

        assert_eq!(cli.worker_threads, Some(2));
        match cli.command {
            Commands::Connect(args) => {
                assert_eq!(args.connection, "wss://front.example@edge.example/mc");
                assert_eq!(args.listen.unwrap().port(), 25570);
                assert!(args.insecure);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_command_rejects_garbage() {
        assert!(print_parsed("ws://", false).is_err());
        assert!(print_parsed("mc.example.com:25565", false).is_ok());
    }
}
