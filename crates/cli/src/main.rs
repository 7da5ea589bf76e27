mod device_commands;

use std::{sync::Arc, time::Duration};

use {
    anyhow::Context,
    castle_chat::{
        ChatSession, MessageStore, OrphanRegistry, RunUpdate, SessionOptions, SqliteMessageStore,
    },
    castle_config::CastleConfig,
    castle_gateway::{
        ClientOptions, ConnectionState, CredentialResolver, DeviceIdentity, GatewayClient,
        GatewayEvent,
    },
    clap::{Parser, Subcommand},
    sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "castle", about = "Castle, a client for the OpenClaw gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway url, overriding config and `OPENCLAW_GATEWAY_URL`.
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and print state changes and gateway events until Ctrl-C.
    Connect,
    /// Issue one RPC and print its payload.
    Call {
        method: String,
        /// JSON params.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Per-request timeout in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send a chat message and follow the run until it finishes.
    Chat {
        #[arg(short, long)]
        message: String,
        #[arg(long)]
        session_key: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Device identity management.
    Device {
        #[command(subcommand)]
        action: device_commands::DeviceAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "castle starting");

    let mut config = castle_config::discover_and_load();
    if let Some(url) = cli.url {
        config.gateway.url = url;
    }

    match cli.command {
        Commands::Connect => connect(&config).await,
        Commands::Call {
            method,
            params,
            timeout_ms,
        } => call(&config, &method, &params, timeout_ms).await,
        Commands::Chat {
            message,
            session_key,
            agent,
        } => chat(&config, &message, session_key, agent).await,
        Commands::Device { action } => device_commands::handle_device(action, &config),
    }
}

// ── Client bootstrap ─────────────────────────────────────────────────────────

fn build_client(config: &CastleConfig) -> anyhow::Result<GatewayClient> {
    let resolver = CredentialResolver::standard(
        device_commands::token_store(config)?,
        config.gateway.token.clone(),
    );
    let identity = if config.gateway.device_auth {
        let path = device_commands::identity_path(config)?;
        match DeviceIdentity::load_or_create(&path) {
            Ok(identity) => Some(Arc::new(identity)),
            Err(e) => {
                warn!(error = %e, "device identity unavailable, continuing token-only");
                None
            },
        }
    } else {
        None
    };
    Ok(GatewayClient::spawn(
        ClientOptions::from_config(&config.gateway),
        resolver,
        identity,
    ))
}

/// Start the client and wait until it connects or gives up.
async fn connected_client(config: &CastleConfig) -> anyhow::Result<GatewayClient> {
    let client = build_client(config)?;
    client.start();
    let state = client
        .wait_for_state(|s| matches!(s, ConnectionState::Connected | ConnectionState::Error))
        .await;
    if state == ConnectionState::Error {
        anyhow::bail!("could not connect to {}", config.gateway.url);
    }
    Ok(client)
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn connect(config: &CastleConfig) -> anyhow::Result<()> {
    let client = build_client(config)?;
    let mut events = client.subscribe();
    client.start();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&client, &event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    client.stop().await;
    let stats = client.stats();
    info!(
        frames = stats.frames_received,
        oversized = stats.frames_oversized,
        unparseable = stats.frames_unparseable,
        reconnects = stats.reconnects_scheduled,
        "disconnected"
    );
    Ok(())
}

fn print_event(client: &GatewayClient, event: &GatewayEvent) {
    match event {
        GatewayEvent::StateChange { from, to } => {
            println!("state {from} -> {to}");
            if *to == ConnectionState::Connected
                && let Some(server) = client.server_info()
            {
                println!(
                    "server {} (protocol {}, conn {})",
                    server.version.as_deref().unwrap_or("unknown"),
                    server.protocol.map_or_else(|| "?".into(), |p| p.to_string()),
                    server.conn_id.as_deref().unwrap_or("?"),
                );
            }
        },
        GatewayEvent::Gateway(frame) => println!("event {} {}", frame.event, frame.payload),
        GatewayEvent::PairingRequired(payload) => {
            println!("pairing required, approve this device on the gateway: {payload}");
        },
        GatewayEvent::PairingApproved { device_id } => {
            println!(
                "pairing approved for {}",
                device_id.as_deref().unwrap_or("this device")
            );
        },
        GatewayEvent::AuthError { message } => println!("auth error: {message}"),
    }
}

async fn call(
    config: &CastleConfig,
    method: &str,
    params: &str,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let params: serde_json::Value = serde_json::from_str(params).context("--params is not JSON")?;
    let client = connected_client(config).await?;
    let result = match timeout_ms {
        Some(ms) => {
            client
                .request_with_timeout(method, params, Duration::from_millis(ms))
                .await
        },
        None => client.request(method, params).await,
    };
    client.stop().await;
    if let Err(e) = &result
        && e.is_retryable()
    {
        warn!(%method, error = %e, "request failed, retrying may succeed");
    }
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

async fn chat(
    config: &CastleConfig,
    message: &str,
    session_key: Option<String>,
    agent: Option<String>,
) -> anyhow::Result<()> {
    let store: Arc<dyn MessageStore> = Arc::new(open_store(config).await?);
    let client = connected_client(config).await?;
    let orphans = OrphanRegistry::new(
        client.bus().clone(),
        Arc::clone(&store),
        Duration::from_millis(config.chat.orphan_ttl_ms),
    );

    let mut options = SessionOptions::from_config(&config.chat);
    if let Some(key) = session_key {
        options.session_key = key;
    }
    if let Some(agent) = agent {
        options.agent_name = agent.clone();
        options.agent_id = agent;
    }

    let (mut session, mut updates) = ChatSession::new(client.clone(), store, orphans, options);
    let run_id = session.send(message).await?;
    info!(%run_id, "waiting for reply");

    let printer = tokio::spawn(async move {
        let mut printed = 0;
        while let Some(update) = updates.recv().await {
            match update {
                RunUpdate::Updated(snapshot) => {
                    if let Some(tail) = snapshot.content.get(printed..) {
                        print!("{tail}");
                        printed = snapshot.content.len();
                    }
                },
                RunUpdate::Removed { status, .. } => {
                    println!();
                    info!(%status, "run finished");
                },
                RunUpdate::Error { message, .. } => eprintln!("\nrun failed: {message}"),
                RunUpdate::Started(_) | RunUpdate::AgentThinking { .. } => {},
            }
        }
    });

    session.run_until_idle().await;
    session.close().await;
    client.stop().await;
    let _ = printer.await;
    Ok(())
}

async fn open_store(config: &CastleConfig) -> anyhow::Result<SqliteMessageStore> {
    let path = config
        .chat
        .database_path
        .clone()
        .unwrap_or_else(|| castle_config::data_dir().join("castle.db"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    SqliteMessageStore::init(&pool).await?;
    Ok(SqliteMessageStore::new(pool))
}

#[cfg(test)]
mod tests {
    use {super::*, clap::CommandFactory};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn call_params_default_to_empty_object() {
        let cli = Cli::parse_from(["castle", "call", "status"]);
        match cli.command {
            Commands::Call { method, params, .. } => {
                assert_eq!(method, "status");
                assert_eq!(params, "{}");
            },
            _ => panic!("expected call"),
        }
    }
}
