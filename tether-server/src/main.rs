//! Tether server: entry point.
//!
//! ```text
//! tether-server                  Run with ./tether-server.toml (or defaults)
//! tether-server --config <path>  Load a custom config TOML
//! tether-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_core::{
    Connection, FnCommand, PermissionGroup, PermissionLevel, Server, ServerConfig, ServerEvent,
    TetherError,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "Tether TCP server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-server.toml")]
    config: PathBuf,

    /// Override the configured bind address.
    #[arg(long)]
    ip: Option<String>,

    /// Override the configured port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Commands ─────────────────────────────────────────────────────

fn register_commands(server: &Server) {
    let commands = server.commands();
    commands.register_fn("ping", |_, _| Ok(Value::from("pong")));
    commands.register_fn("echo", |args, _| Ok(Value::Array(args.to_vec())));
    commands.register_fn("whoami", |_, executor| {
        let connection = executor.ok_or(TetherError::NotConnected)?;
        Ok(describe(connection))
    });

    let roster = server.downgrade();
    commands.register_command(
        "clients",
        FnCommand::new(move |_: &[Value], _: Option<&Connection>| {
            let server = roster.upgrade().ok_or(TetherError::InvalidState("server dropped"))?;
            Ok(server.connections().iter().map(describe).collect())
        })
        .with_permission(PermissionLevel::Admin),
    );
}

fn describe(connection: &Connection) -> Value {
    let level = connection
        .components()
        .get::<PermissionGroup>()
        .map(|group| group.level())
        .unwrap_or_default();
    json!({
        "id": connection.id(),
        "peer": connection.info().to_string(),
        "permission": level.to_string(),
    })
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(ip) = cli.ip {
        config.network.ip = ip;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-server v{}", env!("CARGO_PKG_VERSION"));
    info!("encryption: {}", if config.security.key.is_empty() { "off" } else { "on" });

    let maintenance = config.maintenance.clone();
    let server = Server::new(config);
    register_commands(&server);

    server.on(ServerEvent::ClientConnected, |event| async move {
        if let Some(connection) = event.connection {
            info!("client {} connected from {}", connection.id(), connection.info());
        }
    });
    server.on(ServerEvent::ClientDisconnected, |event| async move {
        if let Some(connection) = event.connection {
            info!("client {} disconnected", connection.id());
        }
    });

    if maintenance.commands {
        server.begin_receive_command();
    }
    if maintenance.heartbeat {
        server.begin_verify_client(maintenance.verify_interval())?;
    }
    if maintenance.ban_check {
        server.begin_check_banned_client(maintenance.ban_check_interval())?;
    }

    if let Err(e) = server.start_configured().await {
        error!("failed to start: {e}");
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    let report = server.stop(maintenance.stop_grace()).await;
    info!(
        "stopped: {} queued packets flushed, {} abandoned",
        report.flushed, report.abandoned
    );
    Ok(())
}
