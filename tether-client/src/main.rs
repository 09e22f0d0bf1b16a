//! Tether client: entry point.
//!
//! ```text
//! tether-client heartbeat                   Probe the server
//! tether-client command <name> [args..]     Run a remote command
//! tether-client http-get <url>              Fetch a base64 packet over HTTP
//! tether-client --gen-config                Write default config to stdout
//! ```

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tether_core::message::body_keys;
use tether_core::{Client, ClientConfig, Packet};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-client", about = "Tether command-line client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-client.toml")]
    config: PathBuf,

    /// Override the configured server address.
    #[arg(long)]
    ip: Option<String>,

    /// Override the configured server port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Send a heartbeat and wait for the pong.
    Heartbeat,
    /// Run a server command. Arguments are parsed as JSON, falling back to strings.
    Command { name: String, args: Vec<String> },
    /// GET a base64 packet from a URL and print it.
    HttpGet {
        url: String,
        /// Key the packet was sealed with; defaults to the configured key.
        #[arg(long)]
        key: Option<String>,
    },
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_packet(packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(packet)?);
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ClientConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ClientConfig::load(&cli.config);
    if let Some(ip) = cli.ip {
        config.network.ip = ip;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let timeout = config.network.request_timeout();
    let default_key = config.security.key.clone();
    let client = Client::new(config);

    let Some(action) = cli.action else {
        warn!("nothing to do; try `tether-client --help`");
        return Ok(());
    };

    match action {
        Action::HttpGet { url, key } => {
            let key = key.unwrap_or(default_key);
            match client.try_send_get(&url, &key).await {
                Some(packet) => print_packet(&packet)?,
                None => {
                    eprintln!("no packet at {url}");
                    std::process::exit(1);
                }
            }
        }
        Action::Heartbeat => {
            client.connect_configured().await?;
            let started = Instant::now();
            let reply = client.request(Packet::heartbeat(), timeout).await?;
            info!(
                "{} in {:?}",
                reply.body_str(body_keys::HEARTBEAT_MESSAGE).unwrap_or("<no reply body>"),
                started.elapsed()
            );
            client.disconnect().await;
        }
        Action::Command { name, args } => {
            client.connect_configured().await?;
            let args = args.iter().map(|raw| parse_arg(raw)).collect();
            let reply = client.request(Packet::command(&name, args), timeout).await?;
            match reply.body_str(body_keys::MESSAGE) {
                Some(message) if !message.is_empty() => eprintln!("{name}: {message}"),
                _ => {}
            }
            let result = reply
                .body_value(body_keys::COMMAND_RESPONSE)
                .cloned()
                .unwrap_or(Value::Null);
            println!("{}", serde_json::to_string_pretty(&result)?);
            client.disconnect().await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_as_json_when_possible() {
        assert_eq!(parse_arg("42"), Value::from(42));
        assert_eq!(parse_arg("[1,2]"), serde_json::json!([1, 2]));
        assert_eq!(parse_arg("hello"), Value::from("hello"));
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["tether-client", "-p", "9000", "command", "echo", "a", "1"]);
        assert_eq!(cli.port, Some(9000));
        match cli.action {
            Some(Action::Command { name, args }) => {
                assert_eq!(name, "echo");
                assert_eq!(args, vec!["a", "1"]);
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }
}
