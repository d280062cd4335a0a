//! vpn-rest Client Binary
//!
//! Drives the REST control channel of a WireGuard VPN session server from the
//! command line: token refresh, connect, disconnect and filter updates.

use base64::{engine::general_purpose, Engine};
use log::{debug, error, info, warn};
use std::env;
use std::net::IpAddr;
use std::process;
use tokio::signal;
use vpn_rest::{Config, ConnectResponse, RestClient, RestError, Result};

enum Command {
    Token,
    Connect(Vec<u8>),
    Disconnect(Vec<u8>),
    Filter,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        process::exit(if args.len() > 1 && args[1].starts_with('-') { 0 } else { 1 });
    }

    let config = match Config::from_file(&args[1]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {e}", args[1]);
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting vpn-rest v{}", vpn_rest::VERSION);
    debug!("Loaded configuration from: {}", args[1]);

    let command = match parse_command(&args[2..]) {
        Ok(command) => command,
        Err(e) => {
            error!("{e}");
            print_usage();
            process::exit(1);
        }
    };

    let result = tokio::select! {
        result = run(config, command) => result,
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}

fn parse_command(args: &[String]) -> Result<Command> {
    let decode = |label: &str, value: Option<&String>| -> Result<Vec<u8>> {
        let value = value.ok_or_else(|| RestError::Config(format!("missing {label}")))?;
        general_purpose::STANDARD
            .decode(value.trim())
            .map_err(|e| RestError::Config(format!("{label} is not valid base64: {e}")))
    };

    match args[0].as_str() {
        "token" => Ok(Command::Token),
        "connect" => Ok(Command::Connect(decode("public key", args.get(1))?)),
        "disconnect" => Ok(Command::Disconnect(decode("session token", args.get(1))?)),
        "filter" => Ok(Command::Filter),
        other => Err(RestError::Config(format!("unknown command '{other}'"))),
    }
}

async fn run(config: Config, command: Command) -> Result<()> {
    let mut client = RestClient::new(config)?;

    match command {
        Command::Token => {
            client.resolve().await?;
            client.get_access_token().await
        }
        Command::Connect(public_key) => connect(&mut client, &public_key).await,
        Command::Disconnect(session_token) => {
            client.resolve().await?;
            client.disconnect(&session_token).await
        }
        Command::Filter => client.apply_filter().await,
    }
}

/// Connect, retrying transient failures until the server accepts the key
async fn connect(client: &mut RestClient, public_key: &[u8]) -> Result<()> {
    let reconnect_wait = client.config().reconnect_wait();

    let response = loop {
        match try_connect(client, public_key).await {
            Ok(response) => break response,
            Err(e) if e.is_retriable() => {
                warn!("Connect failed: {e}, retrying in {reconnect_wait:?}");
                tokio::time::sleep(reconnect_wait).await;
            }
            Err(e) => return Err(e),
        }
    };

    display_session(&response);

    if response.stale_access_token {
        let delay = client.config().access_token_update_delay();
        info!("Access token is stale, refreshing in {delay:?}");
        tokio::time::sleep(delay).await;
        client.get_access_token().await?;
    }
    Ok(())
}

async fn try_connect(client: &mut RestClient, public_key: &[u8]) -> Result<ConnectResponse> {
    let resolution = client.resolve().await?;
    if resolution.is_stale() {
        warn!("Using previous address {}", resolution.addr());
    }
    if !client.have_access_token() {
        client.get_access_token().await?;
    }
    client.connect(public_key).await
}

/// Display the negotiated session parameters
fn display_session(response: &ConnectResponse) {
    println!("\n=== Session Information ===");
    println!("Endpoint: {}", response.endpoint.socket_addr());
    println!(
        "Server Public Key: {}",
        general_purpose::STANDARD.encode(&response.public_key)
    );
    println!(
        "Persistent Keepalive: {:?}",
        response.persistent_keepalive()
    );
    println!("Allowed IPs: {}", list(&response.allowed_ips));
    println!("DNS Servers: {}", list(&response.dns));
    println!("Gateway: {}", list(&response.gateway));
    println!(
        "Session Token: {}",
        general_purpose::STANDARD.encode(&response.session_token)
    );
    println!();
}

fn list(ips: &[IpAddr]) -> String {
    ips.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        debug!("Received SIGTERM");
                    }
                    Err(e) => {
                        warn!("Cannot listen for SIGTERM: {e}");
                        futures::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                futures::future::pending::<()>().await;
            }
        } => {}
    }
}

/// Print usage information
fn print_usage() {
    println!("vpn-rest v{}", vpn_rest::VERSION);
    println!("REST control channel client for WireGuard VPN sessions");
    println!();
    println!("USAGE:");
    println!("    vpn-rest <CONFIG_FILE> <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    token                       Refresh the access token");
    println!("    connect <PUBLIC_KEY>        Request a session for a base64 WireGuard key");
    println!("    disconnect <SESSION_TOKEN>  Close the session for a base64 session token");
    println!("    filter                      Apply the configured filter policy");
    println!();
    println!("EXAMPLES:");
    println!("    vpn-rest /etc/vpn-rest/client.toml token");
    println!("    vpn-rest client.toml connect $(wg pubkey < private.key)");
}
