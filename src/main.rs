//! Auth Broker - authentication & authorization for a two-surface web application

use std::process::ExitCode;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use auth_broker::{
    broker::PrincipalDecoder,
    cli::{Cli, Command},
    config::Config,
    gateway::BrokerServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Decode { ref value }) => run_decode(&cli, value),
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {e}");
        ExitCode::from(e.exit_code())
    })
}

/// Decode a header value without verifying it
fn run_decode(cli: &Cli, value: &str) -> ExitCode {
    let value = value.trim();
    let value = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();

    let output = if value.matches('.').count() == 2 {
        match PrincipalDecoder::decode_bearer(value) {
            Ok(token) => json!({
                "kind": "bearer",
                "verified": false,
                "header": token.header,
                "claims": token.claims,
            }),
            Err(e) => {
                eprintln!("❌ {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        let config = match load_config(cli) {
            Ok(config) => config,
            Err(code) => return code,
        };
        match PrincipalDecoder::new(&config.providers).decode_proxy(value) {
            Ok(principal) => json!({
                "kind": "proxy",
                "principal": principal,
            }),
            Err(e) => {
                eprintln!("❌ {e}");
                return ExitCode::FAILURE;
            }
        }
    };

    match serde_json::to_string_pretty(&output) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Validate configuration and print the effective result
fn run_check_config(cli: &Cli) -> ExitCode {
    let mut config = match load_config(cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    // Never echo a literal secret; `env:VAR` references are fine to show.
    if let Some(secret) = config.delegation.client_secret.as_mut()
        && !secret.starts_with("env:")
    {
        *secret = "<redacted>".to_string();
    }

    match serde_yaml::to_string(&config) {
        Ok(yaml) => {
            println!("✅ Configuration is valid\n");
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the broker server
async fn run_server(cli: Cli) -> ExitCode {
    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    // Apply CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        directory = ?config.directory.backend,
        delegation = config.delegation.enabled,
        "Starting auth broker"
    );

    let server = match BrokerServer::from_config(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create broker: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = server.run().await {
        error!("Broker error: {e}");
        return ExitCode::from(e.exit_code());
    }

    info!("Broker shutdown complete");
    ExitCode::SUCCESS
}
