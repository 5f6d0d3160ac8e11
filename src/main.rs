//! LTI Bridge - LTI 1.3 tool server
//!
//! OIDC login, launch validation, Deep Linking and AGS grade passback.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use lti_bridge::{
    ags::{AgsClient, InMemoryGradeSyncLog},
    cli::{Cli, Command},
    config::Config,
    lti::{KeyManager, PlatformRegistry},
    server::ToolServer,
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
        Some(Command::Jwks) => run_jwks(&cli),
        Some(Command::Token {
            ref platform,
            ref scopes,
        }) => run_token(&cli, platform, scopes).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Print the public JWKS for platform registration
fn run_jwks(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let keys = match KeyManager::from_config(&config.keys) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("❌ Failed to load tool key: {e}");
            return ExitCode::FAILURE;
        }
    };
    if config.keys.private_key_path.is_none() {
        eprintln!("⚠️  No private_key_path configured: this key is ephemeral");
    }
    match serde_json::to_string_pretty(&keys.public_jwks()) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to serialize JWKS: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Exchange a client assertion for an AGS token and print it
async fn run_token(cli: &Cli, platform: &str, scopes: &[String]) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let client = match build_ags_client(&config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let scopes: Vec<&str> = scopes.iter().map(String::as_str).collect();
    match client.get_access_token(platform, &scopes).await {
        Ok(token) => {
            println!("✅ Token issued by {platform}");
            println!("   Type: {}", token.token_type.as_deref().unwrap_or("Bearer"));
            if let Some(expires_in) = token.expires_in {
                println!("   Expires in: {expires_in}s");
            }
            println!("   Scope: {}", token.scope.as_deref().unwrap_or(""));
            println!("   Access token: {}", token.access_token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Token exchange failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_ags_client(config: &Config) -> lti_bridge::Result<AgsClient> {
    let keys = Arc::new(KeyManager::from_config(&config.keys)?);
    let registry = Arc::new(PlatformRegistry::from_config(&config.platforms)?);
    AgsClient::new(
        keys,
        registry,
        Arc::new(InMemoryGradeSyncLog::new()),
        &config.ags,
        config.launch.allow_insecure_http,
    )
}

/// Run the tool server
async fn run_server(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        platforms = config.platforms.len(),
        "Starting LTI bridge"
    );

    let server = match ToolServer::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}
