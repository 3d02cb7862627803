pub mod config;
pub mod supervise;
pub mod vault;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::VaultConfig;
use crate::supervise::child::{ExitOutcome, ProcessSpec};
use crate::supervise::renew::LeaseState;
use crate::vault::VaultClient;

/// Exit code when vaultrun itself fails, distinguished from anything the
/// supervised command normally returns.
const EXIT_SUPERVISION_FAILED: i32 = 125;

#[derive(Parser)]
#[command(name = "vaultrun", version)]
#[command(about = "Run commands with secrets from Vault in their environment")]
struct Cli {
    /// Vault server address, e.g. https://vault.example.com:8200 (env: VAULT_ADDR)
    #[arg(long)]
    address: Option<String>,

    /// Vault token (env: VAULT_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Path(s) to the secrets to inject (env: VAULT_PATH)
    #[arg(long)]
    path: Option<String>,

    /// Delimiter between multiple secret paths (env: VAULT_PATH_DELIM)
    #[arg(long)]
    path_delim: Option<String>,

    /// Helper command that prints a JSON vault config to stdout. It receives
    /// the resolved config as VAULT_* environment variables.
    #[arg(long)]
    generate_config: Option<String>,

    /// Command to run with the secret environment
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vaultrun=info"));

    // Logs go to stderr; stdout belongs to the supervised command.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(outcome) => std::process::exit(outcome.code()),
        Err(err) => {
            tracing::error!("vaultrun failed: {:#}", err);
            std::process::exit(EXIT_SUPERVISION_FAILED);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitOutcome> {
    let mut config = VaultConfig::resolve(cli.address, cli.token, cli.path, cli.path_delim);
    if let Some(helper) = &cli.generate_config {
        config = config
            .generate(helper)
            .await
            .context("config generation failed")?;
    }
    config.validate()?;

    let client = VaultClient::new(&config)?;
    let (secrets, lease_secs) = client
        .secrets(&config.secret_paths())
        .await
        .context("failed to fetch secrets")?;
    tracing::info!(keys = secrets.len(), lease_secs, "fetched secrets");

    match client.renewable().await {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("vault token is not renewable; the first renewal attempt will fail")
        }
        Err(err) => tracing::warn!(error = %err, "could not determine token renewability"),
    }

    let spec = ProcessSpec {
        argv: cli.command,
        env: vault::secrets_to_env(secrets),
    };
    let outcome = supervise::run(spec, Arc::new(client), LeaseState::from_secs(lease_secs)).await?;
    Ok(outcome)
}
