//! GEO Hub E2E Scenario CLI
//!
//! Drives a running hub over HTTP with real Ed25519 keys. Each scenario
//! provisions its own participants, trust lines, and a fresh equivalent.

mod client;
mod scenarios;

use clap::{Parser, Subcommand};
use eyre::Result;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use client::HubClient;

#[derive(Parser)]
#[command(name = "geo-e2e")]
#[command(about = "E2E scenario suite for the GEO hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Hub base URL
    #[arg(long, global = true, default_value = "http://localhost:8080")]
    hub_url: String,

    /// Operator token for privileged endpoints (falls back to ADMIN_TOKEN)
    #[arg(long, global = true)]
    admin_token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Direct payment over one trust line, plus idempotent replay
    Direct,
    /// Transitive payment through one intermediate
    Transit,
    /// Multipath split across two corridors
    Multipath,
    /// Netting against an opposite debt
    Netting,
    /// Triangular clearing with neutrality check
    Clearing,
    /// Concurrent oversubscription: exactly one of two payments commits
    Contention,
    /// Run every scenario in sequence
    All,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();
    let admin_token = cli
        .admin_token
        .clone()
        .or_else(|| std::env::var("ADMIN_TOKEN").ok());
    let client = HubClient::new(cli.hub_url.clone(), admin_token);

    let started = Instant::now();
    let result = match cli.command {
        Commands::Direct => run_one(&client, "direct", scenarios::direct_payment).await,
        Commands::Transit => run_one(&client, "transit", scenarios::transitive_payment).await,
        Commands::Multipath => run_one(&client, "multipath", scenarios::multipath_split).await,
        Commands::Netting => run_one(&client, "netting", scenarios::netting).await,
        Commands::Clearing => run_one(&client, "clearing", scenarios::triangle_clearing).await,
        Commands::Contention => run_one(&client, "contention", scenarios::contention).await,
        Commands::All => run_all(&client).await,
    };

    match &result {
        Ok(()) => info!(elapsed = ?started.elapsed(), "e2e run passed"),
        Err(e) => error!(elapsed = ?started.elapsed(), error = %e, "e2e run failed"),
    }
    result
}

async fn run_one<'a, F, Fut>(client: &'a HubClient, name: &str, scenario: F) -> Result<()>
where
    F: Fn(&'a HubClient) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    info!(scenario = name, "running");
    scenario(client).await
}

async fn run_all(client: &HubClient) -> Result<()> {
    let mut failures = Vec::new();

    macro_rules! run {
        ($name:literal, $f:expr) => {
            info!(scenario = $name, "running");
            if let Err(e) = $f(client).await {
                error!(scenario = $name, error = %e, "scenario failed");
                failures.push($name);
            }
        };
    }

    run!("direct", scenarios::direct_payment);
    run!("transit", scenarios::transitive_payment);
    run!("multipath", scenarios::multipath_split);
    run!("netting", scenarios::netting);
    run!("clearing", scenarios::triangle_clearing);
    run!("contention", scenarios::contention);

    if failures.is_empty() {
        info!("all scenarios passed");
        Ok(())
    } else {
        Err(eyre::eyre!("{} scenario(s) failed: {:?}", failures.len(), failures))
    }
}
