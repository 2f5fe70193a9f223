use anyhow::Context;
use clap::Parser;
use roundtable::chain::ContractListener;
use roundtable::cli::{Cli, Commands};
use roundtable::config::AppConfig;
use roundtable::runtime::{init_logging, shutdown_signal};
use roundtable::services::{create_router, serve, ApiState};
use roundtable::signing::{canonical_string, Wallet};
use roundtable::store::{ChangeFeed, PostgresStore, RoundStore};
use roundtable::{ChatCompletionsOracle, HttpRelay, RoundEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config_dir } => run(&config_dir).await,
        Commands::Canonicalize { json, sign_as, chain_id } => {
            canonicalize(&json, sign_as, chain_id).await
        }
    }
}

async fn run(config_dir: &str) -> anyhow::Result<()> {
    let config = AppConfig::load_from(config_dir)
        .with_context(|| format!("failed to load configuration from {}", config_dir))?;
    init_logging(&config.logging);

    if let Err(problems) = config.validate() {
        for problem in &problems {
            error!("Invalid configuration: {}", problem);
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }

    info!(
        agent_id = config.agent.id,
        room_id = config.agent.room_id,
        "Starting roundtable agent"
    );

    let wallet = Wallet::from_env(config.agent.id, config.agent.chain_id)?;
    info!("Signing as {}", wallet.address_string());

    let store = PostgresStore::new(&config.store.url, config.store.max_connections)
        .await
        .context("failed to connect to the round store")?;
    let pool = store.pool().clone();
    let store: Arc<dyn RoundStore> = Arc::new(store);
    let oracle = Arc::new(ChatCompletionsOracle::new(config.oracle.clone())?);
    let relay = Arc::new(HttpRelay::new(&config.relay)?);

    let engine = Arc::new(RoundEngine::new(
        &config.agent,
        config.engine.clone(),
        wallet,
        oracle,
        relay,
        store,
    ));

    engine.verify_identity().await?;
    engine.initialize_room_context().await?;

    let (events_tx, events_rx) = mpsc::channel(LIFECYCLE_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(Arc::clone(&engine).drive_lifecycle(events_rx));

    let feed = ChangeFeed::new(pool, config.store.change_channel.clone());
    let feed_tx = events_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = feed.run(feed_tx).await {
            error!("Change feed stopped: {}", e);
        }
    });

    match &config.contract {
        Some(contract) => {
            let listener = ContractListener::new(contract, config.agent.room_id)?;
            let tx = events_tx.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.run(tx, rx).await {
                    error!("Contract listener stopped: {}", e);
                }
            });
        }
        None => warn!("No contract configured, relying on the change feed alone"),
    }
    drop(events_tx);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let router = create_router(ApiState { engine });

    serve(router, addr, async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await?;

    info!("Agent stopped");
    Ok(())
}

async fn canonicalize(json: &str, sign_as: Option<i64>, chain_id: u64) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("input is not valid JSON")?;
    println!("{}", canonical_string(&value)?);

    if let Some(agent_id) = sign_as {
        let wallet = Wallet::from_env(agent_id, chain_id)?;
        let signature = wallet.sign_payload(&value).await?;
        println!("signer:    {}", wallet.address_string());
        println!("signature: {}", signature);
    }
    Ok(())
}
