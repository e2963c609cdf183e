//! gridspace node: one messaging domain hosting the space manager, a
//! transfer scheduler and tunnels to peer domains.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use gridspace::cells::{tunnel, Nucleus};
use gridspace::config::Config;
use gridspace::messages::TOPIC_POOL_NOTIFICATIONS;
use gridspace::scheduler::Scheduler;
use gridspace::space::ledger::LedgerPolicies;
use gridspace::space::{manager, Ledger, SpaceManager};

#[derive(Parser)]
#[command(name = "gridspace")]
#[command(about = "Storage-management middleware node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "gridspace.toml")]
    config: String,

    /// Domain name (overrides config file)
    #[arg(long, env = "GRIDSPACE_DOMAIN")]
    domain: Option<String>,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "GRIDSPACE_DATA_DIR")]
    data_dir: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gridspace=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if Path::new(&cli.config).exists() {
        Config::load(Path::new(&cli.config))?
    } else {
        info!("config file not found, using defaults");
        Config::default()
    };
    if let Some(domain) = cli.domain {
        config.node.domain = domain;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir.into();
    }

    info!(domain = %config.node.domain, "starting gridspace node");

    std::fs::create_dir_all(&config.node.data_dir)
        .with_context(|| format!("creating data dir {}", config.node.data_dir.display()))?;

    let nucleus = Nucleus::new(config.node.domain.clone());

    let ledger = Arc::new(
        Ledger::open(
            config.node.data_dir.join("space.db"),
            config.space.db_pool_size,
            LedgerPolicies {
                cleanup_expired_space_files: config.space.cleanup_expired_space_files,
                delete_stored_file_record: config.space.delete_stored_file_record,
            },
        )
        .context("opening reservation ledger")?,
    );
    manager::seed_link_groups(&ledger, &config.space).context("seeding link groups")?;

    nucleus
        .register(
            "SpaceManager",
            SpaceManager::new(Arc::clone(&ledger), config.space.clone()),
        )
        .context("registering space manager")?;
    nucleus.subscribe(TOPIC_POOL_NOTIFICATIONS, "SpaceManager");

    manager::spawn_sweeper(
        Arc::clone(&ledger),
        Duration::from_millis(config.space.expire_period_ms),
    );
    if manager::spawn_refresher(nucleus.clone(), Arc::clone(&ledger), config.space.clone())
        .is_some()
    {
        info!("link-group refresher running");
    }

    let scheduler = Scheduler::new(
        "transfers",
        config.scheduler.max_active,
        config.scheduler.fifo,
    );
    info!(max_active = scheduler.max_active(), "transfer scheduler running");

    let handshake_timeout = Duration::from_millis(config.tunnel.handshake_timeout_ms);
    if let Some(listen_addr) = &config.tunnel.listen_addr {
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("binding tunnel listener on {listen_addr}"))?;
        info!(%listen_addr, "tunnel listener running");
        tunnel::spawn_listener(nucleus.clone(), listener, handshake_timeout);
    }
    for peer in &config.tunnel.peers {
        match tunnel::connect(&nucleus, peer, handshake_timeout).await {
            Ok(cell) => info!(peer = %peer, cell = %cell, "connected to peer"),
            Err(err) => warn!(peer = %peer, %err, "could not connect to peer"),
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler
        .shutdown(Duration::from_millis(config.scheduler.shutdown_grace_ms))
        .await;
    for name in nucleus.cell_names() {
        let _ = nucleus.kill(&name);
    }
    Ok(())
}
