#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;
mod db;
mod discord;
mod platform;
mod roles;
mod utils;
mod web;

use cli::CliArgs;
use config::Config;
use utils::time::SystemClock;
use web::WebServer;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let config = Arc::new(Config::load_from_file(&args.config)?);
    utils::logging::init_tracing(&config.logging, args.log_level.as_deref());
    info!(config = %args.config.display(), "discord role steward starting up");

    let db_manager = db::DatabaseManager::new(&config.database).await?;
    db_manager.migrate().await?;
    info!(database = db_manager.db_type().as_str(), "database ready");
    if args.migrate_only {
        info!("migrations applied, exiting");
        return Ok(());
    }

    let discord_client = Arc::new(discord::DiscordClient::new(
        config.clone(),
        db_manager.clone(),
        Arc::new(SystemClock),
    ));

    let web_handle = if config.web.enabled {
        let web_server = WebServer::new(config.clone(), db_manager.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = web_server.start().await {
                error!("web server error: {}", e);
            }
        }))
    } else {
        None
    };

    let discord_handle = tokio::spawn(async move {
        if let Err(e) = discord_client.run().await {
            error!("discord client error: {}", e);
        }
    });

    tokio::select! {
        _ = discord_handle => {},
        _ = async {
            match web_handle {
                Some(handle) => { let _ = handle.await; }
                None => std::future::pending::<()>().await,
            }
        } => {},
        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
    }

    info!("discord role steward shutting down");
    Ok(())
}
