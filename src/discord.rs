use std::sync::Arc;

use anyhow::{Result, anyhow};
use once_cell::sync::OnceCell;
use secrecy::ExposeSecret;
use serenity::all::{Client as SerenityClient, GatewayIntents};
use tokio::sync::{Mutex, oneshot};
use tracing::{error, info};

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::utils::time::Clock;
use crate::web;

use self::handler::{Bound, RoleEventHandler};

const INITIAL_LOGIN_RETRY_SECONDS: u64 = 2;
const MAX_LOGIN_RETRY_SECONDS: u64 = 300;
const READY_TIMEOUT_SECONDS: u64 = 30;

pub mod commands;
pub mod embed;
pub mod handler;
pub mod platform;

pub use self::commands::{CommandDispatcher, ComponentAction, Invocation, PickerPublisher, SlashCommand};
pub use self::embed::EmbedSpec;
pub use self::platform::SerenityPlatform;

/// Gateway intents the bot needs. Member joins require the privileged members intent.
pub fn intents(use_privileged: bool) -> GatewayIntents {
    let mut intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::GUILD_MESSAGE_REACTIONS;
    if use_privileged {
        intents |= GatewayIntents::GUILD_MEMBERS;
    }
    intents
}

#[derive(Default)]
struct LoginState {
    is_logged_in: bool,
    gateway_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct DiscordClient {
    config: Arc<Config>,
    db: DatabaseManager,
    clock: Arc<dyn Clock>,
    bound: Arc<OnceCell<Bound>>,
    login_state: Mutex<LoginState>,
}

impl DiscordClient {
    pub fn new(config: Arc<Config>, db: DatabaseManager, clock: Arc<dyn Clock>) -> Self {
        info!("initializing discord client");
        Self {
            config,
            db,
            clock,
            bound: Arc::new(OnceCell::new()),
            login_state: Mutex::new(LoginState::default()),
        }
    }

    pub async fn login(&self) -> Result<()> {
        let mut state = self.login_state.lock().await;
        if state.is_logged_in {
            return Ok(());
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let event_handler = RoleEventHandler {
            config: self.config.clone(),
            db: self.db.clone(),
            clock: self.clock.clone(),
            bound: self.bound.clone(),
            ready_sender: Arc::new(Mutex::new(Some(ready_tx))),
        };

        let token = self.config.auth.token();
        let mut gateway_client = SerenityClient::builder(
            token.expose_secret(),
            intents(self.config.bot.use_privileged_intents),
        )
        .event_handler(event_handler)
        .await
        .map_err(|err| anyhow!("failed to build discord gateway client: {err}"))?;

        let gateway_task = tokio::spawn(async move {
            if let Err(err) = gateway_client.start_autosharded().await {
                error!("discord gateway stopped: {err}");
            }
            web::set_gateway_ready(false);
        });

        match tokio::time::timeout(std::time::Duration::from_secs(READY_TIMEOUT_SECONDS), ready_rx).await {
            Ok(Ok(())) => {
                state.is_logged_in = true;
                state.gateway_task = Some(gateway_task);
                info!("discord bot login succeeded and gateway is connected");
                Ok(())
            }
            Ok(Err(_)) => {
                gateway_task.abort();
                Err(anyhow!("discord gateway exited before receiving Ready event"))
            }
            Err(_) => {
                gateway_task.abort();
                Err(anyhow!("timed out waiting for discord Ready event"))
            }
        }
    }

    /// Logs in, retrying with exponential backoff until the gateway is ready.
    pub async fn start(&self) -> Result<()> {
        let mut retry_seconds = INITIAL_LOGIN_RETRY_SECONDS;

        loop {
            match self.login().await {
                Ok(()) => {
                    info!("discord client is ready");
                    return Ok(());
                }
                Err(err) => {
                    error!("failed to start discord client: {err}. retrying in {retry_seconds} seconds");
                    tokio::time::sleep(std::time::Duration::from_secs(retry_seconds)).await;
                    retry_seconds = next_retry(retry_seconds);
                }
            }
        }
    }

    /// Starts the client and then waits until the gateway task ends.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        let task = self.login_state.lock().await.gateway_task.take();
        if let Some(task) = task {
            if let Err(join_err) = task.await {
                if !join_err.is_cancelled() {
                    return Err(anyhow!("discord gateway task failed: {join_err}"));
                }
            }
        }
        self.login_state.lock().await.is_logged_in = false;
        info!("discord gateway task exited");
        Ok(())
    }
}

fn next_retry(current: u64) -> u64 {
    (current * 2).min(MAX_LOGIN_RETRY_SECONDS)
}
