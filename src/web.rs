use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use tracing::info;

use crate::config::Config;
use crate::db::DatabaseManager;

pub mod handlers;
pub mod metrics;

use self::handlers::{get_status, health_check};
use self::metrics::metrics_endpoint;

#[derive(Clone)]
pub struct WebState {
    pub db_manager: DatabaseManager,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();
static GATEWAY_READY: AtomicBool = AtomicBool::new(false);

pub fn web_state() -> Option<&'static WebState> {
    WEB_STATE.get()
}

/// Flipped by the gateway client on Ready and when the gateway task ends.
pub fn set_gateway_ready(ready: bool) {
    GATEWAY_READY.store(ready, Ordering::SeqCst);
}

pub fn gateway_ready() -> bool {
    GATEWAY_READY.load(Ordering::SeqCst)
}

pub fn create_router() -> Router {
    Router::new()
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("status").get(get_status))
        .push(Router::with_path("metrics").get(metrics_endpoint))
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub fn new(config: Arc<Config>, db_manager: DatabaseManager) -> Self {
        let _ = WEB_STATE.set(WebState {
            db_manager,
            started_at: Instant::now(),
        });

        Self { config }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.web.bind_address, self.config.web.port);
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
