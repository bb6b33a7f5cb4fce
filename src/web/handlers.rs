use std::time::Duration;

use salvo::prelude::*;
use serde::Serialize;
use serde_json::json;

use crate::web::{gateway_ready, web_state};

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct StatusReport {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub gateway_ready: bool,
    pub database: &'static str,
}

pub fn status_report(uptime: Duration, gateway_ready: bool, database: &'static str) -> StatusReport {
    StatusReport {
        status: if gateway_ready { "running" } else { "starting" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime.as_secs(),
        gateway_ready,
        database,
    }
}

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render(Json(json!({ "status": "ok" })));
}

#[handler]
pub async fn get_status(res: &mut Response) {
    let Some(state) = web_state() else {
        res.status_code(StatusCode::SERVICE_UNAVAILABLE);
        res.render(Json(json!({ "error": "web state is not initialized" })));
        return;
    };
    res.render(Json(status_report(
        state.started_at.elapsed(),
        gateway_ready(),
        state.db_manager.db_type().as_str(),
    )));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::status_report;

    #[test]
    fn status_reflects_gateway_readiness() {
        let starting = status_report(Duration::from_millis(2_500), false, "sqlite");
        assert_eq!(starting.status, "starting");
        assert_eq!(starting.uptime_seconds, 2);

        let running = status_report(Duration::from_secs(90), true, "postgres");
        assert_eq!(running.status, "running");
        assert!(running.gateway_ready);
        assert_eq!(running.version, env!("CARGO_PKG_VERSION"));
    }
}
