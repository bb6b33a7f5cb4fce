use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::requests::expire_request;
use super::{RoleError, record_activity};
use crate::db::{
    ActivityAction, ActivityLogEntry, ActivityLogStore, RoleRequestStore, TempRoleGrant,
    TempRoleStore,
};
use crate::platform::GuildPlatform;
use crate::utils::time::Clock;
use crate::web::metrics::Metrics;

const TEMP_ROLE_AUDIT_REASON: &str = "Temporary role expired";

async fn sweep_forever<F, Fut>(what: &'static str, every: Duration, mut sweep: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, RoleError>>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match sweep().await {
            Ok(0) => {}
            Ok(count) => info!(sweeper = what, count, "sweep finished"),
            Err(e) => warn!(sweeper = what, "sweep failed: {e}"),
        }
    }
}

/// Revokes temporary roles whose time is up. The grant row is always deleted, even
/// when the platform refuses the revoke.
pub struct TempRoleSweeper {
    store: Arc<dyn TempRoleStore>,
    activity: Arc<dyn ActivityLogStore>,
    platform: Arc<dyn GuildPlatform>,
    clock: Arc<dyn Clock>,
}

impl TempRoleSweeper {
    pub fn new(
        store: Arc<dyn TempRoleStore>,
        activity: Arc<dyn ActivityLogStore>,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            activity,
            platform,
            clock,
        }
    }

    pub async fn run(&self, every: Duration) {
        sweep_forever("temp_roles", every, || self.sweep()).await
    }

    pub async fn sweep(&self) -> Result<usize, RoleError> {
        let now = self.clock.now();
        let expired = self.store.list_expired_temp_roles(now).await?;
        let count = expired.len();
        join_all(expired.into_iter().map(|grant| self.expire(grant, now))).await;
        Ok(count)
    }

    async fn expire(&self, grant: TempRoleGrant, now: DateTime<Utc>) {
        let holder = match self.platform.fetch_member(grant.guild_id, grant.user_id).await {
            Ok(holder) => holder,
            Err(e) => {
                warn!(guild_id = grant.guild_id, user_id = grant.user_id, "failed to look up member: {e}");
                None
            }
        };

        let revoked = match &holder {
            Some(member) if member.has_role(grant.role_id) => match self
                .platform
                .remove_role(grant.guild_id, grant.user_id, grant.role_id, TEMP_ROLE_AUDIT_REASON)
                .await
            {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        guild_id = grant.guild_id,
                        user_id = grant.user_id,
                        role_id = grant.role_id,
                        "failed to revoke temporary role: {e}"
                    );
                    false
                }
            },
            Some(_) => {
                debug!(guild_id = grant.guild_id, user_id = grant.user_id, "temporary role already removed");
                false
            }
            None => {
                debug!(guild_id = grant.guild_id, user_id = grant.user_id, "temporary role holder gone");
                false
            }
        };
        let username = holder.map_or_else(|| grant.user_id.to_string(), |member| member.username);

        if let Err(e) = self.store.delete_temp_role(&grant.id).await {
            warn!(grant_id = %grant.id, "failed to delete expired temporary role: {e}");
            return;
        }

        let entry = ActivityLogEntry::new(grant.guild_id, ActivityAction::RoleTempExpired, now)
            .target(grant.user_id, username)
            .by_system()
            .role(grant.role_id, grant.role_name.clone())
            .details(json!({
                "revoked": revoked,
                "given_by": grant.given_by.to_string(),
                "expired_at": grant.expires_at,
            }));
        record_activity(self.activity.as_ref(), &entry).await;
        Metrics::temp_role_expired();
    }
}

/// Moves pending requests past their expiry to `expired`.
pub struct RequestExpirySweeper {
    store: Arc<dyn RoleRequestStore>,
    activity: Arc<dyn ActivityLogStore>,
    clock: Arc<dyn Clock>,
}

impl RequestExpirySweeper {
    pub fn new(
        store: Arc<dyn RoleRequestStore>,
        activity: Arc<dyn ActivityLogStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            activity,
            clock,
        }
    }

    pub async fn run(&self, every: Duration) {
        sweep_forever("role_requests", every, || self.sweep()).await
    }

    pub async fn sweep(&self) -> Result<usize, RoleError> {
        let now = self.clock.now();
        let mut expired = 0;
        for request in self.store.list_expired_pending(now).await? {
            let request_id = request.id.clone();
            match expire_request(self.store.as_ref(), self.activity.as_ref(), request, now).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(request_id = %request_id, "failed to expire role request: {e}"),
            }
        }
        Ok(expired)
    }
}
