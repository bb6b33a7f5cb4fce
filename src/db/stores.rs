use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    ActivityLogEntry, GuildConfig, RequestStatus, RoleRequest, TempRoleGrant, UserStats,
};

#[async_trait]
pub trait GuildConfigStore: Send + Sync {
    async fn get_guild_config(&self, guild_id: u64) -> Result<Option<GuildConfig>, DatabaseError>;
    async fn upsert_guild_config(
        &self,
        config: &GuildConfig,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

/// Terminal fields written when a pending request is resolved.
#[derive(Debug, Clone)]
pub struct RequestResolution {
    pub status: RequestStatus,
    pub resolved_by: Option<u64>,
    pub resolved_by_username: Option<String>,
    pub resolved_at: DateTime<Utc>,
    pub resolution_reason: Option<String>,
}

impl RequestResolution {
    pub fn apply_to(&self, request: &mut RoleRequest) {
        request.status = self.status;
        request.resolved_by = self.resolved_by;
        request.resolved_by_username = self.resolved_by_username.clone();
        request.resolved_at = Some(self.resolved_at);
        request.resolution_reason = self.resolution_reason.clone();
    }
}

#[async_trait]
pub trait RoleRequestStore: Send + Sync {
    /// Fails with [`DatabaseError::Conflict`] when a pending request already exists
    /// for the same (guild, user, role).
    async fn insert_request(&self, request: &RoleRequest) -> Result<(), DatabaseError>;
    async fn get_request(&self, id: &str) -> Result<Option<RoleRequest>, DatabaseError>;
    async fn find_pending_for_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<Option<RoleRequest>, DatabaseError>;
    /// Most recent request by the user created strictly after `since`.
    async fn latest_request_since(
        &self,
        guild_id: u64,
        user_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Option<RoleRequest>, DatabaseError>;
    async fn list_by_status(
        &self,
        guild_id: u64,
        status: RequestStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoleRequest>, DatabaseError>;
    async fn count_by_status(
        &self,
        guild_id: u64,
        status: RequestStatus,
    ) -> Result<i64, DatabaseError>;
    async fn list_for_user(
        &self,
        guild_id: u64,
        user_id: u64,
        status: Option<RequestStatus>,
        limit: i64,
    ) -> Result<Vec<RoleRequest>, DatabaseError>;
    /// Pending requests in the community whose id ends with `suffix`. The suffix must
    /// already be lower-case hex.
    async fn find_pending_by_suffix(
        &self,
        guild_id: u64,
        suffix: &str,
    ) -> Result<Vec<RoleRequest>, DatabaseError>;
    /// Writes the resolution only if the request is still pending. Returns whether
    /// a row changed.
    async fn resolve_request(
        &self,
        id: &str,
        resolution: &RequestResolution,
    ) -> Result<bool, DatabaseError>;
    async fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleRequest>, DatabaseError>;
}

#[async_trait]
pub trait ActivityLogStore: Send + Sync {
    async fn record_activity(&self, entry: &ActivityLogEntry) -> Result<(), DatabaseError>;
    async fn list_recent_activity(
        &self,
        guild_id: u64,
        limit: i64,
    ) -> Result<Vec<ActivityLogEntry>, DatabaseError>;
}

#[async_trait]
pub trait TempRoleStore: Send + Sync {
    async fn insert_temp_role(&self, grant: &TempRoleGrant) -> Result<(), DatabaseError>;
    async fn list_expired_temp_roles(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TempRoleGrant>, DatabaseError>;
    async fn list_temp_roles_for_guild(
        &self,
        guild_id: u64,
    ) -> Result<Vec<TempRoleGrant>, DatabaseError>;
    async fn delete_temp_role(&self, id: &str) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait UserStatsStore: Send + Sync {
    /// Creates the record on first sight and refreshes the join timestamp.
    async fn upsert_member_join(
        &self,
        guild_id: u64,
        user_id: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn record_message(
        &self,
        guild_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
    async fn get_user_stats(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<UserStats>, DatabaseError>;
}
