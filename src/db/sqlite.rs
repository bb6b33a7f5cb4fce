use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{activity_logs, guild_configs, role_requests, temp_roles, user_stats};

use super::{
    DatabaseError,
    error::{parse_optional_snowflake, parse_snowflake},
    models::{ActivityLogEntry, GuildConfig, RequestStatus, RoleRequest, TempRoleGrant, UserStats},
    stores::RequestResolution,
};

// Fixed-width UTC timestamps so lexical comparison in SQL matches time order.
pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("invalid datetime format: {}", e)))
}

fn optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(string_to_datetime).transpose()
}

pub(crate) fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    diesel::sql_query("PRAGMA busy_timeout = 5000")
        .execute(&mut conn)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = guild_configs)]
struct DbGuildConfig {
    config: String,
}

#[derive(Insertable)]
#[diesel(table_name = guild_configs)]
struct NewGuildConfig<'a> {
    guild_id: &'a str,
    config: &'a str,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = role_requests)]
struct DbRoleRequest {
    id: String,
    guild_id: String,
    user_id: String,
    username: String,
    role_id: String,
    role_name: String,
    reason: Option<String>,
    tier_level: i32,
    status: String,
    requirements_met: bool,
    requirements_details: String,
    resolved_by: Option<String>,
    resolved_by_username: Option<String>,
    resolved_at: Option<String>,
    resolution_reason: Option<String>,
    created_at: String,
    expires_at: String,
}

impl DbRoleRequest {
    fn from_request(request: &RoleRequest) -> Self {
        Self {
            id: request.id.clone(),
            guild_id: request.guild_id.to_string(),
            user_id: request.user_id.to_string(),
            username: request.username.clone(),
            role_id: request.role_id.to_string(),
            role_name: request.role_name.clone(),
            reason: request.reason.clone(),
            tier_level: request.tier_level,
            status: request.status.as_str().to_string(),
            requirements_met: request.requirements_met,
            requirements_details: request.requirements_details.clone(),
            resolved_by: request.resolved_by.map(|id| id.to_string()),
            resolved_by_username: request.resolved_by_username.clone(),
            resolved_at: request.resolved_at.as_ref().map(datetime_to_string),
            resolution_reason: request.resolution_reason.clone(),
            created_at: datetime_to_string(&request.created_at),
            expires_at: datetime_to_string(&request.expires_at),
        }
    }

    fn into_request(self) -> Result<RoleRequest, DatabaseError> {
        Ok(RoleRequest {
            guild_id: parse_snowflake(&self.guild_id)?,
            user_id: parse_snowflake(&self.user_id)?,
            role_id: parse_snowflake(&self.role_id)?,
            status: self.status.parse()?,
            resolved_by: parse_optional_snowflake(self.resolved_by.as_deref())?,
            resolved_at: optional_datetime(self.resolved_at.as_deref())?,
            created_at: string_to_datetime(&self.created_at)?,
            expires_at: string_to_datetime(&self.expires_at)?,
            id: self.id,
            username: self.username,
            role_name: self.role_name,
            reason: self.reason,
            tier_level: self.tier_level,
            requirements_met: self.requirements_met,
            requirements_details: self.requirements_details,
            resolved_by_username: self.resolved_by_username,
            resolution_reason: self.resolution_reason,
        })
    }
}

#[derive(AsChangeset)]
#[diesel(table_name = role_requests)]
#[diesel(treat_none_as_null = true)]
struct ResolveRoleRequest {
    status: String,
    resolved_by: Option<String>,
    resolved_by_username: Option<String>,
    resolved_at: Option<String>,
    resolution_reason: Option<String>,
}

impl From<&RequestResolution> for ResolveRoleRequest {
    fn from(value: &RequestResolution) -> Self {
        Self {
            status: value.status.as_str().to_string(),
            resolved_by: value.resolved_by.map(|id| id.to_string()),
            resolved_by_username: value.resolved_by_username.clone(),
            resolved_at: Some(datetime_to_string(&value.resolved_at)),
            resolution_reason: value.resolution_reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = activity_logs)]
struct DbActivityLog {
    id: String,
    guild_id: String,
    action: String,
    target_user_id: Option<String>,
    target_username: Option<String>,
    performed_by: Option<String>,
    performed_by_username: Option<String>,
    role_id: Option<String>,
    role_name: Option<String>,
    details: Option<String>,
    created_at: String,
}

impl DbActivityLog {
    fn from_entry(entry: &ActivityLogEntry) -> Result<Self, DatabaseError> {
        let details = entry
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(Self {
            id: entry.id.clone(),
            guild_id: entry.guild_id.to_string(),
            action: entry.action.as_str().to_string(),
            target_user_id: entry.target_user_id.map(|id| id.to_string()),
            target_username: entry.target_username.clone(),
            performed_by: entry.performed_by.clone(),
            performed_by_username: entry.performed_by_username.clone(),
            role_id: entry.role_id.map(|id| id.to_string()),
            role_name: entry.role_name.clone(),
            details,
            created_at: datetime_to_string(&entry.created_at),
        })
    }

    fn into_entry(self) -> Result<ActivityLogEntry, DatabaseError> {
        let details = self
            .details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        Ok(ActivityLogEntry {
            guild_id: parse_snowflake(&self.guild_id)?,
            action: self.action.parse()?,
            target_user_id: parse_optional_snowflake(self.target_user_id.as_deref())?,
            role_id: parse_optional_snowflake(self.role_id.as_deref())?,
            created_at: string_to_datetime(&self.created_at)?,
            id: self.id,
            target_username: self.target_username,
            performed_by: self.performed_by,
            performed_by_username: self.performed_by_username,
            role_name: self.role_name,
            details,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = temp_roles)]
struct DbTempRole {
    id: String,
    guild_id: String,
    user_id: String,
    role_id: String,
    role_name: String,
    given_by: String,
    given_by_username: Option<String>,
    expires_at: String,
    created_at: String,
}

impl DbTempRole {
    fn from_grant(grant: &TempRoleGrant) -> Self {
        Self {
            id: grant.id.clone(),
            guild_id: grant.guild_id.to_string(),
            user_id: grant.user_id.to_string(),
            role_id: grant.role_id.to_string(),
            role_name: grant.role_name.clone(),
            given_by: grant.given_by.to_string(),
            given_by_username: grant.given_by_username.clone(),
            expires_at: datetime_to_string(&grant.expires_at),
            created_at: datetime_to_string(&grant.created_at),
        }
    }

    fn into_grant(self) -> Result<TempRoleGrant, DatabaseError> {
        Ok(TempRoleGrant {
            guild_id: parse_snowflake(&self.guild_id)?,
            user_id: parse_snowflake(&self.user_id)?,
            role_id: parse_snowflake(&self.role_id)?,
            given_by: parse_snowflake(&self.given_by)?,
            expires_at: string_to_datetime(&self.expires_at)?,
            created_at: string_to_datetime(&self.created_at)?,
            id: self.id,
            role_name: self.role_name,
            given_by_username: self.given_by_username,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = user_stats)]
struct DbUserStats {
    guild_id: String,
    user_id: String,
    message_count: i64,
    last_message_at: Option<String>,
    joined_at: Option<String>,
}

impl DbUserStats {
    fn into_stats(self) -> Result<UserStats, DatabaseError> {
        Ok(UserStats {
            guild_id: parse_snowflake(&self.guild_id)?,
            user_id: parse_snowflake(&self.user_id)?,
            message_count: self.message_count,
            last_message_at: optional_datetime(self.last_message_at.as_deref())?,
            joined_at: optional_datetime(self.joined_at.as_deref())?,
        })
    }
}

fn load_requests(rows: Vec<DbRoleRequest>) -> Result<Vec<RoleRequest>, DatabaseError> {
    rows.into_iter().map(DbRoleRequest::into_request).collect()
}

pub struct SqliteGuildConfigStore {
    db_path: Arc<String>,
}

impl SqliteGuildConfigStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::GuildConfigStore for SqliteGuildConfigStore {
    async fn get_guild_config(&self, guild_id: u64) -> Result<Option<GuildConfig>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let row = guild_configs::table
                .filter(guild_configs::guild_id.eq(guild_id.to_string()))
                .select(DbGuildConfig::as_select())
                .first::<DbGuildConfig>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?;

            row.map(|row| {
                serde_json::from_str(&row.config)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))
            })
            .transpose()
        })
        .await
    }

    async fn upsert_guild_config(
        &self,
        config: &GuildConfig,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let document =
            serde_json::to_string(config).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let guild_id = config.guild_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let stamp = datetime_to_string(&now);
            let new_config = NewGuildConfig {
                guild_id: &guild_id,
                config: &document,
                created_at: stamp.clone(),
                updated_at: stamp.clone(),
            };

            diesel::insert_into(guild_configs::table)
                .values(&new_config)
                .on_conflict(guild_configs::guild_id)
                .do_update()
                .set((
                    guild_configs::config.eq(&document),
                    guild_configs::updated_at.eq(&stamp),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct SqliteRoleRequestStore {
    db_path: Arc<String>,
}

impl SqliteRoleRequestStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::RoleRequestStore for SqliteRoleRequestStore {
    async fn insert_request(&self, request: &RoleRequest) -> Result<(), DatabaseError> {
        let row = DbRoleRequest::from_request(request);
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_into(role_requests::table)
                .values(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from_diesel)
        })
        .await
    }

    async fn get_request(&self, id: &str) -> Result<Option<RoleRequest>, DatabaseError> {
        let id = id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            role_requests::table
                .filter(role_requests::id.eq(id))
                .select(DbRoleRequest::as_select())
                .first::<DbRoleRequest>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(DbRoleRequest::into_request)
                .transpose()
        })
        .await
    }

    async fn find_pending_for_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
    ) -> Result<Option<RoleRequest>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::user_id.eq(user_id.to_string()))
                .filter(role_requests::role_id.eq(role_id.to_string()))
                .filter(role_requests::status.eq(RequestStatus::Pending.as_str()))
                .select(DbRoleRequest::as_select())
                .first::<DbRoleRequest>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(DbRoleRequest::into_request)
                .transpose()
        })
        .await
    }

    async fn latest_request_since(
        &self,
        guild_id: u64,
        user_id: u64,
        since: DateTime<Utc>,
    ) -> Result<Option<RoleRequest>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::user_id.eq(user_id.to_string()))
                .filter(role_requests::created_at.gt(datetime_to_string(&since)))
                .order(role_requests::created_at.desc())
                .select(DbRoleRequest::as_select())
                .first::<DbRoleRequest>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(DbRoleRequest::into_request)
                .transpose()
        })
        .await
    }

    async fn list_by_status(
        &self,
        guild_id: u64,
        status: RequestStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoleRequest>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let rows = role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::status.eq(status.as_str()))
                .order(role_requests::created_at.desc())
                .limit(limit)
                .offset(offset)
                .select(DbRoleRequest::as_select())
                .load::<DbRoleRequest>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            load_requests(rows)
        })
        .await
    }

    async fn count_by_status(
        &self,
        guild_id: u64,
        status: RequestStatus,
    ) -> Result<i64, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::status.eq(status.as_str()))
                .count()
                .get_result(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_for_user(
        &self,
        guild_id: u64,
        user_id: u64,
        status: Option<RequestStatus>,
        limit: i64,
    ) -> Result<Vec<RoleRequest>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let mut query = role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::user_id.eq(user_id.to_string()))
                .into_boxed();
            if let Some(status) = status {
                query = query.filter(role_requests::status.eq(status.as_str()));
            }

            let rows = query
                .order(role_requests::created_at.desc())
                .limit(limit)
                .select(DbRoleRequest::as_select())
                .load::<DbRoleRequest>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            load_requests(rows)
        })
        .await
    }

    async fn find_pending_by_suffix(
        &self,
        guild_id: u64,
        suffix: &str,
    ) -> Result<Vec<RoleRequest>, DatabaseError> {
        let pattern = format!("%{suffix}");
        with_connection(self.db_path.clone(), move |conn| {
            let rows = role_requests::table
                .filter(role_requests::guild_id.eq(guild_id.to_string()))
                .filter(role_requests::status.eq(RequestStatus::Pending.as_str()))
                .filter(role_requests::id.like(pattern))
                .order(role_requests::created_at.desc())
                .select(DbRoleRequest::as_select())
                .load::<DbRoleRequest>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            load_requests(rows)
        })
        .await
    }

    async fn resolve_request(
        &self,
        id: &str,
        resolution: &RequestResolution,
    ) -> Result<bool, DatabaseError> {
        let id = id.to_string();
        let changes = ResolveRoleRequest::from(resolution);
        with_connection(self.db_path.clone(), move |conn| {
            diesel::update(
                role_requests::table
                    .filter(role_requests::id.eq(id))
                    .filter(role_requests::status.eq(RequestStatus::Pending.as_str())),
            )
            .set(&changes)
            .execute(conn)
            .map(|changed| changed > 0)
            .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RoleRequest>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let rows = role_requests::table
                .filter(role_requests::status.eq(RequestStatus::Pending.as_str()))
                .filter(role_requests::expires_at.le(datetime_to_string(&now)))
                .order(role_requests::expires_at.asc())
                .select(DbRoleRequest::as_select())
                .load::<DbRoleRequest>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
            load_requests(rows)
        })
        .await
    }
}

pub struct SqliteActivityLogStore {
    db_path: Arc<String>,
}

impl SqliteActivityLogStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::ActivityLogStore for SqliteActivityLogStore {
    async fn record_activity(&self, entry: &ActivityLogEntry) -> Result<(), DatabaseError> {
        let row = DbActivityLog::from_entry(entry)?;
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_into(activity_logs::table)
                .values(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn list_recent_activity(
        &self,
        guild_id: u64,
        limit: i64,
    ) -> Result<Vec<ActivityLogEntry>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            activity_logs::table
                .filter(activity_logs::guild_id.eq(guild_id.to_string()))
                .order(activity_logs::created_at.desc())
                .limit(limit)
                .select(DbActivityLog::as_select())
                .load::<DbActivityLog>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(DbActivityLog::into_entry)
                .collect()
        })
        .await
    }
}

pub struct SqliteTempRoleStore {
    db_path: Arc<String>,
}

impl SqliteTempRoleStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::TempRoleStore for SqliteTempRoleStore {
    async fn insert_temp_role(&self, grant: &TempRoleGrant) -> Result<(), DatabaseError> {
        let row = DbTempRole::from_grant(grant);
        with_connection(self.db_path.clone(), move |conn| {
            diesel::insert_into(temp_roles::table)
                .values(&row)
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from_diesel)
        })
        .await
    }

    async fn list_expired_temp_roles(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TempRoleGrant>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            temp_roles::table
                .filter(temp_roles::expires_at.le(datetime_to_string(&now)))
                .order(temp_roles::expires_at.asc())
                .select(DbTempRole::as_select())
                .load::<DbTempRole>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(DbTempRole::into_grant)
                .collect()
        })
        .await
    }

    async fn list_temp_roles_for_guild(
        &self,
        guild_id: u64,
    ) -> Result<Vec<TempRoleGrant>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            temp_roles::table
                .filter(temp_roles::guild_id.eq(guild_id.to_string()))
                .order(temp_roles::expires_at.asc())
                .select(DbTempRole::as_select())
                .load::<DbTempRole>(conn)
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .into_iter()
                .map(DbTempRole::into_grant)
                .collect()
        })
        .await
    }

    async fn delete_temp_role(&self, id: &str) -> Result<(), DatabaseError> {
        let id = id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            diesel::delete(temp_roles::table.filter(temp_roles::id.eq(id)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }
}

pub struct SqliteUserStatsStore {
    db_path: Arc<String>,
}

impl SqliteUserStatsStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::UserStatsStore for SqliteUserStatsStore {
    async fn upsert_member_join(
        &self,
        guild_id: u64,
        user_id: u64,
        joined_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let joined = datetime_to_string(&joined_at);
            let row = DbUserStats {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
                message_count: 0,
                last_message_at: None,
                joined_at: Some(joined.clone()),
            };

            diesel::insert_into(user_stats::table)
                .values(&row)
                .on_conflict((user_stats::guild_id, user_stats::user_id))
                .do_update()
                .set(user_stats::joined_at.eq(Some(joined)))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn record_message(
        &self,
        guild_id: u64,
        user_id: u64,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let stamp = datetime_to_string(&at);
            let row = DbUserStats {
                guild_id: guild_id.to_string(),
                user_id: user_id.to_string(),
                message_count: 1,
                last_message_at: Some(stamp.clone()),
                joined_at: None,
            };

            diesel::insert_into(user_stats::table)
                .values(&row)
                .on_conflict((user_stats::guild_id, user_stats::user_id))
                .do_update()
                .set((
                    user_stats::message_count.eq(user_stats::message_count + 1i64),
                    user_stats::last_message_at.eq(Some(stamp)),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(|e| DatabaseError::Query(e.to_string()))
        })
        .await
    }

    async fn get_user_stats(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<UserStats>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            user_stats::table
                .filter(user_stats::guild_id.eq(guild_id.to_string()))
                .filter(user_stats::user_id.eq(user_id.to_string()))
                .select(DbUserStats::as_select())
                .first::<DbUserStats>(conn)
                .optional()
                .map_err(|e| DatabaseError::Query(e.to_string()))?
                .map(DbUserStats::into_stats)
                .transpose()
        })
        .await
    }
}
