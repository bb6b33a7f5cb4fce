use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{
    ActivityLogStore, DatabaseError, GuildConfigStore, RoleRequestStore, TempRoleStore,
    UserStatsStore,
};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{
    PostgresActivityLogStore, PostgresGuildConfigStore, PostgresRoleRequestStore,
    PostgresTempRoleStore, PostgresUserStatsStore,
};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{
    SqliteActivityLogStore, SqliteGuildConfigStore, SqliteRoleRequestStore, SqliteTempRoleStore,
    SqliteUserStatsStore, establish_connection,
};

#[cfg(feature = "postgres")]
const POSTGRES_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS guild_configs (
        guild_id TEXT PRIMARY KEY,
        config TEXT NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_requests (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        username TEXT NOT NULL,
        role_id TEXT NOT NULL,
        role_name TEXT NOT NULL,
        reason TEXT,
        tier_level INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        requirements_met BOOLEAN NOT NULL DEFAULT TRUE,
        requirements_details TEXT NOT NULL DEFAULT '',
        resolved_by TEXT,
        resolved_by_username TEXT,
        resolved_at TIMESTAMP WITH TIME ZONE,
        resolution_reason TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
        expires_at TIMESTAMP WITH TIME ZONE NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_logs (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        action TEXT NOT NULL,
        target_user_id TEXT,
        target_username TEXT,
        performed_by TEXT,
        performed_by_username TEXT,
        role_id TEXT,
        role_name TEXT,
        details TEXT,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS temp_roles (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role_id TEXT NOT NULL,
        role_name TEXT NOT NULL,
        given_by TEXT NOT NULL,
        given_by_username TEXT,
        expires_at TIMESTAMP WITH TIME ZONE NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_stats (
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        message_count BIGINT NOT NULL DEFAULT 0,
        last_message_at TIMESTAMP WITH TIME ZONE,
        joined_at TIMESTAMP WITH TIME ZONE,
        PRIMARY KEY (guild_id, user_id)
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_role_requests_one_pending ON role_requests(guild_id, user_id, role_id) WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_guild_status ON role_requests(guild_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_user ON role_requests(guild_id, user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_expiry ON role_requests(status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_activity_logs_guild ON activity_logs(guild_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_temp_roles_expires ON temp_roles(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_temp_roles_guild ON temp_roles(guild_id)",
];

#[cfg(feature = "sqlite")]
const SQLITE_MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS guild_configs (
        guild_id TEXT PRIMARY KEY,
        config TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS role_requests (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        username TEXT NOT NULL,
        role_id TEXT NOT NULL,
        role_name TEXT NOT NULL,
        reason TEXT,
        tier_level INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        requirements_met BOOLEAN NOT NULL DEFAULT 1,
        requirements_details TEXT NOT NULL DEFAULT '',
        resolved_by TEXT,
        resolved_by_username TEXT,
        resolved_at TEXT,
        resolution_reason TEXT,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activity_logs (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        action TEXT NOT NULL,
        target_user_id TEXT,
        target_username TEXT,
        performed_by TEXT,
        performed_by_username TEXT,
        role_id TEXT,
        role_name TEXT,
        details TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS temp_roles (
        id TEXT PRIMARY KEY,
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        role_id TEXT NOT NULL,
        role_name TEXT NOT NULL,
        given_by TEXT NOT NULL,
        given_by_username TEXT,
        expires_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_stats (
        guild_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        message_count BIGINT NOT NULL DEFAULT 0,
        last_message_at TEXT,
        joined_at TEXT,
        PRIMARY KEY (guild_id, user_id)
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_role_requests_one_pending ON role_requests(guild_id, user_id, role_id) WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_guild_status ON role_requests(guild_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_user ON role_requests(guild_id, user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_role_requests_expiry ON role_requests(status, expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_activity_logs_guild ON activity_logs(guild_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_temp_roles_expires ON temp_roles(expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_temp_roles_guild ON temp_roles(guild_id)",
];

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    guild_config_store: Arc<dyn GuildConfigStore>,
    role_request_store: Arc<dyn RoleRequestStore>,
    activity_log_store: Arc<dyn ActivityLogStore>,
    temp_role_store: Arc<dyn TempRoleStore>,
    user_stats_store: Arc<dyn UserStatsStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Sqlite => "sqlite",
        }
    }
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    guild_config_store: Arc::new(PostgresGuildConfigStore::new(pool.clone())),
                    role_request_store: Arc::new(PostgresRoleRequestStore::new(pool.clone())),
                    activity_log_store: Arc::new(PostgresActivityLogStore::new(pool.clone())),
                    temp_role_store: Arc::new(PostgresTempRoleStore::new(pool.clone())),
                    user_stats_store: Arc::new(PostgresUserStatsStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is not configured".to_string())
                })?;
                let path_arc = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    guild_config_store: Arc::new(SqliteGuildConfigStore::new(path_arc.clone())),
                    role_request_store: Arc::new(SqliteRoleRequestStore::new(path_arc.clone())),
                    activity_log_store: Arc::new(SqliteActivityLogStore::new(path_arc.clone())),
                    temp_role_store: Arc::new(SqliteTempRoleStore::new(path_arc.clone())),
                    user_stats_store: Arc::new(SqliteUserStatsStore::new(path_arc)),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not initialized".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in POSTGRES_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        use diesel::RunQueryDsl;

        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&path)?;

            for statement in SQLITE_MIGRATIONS {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn guild_config_store(&self) -> Arc<dyn GuildConfigStore> {
        self.guild_config_store.clone()
    }

    pub fn role_request_store(&self) -> Arc<dyn RoleRequestStore> {
        self.role_request_store.clone()
    }

    pub fn activity_log_store(&self) -> Arc<dyn ActivityLogStore> {
        self.activity_log_store.clone()
    }

    pub fn temp_role_store(&self) -> Arc<dyn TempRoleStore> {
        self.temp_role_store.clone()
    }

    pub fn user_stats_store(&self) -> Arc<dyn UserStatsStore> {
        self.user_stats_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}


#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::testing::sqlite_manager;
    use crate::db::{
        ActivityAction, ActivityLogEntry, GuildConfig, RequestResolution, RequestStatus,
        RoleRequest, TempRoleGrant, new_record_id,
    };

    fn pending_request(guild_id: u64, user_id: u64, role_id: u64) -> RoleRequest {
        let created_at = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        RoleRequest {
            id: new_record_id(),
            guild_id,
            user_id,
            username: "alice".to_string(),
            role_id,
            role_name: "Member".to_string(),
            reason: Some("I'd like access".to_string()),
            tier_level: 1,
            status: RequestStatus::Pending,
            requirements_met: true,
            requirements_details: String::new(),
            resolved_by: None,
            resolved_by_username: None,
            resolved_at: None,
            resolution_reason: None,
            created_at,
            expires_at: created_at + Duration::days(7),
        }
    }

    #[tokio::test]
    async fn guild_config_upsert_and_reopen() {
        let (file, manager) = sqlite_manager().await;
        let now = Utc::now();

        let mut config = GuildConfig::with_defaults(100, 3600);
        manager
            .guild_config_store()
            .upsert_guild_config(&config, now)
            .await
            .expect("insert config");

        config.guild_name = Some("Rustaceans".to_string());
        config.notifications.request_channel_id = Some(555);
        manager
            .guild_config_store()
            .upsert_guild_config(&config, now)
            .await
            .expect("update config");

        let db_path = file.path().to_string_lossy().to_string();
        let reopened = super::DatabaseManager::new(&crate::config::DatabaseConfig {
            url: None,
            conn_string: None,
            filename: Some(db_path),
            max_connections: Some(1),
            min_connections: Some(1),
        })
        .await
        .expect("reopen");
        reopened.migrate().await.expect("migrate is idempotent");

        let stored = reopened
            .guild_config_store()
            .get_guild_config(100)
            .await
            .expect("query config")
            .expect("config exists");
        assert_eq!(stored, config);
        assert!(
            reopened
                .guild_config_store()
                .get_guild_config(101)
                .await
                .expect("query missing")
                .is_none()
        );
    }

    #[tokio::test]
    async fn second_pending_request_for_same_role_conflicts() {
        let (_file, manager) = sqlite_manager().await;
        let store = manager.role_request_store();

        store
            .insert_request(&pending_request(1, 2, 3))
            .await
            .expect("first insert");
        let err = store
            .insert_request(&pending_request(1, 2, 3))
            .await
            .expect_err("duplicate pending");
        assert!(err.is_conflict());

        // a different role is fine
        store
            .insert_request(&pending_request(1, 2, 4))
            .await
            .expect("other role");
    }

    #[tokio::test]
    async fn resolve_only_applies_to_pending_rows() {
        let (_file, manager) = sqlite_manager().await;
        let store = manager.role_request_store();
        let request = pending_request(1, 2, 3);
        store.insert_request(&request).await.expect("insert");

        let approved = RequestResolution {
            status: RequestStatus::Approved,
            resolved_by: Some(9),
            resolved_by_username: Some("mod".to_string()),
            resolved_at: request.created_at + Duration::hours(1),
            resolution_reason: Some("welcome aboard".to_string()),
        };
        assert!(store.resolve_request(&request.id, &approved).await.expect("resolve"));

        let denied = RequestResolution {
            status: RequestStatus::Denied,
            ..approved.clone()
        };
        assert!(!store.resolve_request(&request.id, &denied).await.expect("second resolve"));

        let stored = store
            .get_request(&request.id)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(stored.status, RequestStatus::Approved);
        assert_eq!(stored.resolved_by, Some(9));
        assert_eq!(stored.resolution_reason.as_deref(), Some("welcome aboard"));
        assert_eq!(stored.reason.as_deref(), Some("I'd like access"));

        // once resolved, the same role may be requested again
        store
            .insert_request(&pending_request(1, 2, 3))
            .await
            .expect("new pending after resolution");
    }

    #[tokio::test]
    async fn latest_request_since_is_strict() {
        let (_file, manager) = sqlite_manager().await;
        let store = manager.role_request_store();
        let request = pending_request(1, 2, 3);
        store.insert_request(&request).await.expect("insert");

        let at_boundary = store
            .latest_request_since(1, 2, request.created_at)
            .await
            .expect("query");
        assert!(at_boundary.is_none());

        let just_before = store
            .latest_request_since(1, 2, request.created_at - Duration::microseconds(1))
            .await
            .expect("query");
        assert_eq!(just_before.map(|r| r.id), Some(request.id));
    }

    #[tokio::test]
    async fn listing_and_expiry_queries() {
        let (_file, manager) = sqlite_manager().await;
        let store = manager.role_request_store();

        let older = pending_request(1, 2, 3);
        let mut newer = pending_request(1, 5, 3);
        newer.created_at = older.created_at + Duration::minutes(5);
        newer.expires_at = older.expires_at + Duration::days(30);
        store.insert_request(&older).await.expect("insert older");
        store.insert_request(&newer).await.expect("insert newer");

        let pending = store
            .list_by_status(1, RequestStatus::Pending, 15, 0)
            .await
            .expect("list");
        assert_eq!(
            pending.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![newer.id.clone(), older.id.clone()]
        );
        assert_eq!(
            store.count_by_status(1, RequestStatus::Pending).await.expect("count"),
            2
        );
        assert_eq!(
            store
                .list_for_user(1, 5, Some(RequestStatus::Approved), 10)
                .await
                .expect("filtered")
                .len(),
            0
        );

        let expired = store
            .list_expired_pending(older.expires_at)
            .await
            .expect("expired");
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, older.id);
    }

    #[tokio::test]
    async fn activity_temp_roles_and_stats() {
        let (_file, manager) = sqlite_manager().await;
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();

        let entry = ActivityLogEntry::new(1, ActivityAction::AutoroleGiven, now)
            .target(2, "alice")
            .by_system()
            .role(3, "Member")
            .details(json!({ "delay": 60 }));
        manager
            .activity_log_store()
            .record_activity(&entry)
            .await
            .expect("record");
        let recent = manager
            .activity_log_store()
            .list_recent_activity(1, 10)
            .await
            .expect("list activity");
        assert_eq!(recent, vec![entry]);

        let grant = TempRoleGrant {
            id: new_record_id(),
            guild_id: 1,
            user_id: 2,
            role_id: 3,
            role_name: "Event".to_string(),
            given_by: 9,
            given_by_username: Some("mod".to_string()),
            expires_at: now + Duration::hours(1),
            created_at: now,
        };
        let temp_roles = manager.temp_role_store();
        temp_roles.insert_temp_role(&grant).await.expect("insert grant");
        assert!(temp_roles.list_expired_temp_roles(now).await.expect("none yet").is_empty());
        let due = temp_roles
            .list_expired_temp_roles(now + Duration::hours(1))
            .await
            .expect("due");
        assert_eq!(due, vec![grant.clone()]);
        temp_roles.delete_temp_role(&grant.id).await.expect("delete");
        assert!(temp_roles.list_temp_roles_for_guild(1).await.expect("list").is_empty());

        let stats = manager.user_stats_store();
        stats.record_message(1, 2, now).await.expect("first message");
        stats
            .record_message(1, 2, now + Duration::minutes(1))
            .await
            .expect("second message");
        stats
            .upsert_member_join(1, 2, now - Duration::days(3))
            .await
            .expect("join");
        let stored = stats.get_user_stats(1, 2).await.expect("stats").expect("exists");
        assert_eq!(stored.message_count, 2);
        assert_eq!(stored.joined_at, Some(now - Duration::days(3)));
        assert_eq!(stored.last_message_at, Some(now + Duration::minutes(1)));
    }
}
