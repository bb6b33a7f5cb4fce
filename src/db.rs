pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::models::{
    ActivityAction, ActivityLogEntry, AutoRoleRule, ButtonRoleBinding, ButtonRoleConfig,
    ButtonStyleKind, DEFAULT_WELCOME_TEMPLATE, GuildConfig, NotificationSettings,
    ReactionRoleBinding, ReactionRoleConfig, ReactionRoleMode, RequestStatus, Requirements,
    RoleRequest, RoleTier, SYSTEM_ACTOR, SelfRole, TempRoleGrant, UserStats, WelcomeMessage,
    display_suffix, new_record_id,
};
pub use self::stores::{
    ActivityLogStore, GuildConfigStore, RequestResolution, RoleRequestStore, TempRoleStore,
    UserStatsStore,
};

pub mod error;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;
