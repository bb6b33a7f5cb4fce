use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

pub use self::auto_role::{AutoRoleAssigner, AutoRoleScheduler, JoinReport, render_welcome};
pub use self::cooldown::{CommandCooldowns, CooldownCheck};
pub use self::error::{ErrorKind, RoleError};
pub use self::expiry::{RequestExpirySweeper, TempRoleSweeper};
pub use self::moderation::{Moderation, RoleInfo};
pub use self::pickers::{PickerOutcome, RolePickers};
pub use self::requests::{
    AvailableRole, Decision, PendingPage, RequestLimits, RequestManager, ResolveOutcome,
};
pub use self::requirements::{Verdict, evaluate};
pub use self::settings::{GuildSettings, assignable_role, validate_assignable_role};

pub mod auto_role;
pub mod cooldown;
pub mod error;
pub mod expiry;
pub mod moderation;
pub mod pickers;
pub mod requests;
pub mod requirements;
pub mod settings;

use crate::config::{RequestsConfig, SchedulerConfig};
use crate::db::{ActivityLogEntry, ActivityLogStore, DatabaseManager, GuildConfig, UserStatsStore};
use crate::platform::{DeliveryOutcome, GuildPlatform, MemberSnapshot, Notice};
use crate::utils::time::Clock;
use crate::web::metrics::Metrics;

/// The user a command or button press is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: u64,
    pub username: String,
}

impl Actor {
    pub fn new(user_id: u64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }

    pub fn from_member(member: &MemberSnapshot) -> Self {
        Self::new(member.user_id, member.username.clone())
    }
}

/// Appends to the activity log after the state change it describes has already
/// been committed, so a failed write is logged rather than returned.
pub(crate) async fn record_activity(activity: &dyn ActivityLogStore, entry: &ActivityLogEntry) {
    if let Err(e) = activity.record_activity(entry).await {
        warn!(
            guild_id = entry.guild_id,
            action = entry.action.as_str(),
            "failed to record activity: {e}"
        );
    }
}

/// Sends a notice and swallows delivery failures.
pub(crate) async fn deliver(platform: &dyn GuildPlatform, target: NoticeTarget, notice: &Notice) -> bool {
    let outcome = match target {
        NoticeTarget::Direct(user_id) => platform.send_direct(user_id, notice).await,
        NoticeTarget::Channel(channel_id) => platform.send_to_channel(channel_id, notice).await,
    };
    match outcome {
        DeliveryOutcome::Delivered => true,
        DeliveryOutcome::Failed(reason) => {
            Metrics::notice_failed();
            debug!(?target, kind = notice.kind(), "notice not delivered: {reason}");
            false
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum NoticeTarget {
    Direct(u64),
    Channel(u64),
}

/// Name used in member-facing notices.
pub(crate) async fn guild_display_name(platform: &dyn GuildPlatform, config: &GuildConfig) -> String {
    if let Some(name) = &config.guild_name {
        return name.clone();
    }
    match platform.guild_summary(config.guild_id).await {
        Ok(Some(summary)) => summary.name,
        _ => "the server".to_string(),
    }
}

/// Mirrors an activity entry to the community's audit channel, if one is set.
pub(crate) async fn post_audit(
    platform: &dyn GuildPlatform,
    config: &GuildConfig,
    entry: &ActivityLogEntry,
) {
    if let Some(channel_id) = config.notifications.log_channel_id {
        deliver(platform, NoticeTarget::Channel(channel_id), &Notice::Audit(entry.clone())).await;
    }
}

/// All role services wired against one database and one platform.
pub struct RoleCore {
    pub settings: Arc<GuildSettings>,
    pub requests: Arc<RequestManager>,
    pub auto_roles: Arc<AutoRoleAssigner>,
    pub moderation: Arc<Moderation>,
    pub pickers: Arc<RolePickers>,
    pub cooldowns: Arc<CommandCooldowns>,
    stats: Arc<dyn UserStatsStore>,
    temp_role_sweeper: Arc<TempRoleSweeper>,
    request_sweeper: Arc<RequestExpirySweeper>,
    clock: Arc<dyn Clock>,
    sweepers_started: AtomicBool,
}

impl RoleCore {
    pub fn new(
        db: &DatabaseManager,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
        requests_config: &RequestsConfig,
    ) -> Self {
        let settings = Arc::new(GuildSettings::new(
            db.guild_config_store(),
            db.activity_log_store(),
            clock.clone(),
            requests_config.default_cooldown_seconds,
        ));

        let requests = Arc::new(RequestManager::new(
            settings.clone(),
            db.role_request_store(),
            db.activity_log_store(),
            platform.clone(),
            clock.clone(),
            RequestLimits::from_config(requests_config),
        ));

        let auto_roles = Arc::new(AutoRoleAssigner::new(
            settings.clone(),
            db.activity_log_store(),
            db.user_stats_store(),
            platform.clone(),
            clock.clone(),
        ));

        let moderation = Arc::new(Moderation::new(
            settings.clone(),
            db.temp_role_store(),
            db.activity_log_store(),
            platform.clone(),
            clock.clone(),
        ));

        let pickers = Arc::new(RolePickers::new(
            settings.clone(),
            db.activity_log_store(),
            platform.clone(),
            clock.clone(),
        ));

        let temp_role_sweeper = Arc::new(TempRoleSweeper::new(
            db.temp_role_store(),
            db.activity_log_store(),
            platform,
            clock.clone(),
        ));

        let request_sweeper = Arc::new(RequestExpirySweeper::new(
            db.role_request_store(),
            db.activity_log_store(),
            clock.clone(),
        ));

        Self {
            settings,
            requests,
            auto_roles,
            moderation,
            pickers,
            cooldowns: Arc::new(CommandCooldowns::new(clock.clone())),
            stats: db.user_stats_store(),
            temp_role_sweeper,
            request_sweeper,
            clock,
            sweepers_started: AtomicBool::new(false),
        }
    }

    /// Spawns both periodic sweepers. Later calls are no-ops, so a gateway
    /// reconnect does not start duplicates.
    pub fn start_sweepers(&self, scheduler: &SchedulerConfig) -> bool {
        if self.sweepers_started.swap(true, Ordering::SeqCst) {
            return false;
        }

        let temp_roles = self.temp_role_sweeper.clone();
        let temp_every = std::time::Duration::from_secs(scheduler.temp_role_sweep_seconds);
        tokio::spawn(async move { temp_roles.run(temp_every).await });

        let requests = self.request_sweeper.clone();
        let request_every = std::time::Duration::from_secs(scheduler.request_expiry_sweep_seconds);
        tokio::spawn(async move { requests.run(request_every).await });

        info!(
            temp_role_sweep_seconds = scheduler.temp_role_sweep_seconds,
            request_expiry_sweep_seconds = scheduler.request_expiry_sweep_seconds,
            "started role sweepers"
        );
        true
    }

    pub async fn record_message(&self, guild_id: u64, user_id: u64) -> Result<(), RoleError> {
        self.stats
            .record_message(guild_id, user_id, self.clock.now())
            .await?;
        Ok(())
    }
}
