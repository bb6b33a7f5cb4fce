use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::settings::{GuildSettings, validate_assignable_role};
use super::{NoticeTarget, RoleError, deliver, guild_display_name, record_activity};
use crate::db::{
    ActivityAction, ActivityLogEntry, ActivityLogStore, AutoRoleRule, GuildConfig, UserStatsStore,
};
use crate::platform::{GuildPlatform, MemberSnapshot, Notice, RoleSnapshot};
use crate::utils::time::{Clock, days_since};
use crate::web::metrics::Metrics;

const AUTO_ROLE_AUDIT_REASON: &str = "Auto-role on join";

/// (guild, member, role)
type GrantKey = (u64, u64, u64);

/// Delayed auto-role grants that have not fired yet. A member leaving aborts theirs.
#[derive(Default)]
pub struct AutoRoleScheduler {
    pending: Arc<Mutex<HashMap<GrantKey, JoinHandle<()>>>>,
}

impl AutoRoleScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, key: GrantKey, delay: Duration, grant: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // hold the lock across spawn so the task cannot deregister before it is registered
        let deadline = tokio::time::Instant::now() + delay;
        let mut pending = self.pending.lock();
        let registry = self.pending.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            grant.await;
            registry.lock().remove(&key);
        });
        if let Some(previous) = pending.insert(key, handle) {
            previous.abort();
        }
    }

    /// Aborts every pending grant for the member and returns how many there were.
    pub fn cancel_member(&self, guild_id: u64, user_id: u64) -> usize {
        let mut cancelled = 0;
        self.pending.lock().retain(|(guild, user, _), handle| {
            if *guild == guild_id && *user == user_id {
                handle.abort();
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if cancelled > 0 {
            debug!(guild_id, user_id, cancelled, "cancelled delayed auto-roles");
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinReport {
    pub assigned: Vec<u64>,
    pub scheduled: Vec<u64>,
    pub skipped: Vec<u64>,
    pub welcomed: bool,
}

/// Substitutes `{server}`, `{user}`, `{roles}` and `{memberCount}`.
pub fn render_welcome(
    template: &str,
    server: &str,
    user_mention: &str,
    roles: &[String],
    member_count: u64,
) -> String {
    template
        .replace("{server}", server)
        .replace("{user}", user_mention)
        .replace("{roles}", &roles.join(", "))
        .replace("{memberCount}", &member_count.to_string())
}

#[derive(Clone)]
pub struct AutoRoleAssigner {
    settings: Arc<GuildSettings>,
    activity: Arc<dyn ActivityLogStore>,
    stats: Arc<dyn UserStatsStore>,
    platform: Arc<dyn GuildPlatform>,
    clock: Arc<dyn Clock>,
    scheduler: Arc<AutoRoleScheduler>,
}

impl AutoRoleAssigner {
    pub fn new(
        settings: Arc<GuildSettings>,
        activity: Arc<dyn ActivityLogStore>,
        stats: Arc<dyn UserStatsStore>,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            activity,
            stats,
            platform,
            clock,
            scheduler: Arc::new(AutoRoleScheduler::new()),
        }
    }

    pub fn scheduler(&self) -> &AutoRoleScheduler {
        &self.scheduler
    }

    pub fn handle_leave(&self, guild_id: u64, user_id: u64) -> usize {
        self.scheduler.cancel_member(guild_id, user_id)
    }

    pub async fn handle_join(&self, member: &MemberSnapshot) -> Result<JoinReport, RoleError> {
        let guild_id = member.guild_id;
        let config = self.settings.load_or_create(guild_id).await?;
        let mut report = JoinReport::default();

        // ignore_bots applies to the whole rule set: one rule opting in is enough
        if member.is_bot && config.auto_roles.iter().any(|rule| rule.ignore_bots) {
            debug!(guild_id, user_id = member.user_id, "bot joined, auto-roles skipped");
            return Ok(report);
        }

        let now = self.clock.now();
        let account_age = days_since(member.account_created_at, now);
        let mut assigned_names = Vec::new();
        let mut delayed = Vec::new();

        for rule in config.auto_roles.iter().filter(|rule| rule.enabled) {
            if rule.min_account_age_days > 0 && account_age < f64::from(rule.min_account_age_days) {
                debug!(
                    guild_id,
                    user_id = member.user_id,
                    role_id = rule.role_id,
                    min_account_age_days = rule.min_account_age_days,
                    "account too new for auto-role"
                );
                report.skipped.push(rule.role_id);
                continue;
            }

            if rule.delay_seconds > 0 {
                delayed.push(rule.clone());
                report.scheduled.push(rule.role_id);
                continue;
            }

            match self.assign(member, rule).await {
                Ok(Some(role)) => {
                    report.assigned.push(role.id);
                    assigned_names.push(role.name);
                }
                Ok(None) => report.skipped.push(rule.role_id),
                Err(e) => {
                    warn!(guild_id, user_id = member.user_id, role_id = rule.role_id, "auto-role failed: {e}");
                    report.skipped.push(rule.role_id);
                }
            }
        }

        let joined_at = member.joined_at.unwrap_or(now);
        if let Err(e) = self
            .stats
            .upsert_member_join(guild_id, member.user_id, joined_at)
            .await
        {
            warn!(guild_id, user_id = member.user_id, "failed to record member join: {e}");
        }

        if config.welcome_message.enabled && !assigned_names.is_empty() {
            report.welcomed = self.welcome(&config, member, &assigned_names).await;
        }

        for rule in delayed {
            self.schedule(member, rule);
        }

        info!(
            guild_id,
            user_id = member.user_id,
            assigned = report.assigned.len(),
            scheduled = report.scheduled.len(),
            skipped = report.skipped.len(),
            "processed member join"
        );
        Ok(report)
    }

    fn schedule(&self, member: &MemberSnapshot, rule: AutoRoleRule) {
        let key = (member.guild_id, member.user_id, rule.role_id);
        let delay = Duration::from_secs(u64::from(rule.delay_seconds));
        let assigner = self.clone();
        let member = member.clone();
        self.scheduler.schedule(key, delay, async move {
            if let Err(e) = assigner.assign(&member, &rule).await {
                warn!(
                    guild_id = member.guild_id,
                    user_id = member.user_id,
                    role_id = rule.role_id,
                    "delayed auto-role failed: {e}"
                );
            }
        });
    }

    /// Grants one auto-role after re-checking the role is still there and below the
    /// bot. Returns `None` when the grant was skipped.
    async fn assign(
        &self,
        member: &MemberSnapshot,
        rule: &AutoRoleRule,
    ) -> Result<Option<RoleSnapshot>, RoleError> {
        let guild_id = member.guild_id;
        let Some(role) = self.platform.role(guild_id, rule.role_id).await? else {
            warn!(guild_id, role_id = rule.role_id, "auto-role no longer exists");
            return Ok(None);
        };
        let bot_top = self.platform.bot_top_position(guild_id).await?;
        if let Err(e) = validate_assignable_role(&role, bot_top) {
            warn!(guild_id, role_id = role.id, "cannot assign auto-role: {e}");
            return Ok(None);
        }

        self.platform
            .add_role(guild_id, member.user_id, role.id, AUTO_ROLE_AUDIT_REASON)
            .await?;

        let entry = ActivityLogEntry::new(guild_id, ActivityAction::AutoroleGiven, self.clock.now())
            .target(member.user_id, member.username.clone())
            .by_system()
            .role(role.id, role.name.clone())
            .details(json!({ "delay_seconds": rule.delay_seconds }));
        record_activity(self.activity.as_ref(), &entry).await;
        Metrics::auto_role_given();
        Ok(Some(role))
    }

    async fn welcome(&self, config: &GuildConfig, member: &MemberSnapshot, roles: &[String]) -> bool {
        let server = guild_display_name(self.platform.as_ref(), config).await;
        let member_count = match self.platform.guild_summary(member.guild_id).await {
            Ok(Some(summary)) => summary.member_count,
            _ => 0,
        };
        let text = render_welcome(
            &config.welcome_message.template,
            &server,
            &member.mention(),
            roles,
            member_count,
        );

        let dm = Notice::Welcome {
            guild_name: server,
            text: text.clone(),
        };
        let mut delivered = deliver(self.platform.as_ref(), NoticeTarget::Direct(member.user_id), &dm).await;

        if let Some(channel_id) = config.welcome_message.channel_id {
            let notice = Notice::WelcomeChannel {
                user_id: member.user_id,
                text,
            };
            delivered |= deliver(self.platform.as_ref(), NoticeTarget::Channel(channel_id), &notice).await;
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::render_welcome;

    #[test]
    fn welcome_placeholders_are_all_substituted() {
        let text = render_welcome(
            "Hi {user}, welcome to {server} (member #{memberCount}). Roles: {roles}. {server}!",
            "Rustaceans",
            "<@5>",
            &["Newcomer".to_string(), "Reader".to_string()],
            42,
        );
        assert_eq!(
            text,
            "Hi <@5>, welcome to Rustaceans (member #42). Roles: Newcomer, Reader. Rustaceans!"
        );
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod join_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::AutoRoleAssigner;
    use crate::db::manager::testing::sqlite_manager;
    use crate::db::{ActivityAction, AutoRoleRule};
    use crate::platform::Notice;
    use crate::platform::fake::{FakePlatform, PlatformCall, member};
    use crate::roles::{Actor, GuildSettings};
    use crate::utils::time::ManualClock;

    const GUILD: u64 = 20;
    const NEWCOMER: u64 = 31;
    const VERIFIED: u64 = 32;
    const JOINER: u64 = 8;

    fn rule(role_id: u64, delay_seconds: u32, min_account_age_days: u32) -> AutoRoleRule {
        AutoRoleRule {
            role_id,
            role_name: None,
            enabled: true,
            delay_seconds,
            ignore_bots: true,
            min_account_age_days,
        }
    }

    async fn setup(
        rules: Vec<AutoRoleRule>,
        bot_top: i64,
    ) -> (tempfile::NamedTempFile, crate::db::DatabaseManager, Arc<FakePlatform>, AutoRoleAssigner) {
        let (file, manager) = sqlite_manager().await;
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 9, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let platform = Arc::new(
            FakePlatform::new()
                .with_guild(GUILD, "Rustaceans", bot_top)
                .with_role(GUILD, NEWCOMER, "Newcomer", 3)
                .with_role(GUILD, VERIFIED, "Verified", 4)
                .with_member(member(GUILD, JOINER, now, 2, 0)),
        );
        let settings = Arc::new(GuildSettings::new(
            manager.guild_config_store(),
            manager.activity_log_store(),
            clock.clone(),
            3600,
        ));
        let admin = Actor::new(1, "admin");
        for rule in rules {
            settings
                .add_auto_role(GUILD, &admin, rule)
                .await
                .expect("rule");
        }
        settings
            .set_welcome_message(GUILD, &admin, true, Some("{user} got {roles} in {server}".to_string()), Some(600))
            .await
            .expect("welcome");

        let assigner = AutoRoleAssigner::new(
            settings,
            manager.activity_log_store(),
            manager.user_stats_store(),
            platform.clone(),
            clock,
        );
        (file, manager, platform, assigner)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    /// Lets the runtime drive scheduled grants until none are left pending.
    async fn drain(assigner: &AutoRoleAssigner) {
        for _ in 0..200 {
            if assigner.scheduler().pending_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("delayed auto-roles never finished");
    }

    #[tokio::test]
    async fn immediate_rules_grant_welcome_and_record() {
        let (_file, manager, platform, assigner) =
            setup(vec![rule(NEWCOMER, 0, 0), rule(VERIFIED, 0, 7)], 10).await;
        let joiner = platform.member(GUILD, JOINER).expect("joiner");

        let report = assigner.handle_join(&joiner).await.expect("join");
        assert_eq!(report.assigned, vec![NEWCOMER]);
        assert_eq!(report.skipped, vec![VERIFIED]);
        assert!(report.welcomed);
        assert_eq!(platform.role_grants(), vec![(JOINER, NEWCOMER)]);

        let deliveries = platform.deliveries();
        assert!(deliveries.iter().any(|call| matches!(
            call,
            PlatformCall::Direct { user_id: JOINER, notice: Notice::Welcome { text, .. } }
                if text == "<@8> got Newcomer in Rustaceans"
        )));
        assert!(deliveries
            .iter()
            .any(|call| matches!(call, PlatformCall::Channel { channel_id: 600, .. })));

        let activity = manager
            .activity_log_store()
            .list_recent_activity(GUILD, 10)
            .await
            .expect("activity");
        let given = activity
            .iter()
            .find(|entry| entry.action == ActivityAction::AutoroleGiven)
            .expect("autorole entry");
        assert_eq!(given.performed_by.as_deref(), Some("system"));

        let stats = manager
            .user_stats_store()
            .get_user_stats(GUILD, JOINER)
            .await
            .expect("stats")
            .expect("stats row");
        assert!(stats.joined_at.is_some());
    }

    #[tokio::test]
    async fn bots_are_skipped_when_any_rule_ignores_them() {
        let (_file, _manager, platform, assigner) = setup(vec![rule(NEWCOMER, 0, 0)], 10).await;
        let mut bot = platform.member(GUILD, JOINER).expect("joiner");
        bot.is_bot = true;

        let report = assigner.handle_join(&bot).await.expect("join");
        assert!(report.assigned.is_empty());
        assert!(platform.role_grants().is_empty());
        assert!(platform.deliveries().is_empty());
    }

    #[tokio::test]
    async fn delayed_grant_fires_after_exactly_the_delay() {
        let (_file, _manager, platform, assigner) = setup(vec![rule(NEWCOMER, 60, 0)], 10).await;
        let joiner = platform.member(GUILD, JOINER).expect("joiner");
        tokio::time::pause();

        let report = assigner.handle_join(&joiner).await.expect("join");
        assert_eq!(report.scheduled, vec![NEWCOMER]);
        assert!(!report.welcomed);

        tokio::time::advance(Duration::from_secs(59)).await;
        settle().await;
        assert!(platform.role_grants().is_empty());
        assert_eq!(assigner.scheduler().pending_count(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        drain(&assigner).await;
        assert_eq!(platform.role_grants(), vec![(JOINER, NEWCOMER)]);
    }

    #[tokio::test]
    async fn delayed_grant_is_skipped_when_bot_is_outranked() {
        let (_file, _manager, platform, assigner) = setup(vec![rule(NEWCOMER, 60, 0)], 10).await;
        let joiner = platform.member(GUILD, JOINER).expect("joiner");
        tokio::time::pause();

        assigner.handle_join(&joiner).await.expect("join");
        platform.set_bot_top(GUILD, 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        drain(&assigner).await;
        assert!(platform.role_grants().is_empty());
    }

    #[tokio::test]
    async fn leaving_cancels_pending_grants() {
        let (_file, _manager, platform, assigner) = setup(vec![rule(NEWCOMER, 60, 0)], 10).await;
        let joiner = platform.member(GUILD, JOINER).expect("joiner");
        tokio::time::pause();

        assigner.handle_join(&joiner).await.expect("join");
        assert_eq!(assigner.scheduler().pending_count(), 1);
        assert_eq!(assigner.handle_leave(GUILD, JOINER), 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert!(platform.role_grants().is_empty());
        assert_eq!(assigner.scheduler().pending_count(), 0);
    }
}
