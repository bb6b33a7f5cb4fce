use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use super::requirements::evaluate;
use super::settings::{GuildSettings, validate_assignable_role};
use super::{
    NoticeTarget, RoleError, deliver, guild_display_name, post_audit, record_activity,
};
use crate::config::RequestsConfig;
use crate::db::{
    ActivityAction, ActivityLogEntry, ActivityLogStore, GuildConfig, RequestResolution,
    RequestStatus, Requirements, RoleRequest, RoleRequestStore, new_record_id,
};
use crate::platform::{GuildPlatform, MemberSnapshot, Notice};
use crate::utils::time::Clock;
use crate::web::metrics::Metrics;

pub const MEMBER_LEFT_REASON: &str = "Member left the server";
const MAX_COOLDOWN_SECONDS: u64 = 365 * 86_400;
const USER_HISTORY_LIMIT: i64 = 25;
const MIN_ID_INPUT_LEN: usize = 4;
const FULL_ID_LEN: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    pub expiry: Duration,
    pub max_reason_length: usize,
    pub max_note_length: usize,
    pub page_size: i64,
}

impl RequestLimits {
    pub fn from_config(config: &RequestsConfig) -> Self {
        Self {
            expiry: Duration::days(i64::from(config.expiry_days)),
            max_reason_length: config.max_reason_length,
            max_note_length: config.max_note_length,
            page_size: config.pending_page_size.max(1),
        }
    }
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self::from_config(&RequestsConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(RoleRequest),
    /// The requester left before review; the request was cancelled instead.
    MemberGone(RoleRequest),
}

impl ResolveOutcome {
    pub fn request(&self) -> &RoleRequest {
        match self {
            ResolveOutcome::Resolved(request) | ResolveOutcome::MemberGone(request) => request,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingPage {
    pub requests: Vec<RoleRequest>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl PendingPage {
    pub fn total_pages(&self) -> i64 {
        ((self.total + self.page_size - 1) / self.page_size).max(1)
    }
}

/// A role members may ask for, with whatever governs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableRole {
    pub role_id: u64,
    pub role_name: String,
    pub tier_name: Option<String>,
    pub tier_level: Option<i32>,
    pub requirements: Option<Requirements>,
    pub description: Option<String>,
}

/// The role request state machine. `pending` is the only state that moves;
/// every transition out of it goes through a conditional store update.
pub struct RequestManager {
    settings: Arc<GuildSettings>,
    store: Arc<dyn RoleRequestStore>,
    activity: Arc<dyn ActivityLogStore>,
    platform: Arc<dyn GuildPlatform>,
    clock: Arc<dyn Clock>,
    limits: RequestLimits,
}

impl RequestManager {
    pub fn new(
        settings: Arc<GuildSettings>,
        store: Arc<dyn RoleRequestStore>,
        activity: Arc<dyn ActivityLogStore>,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
        limits: RequestLimits,
    ) -> Self {
        Self {
            settings,
            store,
            activity,
            platform,
            clock,
            limits,
        }
    }

    pub fn limits(&self) -> RequestLimits {
        self.limits
    }

    pub async fn create(
        &self,
        requester: &MemberSnapshot,
        role_id: u64,
        reason: Option<String>,
    ) -> Result<RoleRequest, RoleError> {
        let guild_id = requester.guild_id;
        let reason = clean_text(reason);
        check_length(reason.as_deref(), self.limits.max_reason_length, "reason")?;

        let role = self
            .platform
            .role(guild_id, role_id)
            .await?
            .ok_or(RoleError::RoleNotFound)?;
        let bot_top = self.platform.bot_top_position(guild_id).await?;
        validate_assignable_role(&role, bot_top)?;

        let config = self.settings.load_or_create(guild_id).await?;
        if !config.is_requestable(role_id) {
            return Err(RoleError::validation(format!(
                "{} is not available for requests",
                role.name
            )));
        }
        if requester.has_role(role_id) {
            return Err(RoleError::AlreadyHasRole);
        }

        let now = self.clock.now();
        if config.request_cooldown_seconds > 0 {
            let window = cooldown_window(config.request_cooldown_seconds);
            if let Some(last) = self
                .store
                .latest_request_since(guild_id, requester.user_id, now - window)
                .await?
            {
                return Err(RoleError::OnCooldown {
                    next_allowed: last.created_at + window,
                });
            }
        }

        if self
            .store
            .find_pending_for_role(guild_id, requester.user_id, role_id)
            .await?
            .is_some()
        {
            return Err(RoleError::DuplicatePending);
        }

        let verdict = evaluate(requester, &config, role_id, now);
        let tier_level = config.tier_for_role(role_id).map(|tier| tier.level).unwrap_or(1);

        let request = RoleRequest {
            id: new_record_id(),
            guild_id,
            user_id: requester.user_id,
            username: requester.username.clone(),
            role_id,
            role_name: role.name.clone(),
            reason,
            tier_level,
            status: RequestStatus::Pending,
            requirements_met: verdict.met,
            requirements_details: verdict.details,
            resolved_by: None,
            resolved_by_username: None,
            resolved_at: None,
            resolution_reason: None,
            created_at: now,
            expires_at: now + self.limits.expiry,
        };

        match self.store.insert_request(&request).await {
            Err(e) if e.is_conflict() => return Err(RoleError::DuplicatePending),
            other => other?,
        }

        let entry = ActivityLogEntry::new(guild_id, ActivityAction::RoleRequest, now)
            .target(requester.user_id, requester.username.clone())
            .performed_by(requester.user_id, requester.username.clone())
            .role(role_id, role.name.clone())
            .details(json!({
                "request_id": request.id,
                "tier_level": tier_level,
                "requirements_met": request.requirements_met,
                "reason": request.reason,
            }));
        record_activity(self.activity.as_ref(), &entry).await;
        Metrics::request_created();

        info!(
            guild_id,
            user_id = requester.user_id,
            role_id,
            request_id = %request.display_id(),
            requirements_met = request.requirements_met,
            "role request created"
        );

        if let Some(channel_id) = config.notifications.request_channel_id {
            let notice = Notice::RequestReview {
                request: request.clone(),
                requester_mention: requester.mention(),
            };
            if !deliver(self.platform.as_ref(), NoticeTarget::Channel(channel_id), &notice).await {
                warn!(guild_id, channel_id, "review notice for request {} was not posted", request.display_id());
            }
        }

        Ok(request)
    }

    /// Applies a moderator decision to a pending request.
    pub async fn resolve(
        &self,
        guild_id: u64,
        request_id: &str,
        moderator: &MemberSnapshot,
        decision: Decision,
        note: Option<String>,
    ) -> Result<ResolveOutcome, RoleError> {
        let note = clean_text(note);
        check_length(note.as_deref(), self.limits.max_note_length, "note")?;

        let request = self
            .store
            .get_request(request_id)
            .await?
            .filter(|request| request.guild_id == guild_id)
            .ok_or(RoleError::RequestNotFound)?;
        if !request.is_pending() {
            return Err(RoleError::AlreadyResolved {
                status: request.status,
            });
        }

        let config = self.settings.load_or_create(guild_id).await?;
        authorize(&config, &request, moderator)?;

        let now = self.clock.now();
        if request.expires_at <= now {
            expire_request(self.store.as_ref(), self.activity.as_ref(), request, now).await?;
            return Err(RoleError::RequestExpired);
        }

        let Some(member) = self.platform.fetch_member(guild_id, request.user_id).await? else {
            let resolution = RequestResolution {
                status: RequestStatus::Cancelled,
                resolved_by: Some(moderator.user_id),
                resolved_by_username: Some(moderator.username.clone()),
                resolved_at: now,
                resolution_reason: Some(MEMBER_LEFT_REASON.to_string()),
            };
            let request = self.finish(request, &resolution).await?;

            let entry = ActivityLogEntry::new(guild_id, ActivityAction::RoleCancelled, now)
                .target(request.user_id, request.username.clone())
                .performed_by(moderator.user_id, moderator.username.clone())
                .role(request.role_id, request.role_name.clone())
                .details(json!({ "request_id": request.id, "reason": MEMBER_LEFT_REASON }));
            record_activity(self.activity.as_ref(), &entry).await;
            Metrics::request_cancelled();
            info!(guild_id, request_id = %request.display_id(), "requester left, request cancelled");
            return Ok(ResolveOutcome::MemberGone(request));
        };

        let request = match decision {
            Decision::Approve => {
                self.approve(&config, request, &member, moderator, note, now)
                    .await?
            }
            Decision::Deny => self.deny(&config, request, moderator, note, now).await?,
        };
        Ok(ResolveOutcome::Resolved(request))
    }

    async fn approve(
        &self,
        config: &GuildConfig,
        request: RoleRequest,
        member: &MemberSnapshot,
        moderator: &MemberSnapshot,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RoleRequest, RoleError> {
        let guild_id = request.guild_id;
        let role = self
            .platform
            .role(guild_id, request.role_id)
            .await?
            .ok_or(RoleError::RoleGone)?;
        let bot_top = self.platform.bot_top_position(guild_id).await?;
        validate_assignable_role(&role, bot_top)?;

        if member.has_role(role.id) {
            debug!(guild_id, user_id = member.user_id, role_id = role.id, "requester already holds role");
        } else {
            let audit_reason = format!(
                "Role request {} approved by {}",
                request.display_id(),
                moderator.username
            );
            self.platform
                .add_role(guild_id, member.user_id, role.id, &audit_reason)
                .await?;
        }

        let resolution = RequestResolution {
            status: RequestStatus::Approved,
            resolved_by: Some(moderator.user_id),
            resolved_by_username: Some(moderator.username.clone()),
            resolved_at: now,
            resolution_reason: note.clone(),
        };
        let request = self.finish(request, &resolution).await?;

        let entry = ActivityLogEntry::new(guild_id, ActivityAction::RoleApproved, now)
            .target(request.user_id, request.username.clone())
            .performed_by(moderator.user_id, moderator.username.clone())
            .role(role.id, role.name.clone())
            .details(json!({ "request_id": request.id, "note": note }));
        record_activity(self.activity.as_ref(), &entry).await;
        post_audit(self.platform.as_ref(), config, &entry).await;
        Metrics::request_approved();
        info!(
            guild_id,
            request_id = %request.display_id(),
            moderator_id = moderator.user_id,
            "role request approved"
        );

        if config.notifications.approval_dm_enabled {
            let notice = Notice::RequestApproved {
                guild_name: guild_display_name(self.platform.as_ref(), config).await,
                role_name: role.name,
                moderator: moderator.display_name.clone(),
                note,
            };
            deliver(self.platform.as_ref(), NoticeTarget::Direct(request.user_id), &notice).await;
        }

        Ok(request)
    }

    async fn deny(
        &self,
        config: &GuildConfig,
        request: RoleRequest,
        moderator: &MemberSnapshot,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RoleRequest, RoleError> {
        let resolution = RequestResolution {
            status: RequestStatus::Denied,
            resolved_by: Some(moderator.user_id),
            resolved_by_username: Some(moderator.username.clone()),
            resolved_at: now,
            resolution_reason: note.clone(),
        };
        let request = self.finish(request, &resolution).await?;

        let entry = ActivityLogEntry::new(request.guild_id, ActivityAction::RoleDenied, now)
            .target(request.user_id, request.username.clone())
            .performed_by(moderator.user_id, moderator.username.clone())
            .role(request.role_id, request.role_name.clone())
            .details(json!({ "request_id": request.id, "reason": note }));
        record_activity(self.activity.as_ref(), &entry).await;
        post_audit(self.platform.as_ref(), config, &entry).await;
        Metrics::request_denied();
        info!(
            guild_id = request.guild_id,
            request_id = %request.display_id(),
            moderator_id = moderator.user_id,
            "role request denied"
        );

        if config.notifications.denial_dm_enabled {
            let notice = Notice::RequestDenied {
                guild_name: guild_display_name(self.platform.as_ref(), config).await,
                role_name: request.role_name.clone(),
                moderator: moderator.display_name.clone(),
                reason: note,
            };
            deliver(self.platform.as_ref(), NoticeTarget::Direct(request.user_id), &notice).await;
        }

        Ok(request)
    }

    /// Writes a resolution unless another writer got there first.
    async fn finish(
        &self,
        mut request: RoleRequest,
        resolution: &RequestResolution,
    ) -> Result<RoleRequest, RoleError> {
        if !self.store.resolve_request(&request.id, resolution).await? {
            let status = self
                .store
                .get_request(&request.id)
                .await?
                .map(|current| current.status)
                .unwrap_or(resolution.status);
            return Err(RoleError::AlreadyResolved { status });
        }
        resolution.apply_to(&mut request);
        Ok(request)
    }

    /// Finds a pending request by the short id shown to humans, or by its full id.
    /// Several matches are reported rather than guessed between.
    pub async fn find_by_display_id(
        &self,
        guild_id: u64,
        input: &str,
    ) -> Result<RoleRequest, RoleError> {
        let suffix = normalize_request_id(input)?;
        let mut matches = self.store.find_pending_by_suffix(guild_id, &suffix).await?;
        match matches.len() {
            0 => Err(RoleError::RequestNotFound),
            1 => Ok(matches.remove(0)),
            count => Err(RoleError::AmbiguousRequestId { matches: count }),
        }
    }

    pub async fn resolve_by_display_id(
        &self,
        guild_id: u64,
        input: &str,
        moderator: &MemberSnapshot,
        decision: Decision,
        note: Option<String>,
    ) -> Result<ResolveOutcome, RoleError> {
        let request = self.find_by_display_id(guild_id, input).await?;
        self.resolve(guild_id, &request.id, moderator, decision, note)
            .await
    }

    pub async fn list_for_user(
        &self,
        guild_id: u64,
        user_id: u64,
        status: Option<RequestStatus>,
    ) -> Result<Vec<RoleRequest>, RoleError> {
        Ok(self
            .store
            .list_for_user(guild_id, user_id, status, USER_HISTORY_LIMIT)
            .await?)
    }

    /// Pending requests, newest first. Pages start at 1.
    pub async fn list_pending(&self, guild_id: u64, page: i64) -> Result<PendingPage, RoleError> {
        let page = page.max(1);
        let page_size = self.limits.page_size;
        let total = self
            .store
            .count_by_status(guild_id, RequestStatus::Pending)
            .await?;
        let requests = self
            .store
            .list_by_status(
                guild_id,
                RequestStatus::Pending,
                page_size,
                (page - 1).saturating_mul(page_size),
            )
            .await?;
        Ok(PendingPage {
            requests,
            total,
            page,
            page_size,
        })
    }

    /// Tier roles ordered by level, then self-roles outside any tier. Roles deleted
    /// from the server are left out.
    pub async fn available_roles(&self, guild_id: u64) -> Result<Vec<AvailableRole>, RoleError> {
        let config = self.settings.load_or_create(guild_id).await?;
        let mut tiers: Vec<_> = config.role_tiers.iter().collect();
        tiers.sort_by_key(|tier| tier.level);

        let mut available = Vec::new();
        for tier in tiers {
            for role_id in &tier.roles {
                if available.iter().any(|role: &AvailableRole| role.role_id == *role_id) {
                    continue;
                }
                if let Some(role) = self.platform.role(guild_id, *role_id).await? {
                    available.push(AvailableRole {
                        role_id: role.id,
                        role_name: role.name,
                        tier_name: Some(tier.name.clone()),
                        tier_level: Some(tier.level),
                        requirements: tier.requirements.clone(),
                        description: None,
                    });
                }
            }
        }

        for self_role in &config.self_roles {
            if config.tier_for_role(self_role.role_id).is_some() {
                continue;
            }
            if let Some(role) = self.platform.role(guild_id, self_role.role_id).await? {
                available.push(AvailableRole {
                    role_id: role.id,
                    role_name: role.name,
                    tier_name: None,
                    tier_level: None,
                    requirements: None,
                    description: self_role.description.clone(),
                });
            }
        }

        Ok(available)
    }
}

/// Moves a stale pending request to `expired`. Returns false if it was no longer pending.
pub(crate) async fn expire_request(
    store: &dyn RoleRequestStore,
    activity: &dyn ActivityLogStore,
    request: RoleRequest,
    now: DateTime<Utc>,
) -> Result<bool, RoleError> {
    let resolution = RequestResolution {
        status: RequestStatus::Expired,
        resolved_by: None,
        resolved_by_username: None,
        resolved_at: now,
        resolution_reason: None,
    };
    if !store.resolve_request(&request.id, &resolution).await? {
        return Ok(false);
    }

    let entry = ActivityLogEntry::new(request.guild_id, ActivityAction::RoleRequestExpired, now)
        .target(request.user_id, request.username.clone())
        .by_system()
        .role(request.role_id, request.role_name.clone())
        .details(json!({ "request_id": request.id, "expired_at": request.expires_at }));
    record_activity(activity, &entry).await;
    Metrics::request_expired();
    debug!(guild_id = request.guild_id, request_id = %request.display_id(), "role request expired");
    Ok(true)
}

fn authorize(
    config: &GuildConfig,
    request: &RoleRequest,
    moderator: &MemberSnapshot,
) -> Result<(), RoleError> {
    if moderator.is_administrator {
        return Ok(());
    }

    let approvers = config
        .tier_for_role(request.role_id)
        .map(|tier| tier.approver_roles.as_slice())
        .unwrap_or_default();
    if !approvers.is_empty() {
        if moderator.has_any_role(approvers) {
            return Ok(());
        }
        return Err(RoleError::PermissionDenied(
            "you need one of this tier's approver roles to review this request".to_string(),
        ));
    }

    if moderator.can_manage_roles {
        Ok(())
    } else {
        Err(RoleError::PermissionDenied(
            "you need the Manage Roles permission to review requests".to_string(),
        ))
    }
}

fn cooldown_window(seconds: u64) -> Duration {
    Duration::seconds(seconds.min(MAX_COOLDOWN_SECONDS) as i64)
}

fn clean_text(text: Option<String>) -> Option<String> {
    text.map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn check_length(text: Option<&str>, max: usize, what: &str) -> Result<(), RoleError> {
    match text {
        Some(text) if text.chars().count() > max => Err(RoleError::validation(format!(
            "the {what} must be at most {max} characters"
        ))),
        _ => Ok(()),
    }
}

/// Accepts `A1B2C3`, `#a1b2c3` or a full id and returns the lower-case hex to match.
fn normalize_request_id(input: &str) -> Result<String, RoleError> {
    let id = input.trim().trim_start_matches('#').to_ascii_lowercase();
    let valid = (MIN_ID_INPUT_LEN..=FULL_ID_LEN).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(id)
    } else {
        Err(RoleError::validation(
            "request ids look like A1B2C3, copy the one shown on the request",
        ))
    }
}

#[cfg(test)]
mod id_tests {
    use test_case::test_case;

    use super::normalize_request_id;

    #[test_case("A1B2C3", Some("a1b2c3"))]
    #[test_case("  #d2e1f0 ", Some("d2e1f0"))]
    #[test_case("0f1e2d3c4b5a69788796a5b4c3d2e1f0", Some("0f1e2d3c4b5a69788796a5b4c3d2e1f0"))]
    #[test_case("abc", None ; "too short")]
    #[test_case("XYZ123", None ; "not hex")]
    fn request_id_input(input: &str, expected: Option<&str>) {
        assert_eq!(normalize_request_id(input).ok().as_deref(), expected);
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use tempfile::NamedTempFile;

    use super::{Decision, MEMBER_LEFT_REASON, RequestLimits, RequestManager, ResolveOutcome};
    use crate::db::manager::testing::sqlite_manager;
    use crate::db::{
        ActivityAction, DatabaseManager, NotificationSettings, RequestStatus, RoleRequest,
    };
    use crate::platform::fake::{FakePlatform, PlatformCall, member};
    use crate::platform::{MemberSnapshot, Notice};
    use crate::roles::{Actor, GuildSettings, RoleError};
    use crate::utils::time::{Clock, ManualClock};

    const GUILD: u64 = 10;
    const HELPER_ROLE: u64 = 50;
    const ARTIST_ROLE: u64 = 51;
    const TRUSTED_ROLE: u64 = 60;
    const REQUESTER: u64 = 2;
    const MODERATOR: u64 = 3;

    struct Harness {
        _file: NamedTempFile,
        manager: DatabaseManager,
        platform: Arc<FakePlatform>,
        clock: Arc<ManualClock>,
        settings: Arc<GuildSettings>,
        requests: RequestManager,
    }

    impl Harness {
        fn requester(&self) -> MemberSnapshot {
            self.platform.member(GUILD, REQUESTER).expect("requester")
        }

        fn moderator(&self) -> MemberSnapshot {
            self.platform.member(GUILD, MODERATOR).expect("moderator")
        }

        async fn stored(&self, id: &str) -> RoleRequest {
            self.manager
                .role_request_store()
                .get_request(id)
                .await
                .expect("query")
                .expect("request exists")
        }

        async fn count_activity(&self, action: ActivityAction) -> usize {
            self.manager
                .activity_log_store()
                .list_recent_activity(GUILD, 100)
                .await
                .expect("activity")
                .iter()
                .filter(|entry| entry.action == action)
                .count()
        }
    }

    async fn harness() -> Harness {
        let (file, manager) = sqlite_manager().await;
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));

        let mut moderator = member(GUILD, MODERATOR, start, 400, 200);
        moderator.can_manage_roles = true;
        let platform = Arc::new(
            FakePlatform::new()
                .with_guild(GUILD, "Guild", 100)
                .with_role(GUILD, HELPER_ROLE, "Helper", 5)
                .with_role(GUILD, ARTIST_ROLE, "Artist", 6)
                .with_role(GUILD, TRUSTED_ROLE, "Trusted", 7)
                .with_member(member(GUILD, REQUESTER, start, 10, 1))
                .with_member(moderator),
        );

        let settings = Arc::new(GuildSettings::new(
            manager.guild_config_store(),
            manager.activity_log_store(),
            clock.clone(),
            3600,
        ));
        let admin = Actor::new(900, "admin");
        settings
            .add_role_to_tier(GUILD, &admin, "Basic", HELPER_ROLE)
            .await
            .expect("helper in basic");
        settings
            .add_role_to_tier(GUILD, &admin, "Basic", ARTIST_ROLE)
            .await
            .expect("artist in basic");
        settings
            .add_role_to_tier(GUILD, &admin, "Elevated", TRUSTED_ROLE)
            .await
            .expect("trusted in elevated");

        let requests = RequestManager::new(
            settings.clone(),
            manager.role_request_store(),
            manager.activity_log_store(),
            platform.clone(),
            clock.clone(),
            RequestLimits::default(),
        );

        Harness {
            _file: file,
            manager,
            platform,
            clock,
            settings,
            requests,
        }
    }

    #[tokio::test]
    async fn cooldown_blocks_until_exactly_the_window_has_passed() {
        let h = harness().await;
        let first = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("first request");

        h.clock.advance(Duration::seconds(3599));
        let err = h
            .requests
            .create(&h.requester(), ARTIST_ROLE, None)
            .await
            .expect_err("inside cooldown");
        match err {
            RoleError::OnCooldown { next_allowed } => {
                assert_eq!(next_allowed, first.created_at + Duration::seconds(3600));
            }
            other => panic!("expected cooldown, got {other:?}"),
        }

        h.clock.advance(Duration::seconds(1));
        h.requests
            .create(&h.requester(), ARTIST_ROLE, None)
            .await
            .expect("allowed at the boundary");
    }

    #[tokio::test]
    async fn duplicate_pending_is_rejected_per_role() {
        let h = harness().await;
        h.settings
            .set_request_cooldown(GUILD, &Actor::new(900, "admin"), 0)
            .await
            .expect("disable cooldown");

        h.requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("first");
        assert!(matches!(
            h.requests.create(&h.requester(), HELPER_ROLE, None).await,
            Err(RoleError::DuplicatePending)
        ));
        h.requests
            .create(&h.requester(), ARTIST_ROLE, None)
            .await
            .expect("different role is fine");
    }

    #[tokio::test]
    async fn targets_are_validated_before_anything_is_stored() {
        let h = harness().await;
        h.platform.set_bot_top(GUILD, 6);

        assert!(matches!(
            h.requests.create(&h.requester(), 4040, None).await,
            Err(RoleError::RoleNotFound)
        ));
        assert!(matches!(
            h.requests.create(&h.requester(), TRUSTED_ROLE, None).await,
            Err(RoleError::Validation(_))
        ));

        let mut holder = h.requester();
        holder.role_ids.insert(HELPER_ROLE);
        assert!(matches!(
            h.requests.create(&holder, HELPER_ROLE, None).await,
            Err(RoleError::AlreadyHasRole)
        ));
        assert_eq!(h.count_activity(ActivityAction::RoleRequest).await, 0);
    }

    #[tokio::test]
    async fn second_approval_is_rejected_without_side_effects() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");

        let outcome = h
            .requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
            .await
            .expect("approve");
        assert_eq!(outcome.request().status, RequestStatus::Approved);

        let err = h
            .requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
            .await
            .expect_err("second approve");
        assert!(matches!(
            err,
            RoleError::AlreadyResolved {
                status: RequestStatus::Approved
            }
        ));

        assert_eq!(h.platform.role_grants(), vec![(REQUESTER, HELPER_ROLE)]);
        assert_eq!(h.count_activity(ActivityAction::RoleApproved).await, 1);
        assert!(h.platform.member(GUILD, REQUESTER).unwrap().has_role(HELPER_ROLE));
    }

    #[tokio::test]
    async fn reason_and_note_are_kept_verbatim_up_to_their_caps() {
        let h = harness().await;
        let reason = "r".repeat(500);
        let note = "n".repeat(1000);

        assert!(matches!(
            h.requests
                .create(&h.requester(), HELPER_ROLE, Some("r".repeat(501)))
                .await,
            Err(RoleError::Validation(_))
        ));

        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, Some(reason.clone()))
            .await
            .expect("request");
        assert!(matches!(
            h.requests
                .resolve(GUILD, &request.id, &h.moderator(), Decision::Deny, Some("n".repeat(1001)))
                .await,
            Err(RoleError::Validation(_))
        ));
        h.requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Deny, Some(note.clone()))
            .await
            .expect("deny");

        let stored = h.stored(&request.id).await;
        assert_eq!(stored.status, RequestStatus::Denied);
        assert_eq!(stored.reason, Some(reason));
        assert_eq!(stored.resolution_reason, Some(note));
        assert_eq!(stored.resolved_by, Some(MODERATOR));
        assert!(h.platform.role_grants().is_empty());
    }

    #[tokio::test]
    async fn unmet_requirements_are_recorded_not_enforced() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), TRUSTED_ROLE, Some("I help a lot".to_string()))
            .await
            .expect("request created despite requirements");

        assert!(!request.requirements_met);
        assert!(request.requirements_details.contains("Server membership: 1/3 days"));
        assert_eq!(request.tier_level, 2);
        assert_eq!(request.expires_at, request.created_at + Duration::days(7));
        assert!(!h.stored(&request.id).await.requirements_met);
    }

    #[tokio::test]
    async fn approver_roles_gate_resolution() {
        let h = harness().await;
        h.settings
            .set_tier_approvers(GUILD, &Actor::new(900, "admin"), "Elevated", vec![77])
            .await
            .expect("approvers");
        let request = h
            .requests
            .create(&h.requester(), TRUSTED_ROLE, None)
            .await
            .expect("request");

        let err = h
            .requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
            .await
            .expect_err("not an approver");
        assert!(matches!(err, RoleError::PermissionDenied(_)));
        assert_eq!(h.stored(&request.id).await.status, RequestStatus::Pending);

        let mut approver = h.moderator();
        approver.can_manage_roles = false;
        approver.role_ids.insert(77);
        h.requests
            .resolve(GUILD, &request.id, &approver, Decision::Approve, None)
            .await
            .expect("approver may resolve");
    }

    #[tokio::test]
    async fn members_without_authority_cannot_review() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        let bystander = member(GUILD, 44, h.clock.now(), 100, 100);

        assert!(matches!(
            h.requests
                .resolve(GUILD, &request.id, &bystander, Decision::Deny, None)
                .await,
            Err(RoleError::PermissionDenied(_))
        ));

        let mut admin = bystander.clone();
        admin.is_administrator = true;
        h.requests
            .resolve(GUILD, &request.id, &admin, Decision::Deny, None)
            .await
            .expect("administrators bypass");
    }

    #[tokio::test]
    async fn departed_requester_cancels_the_request() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        h.platform.remove_member(GUILD, REQUESTER);

        let outcome = h
            .requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
            .await
            .expect("consumed");
        let ResolveOutcome::MemberGone(cancelled) = outcome else {
            panic!("expected member gone, got {outcome:?}");
        };
        assert_eq!(cancelled.status, RequestStatus::Cancelled);

        let stored = h.stored(&request.id).await;
        assert_eq!(stored.status, RequestStatus::Cancelled);
        assert_eq!(stored.resolution_reason.as_deref(), Some(MEMBER_LEFT_REASON));
        assert!(h.platform.role_grants().is_empty());
    }

    #[tokio::test]
    async fn deleted_role_leaves_request_pending() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        h.platform.delete_role(GUILD, HELPER_ROLE);

        assert!(matches!(
            h.requests
                .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
                .await,
            Err(RoleError::RoleGone)
        ));
        assert_eq!(h.stored(&request.id).await.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn stale_requests_expire_on_review() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        h.clock.advance(Duration::days(7));

        assert!(matches!(
            h.requests
                .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
                .await,
            Err(RoleError::RequestExpired)
        ));
        assert_eq!(h.stored(&request.id).await.status, RequestStatus::Expired);
        assert_eq!(h.count_activity(ActivityAction::RoleRequestExpired).await, 1);
    }

    #[tokio::test]
    async fn existing_role_is_not_granted_again() {
        let h = harness().await;
        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        let mut requester = h.requester();
        requester.role_ids.insert(HELPER_ROLE);
        h.platform.insert_member(requester);

        let outcome = h
            .requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, None)
            .await
            .expect("approve");
        assert_eq!(outcome.request().status, RequestStatus::Approved);
        assert!(h.platform.role_grants().is_empty());
    }

    #[tokio::test]
    async fn notices_go_to_review_channel_and_requester() {
        let h = harness().await;
        h.settings
            .set_notifications(
                GUILD,
                &Actor::new(900, "admin"),
                NotificationSettings {
                    request_channel_id: Some(300),
                    log_channel_id: Some(301),
                    approval_dm_enabled: true,
                    denial_dm_enabled: true,
                },
            )
            .await
            .expect("notifications");

        let request = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");
        h.platform.fail_deliveries();
        h.requests
            .resolve(GUILD, &request.id, &h.moderator(), Decision::Approve, Some("welcome".into()))
            .await
            .expect("delivery failures are swallowed");

        let deliveries = h.platform.deliveries();
        assert!(matches!(
            &deliveries[0],
            PlatformCall::Channel { channel_id: 300, notice: Notice::RequestReview { request: posted, .. } }
                if posted.id == request.id
        ));
        assert!(deliveries.iter().any(|call| matches!(
            call,
            PlatformCall::Channel { channel_id: 301, notice: Notice::Audit(_) }
        )));
        assert!(deliveries.iter().any(|call| matches!(
            call,
            PlatformCall::Direct { user_id: REQUESTER, notice: Notice::RequestApproved { note: Some(note), .. } }
                if note == "welcome"
        )));
    }

    #[tokio::test]
    async fn display_ids_resolve_and_refuse_to_guess() {
        let h = harness().await;
        let store = h.manager.role_request_store();
        let template = h
            .requests
            .create(&h.requester(), HELPER_ROLE, None)
            .await
            .expect("request");

        let found = h
            .requests
            .find_by_display_id(GUILD, &template.display_id())
            .await
            .expect("found by short id");
        assert_eq!(found.id, template.id);

        for (id, role_id) in [
            ("aaaaaaaaaaaaaaaaaaaaaaaaaaabc123", 70),
            ("bbbbbbbbbbbbbbbbbbbbbbbbbbabc123", 71),
        ] {
            let mut request = template.clone();
            request.id = id.to_string();
            request.role_id = role_id;
            store.insert_request(&request).await.expect("insert");
        }

        assert!(matches!(
            h.requests.find_by_display_id(GUILD, "ABC123").await,
            Err(RoleError::AmbiguousRequestId { matches: 2 })
        ));
        assert!(matches!(
            h.requests.find_by_display_id(GUILD, "#FFFFFF").await,
            Err(RoleError::RequestNotFound)
        ));

        let outcome = h
            .requests
            .resolve_by_display_id(
                GUILD,
                "aaaaaaaaaaaaaaaaaaaaaaaaaaabc123",
                &h.moderator(),
                Decision::Deny,
                None,
            )
            .await
            .expect("full id is unambiguous");
        assert_eq!(outcome.request().status, RequestStatus::Denied);
    }

    #[tokio::test]
    async fn pending_pages_and_available_roles() {
        let h = harness().await;
        h.settings
            .set_request_cooldown(GUILD, &Actor::new(900, "admin"), 0)
            .await
            .expect("disable cooldown");
        for role_id in [HELPER_ROLE, ARTIST_ROLE, TRUSTED_ROLE] {
            h.requests
                .create(&h.requester(), role_id, None)
                .await
                .expect("request");
            h.clock.advance(Duration::seconds(1));
        }

        let page = h.requests.list_pending(GUILD, 0).await.expect("page");
        assert_eq!(page.page, 1);
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages(), 1);
        assert_eq!(page.requests[0].role_id, TRUSTED_ROLE);

        let mine = h
            .requests
            .list_for_user(GUILD, REQUESTER, Some(RequestStatus::Pending))
            .await
            .expect("mine");
        assert_eq!(mine.len(), 3);

        h.platform.delete_role(GUILD, ARTIST_ROLE);
        let available = h.requests.available_roles(GUILD).await.expect("available");
        let names: Vec<&str> = available.iter().map(|role| role.role_name.as_str()).collect();
        assert_eq!(names, vec!["Helper", "Trusted"]);
        assert_eq!(
            available[1].requirements.as_ref().map(|r| r.min_server_age_days),
            Some(3)
        );
    }
}
