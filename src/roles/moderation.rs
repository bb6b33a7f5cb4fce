use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::{info, warn};

use super::settings::{GuildSettings, assignable_role};
use super::{RoleError, post_audit, record_activity};
use crate::db::{
    ActivityAction, ActivityLogEntry, ActivityLogStore, GuildConfig, TempRoleGrant, TempRoleStore,
    new_record_id,
};
use crate::platform::{GuildPlatform, MemberSnapshot, RoleSnapshot};
use crate::utils::time::Clock;

pub const MIN_TEMP_ROLE_SECONDS: i64 = 60;

/// The member and role a moderation command acted on.
#[derive(Debug, Clone)]
pub struct RoleChange {
    pub member: MemberSnapshot,
    pub role: RoleSnapshot,
}

/// A role with its live member count, `None` when the platform could not count.
#[derive(Debug, Clone)]
pub struct RoleInfo {
    pub role: RoleSnapshot,
    pub member_count: Option<u64>,
}

/// Direct role changes by moderators, outside the request flow.
pub struct Moderation {
    settings: Arc<GuildSettings>,
    temp_roles: Arc<dyn TempRoleStore>,
    activity: Arc<dyn ActivityLogStore>,
    platform: Arc<dyn GuildPlatform>,
    clock: Arc<dyn Clock>,
}

impl Moderation {
    pub fn new(
        settings: Arc<GuildSettings>,
        temp_roles: Arc<dyn TempRoleStore>,
        activity: Arc<dyn ActivityLogStore>,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            temp_roles,
            activity,
            platform,
            clock,
        }
    }

    async fn prepare(
        &self,
        actor: &MemberSnapshot,
        target_user_id: u64,
        role_id: u64,
    ) -> Result<(GuildConfig, RoleChange), RoleError> {
        if !(actor.can_manage_roles || actor.is_administrator) {
            return Err(RoleError::PermissionDenied(
                "you need the Manage Roles permission to do that".to_string(),
            ));
        }
        let guild_id = actor.guild_id;
        let role = assignable_role(self.platform.as_ref(), guild_id, role_id).await?;
        let member = self
            .platform
            .fetch_member(guild_id, target_user_id)
            .await?
            .ok_or(RoleError::MemberNotFound)?;
        let config = self.settings.load_or_create(guild_id).await?;
        Ok((config, RoleChange { member, role }))
    }

    async fn log(
        &self,
        config: &GuildConfig,
        action: ActivityAction,
        actor: &MemberSnapshot,
        change: &RoleChange,
        details: serde_json::Value,
    ) {
        let entry = ActivityLogEntry::new(config.guild_id, action, self.clock.now())
            .target(change.member.user_id, change.member.username.clone())
            .performed_by(actor.user_id, actor.username.clone())
            .role(change.role.id, change.role.name.clone())
            .details(details);
        record_activity(self.activity.as_ref(), &entry).await;
        post_audit(self.platform.as_ref(), config, &entry).await;
    }

    pub async fn give_role(
        &self,
        actor: &MemberSnapshot,
        target_user_id: u64,
        role_id: u64,
        reason: Option<&str>,
    ) -> Result<RoleChange, RoleError> {
        let (config, change) = self.prepare(actor, target_user_id, role_id).await?;
        if change.member.has_role(role_id) {
            return Err(RoleError::validation(format!(
                "{} already has {}",
                change.member.display_name, change.role.name
            )));
        }

        self.platform
            .add_role(
                actor.guild_id,
                target_user_id,
                role_id,
                &audit_reason("Given", actor, reason),
            )
            .await?;
        self.log(&config, ActivityAction::RoleGiven, actor, &change, json!({ "reason": reason }))
            .await;
        info!(guild_id = actor.guild_id, target_user_id, role_id, moderator_id = actor.user_id, "role given");
        Ok(change)
    }

    pub async fn remove_role(
        &self,
        actor: &MemberSnapshot,
        target_user_id: u64,
        role_id: u64,
        reason: Option<&str>,
    ) -> Result<RoleChange, RoleError> {
        let (config, change) = self.prepare(actor, target_user_id, role_id).await?;
        if !change.member.has_role(role_id) {
            return Err(RoleError::validation(format!(
                "{} does not have {}",
                change.member.display_name, change.role.name
            )));
        }

        self.platform
            .remove_role(
                actor.guild_id,
                target_user_id,
                role_id,
                &audit_reason("Removed", actor, reason),
            )
            .await?;
        self.log(&config, ActivityAction::RoleRemoved, actor, &change, json!({ "reason": reason }))
            .await;
        info!(guild_id = actor.guild_id, target_user_id, role_id, moderator_id = actor.user_id, "role removed");
        Ok(change)
    }

    /// Grants a role that the temp-role sweeper takes away again after `duration`.
    pub async fn give_temp_role(
        &self,
        actor: &MemberSnapshot,
        target_user_id: u64,
        role_id: u64,
        duration: Duration,
        reason: Option<&str>,
    ) -> Result<TempRoleGrant, RoleError> {
        if duration < Duration::seconds(MIN_TEMP_ROLE_SECONDS) {
            return Err(RoleError::validation("temporary roles must last at least one minute"));
        }
        let (config, change) = self.prepare(actor, target_user_id, role_id).await?;
        if change.member.has_role(role_id) {
            return Err(RoleError::validation(format!(
                "{} already has {}",
                change.member.display_name, change.role.name
            )));
        }

        let now = self.clock.now();
        let grant = TempRoleGrant {
            id: new_record_id(),
            guild_id: actor.guild_id,
            user_id: target_user_id,
            role_id,
            role_name: change.role.name.clone(),
            given_by: actor.user_id,
            given_by_username: Some(actor.username.clone()),
            expires_at: now + duration,
            created_at: now,
        };

        // The grant row exists before the role does, so the sweeper can always take it back.
        self.temp_roles.insert_temp_role(&grant).await?;
        if let Err(e) = self
            .platform
            .add_role(
                actor.guild_id,
                target_user_id,
                role_id,
                &audit_reason("Temporarily given", actor, reason),
            )
            .await
        {
            if let Err(cleanup) = self.temp_roles.delete_temp_role(&grant.id).await {
                warn!(grant_id = %grant.id, "failed to discard temporary role record: {cleanup}");
            }
            return Err(e.into());
        }

        self.log(
            &config,
            ActivityAction::RoleTempGiven,
            actor,
            &change,
            json!({
                "reason": reason,
                "duration_seconds": duration.num_seconds(),
                "expires_at": grant.expires_at,
            }),
        )
        .await;
        info!(
            guild_id = actor.guild_id,
            target_user_id,
            role_id,
            expires_at = %grant.expires_at,
            "temporary role given"
        );
        Ok(grant)
    }

    /// A member's roles, highest first, without the everyone role.
    pub async fn member_roles(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<(MemberSnapshot, Vec<RoleSnapshot>), RoleError> {
        let member = self
            .platform
            .fetch_member(guild_id, user_id)
            .await?
            .ok_or(RoleError::MemberNotFound)?;
        let mut roles = Vec::with_capacity(member.role_ids.len());
        for role_id in &member.role_ids {
            if let Some(role) = self.platform.role(guild_id, *role_id).await? {
                if !role.is_everyone {
                    roles.push(role);
                }
            }
        }
        roles.sort_by(|a, b| b.position.cmp(&a.position).then(a.id.cmp(&b.id)));
        Ok((member, roles))
    }

    pub async fn role_info(&self, guild_id: u64, role_id: u64) -> Result<RoleInfo, RoleError> {
        let role = self
            .platform
            .role(guild_id, role_id)
            .await?
            .ok_or(RoleError::RoleNotFound)?;
        let member_count = self.platform.role_member_count(guild_id, role_id).await?;
        Ok(RoleInfo { role, member_count })
    }
}

fn audit_reason(verb: &str, actor: &MemberSnapshot, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{verb} by {}: {reason}", actor.username),
        None => format!("{verb} by {}", actor.username),
    }
}
