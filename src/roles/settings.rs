use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Actor, RoleError};
use crate::db::{
    ActivityAction, ActivityLogEntry, ActivityLogStore, AutoRoleRule, ButtonRoleConfig,
    GuildConfig, GuildConfigStore, NotificationSettings, ReactionRoleConfig, Requirements,
    RoleTier, SelfRole,
};
use crate::platform::{GuildPlatform, RoleSnapshot};
use crate::utils::time::Clock;

pub const MAX_AUTO_ROLE_DELAY_SECONDS: u32 = 300;
pub const MAX_AUTO_ROLE_ACCOUNT_AGE_DAYS: u32 = 365;
pub const MAX_WELCOME_TEMPLATE_LENGTH: usize = 1000;

/// Rejects roles the bot must never hand out: integration-managed roles, the
/// everyone pseudo-role and anything at or above the bot's own top role.
pub fn validate_assignable_role(role: &RoleSnapshot, bot_top_position: i64) -> Result<(), RoleError> {
    if role.is_everyone {
        return Err(RoleError::validation("the @everyone role cannot be assigned"));
    }
    if role.managed {
        return Err(RoleError::validation(format!(
            "{} is managed by an integration and cannot be assigned",
            role.name
        )));
    }
    if role.position >= bot_top_position {
        return Err(RoleError::validation(format!(
            "{} is higher than or equal to my highest role, I cannot manage it",
            role.name
        )));
    }
    Ok(())
}

/// Looks up a live role and checks that the bot may assign it.
pub async fn assignable_role(
    platform: &dyn GuildPlatform,
    guild_id: u64,
    role_id: u64,
) -> Result<RoleSnapshot, RoleError> {
    let role = platform
        .role(guild_id, role_id)
        .await?
        .ok_or(RoleError::RoleNotFound)?;
    let bot_top = platform.bot_top_position(guild_id).await?;
    validate_assignable_role(&role, bot_top)?;
    Ok(role)
}

pub struct GuildSettings {
    store: Arc<dyn GuildConfigStore>,
    activity: Arc<dyn ActivityLogStore>,
    clock: Arc<dyn Clock>,
    default_cooldown_seconds: u64,
}

impl GuildSettings {
    pub fn new(
        store: Arc<dyn GuildConfigStore>,
        activity: Arc<dyn ActivityLogStore>,
        clock: Arc<dyn Clock>,
        default_cooldown_seconds: u64,
    ) -> Self {
        Self {
            store,
            activity,
            clock,
            default_cooldown_seconds,
        }
    }

    pub async fn load_or_create(&self, guild_id: u64) -> Result<GuildConfig, RoleError> {
        if let Some(config) = self.store.get_guild_config(guild_id).await? {
            return Ok(config);
        }

        let config = GuildConfig::with_defaults(guild_id, self.default_cooldown_seconds);
        self.store
            .upsert_guild_config(&config, self.clock.now())
            .await?;
        info!(guild_id, "created default guild configuration");
        Ok(config)
    }

    /// Makes sure a configuration exists and carries the current guild name.
    pub async fn ensure_guild(&self, guild_id: u64, name: &str) -> Result<GuildConfig, RoleError> {
        let mut config = self.load_or_create(guild_id).await?;
        if config.guild_name.as_deref() != Some(name) {
            config.guild_name = Some(name.to_string());
            self.store
                .upsert_guild_config(&config, self.clock.now())
                .await?;
            debug!(guild_id, name, "refreshed stored guild name");
        }
        Ok(config)
    }

    async fn update<T>(
        &self,
        guild_id: u64,
        actor: &Actor,
        action: ActivityAction,
        details: Value,
        apply: impl FnOnce(&mut GuildConfig) -> Result<T, RoleError>,
    ) -> Result<T, RoleError> {
        let mut config = self.load_or_create(guild_id).await?;
        let outcome = apply(&mut config)?;
        let now = self.clock.now();
        self.store.upsert_guild_config(&config, now).await?;

        let entry = ActivityLogEntry::new(guild_id, action, now)
            .performed_by(actor.user_id, actor.username.clone())
            .details(details);
        self.activity.record_activity(&entry).await?;
        Ok(outcome)
    }

    /// Adds an auto-role rule, replacing any existing rule for the same role.
    pub async fn add_auto_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        rule: AutoRoleRule,
    ) -> Result<(), RoleError> {
        if rule.delay_seconds > MAX_AUTO_ROLE_DELAY_SECONDS {
            return Err(RoleError::validation(format!(
                "delay must be between 0 and {MAX_AUTO_ROLE_DELAY_SECONDS} seconds"
            )));
        }
        if rule.min_account_age_days > MAX_AUTO_ROLE_ACCOUNT_AGE_DAYS {
            return Err(RoleError::validation(format!(
                "minimum account age must be between 0 and {MAX_AUTO_ROLE_ACCOUNT_AGE_DAYS} days"
            )));
        }

        let details = json!({
            "section": "auto_roles",
            "op": "add",
            "role_id": rule.role_id.to_string(),
            "delay_seconds": rule.delay_seconds,
            "min_account_age_days": rule.min_account_age_days,
        });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config.auto_roles.retain(|existing| existing.role_id != rule.role_id);
            config.auto_roles.push(rule);
            Ok(())
        })
        .await
    }

    pub async fn remove_auto_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        role_id: u64,
    ) -> Result<(), RoleError> {
        let details = json!({ "section": "auto_roles", "op": "remove", "role_id": role_id.to_string() });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            let before = config.auto_roles.len();
            config.auto_roles.retain(|rule| rule.role_id != role_id);
            if config.auto_roles.len() == before {
                return Err(RoleError::validation("that role is not configured as an auto-role"));
            }
            Ok(())
        })
        .await
    }

    pub async fn toggle_auto_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        role_id: u64,
        enabled: bool,
    ) -> Result<(), RoleError> {
        let details = json!({
            "section": "auto_roles",
            "op": "toggle",
            "role_id": role_id.to_string(),
            "enabled": enabled,
        });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            let rule = config
                .auto_roles
                .iter_mut()
                .find(|rule| rule.role_id == role_id)
                .ok_or_else(|| RoleError::validation("that role is not configured as an auto-role"))?;
            rule.enabled = enabled;
            Ok(())
        })
        .await
    }

    pub async fn set_welcome_message(
        &self,
        guild_id: u64,
        actor: &Actor,
        enabled: bool,
        template: Option<String>,
        channel_id: Option<u64>,
    ) -> Result<(), RoleError> {
        if let Some(template) = &template {
            if template.trim().is_empty() {
                return Err(RoleError::validation("the welcome message cannot be empty"));
            }
            if template.chars().count() > MAX_WELCOME_TEMPLATE_LENGTH {
                return Err(RoleError::validation(format!(
                    "the welcome message must be at most {MAX_WELCOME_TEMPLATE_LENGTH} characters"
                )));
            }
        }

        let details = json!({ "section": "welcome_message", "enabled": enabled });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config.welcome_message.enabled = enabled;
            if let Some(template) = template {
                config.welcome_message.template = template;
            }
            config.welcome_message.channel_id = channel_id;
            Ok(())
        })
        .await
    }

    pub async fn create_tier(
        &self,
        guild_id: u64,
        actor: &Actor,
        name: &str,
        level: i32,
        color: Option<&str>,
    ) -> Result<(), RoleError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RoleError::validation("tier name cannot be empty"));
        }
        if level < 1 {
            return Err(RoleError::validation("tier level must be at least 1"));
        }

        let details = json!({ "tier": name, "level": level });
        self.update(guild_id, actor, ActivityAction::TierCreated, details, |config| {
            if config.tier_by_name(name).is_some() {
                return Err(RoleError::validation(format!("a tier named {name} already exists")));
            }
            if let Some(existing) = config.role_tiers.iter().find(|tier| tier.level == level) {
                return Err(RoleError::validation(format!(
                    "level {level} is already used by the {} tier",
                    existing.name
                )));
            }
            let mut tier = RoleTier::new(name, level, color.unwrap_or("#5865F2"), Requirements::default());
            tier.requirements = None;
            config.role_tiers.push(tier);
            config.role_tiers.sort_by_key(|tier| tier.level);
            Ok(())
        })
        .await
    }

    /// Puts a role under a tier. A role may only be governed by one tier.
    pub async fn add_role_to_tier(
        &self,
        guild_id: u64,
        actor: &Actor,
        tier_name: &str,
        role_id: u64,
    ) -> Result<(), RoleError> {
        let details = json!({ "tier": tier_name, "op": "add_role", "role_id": role_id.to_string() });
        self.update(guild_id, actor, ActivityAction::TierUpdated, details, |config| {
            if let Some(owner) = config
                .role_tiers
                .iter()
                .find(|tier| tier.roles.contains(&role_id) && !tier.name.eq_ignore_ascii_case(tier_name))
            {
                return Err(RoleError::RoleInAnotherTier {
                    tier: owner.name.clone(),
                });
            }

            let tier = config
                .tier_by_name_mut(tier_name)
                .ok_or_else(|| unknown_tier(tier_name))?;
            if tier.roles.contains(&role_id) {
                return Err(RoleError::validation(format!(
                    "that role is already part of the {} tier",
                    tier.name
                )));
            }
            tier.roles.push(role_id);
            Ok(())
        })
        .await
    }

    pub async fn remove_role_from_tier(
        &self,
        guild_id: u64,
        actor: &Actor,
        tier_name: &str,
        role_id: u64,
    ) -> Result<(), RoleError> {
        let details = json!({ "tier": tier_name, "op": "remove_role", "role_id": role_id.to_string() });
        self.update(guild_id, actor, ActivityAction::TierUpdated, details, |config| {
            let tier = config
                .tier_by_name_mut(tier_name)
                .ok_or_else(|| unknown_tier(tier_name))?;
            let before = tier.roles.len();
            tier.roles.retain(|id| *id != role_id);
            if tier.roles.len() == before {
                return Err(RoleError::validation(format!(
                    "that role is not part of the {} tier",
                    tier.name
                )));
            }
            Ok(())
        })
        .await
    }

    pub async fn set_tier_approvers(
        &self,
        guild_id: u64,
        actor: &Actor,
        tier_name: &str,
        approver_roles: Vec<u64>,
    ) -> Result<(), RoleError> {
        let details = json!({
            "tier": tier_name,
            "op": "approvers",
            "approver_roles": approver_roles.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        self.update(guild_id, actor, ActivityAction::TierUpdated, details, |config| {
            let tier = config
                .tier_by_name_mut(tier_name)
                .ok_or_else(|| unknown_tier(tier_name))?;
            tier.approver_roles = approver_roles;
            Ok(())
        })
        .await
    }

    pub async fn set_tier_requirements(
        &self,
        guild_id: u64,
        actor: &Actor,
        tier_name: &str,
        requirements: Requirements,
    ) -> Result<(), RoleError> {
        let details = json!({
            "tier": tier_name,
            "op": "requirements",
            "min_messages": requirements.min_messages,
            "min_account_age_days": requirements.min_account_age_days,
            "min_server_age_days": requirements.min_server_age_days,
        });
        self.update(guild_id, actor, ActivityAction::TierUpdated, details, |config| {
            let tier = config
                .tier_by_name_mut(tier_name)
                .ok_or_else(|| unknown_tier(tier_name))?;
            tier.requirements = Some(requirements);
            Ok(())
        })
        .await
    }

    pub async fn set_notifications(
        &self,
        guild_id: u64,
        actor: &Actor,
        notifications: NotificationSettings,
    ) -> Result<(), RoleError> {
        let details = json!({
            "section": "notifications",
            "request_channel_id": notifications.request_channel_id.map(|id| id.to_string()),
            "log_channel_id": notifications.log_channel_id.map(|id| id.to_string()),
            "approval_dm_enabled": notifications.approval_dm_enabled,
            "denial_dm_enabled": notifications.denial_dm_enabled,
        });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config.notifications = notifications;
            Ok(())
        })
        .await
    }

    pub async fn set_request_cooldown(
        &self,
        guild_id: u64,
        actor: &Actor,
        seconds: u64,
    ) -> Result<(), RoleError> {
        let details = json!({ "section": "request_cooldown", "seconds": seconds });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config.request_cooldown_seconds = seconds;
            Ok(())
        })
        .await
    }

    /// Binds buttons to a posted message, replacing any previous binding for it.
    pub async fn add_button_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        binding: ButtonRoleConfig,
    ) -> Result<(), RoleError> {
        if binding.roles.is_empty() {
            return Err(RoleError::validation("a button role message needs at least one role"));
        }
        let details = json!({
            "section": "button_roles",
            "message_id": binding.message_id.to_string(),
            "roles": binding.roles.len(),
        });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config
                .button_roles
                .retain(|existing| existing.message_id != binding.message_id);
            config.button_roles.push(binding);
            Ok(())
        })
        .await
    }

    pub async fn add_reaction_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        binding: ReactionRoleConfig,
    ) -> Result<(), RoleError> {
        if binding.roles.is_empty() {
            return Err(RoleError::validation("a reaction role message needs at least one role"));
        }
        let details = json!({
            "section": "reaction_roles",
            "message_id": binding.message_id.to_string(),
            "mode": binding.mode,
            "roles": binding.roles.len(),
        });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config
                .reaction_roles
                .retain(|existing| existing.message_id != binding.message_id);
            config.reaction_roles.push(binding);
            Ok(())
        })
        .await
    }

    pub async fn add_self_role(
        &self,
        guild_id: u64,
        actor: &Actor,
        self_role: SelfRole,
    ) -> Result<(), RoleError> {
        let details = json!({ "section": "self_roles", "role_id": self_role.role_id.to_string() });
        self.update(guild_id, actor, ActivityAction::ConfigUpdated, details, |config| {
            config.self_roles.retain(|existing| existing.role_id != self_role.role_id);
            config.self_roles.push(self_role);
            Ok(())
        })
        .await
    }
}

fn unknown_tier(name: &str) -> RoleError {
    RoleError::validation(format!("no tier named {name}"))
}
