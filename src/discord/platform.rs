use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serenity::all::{
    Cache, ChannelId, CreateMessage, GuildId, Http, Member, MessageId, Permissions, ReactionType,
    Role, RoleId, Timestamp, UserId,
};
use tracing::{debug, warn};

use super::commands::PickerPublisher;
use super::embed::{self, EmbedSpec, COLOR_INFO};
use crate::db::{ButtonRoleBinding, ReactionRoleBinding, ReactionRoleMode};
use crate::platform::{
    DeliveryOutcome, GuildPlatform, GuildSummary, MemberSnapshot, Notice, PlatformError,
    RoleSnapshot,
};

/// The parts of a guild needed for permission and hierarchy checks.
struct GuildFacts {
    name: String,
    owner_id: UserId,
    member_count: u64,
    roles: HashMap<RoleId, Role>,
}

impl GuildFacts {
    fn permissions_for(&self, guild_id: GuildId, user_id: UserId, role_ids: &[RoleId]) -> Permissions {
        if user_id == self.owner_id {
            return Permissions::all();
        }
        let mut permissions = self
            .roles
            .get(&guild_id.everyone_role())
            .map(|role| role.permissions)
            .unwrap_or_else(Permissions::empty);
        for role_id in role_ids {
            if let Some(role) = self.roles.get(role_id) {
                permissions |= role.permissions;
            }
        }
        permissions
    }
}

fn to_utc(timestamp: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0).unwrap_or_default()
}

fn status_of(err: &serenity::Error) -> Option<u16> {
    match err {
        serenity::Error::Http(http) => http.status_code().map(|status| status.as_u16()),
        _ => None,
    }
}

fn platform_error(err: serenity::Error) -> PlatformError {
    match status_of(&err) {
        Some(403) => PlatformError::MissingPermissions(err.to_string()),
        Some(404) => PlatformError::NotFound(err.to_string()),
        _ => PlatformError::Request(err.to_string()),
    }
}

fn role_snapshot(guild_id: GuildId, role: &Role) -> RoleSnapshot {
    RoleSnapshot {
        id: role.id.get(),
        name: role.name.clone(),
        color: role.colour.0,
        position: i64::from(role.position),
        managed: role.managed,
        is_everyone: role.id == guild_id.everyone_role(),
    }
}

/// Snapshot of a gateway member, with permissions folded from its roles.
fn snapshot(member: &Member, permissions: Permissions) -> MemberSnapshot {
    let is_administrator = permissions.contains(Permissions::ADMINISTRATOR);
    MemberSnapshot {
        guild_id: member.guild_id.get(),
        user_id: member.user.id.get(),
        username: member.user.name.clone(),
        display_name: member.display_name().to_string(),
        is_bot: member.user.bot,
        account_created_at: to_utc(member.user.id.created_at()),
        joined_at: member.joined_at.map(to_utc),
        role_ids: member.roles.iter().map(|role_id| role_id.get()).collect(),
        is_administrator,
        can_manage_roles: is_administrator || permissions.contains(Permissions::MANAGE_ROLES),
    }
}

/// [`GuildPlatform`] over serenity's HTTP client, reading guild structure from the
/// gateway cache when it is warm.
pub struct SerenityPlatform {
    http: Arc<Http>,
    cache: Arc<Cache>,
    bot_user_id: UserId,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, cache: Arc<Cache>, bot_user_id: UserId) -> Self {
        Self {
            http,
            cache,
            bot_user_id,
        }
    }

    async fn guild_facts(&self, guild_id: GuildId) -> Result<Option<GuildFacts>, PlatformError> {
        let cached = self.cache.guild(guild_id).map(|guild| GuildFacts {
            name: guild.name.clone(),
            owner_id: guild.owner_id,
            member_count: guild.member_count,
            roles: guild.roles.clone(),
        });
        if cached.is_some() {
            return Ok(cached);
        }

        match self.http.get_guild(guild_id).await {
            Ok(guild) => Ok(Some(GuildFacts {
                name: guild.name,
                owner_id: guild.owner_id,
                member_count: guild.approximate_member_count.unwrap_or(0),
                roles: guild.roles,
            })),
            Err(e) if status_of(&e) == Some(404) => Ok(None),
            Err(e) => Err(platform_error(e)),
        }
    }

    async fn fetch_raw_member(&self, guild_id: GuildId, user_id: UserId) -> Result<Option<Member>, PlatformError> {
        match self.http.get_member(guild_id, user_id).await {
            Ok(member) => Ok(Some(member)),
            Err(e) if status_of(&e) == Some(404) => Ok(None),
            Err(e) => Err(platform_error(e)),
        }
    }

    /// Builds a snapshot for a member the gateway already handed us.
    pub async fn snapshot_member(&self, member: &Member) -> Result<MemberSnapshot, PlatformError> {
        let permissions = self
            .guild_facts(member.guild_id)
            .await?
            .map(|facts| facts.permissions_for(member.guild_id, member.user.id, &member.roles))
            .unwrap_or_else(Permissions::empty);
        Ok(snapshot(member, permissions))
    }

    /// Interaction payloads carry the resolved permissions of the invoker; prefer those.
    pub async fn snapshot_invoker(
        &self,
        member: &Member,
        resolved: Option<Permissions>,
    ) -> Result<MemberSnapshot, PlatformError> {
        match resolved {
            Some(permissions) => Ok(snapshot(member, permissions)),
            None => self.snapshot_member(member).await,
        }
    }

    async fn send(&self, channel_id: ChannelId, notice: &Notice) -> DeliveryOutcome {
        let mut message = CreateMessage::new().embed(embed::notice(notice).to_create_embed());
        if let Notice::RequestReview { request, .. } = notice {
            message = message.components(vec![embed::review_buttons(&request.id)]);
        }
        if let Notice::WelcomeChannel { user_id, .. } = notice {
            message = message.content(format!("<@{user_id}>"));
        }
        match channel_id.send_message(self.http.as_ref(), message).await {
            Ok(_) => DeliveryOutcome::Delivered,
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }
}

#[async_trait]
impl GuildPlatform for SerenityPlatform {
    async fn fetch_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberSnapshot>, PlatformError> {
        let guild_id = GuildId::new(guild_id);
        let Some(member) = self.fetch_raw_member(guild_id, UserId::new(user_id)).await? else {
            return Ok(None);
        };
        Ok(Some(self.snapshot_member(&member).await?))
    }

    async fn role(&self, guild_id: u64, role_id: u64) -> Result<Option<RoleSnapshot>, PlatformError> {
        let guild_id = GuildId::new(guild_id);
        Ok(self
            .guild_facts(guild_id)
            .await?
            .and_then(|facts| facts.roles.get(&RoleId::new(role_id)).map(|role| role_snapshot(guild_id, role))))
    }

    async fn bot_top_position(&self, guild_id: u64) -> Result<i64, PlatformError> {
        let guild_id = GuildId::new(guild_id);
        let member = self
            .fetch_raw_member(guild_id, self.bot_user_id)
            .await?
            .ok_or_else(|| PlatformError::NotFound(format!("bot is not a member of guild {guild_id}")))?;
        let Some(facts) = self.guild_facts(guild_id).await? else {
            return Ok(0);
        };
        Ok(member
            .roles
            .iter()
            .filter_map(|role_id| facts.roles.get(role_id))
            .map(|role| i64::from(role.position))
            .max()
            .unwrap_or(0))
    }

    async fn guild_summary(&self, guild_id: u64) -> Result<Option<GuildSummary>, PlatformError> {
        Ok(self
            .guild_facts(GuildId::new(guild_id))
            .await?
            .map(|facts| GuildSummary {
                id: guild_id,
                name: facts.name,
                member_count: facts.member_count,
            }))
    }

    async fn role_member_count(&self, guild_id: u64, role_id: u64) -> Result<Option<u64>, PlatformError> {
        let role_id = RoleId::new(role_id);
        Ok(self.cache.guild(GuildId::new(guild_id)).map(|guild| {
            guild
                .members
                .values()
                .filter(|member| member.roles.contains(&role_id))
                .count() as u64
        }))
    }

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .add_member_role(GuildId::new(guild_id), UserId::new(user_id), RoleId::new(role_id), Some(reason))
            .await
            .map_err(platform_error)
    }

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError> {
        self.http
            .remove_member_role(GuildId::new(guild_id), UserId::new(user_id), RoleId::new(role_id), Some(reason))
            .await
            .map_err(platform_error)
    }

    async fn send_direct(&self, user_id: u64, notice: &Notice) -> DeliveryOutcome {
        match UserId::new(user_id).create_dm_channel(self.http.as_ref()).await {
            Ok(channel) => self.send(channel.id, notice).await,
            Err(e) => DeliveryOutcome::Failed(e.to_string()),
        }
    }

    async fn send_to_channel(&self, channel_id: u64, notice: &Notice) -> DeliveryOutcome {
        self.send(ChannelId::new(channel_id), notice).await
    }

    async fn remove_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        user_id: u64,
        emoji: &str,
    ) -> Result<(), PlatformError> {
        let reaction = ReactionType::try_from(emoji)
            .map_err(|e| PlatformError::Request(format!("invalid emoji {emoji:?}: {e}")))?;
        self.http
            .delete_reaction(
                ChannelId::new(channel_id),
                MessageId::new(message_id),
                UserId::new(user_id),
                &reaction,
            )
            .await
            .map_err(platform_error)
    }
}

fn picker_embed(title: &str, lines: Vec<String>) -> EmbedSpec {
    EmbedSpec::new(title, COLOR_INFO).description(lines.join("\n"))
}

#[async_trait]
impl PickerPublisher for SerenityPlatform {
    async fn publish_buttons(
        &self,
        channel_id: u64,
        title: &str,
        buttons: &[ButtonRoleBinding],
    ) -> Result<u64, PlatformError> {
        let lines = buttons
            .iter()
            .map(|button| format!("<@&{}>", button.role_id))
            .collect();
        let message = CreateMessage::new()
            .embed(
                picker_embed(title, lines)
                    .footer("Press a button to add or remove the role")
                    .to_create_embed(),
            )
            .components(embed::button_role_rows(buttons));
        let sent = ChannelId::new(channel_id)
            .send_message(self.http.as_ref(), message)
            .await
            .map_err(platform_error)?;
        Ok(sent.id.get())
    }

    async fn publish_reactions(
        &self,
        channel_id: u64,
        title: &str,
        mode: ReactionRoleMode,
        reactions: &[ReactionRoleBinding],
    ) -> Result<u64, PlatformError> {
        let mut parsed = Vec::with_capacity(reactions.len());
        for binding in reactions {
            let reaction = ReactionType::try_from(binding.emoji.as_str()).map_err(|e| {
                PlatformError::Request(format!("invalid emoji {:?}: {e}", binding.emoji))
            })?;
            parsed.push(reaction);
        }

        let lines = reactions
            .iter()
            .map(|binding| format!("{} <@&{}>", binding.emoji, binding.role_id))
            .collect();
        let footer = match mode {
            ReactionRoleMode::Unique => "React to pick one role",
            ReactionRoleMode::Verify => "React to receive the role",
            ReactionRoleMode::Normal | ReactionRoleMode::Drop => "React to add a role, remove the reaction to drop it",
        };
        let message = CreateMessage::new().embed(picker_embed(title, lines).footer(footer).to_create_embed());
        let sent = ChannelId::new(channel_id)
            .send_message(self.http.as_ref(), message)
            .await
            .map_err(platform_error)?;

        for reaction in parsed {
            if let Err(e) = sent.react(self.http.as_ref(), reaction).await {
                warn!(channel_id, message_id = sent.id.get(), "failed to add picker reaction: {e}");
            }
        }
        debug!(channel_id, message_id = sent.id.get(), "reaction picker published");
        Ok(sent.id.get())
    }
}
