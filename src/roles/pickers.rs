use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use super::settings::{GuildSettings, assignable_role};
use super::{RoleError, record_activity};
use crate::db::{ActivityAction, ActivityLogEntry, ActivityLogStore, ReactionRoleMode};
use crate::platform::{GuildPlatform, MemberSnapshot, RoleSnapshot};
use crate::utils::time::Clock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickerOutcome {
    Added(RoleSnapshot),
    Removed(RoleSnapshot),
    /// Nothing bound to this button or reaction, or nothing to change.
    Ignored,
}

/// Self-service role pickers bound to posted messages: buttons and reactions.
pub struct RolePickers {
    settings: Arc<GuildSettings>,
    activity: Arc<dyn ActivityLogStore>,
    platform: Arc<dyn GuildPlatform>,
    clock: Arc<dyn Clock>,
}

impl RolePickers {
    pub fn new(
        settings: Arc<GuildSettings>,
        activity: Arc<dyn ActivityLogStore>,
        platform: Arc<dyn GuildPlatform>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            activity,
            platform,
            clock,
        }
    }

    /// Handles a `buttonrole:<roleId>` press by flipping the role on the member.
    pub async fn toggle_button_role(
        &self,
        member: &MemberSnapshot,
        role_id: u64,
    ) -> Result<PickerOutcome, RoleError> {
        let config = self.settings.load_or_create(member.guild_id).await?;
        let bound = config
            .button_roles
            .iter()
            .any(|message| message.roles.iter().any(|button| button.role_id == role_id));
        if !bound {
            return Err(RoleError::validation("this button is no longer configured"));
        }

        let role = assignable_role(self.platform.as_ref(), member.guild_id, role_id).await?;
        if member.has_role(role_id) {
            self.platform
                .remove_role(member.guild_id, member.user_id, role_id, "Button role removed")
                .await?;
            self.log(member, ActivityAction::ButtonroleRemoved, &role, None).await;
            Ok(PickerOutcome::Removed(role))
        } else {
            self.platform
                .add_role(member.guild_id, member.user_id, role_id, "Button role added")
                .await?;
            self.log(member, ActivityAction::ButtonroleGiven, &role, None).await;
            Ok(PickerOutcome::Added(role))
        }
    }

    pub async fn reaction_added(
        &self,
        member: &MemberSnapshot,
        channel_id: u64,
        message_id: u64,
        emoji: &str,
    ) -> Result<PickerOutcome, RoleError> {
        if member.is_bot {
            return Ok(PickerOutcome::Ignored);
        }
        let config = self.settings.load_or_create(member.guild_id).await?;
        let Some(picker) = config.reaction_config_for_message(message_id) else {
            return Ok(PickerOutcome::Ignored);
        };
        let Some(binding) = picker.roles.iter().find(|binding| emoji_matches(&binding.emoji, emoji)) else {
            debug!(message_id, emoji, "reaction not bound to a role");
            return Ok(PickerOutcome::Ignored);
        };

        let role = assignable_role(self.platform.as_ref(), member.guild_id, binding.role_id).await?;

        if picker.mode == ReactionRoleMode::Unique {
            for other in picker.roles.iter().filter(|other| other.role_id != role.id) {
                if !member.has_role(other.role_id) {
                    continue;
                }
                self.platform
                    .remove_role(member.guild_id, member.user_id, other.role_id, "Reaction role swapped")
                    .await?;
                if let Ok(Some(other_role)) = self.platform.role(member.guild_id, other.role_id).await {
                    self.log(member, ActivityAction::ReactionroleRemoved, &other_role, Some(message_id))
                        .await;
                }
            }
        }

        let outcome = if member.has_role(role.id) {
            PickerOutcome::Ignored
        } else {
            self.platform
                .add_role(member.guild_id, member.user_id, role.id, "Reaction role added")
                .await?;
            self.log(member, ActivityAction::ReactionroleGiven, &role, Some(message_id))
                .await;
            PickerOutcome::Added(role)
        };

        if picker.mode == ReactionRoleMode::Verify {
            if let Err(e) = self
                .platform
                .remove_reaction(channel_id, message_id, member.user_id, emoji)
                .await
            {
                warn!(channel_id, message_id, "failed to clear verify reaction: {e}");
            }
        }

        Ok(outcome)
    }

    pub async fn reaction_removed(
        &self,
        member: &MemberSnapshot,
        message_id: u64,
        emoji: &str,
    ) -> Result<PickerOutcome, RoleError> {
        if member.is_bot {
            return Ok(PickerOutcome::Ignored);
        }
        let config = self.settings.load_or_create(member.guild_id).await?;
        let Some(picker) = config.reaction_config_for_message(message_id) else {
            return Ok(PickerOutcome::Ignored);
        };
        // verify reactions are cleared by the bot itself, which must not undo the grant
        if picker.mode == ReactionRoleMode::Verify {
            return Ok(PickerOutcome::Ignored);
        }
        let Some(binding) = picker.roles.iter().find(|binding| emoji_matches(&binding.emoji, emoji)) else {
            return Ok(PickerOutcome::Ignored);
        };
        if !member.has_role(binding.role_id) {
            return Ok(PickerOutcome::Ignored);
        }

        let role = assignable_role(self.platform.as_ref(), member.guild_id, binding.role_id).await?;
        self.platform
            .remove_role(member.guild_id, member.user_id, role.id, "Reaction role removed")
            .await?;
        self.log(member, ActivityAction::ReactionroleRemoved, &role, Some(message_id))
            .await;
        Ok(PickerOutcome::Removed(role))
    }

    async fn log(
        &self,
        member: &MemberSnapshot,
        action: ActivityAction,
        role: &RoleSnapshot,
        message_id: Option<u64>,
    ) {
        let mut entry = ActivityLogEntry::new(member.guild_id, action, self.clock.now())
            .target(member.user_id, member.username.clone())
            .performed_by(member.user_id, member.username.clone())
            .role(role.id, role.name.clone());
        if let Some(message_id) = message_id {
            entry = entry.details(json!({ "message_id": message_id.to_string() }));
        }
        record_activity(self.activity.as_ref(), &entry).await;
    }
}

/// Splits `<:name:id>`, `<a:name:id>` or `name:id` into name and id; anything else
/// is a bare unicode or name emoji.
fn emoji_parts(raw: &str) -> (&str, Option<&str>) {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(trimmed);
    let mut parts = inner.rsplit(':');
    match (parts.next(), parts.next()) {
        (Some(id), Some(name)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
            (name, Some(id))
        }
        _ => (inner.trim_matches(':'), None),
    }
}

pub(crate) fn emoji_matches(configured: &str, reacted: &str) -> bool {
    match (emoji_parts(configured), emoji_parts(reacted)) {
        ((_, Some(a)), (_, Some(b))) => a == b,
        ((a, _), (b, _)) => a == b,
    }
}

#[cfg(test)]
mod emoji_tests {
    use test_case::test_case;

    use super::emoji_matches;

    #[test_case("✅", "✅", true)]
    #[test_case("<:party:123>", "<:party:123>", true)]
    #[test_case("<:party:123>", "<a:renamed:123>", true ; "same id different name")]
    #[test_case("party", "<:party:123>", true ; "name only config")]
    #[test_case(":party:", "party", true)]
    #[test_case("<:party:123>", "<:party:456>", false)]
    #[test_case("✅", "❌", false)]
    fn matching(configured: &str, reacted: &str, expected: bool) {
        assert_eq!(emoji_matches(configured, reacted), expected);
    }
}
