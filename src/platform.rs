use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{ActivityLogEntry, RoleRequest};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("missing permissions: {0}")]
    MissingPermissions(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("platform request failed: {0}")]
    Request(String),
}

/// What the core knows about a guild member at the time of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberSnapshot {
    pub guild_id: u64,
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
    pub is_bot: bool,
    pub account_created_at: DateTime<Utc>,
    pub joined_at: Option<DateTime<Utc>>,
    pub role_ids: HashSet<u64>,
    pub is_administrator: bool,
    pub can_manage_roles: bool,
}

impl MemberSnapshot {
    pub fn has_role(&self, role_id: u64) -> bool {
        self.role_ids.contains(&role_id)
    }

    pub fn has_any_role(&self, role_ids: &[u64]) -> bool {
        role_ids.iter().any(|role_id| self.role_ids.contains(role_id))
    }

    pub fn mention(&self) -> String {
        format!("<@{}>", self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSnapshot {
    pub id: u64,
    pub name: String,
    /// RGB value, 0 when the role has no color.
    pub color: u32,
    pub position: i64,
    pub managed: bool,
    pub is_everyone: bool,
}

impl RoleSnapshot {
    pub fn mention(&self) -> String {
        format!("<@&{}>", self.id)
    }

    pub fn hex_color(&self) -> Option<String> {
        (self.color != 0).then(|| format!("#{:06X}", self.color))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSummary {
    pub id: u64,
    pub name: String,
    pub member_count: u64,
}

/// Messages the core asks the platform to deliver. Rendering is the platform's job.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    RequestReview {
        request: RoleRequest,
        requester_mention: String,
    },
    RequestApproved {
        guild_name: String,
        role_name: String,
        moderator: String,
        note: Option<String>,
    },
    RequestDenied {
        guild_name: String,
        role_name: String,
        moderator: String,
        reason: Option<String>,
    },
    Welcome {
        guild_name: String,
        text: String,
    },
    WelcomeChannel {
        user_id: u64,
        text: String,
    },
    Audit(ActivityLogEntry),
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::RequestReview { .. } => "request_review",
            Notice::RequestApproved { .. } => "request_approved",
            Notice::RequestDenied { .. } => "request_denied",
            Notice::Welcome { .. } => "welcome",
            Notice::WelcomeChannel { .. } => "welcome_channel",
            Notice::Audit(_) => "audit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(String),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryOutcome::Delivered => f.write_str("delivered"),
            DeliveryOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Chat platform capabilities used by the role core.
///
/// Lookups return `Ok(None)` when the entity does not exist; errors are reserved for
/// failed calls. Message delivery never errors, it reports a [`DeliveryOutcome`].
#[async_trait]
pub trait GuildPlatform: Send + Sync {
    async fn fetch_member(
        &self,
        guild_id: u64,
        user_id: u64,
    ) -> Result<Option<MemberSnapshot>, PlatformError>;

    async fn role(&self, guild_id: u64, role_id: u64) -> Result<Option<RoleSnapshot>, PlatformError>;

    /// Position of the highest role held by the bot itself.
    async fn bot_top_position(&self, guild_id: u64) -> Result<i64, PlatformError>;

    async fn guild_summary(&self, guild_id: u64) -> Result<Option<GuildSummary>, PlatformError>;

    /// Members known to hold the role, `None` when the platform cannot count them.
    async fn role_member_count(&self, guild_id: u64, role_id: u64) -> Result<Option<u64>, PlatformError>;

    async fn add_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: &str,
    ) -> Result<(), PlatformError>;

    async fn send_direct(&self, user_id: u64, notice: &Notice) -> DeliveryOutcome;

    async fn send_to_channel(&self, channel_id: u64, notice: &Notice) -> DeliveryOutcome;

    async fn remove_reaction(
        &self,
        channel_id: u64,
        message_id: u64,
        user_id: u64,
        emoji: &str,
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;

    use super::{
        DeliveryOutcome, GuildPlatform, GuildSummary, MemberSnapshot, Notice, PlatformError,
        RoleSnapshot,
    };

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum PlatformCall {
        AddRole { guild_id: u64, user_id: u64, role_id: u64, reason: String },
        RemoveRole { guild_id: u64, user_id: u64, role_id: u64, reason: String },
        Direct { user_id: u64, notice: Notice },
        Channel { channel_id: u64, notice: Notice },
        RemoveReaction { channel_id: u64, message_id: u64, user_id: u64, emoji: String },
    }

    #[derive(Default)]
    struct FakeState {
        members: HashMap<(u64, u64), MemberSnapshot>,
        roles: HashMap<(u64, u64), RoleSnapshot>,
        guilds: HashMap<u64, GuildSummary>,
        bot_top: HashMap<u64, i64>,
        calls: Vec<PlatformCall>,
        fail_role_updates: bool,
        fail_deliveries: bool,
    }

    /// In-memory guild used by core tests. Role updates mutate the stored member
    /// snapshots so follow-up lookups observe them.
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        state: Mutex<FakeState>,
    }

    impl FakePlatform {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_guild(self, guild_id: u64, name: &str, bot_top: i64) -> Self {
            {
                let mut state = self.state.lock();
                state.guilds.insert(
                    guild_id,
                    GuildSummary {
                        id: guild_id,
                        name: name.to_string(),
                        member_count: 0,
                    },
                );
                state.bot_top.insert(guild_id, bot_top);
                state.roles.insert(
                    (guild_id, guild_id),
                    RoleSnapshot {
                        id: guild_id,
                        name: "@everyone".to_string(),
                        color: 0,
                        position: 0,
                        managed: false,
                        is_everyone: true,
                    },
                );
            }
            self
        }

        pub(crate) fn with_role(self, guild_id: u64, role_id: u64, name: &str, position: i64) -> Self {
            self.state.lock().roles.insert(
                (guild_id, role_id),
                RoleSnapshot {
                    id: role_id,
                    name: name.to_string(),
                    color: 0,
                    position,
                    managed: false,
                    is_everyone: false,
                },
            );
            self
        }

        pub(crate) fn with_managed_role(self, guild_id: u64, role_id: u64, name: &str) -> Self {
            self.state.lock().roles.insert(
                (guild_id, role_id),
                RoleSnapshot {
                    id: role_id,
                    name: name.to_string(),
                    color: 0,
                    position: 1,
                    managed: true,
                    is_everyone: false,
                },
            );
            self
        }

        pub(crate) fn with_member(self, member: MemberSnapshot) -> Self {
            self.insert_member(member);
            self
        }

        pub(crate) fn insert_member(&self, member: MemberSnapshot) {
            let mut state = self.state.lock();
            if let Some(guild) = state.guilds.get_mut(&member.guild_id) {
                guild.member_count += 1;
            }
            state.members.insert((member.guild_id, member.user_id), member);
        }

        pub(crate) fn remove_member(&self, guild_id: u64, user_id: u64) {
            self.state.lock().members.remove(&(guild_id, user_id));
        }

        pub(crate) fn delete_role(&self, guild_id: u64, role_id: u64) {
            self.state.lock().roles.remove(&(guild_id, role_id));
        }

        pub(crate) fn set_bot_top(&self, guild_id: u64, position: i64) {
            self.state.lock().bot_top.insert(guild_id, position);
        }

        pub(crate) fn fail_role_updates(&self) {
            self.state.lock().fail_role_updates = true;
        }

        pub(crate) fn fail_deliveries(&self) {
            self.state.lock().fail_deliveries = true;
        }

        pub(crate) fn member(&self, guild_id: u64, user_id: u64) -> Option<MemberSnapshot> {
            self.state.lock().members.get(&(guild_id, user_id)).cloned()
        }

        pub(crate) fn calls(&self) -> Vec<PlatformCall> {
            self.state.lock().calls.clone()
        }

        pub(crate) fn role_grants(&self) -> Vec<(u64, u64)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    PlatformCall::AddRole { user_id, role_id, .. } => Some((user_id, role_id)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn role_removals(&self) -> Vec<(u64, u64)> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    PlatformCall::RemoveRole { user_id, role_id, .. } => Some((user_id, role_id)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn deliveries(&self) -> Vec<PlatformCall> {
            self.calls()
                .into_iter()
                .filter(|call| {
                    matches!(call, PlatformCall::Direct { .. } | PlatformCall::Channel { .. })
                })
                .collect()
        }
    }

    /// A regular member whose account is `account_age_days` old and who joined
    /// `member_days` ago.
    pub(crate) fn member(
        guild_id: u64,
        user_id: u64,
        now: DateTime<Utc>,
        account_age_days: i64,
        member_days: i64,
    ) -> MemberSnapshot {
        MemberSnapshot {
            guild_id,
            user_id,
            username: format!("user{user_id}"),
            display_name: format!("User {user_id}"),
            is_bot: false,
            account_created_at: now - Duration::days(account_age_days),
            joined_at: Some(now - Duration::days(member_days)),
            role_ids: HashSet::new(),
            is_administrator: false,
            can_manage_roles: false,
        }
    }

    #[async_trait]
    impl GuildPlatform for FakePlatform {
        async fn fetch_member(
            &self,
            guild_id: u64,
            user_id: u64,
        ) -> Result<Option<MemberSnapshot>, PlatformError> {
            Ok(self.member(guild_id, user_id))
        }

        async fn role(
            &self,
            guild_id: u64,
            role_id: u64,
        ) -> Result<Option<RoleSnapshot>, PlatformError> {
            Ok(self.state.lock().roles.get(&(guild_id, role_id)).cloned())
        }

        async fn bot_top_position(&self, guild_id: u64) -> Result<i64, PlatformError> {
            self.state
                .lock()
                .bot_top
                .get(&guild_id)
                .copied()
                .ok_or_else(|| PlatformError::NotFound(format!("guild {guild_id}")))
        }

        async fn guild_summary(&self, guild_id: u64) -> Result<Option<GuildSummary>, PlatformError> {
            Ok(self.state.lock().guilds.get(&guild_id).cloned())
        }

        async fn role_member_count(
            &self,
            guild_id: u64,
            role_id: u64,
        ) -> Result<Option<u64>, PlatformError> {
            let state = self.state.lock();
            let count = state
                .members
                .values()
                .filter(|member| member.guild_id == guild_id && member.has_role(role_id))
                .count();
            Ok(Some(count as u64))
        }

        async fn add_role(
            &self,
            guild_id: u64,
            user_id: u64,
            role_id: u64,
            reason: &str,
        ) -> Result<(), PlatformError> {
            let mut state = self.state.lock();
            state.calls.push(PlatformCall::AddRole {
                guild_id,
                user_id,
                role_id,
                reason: reason.to_string(),
            });
            if state.fail_role_updates {
                return Err(PlatformError::Request("role update rejected".to_string()));
            }
            let member = state
                .members
                .get_mut(&(guild_id, user_id))
                .ok_or_else(|| PlatformError::NotFound(format!("member {user_id}")))?;
            member.role_ids.insert(role_id);
            Ok(())
        }

        async fn remove_role(
            &self,
            guild_id: u64,
            user_id: u64,
            role_id: u64,
            reason: &str,
        ) -> Result<(), PlatformError> {
            let mut state = self.state.lock();
            state.calls.push(PlatformCall::RemoveRole {
                guild_id,
                user_id,
                role_id,
                reason: reason.to_string(),
            });
            if state.fail_role_updates {
                return Err(PlatformError::Request("role update rejected".to_string()));
            }
            let member = state
                .members
                .get_mut(&(guild_id, user_id))
                .ok_or_else(|| PlatformError::NotFound(format!("member {user_id}")))?;
            member.role_ids.remove(&role_id);
            Ok(())
        }

        async fn send_direct(&self, user_id: u64, notice: &Notice) -> DeliveryOutcome {
            let mut state = self.state.lock();
            state.calls.push(PlatformCall::Direct {
                user_id,
                notice: notice.clone(),
            });
            if state.fail_deliveries {
                DeliveryOutcome::Failed("direct messages disabled".to_string())
            } else {
                DeliveryOutcome::Delivered
            }
        }

        async fn send_to_channel(&self, channel_id: u64, notice: &Notice) -> DeliveryOutcome {
            let mut state = self.state.lock();
            state.calls.push(PlatformCall::Channel {
                channel_id,
                notice: notice.clone(),
            });
            if state.fail_deliveries {
                DeliveryOutcome::Failed("channel unavailable".to_string())
            } else {
                DeliveryOutcome::Delivered
            }
        }

        async fn remove_reaction(
            &self,
            channel_id: u64,
            message_id: u64,
            user_id: u64,
            emoji: &str,
        ) -> Result<(), PlatformError> {
            self.state.lock().calls.push(PlatformCall::RemoveReaction {
                channel_id,
                message_id,
                user_id,
                emoji: emoji.to_string(),
            });
            Ok(())
        }
    }
}
