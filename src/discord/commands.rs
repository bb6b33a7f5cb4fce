use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandOptionType, CreateCommand,
    CreateCommandOption, Permissions,
};
use tracing::{debug, error, info, warn};

use super::embed::{self, APPROVE_PREFIX, BUTTON_ROLE_PREFIX, DENY_PREFIX, EmbedSpec};
use crate::db::{
    AutoRoleRule, ButtonRoleBinding, ButtonRoleConfig, ButtonStyleKind, ReactionRoleBinding,
    ReactionRoleConfig, ReactionRoleMode, RequestStatus, Requirements,
};
use crate::platform::{GuildPlatform, MemberSnapshot, PlatformError};
use crate::roles::{
    Actor, CommandCooldowns, CooldownCheck, Decision, ErrorKind, PickerOutcome, ResolveOutcome,
    RoleCore, RoleError, assignable_role,
};
use crate::utils::time::parse_duration;

const MAX_PICKER_BUTTONS: usize = 5;
const MAX_PICKER_REACTIONS: usize = 3;
const MAX_APPROVER_ROLES: usize = 3;

/// Posts role picker messages. Returns the id of the message that was created.
#[async_trait]
pub trait PickerPublisher: Send + Sync {
    async fn publish_buttons(
        &self,
        channel_id: u64,
        title: &str,
        buttons: &[ButtonRoleBinding],
    ) -> Result<u64, PlatformError>;

    async fn publish_reactions(
        &self,
        channel_id: u64,
        title: &str,
        mode: ReactionRoleMode,
        reactions: &[ReactionRoleBinding],
    ) -> Result<u64, PlatformError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Bool(bool),
    User(u64),
    Role(u64),
    Channel(u64),
}

/// Flattened slash command options, keyed by option name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args(HashMap<String, ArgValue>);

impl Args {
    pub fn with(mut self, name: &str, value: ArgValue) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(ArgValue::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(ArgValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(ArgValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn user(&self, name: &str) -> Option<u64> {
        match self.0.get(name) {
            Some(ArgValue::User(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn role(&self, name: &str) -> Option<u64> {
        match self.0.get(name) {
            Some(ArgValue::Role(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn channel(&self, name: &str) -> Option<u64> {
        match self.0.get(name) {
            Some(ArgValue::Channel(id)) => Some(*id),
            _ => None,
        }
    }

    fn text(&self, name: &str) -> Option<String> {
        self.str(name).map(str::to_string)
    }
}

fn required<T>(value: Option<T>, name: &str) -> Result<T, RoleError> {
    value.ok_or_else(|| RoleError::validation(format!("missing option `{name}`")))
}

fn small_count(value: Option<i64>, name: &str) -> Result<u32, RoleError> {
    u32::try_from(value.unwrap_or(0))
        .map_err(|_| RoleError::validation(format!("`{name}` must be zero or more")))
}

/// A slash command as received: its name, the chosen subcommand and the arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub name: String,
    pub subcommand: Option<String>,
    pub args: Args,
}

impl Invocation {
    pub fn new(name: &str, subcommand: Option<&str>, args: Args) -> Self {
        Self {
            name: name.to_string(),
            subcommand: subcommand.map(str::to_string),
            args,
        }
    }

    pub fn from_options(name: &str, options: &[CommandDataOption]) -> Self {
        let mut subcommand = None;
        let mut args = Args::default();
        for option in options {
            match &option.value {
                CommandDataOptionValue::SubCommand(inner) => {
                    subcommand = Some(option.name.clone());
                    for inner_option in inner {
                        if let Some(value) = arg_value(&inner_option.value) {
                            args.0.insert(inner_option.name.clone(), value);
                        }
                    }
                }
                value => {
                    if let Some(value) = arg_value(value) {
                        args.0.insert(option.name.clone(), value);
                    }
                }
            }
        }
        Self {
            name: name.to_string(),
            subcommand,
            args,
        }
    }
}

fn arg_value(value: &CommandDataOptionValue) -> Option<ArgValue> {
    match value {
        CommandDataOptionValue::String(value) => Some(ArgValue::Str(value.clone())),
        CommandDataOptionValue::Integer(value) => Some(ArgValue::Int(*value)),
        CommandDataOptionValue::Boolean(value) => Some(ArgValue::Bool(*value)),
        CommandDataOptionValue::User(id) => Some(ArgValue::User(id.get())),
        CommandDataOptionValue::Role(id) => Some(ArgValue::Role(id.get())),
        CommandDataOptionValue::Channel(id) => Some(ArgValue::Channel(id.get())),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SlashCommand {
    RequestRole { role_id: u64, reason: Option<String> },
    MyRequests { status: Option<RequestStatus> },
    AvailableRoles,
    Approve { request_id: String, note: Option<String> },
    Deny { request_id: String, reason: Option<String> },
    Pending { page: i64 },
    GiveRole { user_id: u64, role_id: u64, reason: Option<String> },
    RemoveRole { user_id: u64, role_id: u64, reason: Option<String> },
    TempRole { user_id: u64, role_id: u64, duration: Duration, reason: Option<String> },
    ListRoles { user_id: u64 },
    RoleInfo { role_id: u64 },
    AutoRoleAdd(AutoRoleRule),
    AutoRoleRemove { role_id: u64 },
    AutoRoleList,
    AutoRoleToggle { role_id: u64, enabled: bool },
    WelcomeMessage { enabled: bool, template: Option<String>, channel_id: Option<u64> },
    TierCreate { name: String, level: i32, color: Option<String> },
    TierAddRole { tier: String, role_id: u64 },
    TierRemoveRole { tier: String, role_id: u64 },
    TierApprovers { tier: String, role_ids: Vec<u64> },
    TierRequirements { tier: String, requirements: Requirements },
    TierList,
    Notifications {
        request_channel_id: Option<u64>,
        log_channel_id: Option<u64>,
        approval_dm: Option<bool>,
        denial_dm: Option<bool>,
    },
    ButtonRoles { channel_id: u64, title: String, role_ids: Vec<u64> },
    ReactionRoles {
        channel_id: u64,
        title: String,
        mode: ReactionRoleMode,
        bindings: Vec<(String, u64)>,
    },
}

impl SlashCommand {
    pub fn parse(invocation: &Invocation) -> Result<Self, RoleError> {
        let args = &invocation.args;
        let sub = invocation.subcommand.as_deref();
        let command = match (invocation.name.as_str(), sub) {
            ("request-role", _) => SlashCommand::RequestRole {
                role_id: required(args.role("role"), "role")?,
                reason: args.text("reason"),
            },
            ("my-requests", _) => SlashCommand::MyRequests {
                status: args
                    .str("status")
                    .map(|status| {
                        status
                            .parse::<RequestStatus>()
                            .map_err(|_| RoleError::validation(format!("unknown status `{status}`")))
                    })
                    .transpose()?,
            },
            ("available-roles", _) => SlashCommand::AvailableRoles,
            ("approve", _) => SlashCommand::Approve {
                request_id: required(args.text("request_id"), "request_id")?,
                note: args.text("note"),
            },
            ("deny", _) => SlashCommand::Deny {
                request_id: required(args.text("request_id"), "request_id")?,
                reason: args.text("reason"),
            },
            ("pending", _) => SlashCommand::Pending {
                page: args.int("page").unwrap_or(1).max(1),
            },
            ("role", Some("give")) => SlashCommand::GiveRole {
                user_id: required(args.user("user"), "user")?,
                role_id: required(args.role("role"), "role")?,
                reason: args.text("reason"),
            },
            ("role", Some("remove")) => SlashCommand::RemoveRole {
                user_id: required(args.user("user"), "user")?,
                role_id: required(args.role("role"), "role")?,
                reason: args.text("reason"),
            },
            ("role", Some("temp")) => {
                let raw = required(args.str("duration"), "duration")?;
                let duration = parse_duration(raw).ok_or_else(|| {
                    RoleError::validation("use a duration like 30m, 2h, 1d or 1w")
                })?;
                SlashCommand::TempRole {
                    user_id: required(args.user("user"), "user")?,
                    role_id: required(args.role("role"), "role")?,
                    duration,
                    reason: args.text("reason"),
                }
            }
            ("role", Some("list")) => SlashCommand::ListRoles {
                user_id: required(args.user("user"), "user")?,
            },
            ("role", Some("info")) => SlashCommand::RoleInfo {
                role_id: required(args.role("role"), "role")?,
            },
            ("setup-autorole", Some("add")) => SlashCommand::AutoRoleAdd(AutoRoleRule {
                role_id: required(args.role("role"), "role")?,
                role_name: None,
                enabled: true,
                delay_seconds: small_count(args.int("delay"), "delay")?,
                ignore_bots: args.bool("ignore_bots").unwrap_or(true),
                min_account_age_days: small_count(args.int("min_account_age"), "min_account_age")?,
            }),
            ("setup-autorole", Some("remove")) => SlashCommand::AutoRoleRemove {
                role_id: required(args.role("role"), "role")?,
            },
            ("setup-autorole", Some("list")) => SlashCommand::AutoRoleList,
            ("setup-autorole", Some("toggle")) => SlashCommand::AutoRoleToggle {
                role_id: required(args.role("role"), "role")?,
                enabled: required(args.bool("enabled"), "enabled")?,
            },
            ("setup-autorole", Some("welcome-message")) => SlashCommand::WelcomeMessage {
                enabled: required(args.bool("enabled"), "enabled")?,
                template: args.text("message"),
                channel_id: args.channel("channel"),
            },
            ("setup-tier", Some("create")) => SlashCommand::TierCreate {
                name: required(args.text("name"), "name")?,
                level: i32::try_from(required(args.int("level"), "level")?)
                    .map_err(|_| RoleError::validation("`level` is out of range"))?,
                color: args.text("color"),
            },
            ("setup-tier", Some("add-role")) => SlashCommand::TierAddRole {
                tier: required(args.text("tier"), "tier")?,
                role_id: required(args.role("role"), "role")?,
            },
            ("setup-tier", Some("remove-role")) => SlashCommand::TierRemoveRole {
                tier: required(args.text("tier"), "tier")?,
                role_id: required(args.role("role"), "role")?,
            },
            ("setup-tier", Some("approvers")) => SlashCommand::TierApprovers {
                tier: required(args.text("tier"), "tier")?,
                role_ids: numbered("role", MAX_APPROVER_ROLES)
                    .filter_map(|name| args.role(&name))
                    .collect(),
            },
            ("setup-tier", Some("requirements")) => SlashCommand::TierRequirements {
                tier: required(args.text("tier"), "tier")?,
                requirements: Requirements {
                    min_messages: small_count(args.int("min_messages"), "min_messages")?,
                    min_account_age_days: small_count(args.int("min_account_age"), "min_account_age")?,
                    min_server_age_days: small_count(args.int("min_server_age"), "min_server_age")?,
                    required_roles: args.role("required_role").into_iter().collect(),
                },
            },
            ("setup-tier", Some("list")) => SlashCommand::TierList,
            ("setup-notifications", _) => SlashCommand::Notifications {
                request_channel_id: args.channel("request_channel"),
                log_channel_id: args.channel("log_channel"),
                approval_dm: args.bool("approval_dm"),
                denial_dm: args.bool("denial_dm"),
            },
            ("setup-buttonrole", _) => {
                let role_ids: Vec<u64> = numbered("role", MAX_PICKER_BUTTONS)
                    .filter_map(|name| args.role(&name))
                    .collect();
                if role_ids.is_empty() {
                    return Err(RoleError::validation("pick at least one role"));
                }
                SlashCommand::ButtonRoles {
                    channel_id: required(args.channel("channel"), "channel")?,
                    title: required(args.text("title"), "title")?,
                    role_ids,
                }
            }
            ("setup-reactionrole", _) => {
                let mut bindings = Vec::new();
                for slot in 1..=MAX_PICKER_REACTIONS {
                    let emoji = args.str(&format!("emoji{slot}")).map(str::trim);
                    let role = args.role(&format!("role{slot}"));
                    match (emoji, role) {
                        (Some(emoji), Some(role_id)) if !emoji.is_empty() => {
                            bindings.push((emoji.to_string(), role_id))
                        }
                        (None, None) => {}
                        _ => {
                            return Err(RoleError::validation(format!(
                                "emoji{slot} and role{slot} must be given together"
                            )));
                        }
                    }
                }
                if bindings.is_empty() {
                    return Err(RoleError::validation("pick at least one emoji and role"));
                }
                let mode = match args.str("mode").unwrap_or("normal") {
                    "normal" => ReactionRoleMode::Normal,
                    "unique" => ReactionRoleMode::Unique,
                    "verify" => ReactionRoleMode::Verify,
                    "drop" => ReactionRoleMode::Drop,
                    other => {
                        return Err(RoleError::validation(format!("unknown mode `{other}`")));
                    }
                };
                SlashCommand::ReactionRoles {
                    channel_id: required(args.channel("channel"), "channel")?,
                    title: required(args.text("title"), "title")?,
                    mode,
                    bindings,
                }
            }
            (name, sub) => {
                return Err(RoleError::validation(match sub {
                    Some(sub) => format!("unknown command `/{name} {sub}`"),
                    None => format!("unknown command `/{name}`"),
                }));
            }
        };
        Ok(command)
    }
}

fn numbered(prefix: &str, count: usize) -> impl Iterator<Item = String> + '_ {
    (1..=count).map(move |slot| format!("{prefix}{slot}"))
}

/// Button presses the bot understands, decoded from the component custom id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentAction {
    Approve(String),
    Deny(String),
    ButtonRole(u64),
}

impl ComponentAction {
    pub fn parse(custom_id: &str) -> Option<Self> {
        if let Some(id) = custom_id.strip_prefix(APPROVE_PREFIX) {
            return (!id.is_empty()).then(|| ComponentAction::Approve(id.to_string()));
        }
        if let Some(id) = custom_id.strip_prefix(DENY_PREFIX) {
            return (!id.is_empty()).then(|| ComponentAction::Deny(id.to_string()));
        }
        custom_id
            .strip_prefix(BUTTON_ROLE_PREFIX)
            .and_then(|id| id.parse().ok())
            .map(ComponentAction::ButtonRole)
    }
}

/// Whether a command's answer is posted for the whole channel. The interaction is
/// deferred with this visibility before any work runs.
pub fn answers_publicly(command: &str) -> bool {
    command == "role"
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub embed: EmbedSpec,
    pub ephemeral: bool,
}

impl Reply {
    pub fn private(embed: EmbedSpec) -> Self {
        Self {
            embed,
            ephemeral: true,
        }
    }

    pub fn public(embed: EmbedSpec) -> Self {
        Self {
            embed,
            ephemeral: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentReply {
    /// Replace the message the button sits on; its buttons are dropped.
    UpdateMessage(EmbedSpec),
    Reply(Reply),
}

/// Runs slash commands and button presses against the role core.
pub struct CommandDispatcher {
    core: Arc<RoleCore>,
    platform: Arc<dyn GuildPlatform>,
    publisher: Arc<dyn PickerPublisher>,
    dashboard_url: String,
}

impl CommandDispatcher {
    pub fn new(
        core: Arc<RoleCore>,
        platform: Arc<dyn GuildPlatform>,
        publisher: Arc<dyn PickerPublisher>,
        dashboard_url: impl Into<String>,
    ) -> Self {
        Self {
            core,
            platform,
            publisher,
            dashboard_url: dashboard_url.into(),
        }
    }

    pub async fn dispatch(&self, actor: &MemberSnapshot, invocation: &Invocation) -> Reply {
        let window = CommandCooldowns::window_for(&invocation.name);
        if let CooldownCheck::Limited { retry_at } =
            self.core
                .cooldowns
                .check_and_record(&invocation.name, actor.user_id, window)
        {
            debug!(command = %invocation.name, user_id = actor.user_id, "command on cooldown");
            return Reply::private(embed::slow_down(retry_at));
        }

        let result = match SlashCommand::parse(invocation) {
            Ok(command) => self.execute(actor, command).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Transient => {
                        warn!(command = %invocation.name, guild_id = actor.guild_id, "command hit a transient failure: {e}")
                    }
                    ErrorKind::Internal => {
                        error!(command = %invocation.name, guild_id = actor.guild_id, "command failed: {e}")
                    }
                    _ => debug!(command = %invocation.name, user_id = actor.user_id, "command rejected: {e}"),
                }
                Reply::private(embed::error(&e))
            }
        }
    }

    pub async fn execute(&self, actor: &MemberSnapshot, command: SlashCommand) -> Result<Reply, RoleError> {
        let guild_id = actor.guild_id;
        let by = Actor::from_member(actor);
        let settings = &self.core.settings;

        let reply = match command {
            SlashCommand::RequestRole { role_id, reason } => {
                let request = self.core.requests.create(actor, role_id, reason).await?;
                Reply::private(embed::request_created(&request))
            }
            SlashCommand::MyRequests { status } => {
                let requests = self
                    .core
                    .requests
                    .list_for_user(guild_id, actor.user_id, status)
                    .await?;
                Reply::private(embed::my_requests(&requests))
            }
            SlashCommand::AvailableRoles => {
                let roles = self.core.requests.available_roles(guild_id).await?;
                Reply::private(embed::available_roles(&roles, &self.dashboard_url))
            }
            SlashCommand::Approve { request_id, note } => {
                let outcome = self
                    .core
                    .requests
                    .resolve_by_display_id(guild_id, &request_id, actor, Decision::Approve, note)
                    .await?;
                Reply::private(outcome_embed(&outcome))
            }
            SlashCommand::Deny { request_id, reason } => {
                let outcome = self
                    .core
                    .requests
                    .resolve_by_display_id(guild_id, &request_id, actor, Decision::Deny, reason)
                    .await?;
                Reply::private(outcome_embed(&outcome))
            }
            SlashCommand::Pending { page } => {
                self.require_reviewer(actor).await?;
                let page = self.core.requests.list_pending(guild_id, page).await?;
                Reply::private(embed::pending_page(&page))
            }
            SlashCommand::GiveRole { user_id, role_id, reason } => {
                let change = self
                    .core
                    .moderation
                    .give_role(actor, user_id, role_id, reason.as_deref())
                    .await?;
                Reply::public(embed::success(
                    "Role given",
                    format!("Gave {} to {}.", change.role.mention(), change.member.mention()),
                ))
            }
            SlashCommand::RemoveRole { user_id, role_id, reason } => {
                let change = self
                    .core
                    .moderation
                    .remove_role(actor, user_id, role_id, reason.as_deref())
                    .await?;
                Reply::public(embed::success(
                    "Role removed",
                    format!("Removed {} from {}.", change.role.mention(), change.member.mention()),
                ))
            }
            SlashCommand::TempRole { user_id, role_id, duration, reason } => {
                let grant = self
                    .core
                    .moderation
                    .give_temp_role(actor, user_id, role_id, duration, reason.as_deref())
                    .await?;
                Reply::public(embed::success(
                    "Temporary role given",
                    format!(
                        "Gave <@&{}> to <@{}> until <t:{}:f>.",
                        grant.role_id,
                        grant.user_id,
                        grant.expires_at.timestamp()
                    ),
                ))
            }
            SlashCommand::ListRoles { user_id } => {
                let (member, roles) = self.core.moderation.member_roles(guild_id, user_id).await?;
                Reply::public(embed::member_roles(&member, &roles))
            }
            SlashCommand::RoleInfo { role_id } => {
                let info = self.core.moderation.role_info(guild_id, role_id).await?;
                Reply::public(embed::role_info(&info))
            }
            SlashCommand::AutoRoleAdd(mut rule) => {
                require_admin(actor)?;
                let role = assignable_role(self.platform.as_ref(), guild_id, rule.role_id).await?;
                rule.role_name = Some(role.name.clone());
                let delay = rule.delay_seconds;
                settings.add_auto_role(guild_id, &by, rule).await?;
                let when = if delay == 0 {
                    "on join".to_string()
                } else {
                    format!("{delay}s after joining")
                };
                Reply::private(embed::success(
                    "Auto-role added",
                    format!("New members get {} {when}.", role.mention()),
                ))
            }
            SlashCommand::AutoRoleRemove { role_id } => {
                require_admin(actor)?;
                settings.remove_auto_role(guild_id, &by, role_id).await?;
                Reply::private(embed::success(
                    "Auto-role removed",
                    format!("<@&{role_id}> is no longer given on join."),
                ))
            }
            SlashCommand::AutoRoleList => {
                require_admin(actor)?;
                let config = settings.load_or_create(guild_id).await?;
                Reply::private(embed::auto_role_list(&config))
            }
            SlashCommand::AutoRoleToggle { role_id, enabled } => {
                require_admin(actor)?;
                settings
                    .toggle_auto_role(guild_id, &by, role_id, enabled)
                    .await?;
                Reply::private(embed::success(
                    "Auto-role updated",
                    format!(
                        "<@&{role_id}> is now {}.",
                        if enabled { "enabled" } else { "disabled" }
                    ),
                ))
            }
            SlashCommand::WelcomeMessage { enabled, template, channel_id } => {
                require_admin(actor)?;
                settings
                    .set_welcome_message(guild_id, &by, enabled, template, channel_id)
                    .await?;
                Reply::private(embed::success(
                    "Welcome message updated",
                    if enabled {
                        "New members will be welcomed."
                    } else {
                        "Welcome messages are off."
                    },
                ))
            }
            SlashCommand::TierCreate { name, level, color } => {
                require_admin(actor)?;
                settings
                    .create_tier(guild_id, &by, &name, level, color.as_deref())
                    .await?;
                Reply::private(embed::success(
                    "Tier created",
                    format!("Created tier **{}** at level {level}.", name.trim()),
                ))
            }
            SlashCommand::TierAddRole { tier, role_id } => {
                require_admin(actor)?;
                let role = assignable_role(self.platform.as_ref(), guild_id, role_id).await?;
                settings.add_role_to_tier(guild_id, &by, &tier, role_id).await?;
                Reply::private(embed::success(
                    "Tier updated",
                    format!("{} can now be requested through **{tier}**.", role.mention()),
                ))
            }
            SlashCommand::TierRemoveRole { tier, role_id } => {
                require_admin(actor)?;
                settings
                    .remove_role_from_tier(guild_id, &by, &tier, role_id)
                    .await?;
                Reply::private(embed::success(
                    "Tier updated",
                    format!("Removed <@&{role_id}> from **{tier}**."),
                ))
            }
            SlashCommand::TierApprovers { tier, role_ids } => {
                require_admin(actor)?;
                let description = if role_ids.is_empty() {
                    format!("Anyone with Manage Roles can review **{tier}** requests.")
                } else {
                    format!(
                        "**{tier}** requests can be reviewed by {}.",
                        role_ids
                            .iter()
                            .map(|id| format!("<@&{id}>"))
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                };
                settings
                    .set_tier_approvers(guild_id, &by, &tier, role_ids)
                    .await?;
                Reply::private(embed::success("Approvers updated", description))
            }
            SlashCommand::TierRequirements { tier, requirements } => {
                require_admin(actor)?;
                settings
                    .set_tier_requirements(guild_id, &by, &tier, requirements)
                    .await?;
                Reply::private(embed::success(
                    "Requirements updated",
                    format!("Saved requirements for **{tier}**."),
                ))
            }
            SlashCommand::TierList => {
                let config = settings.load_or_create(guild_id).await?;
                Reply::private(embed::tier_list(&config))
            }
            SlashCommand::Notifications {
                request_channel_id,
                log_channel_id,
                approval_dm,
                denial_dm,
            } => {
                require_admin(actor)?;
                let mut notifications = settings.load_or_create(guild_id).await?.notifications;
                if request_channel_id.is_some() {
                    notifications.request_channel_id = request_channel_id;
                }
                if log_channel_id.is_some() {
                    notifications.log_channel_id = log_channel_id;
                }
                if let Some(enabled) = approval_dm {
                    notifications.approval_dm_enabled = enabled;
                }
                if let Some(enabled) = denial_dm {
                    notifications.denial_dm_enabled = enabled;
                }
                let summary = format!(
                    "Requests: {}\nAudit log: {}\nApproval DMs: {}\nDenial DMs: {}",
                    channel_or_none(notifications.request_channel_id),
                    channel_or_none(notifications.log_channel_id),
                    on_off(notifications.approval_dm_enabled),
                    on_off(notifications.denial_dm_enabled),
                );
                settings.set_notifications(guild_id, &by, notifications).await?;
                Reply::private(embed::success("Notifications updated", summary))
            }
            SlashCommand::ButtonRoles { channel_id, title, role_ids } => {
                require_admin(actor)?;
                let mut buttons = Vec::with_capacity(role_ids.len());
                for role_id in role_ids {
                    let role = assignable_role(self.platform.as_ref(), guild_id, role_id).await?;
                    buttons.push(ButtonRoleBinding {
                        role_id,
                        label: role.name,
                        style: ButtonStyleKind::Primary,
                        emoji: None,
                    });
                }
                let message_id = self
                    .publisher
                    .publish_buttons(channel_id, &title, &buttons)
                    .await?;
                settings
                    .add_button_role(
                        guild_id,
                        &by,
                        ButtonRoleConfig {
                            message_id,
                            channel_id,
                            roles: buttons,
                        },
                    )
                    .await?;
                info!(guild_id, channel_id, message_id, "button role picker posted");
                Reply::private(embed::success(
                    "Button roles posted",
                    format!("Posted the picker in <#{channel_id}>."),
                ))
            }
            SlashCommand::ReactionRoles { channel_id, title, mode, bindings } => {
                require_admin(actor)?;
                let mut reactions = Vec::with_capacity(bindings.len());
                for (emoji, role_id) in bindings {
                    let role = assignable_role(self.platform.as_ref(), guild_id, role_id).await?;
                    reactions.push(ReactionRoleBinding {
                        emoji,
                        role_id,
                        description: Some(role.name),
                    });
                }
                let message_id = self
                    .publisher
                    .publish_reactions(channel_id, &title, mode, &reactions)
                    .await?;
                settings
                    .add_reaction_role(
                        guild_id,
                        &by,
                        ReactionRoleConfig {
                            message_id,
                            channel_id,
                            mode,
                            roles: reactions,
                        },
                    )
                    .await?;
                info!(guild_id, channel_id, message_id, "reaction role picker posted");
                Reply::private(embed::success(
                    "Reaction roles posted",
                    format!("Posted the picker in <#{channel_id}>."),
                ))
            }
        };
        Ok(reply)
    }

    pub async fn press(&self, actor: &MemberSnapshot, action: ComponentAction) -> ComponentReply {
        let result = match action {
            ComponentAction::Approve(request_id) => self
                .core
                .requests
                .resolve(actor.guild_id, &request_id, actor, Decision::Approve, None)
                .await
                .map(|outcome| ComponentReply::UpdateMessage(embed::request_resolved(outcome.request()))),
            ComponentAction::Deny(request_id) => self
                .core
                .requests
                .resolve(actor.guild_id, &request_id, actor, Decision::Deny, None)
                .await
                .map(|outcome| ComponentReply::UpdateMessage(embed::request_resolved(outcome.request()))),
            ComponentAction::ButtonRole(role_id) => self
                .core
                .pickers
                .toggle_button_role(actor, role_id)
                .await
                .map(|outcome| ComponentReply::Reply(Reply::private(picker_embed(&outcome)))),
        };
        match result {
            Ok(reply) => reply,
            Err(e) => {
                if !e.is_user_facing() {
                    error!(guild_id = actor.guild_id, user_id = actor.user_id, "button press failed: {e}");
                }
                ComponentReply::Reply(Reply::private(embed::error(&e)))
            }
        }
    }

    async fn require_reviewer(&self, actor: &MemberSnapshot) -> Result<(), RoleError> {
        if actor.is_administrator || actor.can_manage_roles {
            return Ok(());
        }
        let config = self.core.settings.load_or_create(actor.guild_id).await?;
        let approver = config
            .role_tiers
            .iter()
            .any(|tier| actor.has_any_role(&tier.approver_roles));
        if approver {
            Ok(())
        } else {
            Err(RoleError::PermissionDenied(
                "only moderators and tier approvers can see pending requests".to_string(),
            ))
        }
    }
}

fn require_admin(actor: &MemberSnapshot) -> Result<(), RoleError> {
    if actor.is_administrator {
        Ok(())
    } else {
        Err(RoleError::PermissionDenied(
            "you need the Administrator permission to change bot settings".to_string(),
        ))
    }
}

fn outcome_embed(outcome: &ResolveOutcome) -> EmbedSpec {
    match outcome {
        ResolveOutcome::Resolved(request) => embed::request_resolved(request),
        ResolveOutcome::MemberGone(request) => embed::info(
            "Request cancelled",
            format!(
                "<@{}> left the server, so the request for **{}** was cancelled.",
                request.user_id, request.role_name
            ),
        ),
    }
}

fn picker_embed(outcome: &PickerOutcome) -> EmbedSpec {
    match outcome {
        PickerOutcome::Added(role) => embed::success("Role added", format!("You now have {}.", role.mention())),
        PickerOutcome::Removed(role) => {
            embed::info("Role removed", format!("You no longer have {}.", role.mention()))
        }
        PickerOutcome::Ignored => embed::info("Nothing changed", "This button has nothing to do."),
    }
}

fn channel_or_none(channel_id: Option<u64>) -> String {
    channel_id
        .map(|id| format!("<#{id}>"))
        .unwrap_or_else(|| "not set".to_string())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}

fn option(kind: CommandOptionType, name: &str, description: &str, required: bool) -> CreateCommandOption {
    CreateCommandOption::new(kind, name, description).required(required)
}

fn subcommand(name: &str, description: &str) -> CreateCommandOption {
    CreateCommandOption::new(CommandOptionType::SubCommand, name, description)
}

fn target_options(sub: CreateCommandOption) -> CreateCommandOption {
    sub.add_sub_option(option(CommandOptionType::User, "user", "Member to change", true))
        .add_sub_option(option(CommandOptionType::Role, "role", "Role to change", true))
}

/// Global slash command definitions registered on ready.
pub fn definitions() -> Vec<CreateCommand> {
    let status = option(CommandOptionType::String, "status", "Only show requests in this state", false)
        .add_string_choice("Pending", "pending")
        .add_string_choice("Approved", "approved")
        .add_string_choice("Denied", "denied")
        .add_string_choice("Cancelled", "cancelled")
        .add_string_choice("Expired", "expired");

    let mode = option(CommandOptionType::String, "mode", "How reactions behave", false)
        .add_string_choice("Normal", "normal")
        .add_string_choice("Unique (one role at a time)", "unique")
        .add_string_choice("Verify (add only)", "verify")
        .add_string_choice("Drop", "drop");

    let mut button_role = CreateCommand::new("setup-buttonrole")
        .description("Post a message with buttons that toggle roles")
        .default_member_permissions(Permissions::ADMINISTRATOR)
        .add_option(option(CommandOptionType::Channel, "channel", "Where to post", true))
        .add_option(option(CommandOptionType::String, "title", "Message title", true));
    for slot in 1..=MAX_PICKER_BUTTONS {
        button_role = button_role.add_option(option(
            CommandOptionType::Role,
            &format!("role{slot}"),
            "Role for a button",
            slot == 1,
        ));
    }

    let mut reaction_role = CreateCommand::new("setup-reactionrole")
        .description("Post a message where reactions toggle roles")
        .default_member_permissions(Permissions::ADMINISTRATOR)
        .add_option(option(CommandOptionType::Channel, "channel", "Where to post", true))
        .add_option(option(CommandOptionType::String, "title", "Message title", true))
        .add_option(option(CommandOptionType::String, "emoji1", "Emoji for the first role", true))
        .add_option(option(CommandOptionType::Role, "role1", "First role", true))
        .add_option(mode);
    for slot in 2..=MAX_PICKER_REACTIONS {
        reaction_role = reaction_role
            .add_option(option(CommandOptionType::String, &format!("emoji{slot}"), "Emoji for another role", false))
            .add_option(option(CommandOptionType::Role, &format!("role{slot}"), "Another role", false));
    }

    let mut approvers = subcommand("approvers", "Set which roles review requests in a tier")
        .add_sub_option(option(CommandOptionType::String, "tier", "Tier name", true));
    for slot in 1..=MAX_APPROVER_ROLES {
        approvers = approvers.add_sub_option(option(
            CommandOptionType::Role,
            &format!("role{slot}"),
            "Approver role",
            false,
        ));
    }

    vec![
        CreateCommand::new("request-role")
            .description("Ask the moderators for a role")
            .add_option(option(CommandOptionType::Role, "role", "The role you want", true))
            .add_option(option(CommandOptionType::String, "reason", "Why you want it", false)),
        CreateCommand::new("my-requests")
            .description("Show your role requests")
            .add_option(status),
        CreateCommand::new("available-roles").description("List roles you can request"),
        CreateCommand::new("approve")
            .description("Approve a pending role request")
            .add_option(option(CommandOptionType::String, "request_id", "Request ID", true))
            .add_option(option(CommandOptionType::String, "note", "Note for the member", false)),
        CreateCommand::new("deny")
            .description("Deny a pending role request")
            .add_option(option(CommandOptionType::String, "request_id", "Request ID", true))
            .add_option(option(CommandOptionType::String, "reason", "Reason for the member", false)),
        CreateCommand::new("pending")
            .description("List pending role requests")
            .add_option(option(CommandOptionType::Integer, "page", "Page number", false)),
        CreateCommand::new("role")
            .description("Change a member's roles directly")
            .default_member_permissions(Permissions::MANAGE_ROLES)
            .add_option(
                target_options(subcommand("give", "Give a role"))
                    .add_sub_option(option(CommandOptionType::String, "reason", "Audit log reason", false)),
            )
            .add_option(
                target_options(subcommand("remove", "Remove a role"))
                    .add_sub_option(option(CommandOptionType::String, "reason", "Audit log reason", false)),
            )
            .add_option(
                target_options(subcommand("temp", "Give a role for a limited time"))
                    .add_sub_option(option(CommandOptionType::String, "duration", "e.g. 30m, 2h, 1d, 1w", true))
                    .add_sub_option(option(CommandOptionType::String, "reason", "Audit log reason", false)),
            )
            .add_option(
                subcommand("list", "List a member's roles")
                    .add_sub_option(option(CommandOptionType::User, "user", "Member to inspect", true)),
            )
            .add_option(
                subcommand("info", "Show details about a role")
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role to inspect", true)),
            ),
        CreateCommand::new("setup-autorole")
            .description("Configure roles given on join")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(
                subcommand("add", "Give a role to new members")
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role to give", true))
                    .add_sub_option(option(CommandOptionType::Integer, "delay", "Seconds to wait after joining", false))
                    .add_sub_option(option(CommandOptionType::Integer, "min_account_age", "Minimum account age in days", false))
                    .add_sub_option(option(CommandOptionType::Boolean, "ignore_bots", "Skip bot accounts", false)),
            )
            .add_option(
                subcommand("remove", "Stop giving a role on join")
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role", true)),
            )
            .add_option(subcommand("list", "Show auto-roles"))
            .add_option(
                subcommand("toggle", "Enable or disable an auto-role")
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role", true))
                    .add_sub_option(option(CommandOptionType::Boolean, "enabled", "Enabled", true)),
            )
            .add_option(
                subcommand("welcome-message", "Configure the welcome message")
                    .add_sub_option(option(CommandOptionType::Boolean, "enabled", "Send welcome messages", true))
                    .add_sub_option(option(
                        CommandOptionType::String,
                        "message",
                        "Supports {user}, {server}, {roles}, {memberCount}",
                        false,
                    ))
                    .add_sub_option(option(CommandOptionType::Channel, "channel", "Also post here", false)),
            ),
        CreateCommand::new("setup-tier")
            .description("Configure requestable role tiers")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(
                subcommand("create", "Create a tier")
                    .add_sub_option(option(CommandOptionType::String, "name", "Tier name", true))
                    .add_sub_option(option(CommandOptionType::Integer, "level", "Tier level", true))
                    .add_sub_option(option(CommandOptionType::String, "color", "Hex color like #5865F2", false)),
            )
            .add_option(
                subcommand("add-role", "Make a role requestable in a tier")
                    .add_sub_option(option(CommandOptionType::String, "tier", "Tier name", true))
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role", true)),
            )
            .add_option(
                subcommand("remove-role", "Remove a role from a tier")
                    .add_sub_option(option(CommandOptionType::String, "tier", "Tier name", true))
                    .add_sub_option(option(CommandOptionType::Role, "role", "Role", true)),
            )
            .add_option(approvers)
            .add_option(
                subcommand("requirements", "Set what members need before requesting")
                    .add_sub_option(option(CommandOptionType::String, "tier", "Tier name", true))
                    .add_sub_option(option(CommandOptionType::Integer, "min_messages", "Messages sent", false))
                    .add_sub_option(option(CommandOptionType::Integer, "min_account_age", "Account age in days", false))
                    .add_sub_option(option(CommandOptionType::Integer, "min_server_age", "Days since joining", false))
                    .add_sub_option(option(CommandOptionType::Role, "required_role", "Role they must already have", false)),
            )
            .add_option(subcommand("list", "Show tiers")),
        CreateCommand::new("setup-notifications")
            .description("Configure where request notices go")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(option(CommandOptionType::Channel, "request_channel", "Channel for new requests", false))
            .add_option(option(CommandOptionType::Channel, "log_channel", "Channel for the audit log", false))
            .add_option(option(CommandOptionType::Boolean, "approval_dm", "DM members when approved", false))
            .add_option(option(CommandOptionType::Boolean, "denial_dm", "DM members when denied", false)),
        button_role,
        reaction_role,
    ]
}


#[cfg(all(test, feature = "sqlite"))]
mod dispatch_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use parking_lot::Mutex;

    use super::{
        ArgValue, Args, CommandDispatcher, ComponentAction, ComponentReply, Invocation,
        PickerPublisher,
    };
    use crate::config::RequestsConfig;
    use crate::db::manager::testing::sqlite_manager;
    use crate::db::{ButtonRoleBinding, ReactionRoleBinding, ReactionRoleMode, RequestStatus};
    use crate::discord::embed::{COLOR_DANGER, COLOR_MUTED, COLOR_SUCCESS};
    use crate::platform::fake::{FakePlatform, member};
    use crate::platform::{MemberSnapshot, PlatformError};
    use crate::roles::{Actor, RoleCore};
    use crate::utils::time::ManualClock;

    const GUILD: u64 = 70;
    const ROLE: u64 = 700;
    const MEMBER: u64 = 7;
    const ADMIN: u64 = 8;

    #[derive(Default)]
    struct RecordingPublisher {
        posts: Mutex<Vec<(u64, String, usize)>>,
    }

    #[async_trait]
    impl PickerPublisher for RecordingPublisher {
        async fn publish_buttons(
            &self,
            channel_id: u64,
            title: &str,
            buttons: &[ButtonRoleBinding],
        ) -> Result<u64, PlatformError> {
            self.posts.lock().push((channel_id, title.to_string(), buttons.len()));
            Ok(9001)
        }

        async fn publish_reactions(
            &self,
            channel_id: u64,
            title: &str,
            _mode: ReactionRoleMode,
            reactions: &[ReactionRoleBinding],
        ) -> Result<u64, PlatformError> {
            self.posts.lock().push((channel_id, title.to_string(), reactions.len()));
            Ok(9002)
        }
    }

    struct Fixture {
        _file: tempfile::NamedTempFile,
        clock: Arc<ManualClock>,
        core: Arc<RoleCore>,
        publisher: Arc<RecordingPublisher>,
        dispatcher: CommandDispatcher,
        member: MemberSnapshot,
        admin: MemberSnapshot,
    }

    async fn fixture() -> Fixture {
        let (file, manager) = sqlite_manager().await;
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(now));
        let regular = member(GUILD, MEMBER, now, 60, 30);
        let mut admin = member(GUILD, ADMIN, now, 600, 300);
        admin.is_administrator = true;
        admin.can_manage_roles = true;
        let platform = Arc::new(
            FakePlatform::new()
                .with_guild(GUILD, "Guild", 50)
                .with_role(GUILD, ROLE, "Artist", 4)
                .with_member(regular.clone())
                .with_member(admin.clone()),
        );
        let core = Arc::new(RoleCore::new(
            &manager,
            platform.clone(),
            clock.clone(),
            &RequestsConfig::default(),
        ));
        core.settings
            .add_role_to_tier(GUILD, &Actor::new(ADMIN, "admin"), "Basic", ROLE)
            .await
            .expect("requestable role");
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = CommandDispatcher::new(
            core.clone(),
            platform,
            publisher.clone(),
            "https://example.invalid/dashboard",
        );
        Fixture {
            _file: file,
            clock,
            core,
            publisher,
            dispatcher,
            member: regular,
            admin,
        }
    }

    fn request_role() -> Invocation {
        Invocation::new("request-role", None, Args::default().with("role", ArgValue::Role(ROLE)))
    }

    #[tokio::test]
    async fn request_role_is_rate_limited_per_user() {
        let f = fixture().await;

        let first = f.dispatcher.dispatch(&f.member, &request_role()).await;
        assert!(first.ephemeral);
        assert_eq!(first.embed.title, "Role request submitted");

        let second = f.dispatcher.dispatch(&f.member, &request_role()).await;
        assert_eq!(second.embed.title, "Slow down");
        assert_eq!(second.embed.color, COLOR_MUTED);

        f.clock.advance(Duration::seconds(10));
        let third = f.dispatcher.dispatch(&f.member, &request_role()).await;
        assert_eq!(third.embed.color, COLOR_DANGER);
        assert!(
            third
                .embed
                .description
                .as_deref()
                .is_some_and(|text| text.starts_with("you can request another role"))
        );
    }

    #[tokio::test]
    async fn review_buttons_resolve_and_replace_the_card() {
        let f = fixture().await;
        f.dispatcher.dispatch(&f.member, &request_role()).await;
        let pending = f
            .core
            .requests
            .list_for_user(GUILD, MEMBER, Some(RequestStatus::Pending))
            .await
            .expect("pending");
        let id = pending[0].id.clone();

        let denied_by_member = f
            .dispatcher
            .press(&f.member, ComponentAction::Approve(id.clone()))
            .await;
        assert!(matches!(denied_by_member, ComponentReply::Reply(reply) if reply.embed.color == COLOR_DANGER));

        match f.dispatcher.press(&f.admin, ComponentAction::Approve(id)).await {
            ComponentReply::UpdateMessage(embed) => {
                assert_eq!(embed.title, "Role request approved");
                assert_eq!(embed.color, COLOR_SUCCESS);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn setup_commands_need_an_administrator() {
        let f = fixture().await;
        let setup = Invocation::new(
            "setup-buttonrole",
            None,
            Args::default()
                .with("channel", ArgValue::Channel(33))
                .with("title", ArgValue::Str("Roles".to_string()))
                .with("role1", ArgValue::Role(ROLE)),
        );

        let refused = f.dispatcher.dispatch(&f.member, &setup).await;
        assert_eq!(refused.embed.color, COLOR_DANGER);
        assert!(f.publisher.posts.lock().is_empty());

        let posted = f.dispatcher.dispatch(&f.admin, &setup).await;
        assert_eq!(posted.embed.title, "Button roles posted");
        assert_eq!(*f.publisher.posts.lock(), vec![(33, "Roles".to_string(), 1)]);

        let config = f.core.settings.load_or_create(GUILD).await.expect("config");
        assert_eq!(config.button_roles.len(), 1);
        assert_eq!(config.button_roles[0].message_id, 9001);
        assert_eq!(config.button_roles[0].roles[0].label, "Artist");
    }

    #[tokio::test]
    async fn role_list_and_info_answer_publicly() {
        let f = fixture().await;
        f.dispatcher
            .dispatch(
                &f.admin,
                &Invocation::new(
                    "role",
                    Some("give"),
                    Args::default()
                        .with("user", ArgValue::User(MEMBER))
                        .with("role", ArgValue::Role(ROLE)),
                ),
            )
            .await;
        f.clock.advance(Duration::seconds(5));

        let listed = f
            .dispatcher
            .dispatch(
                &f.admin,
                &Invocation::new("role", Some("list"), Args::default().with("user", ArgValue::User(MEMBER))),
            )
            .await;
        assert!(!listed.ephemeral);
        assert_eq!(listed.embed.title, format!("Roles for user{MEMBER}"));
        assert_eq!(listed.embed.description.as_deref(), Some("<@&700>"));

        f.clock.advance(Duration::seconds(5));
        let info = f
            .dispatcher
            .dispatch(
                &f.admin,
                &Invocation::new("role", Some("info"), Args::default().with("role", ArgValue::Role(ROLE))),
            )
            .await;
        assert!(!info.ephemeral);
        assert_eq!(info.embed.title, "Role: Artist");
        assert_eq!(info.embed.fields[2].value, "1");
    }
}
