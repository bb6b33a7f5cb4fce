use serenity::all::{
    ButtonStyle, CreateActionRow, CreateButton, CreateEmbed, CreateEmbedFooter, ReactionType,
};

use crate::db::{
    ActivityLogEntry, ButtonRoleBinding, ButtonStyleKind, GuildConfig, RequestStatus, RoleRequest,
};
use crate::platform::{MemberSnapshot, Notice, RoleSnapshot};
use crate::roles::{AvailableRole, PendingPage, RoleError, RoleInfo};

pub const COLOR_INFO: u32 = 0x5865F2;
pub const COLOR_PENDING: u32 = 0xFAA61A;
pub const COLOR_SUCCESS: u32 = 0x43B581;
pub const COLOR_DANGER: u32 = 0xF04747;
pub const COLOR_MUTED: u32 = 0x747F8D;

const MAX_FIELD_VALUE: usize = 1024;
const MAX_DESCRIPTION: usize = 4096;

pub const APPROVE_PREFIX: &str = "approve_request:";
pub const DENY_PREFIX: &str = "deny_request:";
pub const BUTTON_ROLE_PREFIX: &str = "buttonrole:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Platform-neutral embed content, converted to a serenity builder at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedSpec {
    pub title: String,
    pub description: Option<String>,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: Option<String>,
}

impl EmbedSpec {
    pub fn new(title: impl Into<String>, color: u32) -> Self {
        Self {
            title: title.into(),
            description: None,
            color,
            fields: Vec::new(),
            footer: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(truncate(&description.into(), MAX_DESCRIPTION));
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>, inline: bool) -> Self {
        let value = value.into();
        let value = if value.trim().is_empty() {
            "-".to_string()
        } else {
            truncate(&value, MAX_FIELD_VALUE)
        };
        self.fields.push(EmbedField {
            name: name.into(),
            value,
            inline,
        });
        self
    }

    pub fn footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn to_create_embed(&self) -> CreateEmbed {
        let mut embed = CreateEmbed::new().title(&self.title).color(self.color);
        if let Some(description) = &self.description {
            embed = embed.description(description);
        }
        for field in &self.fields {
            embed = embed.field(&field.name, &field.value, field.inline);
        }
        if let Some(footer) = &self.footer {
            embed = embed.footer(CreateEmbedFooter::new(footer));
        }
        embed
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out: String = value.chars().take(max_chars.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    format!("<t:{}:R>", at.timestamp())
}

fn status_color(status: RequestStatus) -> u32 {
    match status {
        RequestStatus::Pending => COLOR_PENDING,
        RequestStatus::Approved => COLOR_SUCCESS,
        RequestStatus::Denied => COLOR_DANGER,
        RequestStatus::Cancelled | RequestStatus::Expired => COLOR_MUTED,
    }
}

fn status_label(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Pending => "Pending",
        RequestStatus::Approved => "Approved",
        RequestStatus::Denied => "Denied",
        RequestStatus::Cancelled => "Cancelled",
        RequestStatus::Expired => "Expired",
    }
}

pub fn success(title: impl Into<String>, description: impl Into<String>) -> EmbedSpec {
    EmbedSpec::new(title, COLOR_SUCCESS).description(description)
}

pub fn info(title: impl Into<String>, description: impl Into<String>) -> EmbedSpec {
    EmbedSpec::new(title, COLOR_INFO).description(description)
}

pub fn error(err: &RoleError) -> EmbedSpec {
    if err.is_user_facing() {
        EmbedSpec::new("Cannot do that", COLOR_DANGER).description(err.to_string())
    } else {
        generic_failure()
    }
}

pub fn generic_failure() -> EmbedSpec {
    EmbedSpec::new("Something went wrong", COLOR_DANGER)
        .description("The command failed unexpectedly. Please try again in a moment.")
}

pub fn slow_down(retry_at: chrono::DateTime<chrono::Utc>) -> EmbedSpec {
    EmbedSpec::new("Slow down", COLOR_MUTED)
        .description(format!("You can use this command again {}.", timestamp(retry_at)))
}

pub fn request_created(request: &RoleRequest) -> EmbedSpec {
    let requirements = if request.requirements_met {
        format!("Met\n{}", request.requirements_details)
    } else {
        format!("Not met\n{}", request.requirements_details)
    };
    EmbedSpec::new("Role request submitted", COLOR_PENDING)
        .description(format!(
            "Your request for <@&{}> is waiting for a moderator.",
            request.role_id
        ))
        .field("Request ID", format!("`{}`", request.display_id()), true)
        .field("Expires", timestamp(request.expires_at), true)
        .field("Requirements", requirements, false)
}

/// The review card posted to the request channel.
pub fn request_review(request: &RoleRequest, requester_mention: &str) -> EmbedSpec {
    let mut embed = EmbedSpec::new("New role request", COLOR_PENDING)
        .field("Member", format!("{requester_mention} ({})", request.username), true)
        .field("Role", format!("<@&{}> ({})", request.role_id, request.role_name), true)
        .field("Tier level", request.tier_level.to_string(), true)
        .field(
            "Requirements",
            format!(
                "{}\n{}",
                if request.requirements_met { "Met" } else { "Not met" },
                request.requirements_details
            ),
            false,
        );
    if let Some(reason) = &request.reason {
        embed = embed.field("Reason", reason.clone(), false);
    }
    embed.footer(format!("Request {}", request.display_id()))
}

/// Terminal-state card that replaces the review card once the request is settled.
pub fn request_resolved(request: &RoleRequest) -> EmbedSpec {
    let mut embed = EmbedSpec::new(
        format!("Role request {}", status_label(request.status).to_lowercase()),
        status_color(request.status),
    )
    .field("Member", format!("<@{}> ({})", request.user_id, request.username), true)
    .field("Role", format!("<@&{}> ({})", request.role_id, request.role_name), true);
    if let Some(moderator) = &request.resolved_by_username {
        embed = embed.field("Handled by", moderator.clone(), true);
    }
    if let Some(reason) = &request.resolution_reason {
        embed = embed.field("Note", reason.clone(), false);
    }
    embed.footer(format!("Request {}", request.display_id()))
}

pub fn my_requests(requests: &[RoleRequest]) -> EmbedSpec {
    if requests.is_empty() {
        return info("Your role requests", "You have no role requests yet.");
    }
    let lines: Vec<String> = requests
        .iter()
        .map(|request| {
            format!(
                "`{}` {} · **{}** · {}",
                request.display_id(),
                request.role_name,
                status_label(request.status),
                timestamp(request.created_at)
            )
        })
        .collect();
    info("Your role requests", lines.join("\n"))
}

pub fn pending_page(page: &PendingPage) -> EmbedSpec {
    let title = format!("Pending role requests ({})", page.total);
    if page.requests.is_empty() {
        return info(title, "Nothing is waiting for review.");
    }
    let mut embed = EmbedSpec::new(title, COLOR_PENDING);
    for request in &page.requests {
        embed = embed.field(
            format!("{} · {}", request.display_id(), request.role_name),
            format!(
                "<@{}> · requirements {} · {}",
                request.user_id,
                if request.requirements_met { "met" } else { "not met" },
                timestamp(request.created_at)
            ),
            false,
        );
    }
    embed.footer(format!("Page {} of {}", page.page, page.total_pages()))
}

pub fn available_roles(roles: &[AvailableRole], dashboard_url: &str) -> EmbedSpec {
    if roles.is_empty() {
        return info("Available roles", "No roles can be requested in this server yet.")
            .footer(format!("Configure roles at {dashboard_url}"));
    }
    let mut embed = EmbedSpec::new("Available roles", COLOR_INFO)
        .description("Use `/request-role` to ask for one of these.");
    for role in roles {
        let mut lines = Vec::new();
        if let Some(tier) = &role.tier_name {
            lines.push(format!("Tier: {tier}"));
        }
        if let Some(requirements) = &role.requirements {
            if requirements.min_messages > 0 {
                lines.push(format!("{} messages", requirements.min_messages));
            }
            if requirements.min_account_age_days > 0 {
                lines.push(format!("account {} days old", requirements.min_account_age_days));
            }
            if requirements.min_server_age_days > 0 {
                lines.push(format!("member for {} days", requirements.min_server_age_days));
            }
        }
        if let Some(description) = &role.description {
            lines.push(description.clone());
        }
        if lines.is_empty() {
            lines.push("No requirements".to_string());
        }
        embed = embed.field(role.role_name.clone(), lines.join("\n"), true);
    }
    embed
}

pub fn tier_list(config: &GuildConfig) -> EmbedSpec {
    if config.role_tiers.is_empty() {
        return info("Role tiers", "No tiers configured. Use `/setup-tier create`.");
    }
    let mut tiers: Vec<_> = config.role_tiers.iter().collect();
    tiers.sort_by_key(|tier| tier.level);
    let mut embed = EmbedSpec::new("Role tiers", COLOR_INFO);
    for tier in tiers {
        let roles = mentions(&tier.roles, "<@&", ">");
        let approvers = mentions(&tier.approver_roles, "<@&", ">");
        let requirements = match &tier.requirements {
            Some(r) => format!(
                "{} messages · account {}d · member {}d",
                r.min_messages, r.min_account_age_days, r.min_server_age_days
            ),
            None => "none".to_string(),
        };
        embed = embed.field(
            format!("{} (level {})", tier.name, tier.level),
            format!("Roles: {roles}\nApprovers: {approvers}\nRequirements: {requirements}"),
            false,
        );
    }
    embed
}

pub fn auto_role_list(config: &GuildConfig) -> EmbedSpec {
    let mut embed = EmbedSpec::new("Auto-roles", COLOR_INFO);
    if config.auto_roles.is_empty() {
        embed = embed.description("No auto-roles configured. Use `/setup-autorole add`.");
    }
    for rule in &config.auto_roles {
        embed = embed.field(
            rule.role_name.clone().unwrap_or_else(|| rule.role_id.to_string()),
            format!(
                "<@&{}> · {} · delay {}s · min account age {}d{}",
                rule.role_id,
                if rule.enabled { "enabled" } else { "disabled" },
                rule.delay_seconds,
                rule.min_account_age_days,
                if rule.ignore_bots { " · skips bots" } else { "" }
            ),
            false,
        );
    }
    let welcome = &config.welcome_message;
    embed.field(
        "Welcome message",
        format!(
            "{}{}\n{}",
            if welcome.enabled { "enabled" } else { "disabled" },
            welcome
                .channel_id
                .map(|id| format!(" · <#{id}>"))
                .unwrap_or_default(),
            welcome.template
        ),
        false,
    )
}

/// Roles are expected highest first.
pub fn member_roles(member: &MemberSnapshot, roles: &[RoleSnapshot]) -> EmbedSpec {
    let listed = if roles.is_empty() {
        "No roles".to_string()
    } else {
        roles.iter().map(RoleSnapshot::mention).collect::<Vec<_>>().join(" ")
    };
    EmbedSpec::new(format!("Roles for {}", member.username), COLOR_INFO).description(listed)
}

pub fn role_info(info: &RoleInfo) -> EmbedSpec {
    let role = &info.role;
    let color = if role.color == 0 { COLOR_INFO } else { role.color };
    EmbedSpec::new(format!("Role: {}", role.name), color)
        .field("ID", role.id.to_string(), true)
        .field("Color", role.hex_color().unwrap_or_else(|| "None".to_string()), true)
        .field(
            "Members",
            info.member_count
                .map_or_else(|| "Unknown".to_string(), |count| count.to_string()),
            true,
        )
        .field("Position", role.position.to_string(), true)
}

fn mentions(ids: &[u64], open: &str, close: &str) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(|id| format!("{open}{id}{close}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn audit(entry: &ActivityLogEntry) -> EmbedSpec {
    let mut embed = EmbedSpec::new(entry.action.as_str().replace('_', " "), COLOR_MUTED);
    if let Some(user_id) = entry.target_user_id {
        embed = embed.field("Member", format!("<@{user_id}>"), true);
    }
    if let Some(role_id) = entry.role_id {
        embed = embed.field("Role", format!("<@&{role_id}>"), true);
    }
    if let Some(by) = &entry.performed_by_username {
        embed = embed.field("By", by.clone(), true);
    }
    if let Some(reason) = entry
        .details
        .as_ref()
        .and_then(|details| details.get("reason"))
        .and_then(|reason| reason.as_str())
    {
        embed = embed.field("Reason", reason, false);
    }
    embed
}

pub fn notice(notice: &Notice) -> EmbedSpec {
    match notice {
        Notice::RequestReview {
            request,
            requester_mention,
        } => request_review(request, requester_mention),
        Notice::RequestApproved {
            guild_name,
            role_name,
            moderator,
            note,
        } => {
            let embed = success(
                "Role request approved",
                format!("You now have **{role_name}** in **{guild_name}**."),
            )
            .field("Approved by", moderator.clone(), true);
            match note {
                Some(note) => embed.field("Note", note.clone(), false),
                None => embed,
            }
        }
        Notice::RequestDenied {
            guild_name,
            role_name,
            moderator,
            reason,
        } => {
            let embed = EmbedSpec::new("Role request denied", COLOR_DANGER)
                .description(format!(
                    "Your request for **{role_name}** in **{guild_name}** was denied."
                ))
                .field("Denied by", moderator.clone(), true);
            match reason {
                Some(reason) => embed.field("Reason", reason.clone(), false),
                None => embed,
            }
        }
        Notice::Welcome { guild_name, text } => info(format!("Welcome to {guild_name}"), text.clone()),
        Notice::WelcomeChannel { text, .. } => info("Welcome", text.clone()),
        Notice::Audit(entry) => audit(entry),
    }
}

pub fn review_buttons(request_id: &str) -> CreateActionRow {
    CreateActionRow::Buttons(vec![
        CreateButton::new(format!("{APPROVE_PREFIX}{request_id}"))
            .label("Approve")
            .style(ButtonStyle::Success),
        CreateButton::new(format!("{DENY_PREFIX}{request_id}"))
            .label("Deny")
            .style(ButtonStyle::Danger),
    ])
}

fn button_style(style: ButtonStyleKind) -> ButtonStyle {
    match style {
        ButtonStyleKind::Primary => ButtonStyle::Primary,
        ButtonStyleKind::Secondary => ButtonStyle::Secondary,
        ButtonStyleKind::Success => ButtonStyle::Success,
        ButtonStyleKind::Danger => ButtonStyle::Danger,
    }
}

/// Button rows for a role picker; Discord allows five buttons per row.
pub fn button_role_rows(bindings: &[ButtonRoleBinding]) -> Vec<CreateActionRow> {
    bindings
        .chunks(5)
        .map(|chunk| {
            CreateActionRow::Buttons(
                chunk
                    .iter()
                    .map(|binding| {
                        let mut button =
                            CreateButton::new(format!("{BUTTON_ROLE_PREFIX}{}", binding.role_id))
                                .label(&binding.label)
                                .style(button_style(binding.style));
                        if let Some(emoji) = binding
                            .emoji
                            .as_deref()
                            .and_then(|emoji| ReactionType::try_from(emoji).ok())
                        {
                            button = button.emoji(emoji);
                        }
                        button
                    })
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use test_case::test_case;

    use super::*;
    use crate::db::{ActivityAction, RequestStatus};

    fn request(status: RequestStatus) -> RoleRequest {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        RoleRequest {
            id: "0123456789abcdef0123456789abcdef".to_string(),
            guild_id: 1,
            user_id: 2,
            username: "ana".to_string(),
            role_id: 3,
            role_name: "Helper".to_string(),
            reason: Some("I answer questions".to_string()),
            tier_level: 1,
            status,
            requirements_met: false,
            requirements_details: "Messages: 3/50".to_string(),
            resolved_by: None,
            resolved_by_username: None,
            resolved_at: None,
            resolution_reason: None,
            created_at,
            expires_at: created_at + Duration::days(7),
        }
    }

    #[test]
    fn review_card_shows_reason_and_short_id() {
        let embed = request_review(&request(RequestStatus::Pending), "<@2>");
        assert_eq!(embed.color, COLOR_PENDING);
        assert!(embed.fields.iter().any(|f| f.name == "Reason" && f.value == "I answer questions"));
        assert!(embed.fields.iter().any(|f| f.value.starts_with("Not met")));
        assert_eq!(embed.footer.as_deref(), Some("Request ABCDEF"));
    }

    #[test_case(RequestStatus::Approved, COLOR_SUCCESS, "Role request approved")]
    #[test_case(RequestStatus::Denied, COLOR_DANGER, "Role request denied")]
    #[test_case(RequestStatus::Expired, COLOR_MUTED, "Role request expired")]
    fn resolved_card_tracks_status(status: RequestStatus, color: u32, title: &str) {
        let mut settled = request(status);
        settled.resolved_by_username = Some("mod".to_string());
        let embed = request_resolved(&settled);
        assert_eq!(embed.color, color);
        assert_eq!(embed.title, title);
        assert!(embed.fields.iter().any(|f| f.name == "Handled by"));
    }

    #[test]
    fn internal_errors_hide_details() {
        let db = RoleError::Database(crate::db::DatabaseError::Query("relation missing".to_string()));
        assert_eq!(error(&db), generic_failure());
        assert_eq!(
            error(&RoleError::DuplicatePending).description.as_deref(),
            Some("you already have a pending request for this role")
        );
    }

    #[test]
    fn long_and_empty_field_values_are_clamped() {
        let embed = EmbedSpec::new("t", COLOR_INFO)
            .field("long", "x".repeat(2000), false)
            .field("empty", "  ", false);
        assert_eq!(embed.fields[0].value.chars().count(), MAX_FIELD_VALUE);
        assert!(embed.fields[0].value.ends_with("..."));
        assert_eq!(embed.fields[1].value, "-");
    }

    #[test]
    fn audit_card_pulls_reason_from_details() {
        let entry = ActivityLogEntry::new(1, ActivityAction::RoleGiven, Utc::now())
            .target(2, "ana")
            .performed_by(3, "mod")
            .role(4, "Helper")
            .details(serde_json::json!({ "reason": "event" }));
        let embed = audit(&entry);
        assert_eq!(embed.title, "role given");
        assert!(embed.fields.iter().any(|f| f.name == "Reason" && f.value == "event"));
    }

    #[test]
    fn pending_page_footer_counts_pages() {
        let page = PendingPage {
            requests: vec![request(RequestStatus::Pending)],
            total: 16,
            page: 2,
            page_size: 15,
        };
        let embed = pending_page(&page);
        assert_eq!(embed.footer.as_deref(), Some("Page 2 of 2"));
        assert_eq!(embed.fields.len(), 1);
    }

    #[test_case(0x3498DB, Some(12), 0x3498DB, "#3498DB", "12" ; "colored and counted")]
    #[test_case(0, None, COLOR_INFO, "None", "Unknown" ; "plain and uncounted")]
    fn role_info_card(color: u32, count: Option<u64>, embed_color: u32, hex: &str, members: &str) {
        let info = RoleInfo {
            role: RoleSnapshot {
                id: 55,
                name: "Mentor".to_string(),
                color,
                position: 6,
                managed: false,
                is_everyone: false,
            },
            member_count: count,
        };
        let card = role_info(&info);
        assert_eq!(card.title, "Role: Mentor");
        assert_eq!(card.color, embed_color);
        let values: Vec<&str> = card.fields.iter().map(|field| field.value.as_str()).collect();
        assert_eq!(values, vec!["55", hex, members, "6"]);
    }
}
