use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DatabaseError;

pub const DEFAULT_WELCOME_TEMPLATE: &str =
    "Welcome to {server}! You have been assigned the {roles} role(s).";

const DISPLAY_ID_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildConfig {
    pub guild_id: u64,
    #[serde(default)]
    pub guild_name: Option<String>,
    #[serde(default)]
    pub auto_roles: Vec<AutoRoleRule>,
    #[serde(default)]
    pub welcome_message: WelcomeMessage,
    #[serde(default)]
    pub role_tiers: Vec<RoleTier>,
    #[serde(default)]
    pub self_roles: Vec<SelfRole>,
    #[serde(default)]
    pub reaction_roles: Vec<ReactionRoleConfig>,
    #[serde(default)]
    pub button_roles: Vec<ButtonRoleConfig>,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default = "default_request_cooldown")]
    pub request_cooldown_seconds: u64,
}

impl GuildConfig {
    /// Fresh configuration for a community seen for the first time: three tiers with
    /// increasing thresholds, no auto-roles, DMs enabled.
    pub fn with_defaults(guild_id: u64, request_cooldown_seconds: u64) -> Self {
        Self {
            guild_id,
            guild_name: None,
            auto_roles: Vec::new(),
            welcome_message: WelcomeMessage::default(),
            role_tiers: vec![
                RoleTier::new("Basic", 1, "#43B581", Requirements::default()),
                RoleTier::new(
                    "Elevated",
                    2,
                    "#FAA61A",
                    Requirements {
                        min_messages: 10,
                        min_account_age_days: 7,
                        min_server_age_days: 3,
                        required_roles: Vec::new(),
                    },
                ),
                RoleTier::new(
                    "Premium",
                    3,
                    "#F04747",
                    Requirements {
                        min_messages: 50,
                        min_account_age_days: 30,
                        min_server_age_days: 14,
                        required_roles: Vec::new(),
                    },
                ),
            ],
            self_roles: Vec::new(),
            reaction_roles: Vec::new(),
            button_roles: Vec::new(),
            notifications: NotificationSettings::default(),
            request_cooldown_seconds,
        }
    }

    /// The tier governing `role_id`. Should a role appear in several tiers the lowest
    /// level wins, so lookups stay deterministic for configs written before tier
    /// membership became exclusive.
    pub fn tier_for_role(&self, role_id: u64) -> Option<&RoleTier> {
        self.role_tiers
            .iter()
            .filter(|tier| tier.roles.contains(&role_id))
            .min_by_key(|tier| tier.level)
    }

    pub fn tier_by_name(&self, name: &str) -> Option<&RoleTier> {
        self.role_tiers
            .iter()
            .find(|tier| tier.name.eq_ignore_ascii_case(name))
    }

    pub fn tier_by_name_mut(&mut self, name: &str) -> Option<&mut RoleTier> {
        self.role_tiers
            .iter_mut()
            .find(|tier| tier.name.eq_ignore_ascii_case(name))
    }

    pub fn is_self_role(&self, role_id: u64) -> bool {
        self.self_roles.iter().any(|role| role.role_id == role_id)
    }

    pub fn is_requestable(&self, role_id: u64) -> bool {
        self.role_tiers.is_empty() || self.tier_for_role(role_id).is_some() || self.is_self_role(role_id)
    }

    pub fn reaction_config_for_message(&self, message_id: u64) -> Option<&ReactionRoleConfig> {
        self.reaction_roles
            .iter()
            .find(|config| config.message_id == message_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoRoleRule {
    pub role_id: u64,
    #[serde(default)]
    pub role_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub delay_seconds: u32,
    #[serde(default = "default_true")]
    pub ignore_bots: bool,
    #[serde(default)]
    pub min_account_age_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeMessage {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_welcome_template")]
    pub template: String,
    #[serde(default)]
    pub channel_id: Option<u64>,
}

impl Default for WelcomeMessage {
    fn default() -> Self {
        Self {
            enabled: false,
            template: default_welcome_template(),
            channel_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleTier {
    pub name: String,
    pub level: i32,
    #[serde(default = "default_tier_color")]
    pub color: String,
    #[serde(default)]
    pub roles: Vec<u64>,
    #[serde(default)]
    pub approver_roles: Vec<u64>,
    #[serde(default)]
    pub requirements: Option<Requirements>,
}

impl RoleTier {
    pub fn new(name: &str, level: i32, color: &str, requirements: Requirements) -> Self {
        Self {
            name: name.to_string(),
            level,
            color: color.to_string(),
            roles: Vec::new(),
            approver_roles: Vec::new(),
            requirements: Some(requirements),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub min_messages: u32,
    #[serde(default)]
    pub min_account_age_days: u32,
    #[serde(default)]
    pub min_server_age_days: u32,
    #[serde(default)]
    pub required_roles: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfRole {
    pub role_id: u64,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub min_messages: u32,
    #[serde(default)]
    pub required_roles: Vec<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionRoleMode {
    #[default]
    Normal,
    Unique,
    Verify,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRoleBinding {
    pub emoji: String,
    pub role_id: u64,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionRoleConfig {
    pub message_id: u64,
    pub channel_id: u64,
    #[serde(default)]
    pub mode: ReactionRoleMode,
    #[serde(default)]
    pub roles: Vec<ReactionRoleBinding>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ButtonStyleKind {
    #[default]
    Primary,
    Secondary,
    Success,
    Danger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonRoleBinding {
    pub role_id: u64,
    pub label: String,
    #[serde(default)]
    pub style: ButtonStyleKind,
    #[serde(default)]
    pub emoji: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonRoleConfig {
    pub message_id: u64,
    pub channel_id: u64,
    #[serde(default)]
    pub roles: Vec<ButtonRoleBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub request_channel_id: Option<u64>,
    #[serde(default)]
    pub log_channel_id: Option<u64>,
    #[serde(default = "default_true")]
    pub approval_dm_enabled: bool,
    #[serde(default = "default_true")]
    pub denial_dm_enabled: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            request_channel_id: None,
            log_channel_id: None,
            approval_dm_enabled: true,
            denial_dm_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Denied => "denied",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(RequestStatus::Pending),
            "approved" => Ok(RequestStatus::Approved),
            "denied" => Ok(RequestStatus::Denied),
            "cancelled" => Ok(RequestStatus::Cancelled),
            "expired" => Ok(RequestStatus::Expired),
            other => Err(DatabaseError::Serialization(format!(
                "unknown request status {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRequest {
    pub id: String,
    pub guild_id: u64,
    pub user_id: u64,
    pub username: String,
    pub role_id: u64,
    pub role_name: String,
    pub reason: Option<String>,
    pub tier_level: i32,
    pub status: RequestStatus,
    pub requirements_met: bool,
    pub requirements_details: String,
    pub resolved_by: Option<u64>,
    pub resolved_by_username: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RoleRequest {
    /// Short identifier shown to humans: the last six characters, upper-cased.
    pub fn display_id(&self) -> String {
        display_suffix(&self.id)
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}

pub fn display_suffix(id: &str) -> String {
    let start = id.len().saturating_sub(DISPLAY_ID_LEN);
    id.get(start..).unwrap_or(id).to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    RoleRequest,
    RoleApproved,
    RoleDenied,
    RoleCancelled,
    RoleRequestExpired,
    RoleGiven,
    RoleRemoved,
    RoleTempGiven,
    RoleTempExpired,
    AutoroleGiven,
    SelfroleGiven,
    SelfroleRemoved,
    ReactionroleGiven,
    ReactionroleRemoved,
    ButtonroleGiven,
    ButtonroleRemoved,
    ConfigUpdated,
    TierCreated,
    TierUpdated,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::RoleRequest => "role_request",
            ActivityAction::RoleApproved => "role_approved",
            ActivityAction::RoleDenied => "role_denied",
            ActivityAction::RoleCancelled => "role_cancelled",
            ActivityAction::RoleRequestExpired => "role_request_expired",
            ActivityAction::RoleGiven => "role_given",
            ActivityAction::RoleRemoved => "role_removed",
            ActivityAction::RoleTempGiven => "role_temp_given",
            ActivityAction::RoleTempExpired => "role_temp_expired",
            ActivityAction::AutoroleGiven => "autorole_given",
            ActivityAction::SelfroleGiven => "selfrole_given",
            ActivityAction::SelfroleRemoved => "selfrole_removed",
            ActivityAction::ReactionroleGiven => "reactionrole_given",
            ActivityAction::ReactionroleRemoved => "reactionrole_removed",
            ActivityAction::ButtonroleGiven => "buttonrole_given",
            ActivityAction::ButtonroleRemoved => "buttonrole_removed",
            ActivityAction::ConfigUpdated => "config_updated",
            ActivityAction::TierCreated => "tier_created",
            ActivityAction::TierUpdated => "tier_updated",
        }
    }

    const ALL: [ActivityAction; 19] = [
        ActivityAction::RoleRequest,
        ActivityAction::RoleApproved,
        ActivityAction::RoleDenied,
        ActivityAction::RoleCancelled,
        ActivityAction::RoleRequestExpired,
        ActivityAction::RoleGiven,
        ActivityAction::RoleRemoved,
        ActivityAction::RoleTempGiven,
        ActivityAction::RoleTempExpired,
        ActivityAction::AutoroleGiven,
        ActivityAction::SelfroleGiven,
        ActivityAction::SelfroleRemoved,
        ActivityAction::ReactionroleGiven,
        ActivityAction::ReactionroleRemoved,
        ActivityAction::ButtonroleGiven,
        ActivityAction::ButtonroleRemoved,
        ActivityAction::ConfigUpdated,
        ActivityAction::TierCreated,
        ActivityAction::TierUpdated,
    ];
}

impl FromStr for ActivityAction {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ActivityAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == value)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown activity action {value:?}")))
    }
}

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityLogEntry {
    pub id: String,
    pub guild_id: u64,
    pub action: ActivityAction,
    pub target_user_id: Option<u64>,
    pub target_username: Option<String>,
    /// A user id, or [`SYSTEM_ACTOR`] for automated actions.
    pub performed_by: Option<String>,
    pub performed_by_username: Option<String>,
    pub role_id: Option<u64>,
    pub role_name: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl ActivityLogEntry {
    pub fn new(guild_id: u64, action: ActivityAction, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_record_id(),
            guild_id,
            action,
            target_user_id: None,
            target_username: None,
            performed_by: None,
            performed_by_username: None,
            role_id: None,
            role_name: None,
            details: None,
            created_at,
        }
    }

    pub fn target(mut self, user_id: u64, username: impl Into<String>) -> Self {
        self.target_user_id = Some(user_id);
        self.target_username = Some(username.into());
        self
    }

    pub fn performed_by(mut self, user_id: u64, username: impl Into<String>) -> Self {
        self.performed_by = Some(user_id.to_string());
        self.performed_by_username = Some(username.into());
        self
    }

    pub fn by_system(mut self) -> Self {
        self.performed_by = Some(SYSTEM_ACTOR.to_string());
        self.performed_by_username = None;
        self
    }

    pub fn role(mut self, role_id: u64, role_name: impl Into<String>) -> Self {
        self.role_id = Some(role_id);
        self.role_name = Some(role_name.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempRoleGrant {
    pub id: String,
    pub guild_id: u64,
    pub user_id: u64,
    pub role_id: u64,
    pub role_name: String,
    pub given_by: u64,
    pub given_by_username: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub guild_id: u64,
    pub user_id: u64,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub joined_at: Option<DateTime<Utc>>,
}

pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_cooldown() -> u64 {
    3600
}

fn default_welcome_template() -> String {
    DEFAULT_WELCOME_TEMPLATE.to_string()
}

fn default_tier_color() -> String {
    "#5865F2".to_string()
}

#[cfg(test)]
mod tests {
    use super::{display_suffix, ActivityAction, GuildConfig, RequestStatus, RoleTier, Requirements};
    use std::str::FromStr;

    #[test]
    fn default_config_has_three_increasing_tiers() {
        let config = GuildConfig::with_defaults(42, 3600);
        let levels: Vec<i32> = config.role_tiers.iter().map(|tier| tier.level).collect();

        assert_eq!(levels, vec![1, 2, 3]);
        let elevated = config.tier_by_name("elevated").expect("elevated tier");
        let requirements = elevated.requirements.as_ref().expect("requirements");
        assert_eq!(requirements.min_account_age_days, 7);
        assert_eq!(requirements.min_server_age_days, 3);
        assert!(config.notifications.approval_dm_enabled);
        assert!(!config.welcome_message.enabled);
    }

    #[test]
    fn tier_lookup_prefers_lowest_level_on_overlap() {
        let mut config = GuildConfig::with_defaults(42, 0);
        let mut extra = RoleTier::new("Legacy", 0, "#000000", Requirements::default());
        extra.roles.push(7);
        config.role_tiers[2].roles.push(7);
        config.role_tiers.push(extra);

        assert_eq!(config.tier_for_role(7).map(|tier| tier.name.as_str()), Some("Legacy"));
    }

    #[test]
    fn display_suffix_takes_last_six_uppercased() {
        assert_eq!(display_suffix("0f1e2d3c4b5a69788796a5b4c3d2e1f0"), "D2E1F0");
        assert_eq!(display_suffix("abc"), "ABC");
    }

    #[test]
    fn status_and_action_names_round_trip() {
        for status in ["pending", "approved", "denied", "cancelled", "expired"] {
            assert_eq!(RequestStatus::from_str(status).unwrap().as_str(), status);
        }
        assert_eq!(
            ActivityAction::from_str("autorole_given").unwrap(),
            ActivityAction::AutoroleGiven
        );
        assert!(ActivityAction::from_str("nonsense").is_err());
    }

    #[test]
    fn config_document_tolerates_missing_sections() {
        let json = r#"{"guild_id": 9, "role_tiers": [{"name": "Solo", "level": 1}]}"#;
        let config: GuildConfig = serde_json::from_str(json).expect("document parses");

        assert_eq!(config.request_cooldown_seconds, 3600);
        assert!(config.role_tiers[0].requirements.is_none());
        assert!(config.notifications.denial_dm_enabled);
    }
}
