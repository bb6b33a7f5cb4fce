use chrono::{DateTime, Utc};

use crate::db::GuildConfig;
use crate::platform::MemberSnapshot;
use crate::utils::time::days_since;

pub const NO_REQUIREMENTS: &str = "No requirements";
pub const ALL_REQUIREMENTS_MET: &str = "All requirements met";

/// Outcome of checking a member against the tier that governs a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub met: bool,
    pub details: String,
}

impl Verdict {
    fn unrestricted() -> Self {
        Self {
            met: true,
            details: NO_REQUIREMENTS.to_string(),
        }
    }
}

/// Checks account age, membership age and required roles. Message counts are
/// stored but deliberately not evaluated.
pub fn evaluate(
    member: &MemberSnapshot,
    config: &GuildConfig,
    role_id: u64,
    now: DateTime<Utc>,
) -> Verdict {
    let Some(requirements) = config
        .tier_for_role(role_id)
        .and_then(|tier| tier.requirements.as_ref())
    else {
        return Verdict::unrestricted();
    };

    let mut issues = Vec::new();

    if requirements.min_account_age_days > 0 {
        let account_age = days_since(member.account_created_at, now);
        if account_age < f64::from(requirements.min_account_age_days) {
            issues.push(format!(
                "Account age: {}/{} days",
                account_age.floor().max(0.0),
                requirements.min_account_age_days
            ));
        }
    }

    if requirements.min_server_age_days > 0 {
        // unknown join time counts as joined just now
        let server_age = member
            .joined_at
            .map(|joined_at| days_since(joined_at, now))
            .unwrap_or(0.0);
        if server_age < f64::from(requirements.min_server_age_days) {
            issues.push(format!(
                "Server membership: {}/{} days",
                server_age.floor().max(0.0),
                requirements.min_server_age_days
            ));
        }
    }

    let missing: Vec<String> = requirements
        .required_roles
        .iter()
        .filter(|role_id| !member.has_role(**role_id))
        .map(|role_id| format!("<@&{role_id}>"))
        .collect();
    if !missing.is_empty() {
        issues.push(format!("Missing roles: {}", missing.join(", ")));
    }

    if issues.is_empty() {
        Verdict {
            met: true,
            details: ALL_REQUIREMENTS_MET.to_string(),
        }
    } else {
        Verdict {
            met: false,
            details: issues.join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use test_case::test_case;

    use super::{ALL_REQUIREMENTS_MET, NO_REQUIREMENTS, evaluate};
    use crate::db::{GuildConfig, Requirements};
    use crate::platform::fake::member;

    const GUILD: u64 = 1;
    const ROLE: u64 = 50;

    fn config_with(requirements: Requirements) -> GuildConfig {
        let mut config = GuildConfig::with_defaults(GUILD, 3600);
        let tier = config.tier_by_name_mut("Elevated").unwrap();
        tier.roles.push(ROLE);
        tier.requirements = Some(requirements);
        config
    }

    #[test_case(Duration::days(7), true ; "exactly seven days")]
    #[test_case(Duration::days(7) - Duration::milliseconds(86_400), false ; "six point nine nine nine days")]
    #[test_case(Duration::days(30), true ; "well past")]
    fn account_age_boundary(age: Duration, met: bool) {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let config = config_with(Requirements {
            min_account_age_days: 7,
            ..Requirements::default()
        });
        let mut requester = member(GUILD, 2, now, 0, 100);
        requester.account_created_at = now - age;

        assert_eq!(evaluate(&requester, &config, ROLE, now).met, met);
    }

    #[test]
    fn new_member_fails_server_age() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let config = config_with(Requirements {
            min_messages: 10,
            min_account_age_days: 7,
            min_server_age_days: 3,
            required_roles: Vec::new(),
        });
        let requester = member(GUILD, 2, now, 10, 1);

        let verdict = evaluate(&requester, &config, ROLE, now);
        assert!(!verdict.met);
        assert_eq!(verdict.details, "Server membership: 1/3 days");
    }

    #[test]
    fn issues_are_listed_line_by_line() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let config = config_with(Requirements {
            min_messages: 0,
            min_account_age_days: 30,
            min_server_age_days: 14,
            required_roles: vec![70, 71],
        });
        let mut requester = member(GUILD, 2, now, 2, 0);
        requester.role_ids.insert(71);
        requester.joined_at = None;

        let verdict = evaluate(&requester, &config, ROLE, now);
        assert_eq!(
            verdict.details,
            "Account age: 2/30 days\nServer membership: 0/14 days\nMissing roles: <@&70>"
        );
    }

    #[test]
    fn roles_outside_tiers_have_no_requirements() {
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let config = config_with(Requirements::default());
        let requester = member(GUILD, 2, now, 0, 0);

        assert_eq!(evaluate(&requester, &config, 999, now).details, NO_REQUIREMENTS);
        assert_eq!(evaluate(&requester, &config, ROLE, now).details, ALL_REQUIREMENTS_MET);
    }
}
