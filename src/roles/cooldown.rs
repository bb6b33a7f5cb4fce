use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::utils::time::Clock;

pub const DEFAULT_COMMAND_COOLDOWN_SECONDS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownCheck {
    Allowed,
    Limited { retry_at: DateTime<Utc> },
}

/// Per-command, per-user rate limiting for interactive commands. Advisory only;
/// nothing in the request lifecycle depends on it.
pub struct CommandCooldowns {
    clock: Arc<dyn Clock>,
    /// When each (command, user) window closes.
    open_until: Mutex<HashMap<(String, u64), DateTime<Utc>>>,
}

impl CommandCooldowns {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            open_until: Mutex::new(HashMap::new()),
        }
    }

    /// Window applied to a slash command by name.
    pub fn window_for(command: &str) -> Duration {
        let seconds = match command {
            "request-role" => 10,
            "approve" | "deny" | "role" => 3,
            "my-requests" | "pending" => 5,
            name if name.starts_with("setup-") => 5,
            _ => DEFAULT_COMMAND_COOLDOWN_SECONDS,
        };
        Duration::seconds(seconds)
    }

    pub fn check_and_record(&self, command: &str, user_id: u64, window: Duration) -> CooldownCheck {
        let now = self.clock.now();
        let mut open_until = self.open_until.lock();
        open_until.retain(|_, closes_at| now < *closes_at);

        let key = (command.to_string(), user_id);
        if let Some(&retry_at) = open_until.get(&key) {
            return CooldownCheck::Limited { retry_at };
        }

        open_until.insert(key, now + window);
        CooldownCheck::Allowed
    }

    pub fn tracked_entries(&self) -> usize {
        self.open_until.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use test_case::test_case;

    use super::{CommandCooldowns, CooldownCheck};
    use crate::utils::time::ManualClock;

    #[test]
    fn limits_inside_window_and_allows_at_boundary() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let cooldowns = CommandCooldowns::new(clock.clone());
        let window = Duration::seconds(10);

        assert_eq!(cooldowns.check_and_record("request-role", 1, window), CooldownCheck::Allowed);

        clock.advance(Duration::seconds(9));
        assert_eq!(
            cooldowns.check_and_record("request-role", 1, window),
            CooldownCheck::Limited {
                retry_at: start + window
            }
        );

        // other users and other commands are independent
        assert_eq!(cooldowns.check_and_record("request-role", 2, window), CooldownCheck::Allowed);
        assert_eq!(cooldowns.check_and_record("pending", 1, window), CooldownCheck::Allowed);

        clock.advance(Duration::seconds(1));
        assert_eq!(cooldowns.check_and_record("request-role", 1, window), CooldownCheck::Allowed);
    }

    #[test]
    fn stale_entries_are_evicted_on_access() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()));
        let cooldowns = CommandCooldowns::new(clock.clone());

        for user in 0..5 {
            cooldowns.check_and_record("approve", user, Duration::seconds(3));
        }
        assert_eq!(cooldowns.tracked_entries(), 5);

        clock.advance(Duration::minutes(5));
        cooldowns.check_and_record("approve", 99, Duration::seconds(3));
        assert_eq!(cooldowns.tracked_entries(), 1);
    }

    #[test_case("request-role", 10)]
    #[test_case("approve", 3)]
    #[test_case("setup-tier", 5)]
    #[test_case("available-roles", 3)]
    fn windows_per_command(command: &str, seconds: i64) {
        assert_eq!(CommandCooldowns::window_for(command), Duration::seconds(seconds));
    }

    #[test]
    fn long_windows_outlive_short_ones() {
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let cooldowns = CommandCooldowns::new(clock.clone());
        let hour = Duration::hours(1);

        assert_eq!(cooldowns.check_and_record("digest", 1, hour), CooldownCheck::Allowed);
        assert_eq!(cooldowns.check_and_record("approve", 2, Duration::seconds(3)), CooldownCheck::Allowed);

        clock.advance(Duration::minutes(30));
        // evicting the expired approve entry must not drop the open hour-long window
        assert_eq!(cooldowns.check_and_record("approve", 3, Duration::seconds(3)), CooldownCheck::Allowed);
        assert_eq!(cooldowns.tracked_entries(), 2);
        assert_eq!(
            cooldowns.check_and_record("digest", 1, hour),
            CooldownCheck::Limited { retry_at: start + hour }
        );

        clock.advance(Duration::minutes(30));
        assert_eq!(cooldowns.check_and_record("digest", 1, hour), CooldownCheck::Allowed);
    }
}
