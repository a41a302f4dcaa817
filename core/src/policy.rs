use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Fallback policy values used when the store is unreachable or holds no row.
pub const DEFAULT_MAX_SESSIONS_PER_DAY: i64 = 3;
pub const DEFAULT_MAX_DURATION_MINUTES: i64 = 30;
pub const DEFAULT_COOLDOWN_MINUTES: i64 = 60;
pub const DEFAULT_EXEMPT_ROLE: &str = "supervisor";

/// Daily quota windows are computed in this timezone, not UTC and not the
/// caller's local time. Overridable via HAVEN_REFERENCE_TZ.
pub const DEFAULT_REFERENCE_TZ: &str = "America/New_York";

/// Process-wide usage policy. DB-backed with hot reload: cached with a short
/// TTL and refreshed from the store on expiry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuotaPolicy {
    pub enabled: bool,
    pub max_sessions_per_day: i64,
    pub max_duration_minutes: i64,
    /// 0 disables the cooldown check
    pub cooldown_minutes: i64,
    /// Role that bypasses all quota checks unconditionally
    pub exempt_role: String,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions_per_day: DEFAULT_MAX_SESSIONS_PER_DAY,
            max_duration_minutes: DEFAULT_MAX_DURATION_MINUTES,
            cooldown_minutes: DEFAULT_COOLDOWN_MINUTES,
            exempt_role: DEFAULT_EXEMPT_ROLE.to_string(),
        }
    }
}

impl QuotaPolicy {
    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            max_sessions_per_day: self.max_sessions_per_day,
            max_duration_minutes: self.max_duration_minutes,
            cooldown_minutes: self.cooldown_minutes,
        }
    }
}

/// The limits a client needs to arm a visible countdown.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuotaLimits {
    pub max_sessions_per_day: i64,
    pub max_duration_minutes: i64,
    pub cooldown_minutes: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDenialReason {
    DailyLimit,
    Cooldown,
}

/// Outcome of a quota check. Denials are expected control flow, not errors,
/// and explain why and when retry is possible.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<QuotaDenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Minutes until retry is possible (cooldown denials)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_remaining: Option<i64>,
    /// How many sessions were used today (daily-limit denials)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_used_today: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<QuotaLimits>,
}

impl QuotaDecision {
    pub fn allowed(limits: QuotaLimits) -> Self {
        Self {
            allowed: true,
            reason: None,
            message: None,
            minutes_remaining: None,
            sessions_used_today: None,
            limits: Some(limits),
        }
    }

    pub fn daily_limit(used: i64, limits: QuotaLimits) -> Self {
        let message = format!(
            "Daily session limit reached: {} of {} sessions used today. \
             The window resets at midnight in the service's reference timezone.",
            used, limits.max_sessions_per_day
        );
        Self {
            allowed: false,
            reason: Some(QuotaDenialReason::DailyLimit),
            message: Some(message),
            minutes_remaining: None,
            sessions_used_today: Some(used),
            limits: Some(limits),
        }
    }

    pub fn cooldown(minutes_remaining: i64, limits: QuotaLimits) -> Self {
        let message = format!(
            "Please wait {} more minute{} before starting another session.",
            minutes_remaining,
            if minutes_remaining == 1 { "" } else { "s" }
        );
        Self {
            allowed: false,
            reason: Some(QuotaDenialReason::Cooldown),
            message: Some(message),
            minutes_remaining: Some(minutes_remaining),
            sessions_used_today: None,
            limits: Some(limits),
        }
    }
}

/// Start of "today" in the reference timezone, as a UTC instant. Sessions
/// created at/after this instant count toward the daily limit.
pub fn day_start(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_midnight = now.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
    match tz.from_local_datetime(&local_midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        // DST transitions: take the earlier of two, or the instant the gap
        // resolves to when midnight doesn't exist
        chrono::LocalResult::Ambiguous(earlier, _) => earlier.with_timezone(&Utc),
        chrono::LocalResult::None => tz
            .from_utc_datetime(&local_midnight)
            .with_timezone(&Utc),
    }
}

/// Minutes until a cooldown elapses, rounded up. 0 means the cooldown has
/// passed.
pub fn cooldown_minutes_remaining(
    ended_at: DateTime<Utc>,
    now: DateTime<Utc>,
    cooldown_minutes: i64,
) -> i64 {
    let elapsed_secs = now.signed_duration_since(ended_at).num_seconds();
    let remaining_secs = cooldown_minutes * 60 - elapsed_secs;
    if remaining_secs <= 0 {
        0
    } else {
        remaining_secs.div_ceil(60)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::America::New_York;

    use super::{QuotaDecision, QuotaDenialReason, QuotaPolicy, cooldown_minutes_remaining, day_start};

    #[test]
    fn day_start_uses_reference_timezone_not_utc() {
        // 2026-03-20 02:30 UTC is still 2026-03-19 22:30 in New York
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 2, 30, 0).unwrap();
        let start = day_start(New_York, now);

        // New York midnight on 2026-03-19 is 04:00 UTC
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 3, 19, 4, 0, 0).unwrap());
    }

    #[test]
    fn session_just_before_reference_midnight_does_not_count_toward_today() {
        // 23:30 New York time the previous evening
        let previous_evening = Utc.with_ymd_and_hms(2026, 3, 20, 3, 30, 0).unwrap();
        // 00:30 New York time "today"
        let now = Utc.with_ymd_and_hms(2026, 3, 20, 4, 30, 0).unwrap();

        assert!(previous_evening < day_start(New_York, now));
    }

    #[test]
    fn cooldown_remaining_rounds_up() {
        let now = Utc::now();
        let ended_at = now - Duration::minutes(10);
        assert_eq!(cooldown_minutes_remaining(ended_at, now, 30), 20);

        // 10m30s elapsed of a 30m cooldown → 19.5 minutes left → reported as 20
        let ended_at = now - Duration::seconds(10 * 60 + 30);
        assert_eq!(cooldown_minutes_remaining(ended_at, now, 30), 20);
    }

    #[test]
    fn cooldown_remaining_is_zero_after_elapse() {
        let now = Utc::now();
        let ended_at = now - Duration::minutes(31);
        assert_eq!(cooldown_minutes_remaining(ended_at, now, 30), 0);
    }

    #[test]
    fn denial_messages_carry_retry_detail() {
        let limits = QuotaPolicy::default().limits();

        let daily = QuotaDecision::daily_limit(3, limits.clone());
        assert!(!daily.allowed);
        assert_eq!(daily.reason, Some(QuotaDenialReason::DailyLimit));
        assert_eq!(daily.sessions_used_today, Some(3));

        let cooldown = QuotaDecision::cooldown(20, limits);
        assert_eq!(cooldown.minutes_remaining, Some(20));
        assert!(cooldown.message.unwrap().contains("20 more minutes"));
    }
}
