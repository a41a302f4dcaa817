use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use tokio::sync::RwLock;

use haven_core::policy::{
    QuotaDecision, QuotaPolicy, cooldown_minutes_remaining, day_start,
};

use crate::error::AppError;
use crate::identity::Identity;

/// How long a fetched policy stays authoritative before the store is asked
/// again. Keeps policy edits hot-reloadable without a per-request read.
pub const POLICY_CACHE_TTL_SECONDS: i64 = 60;

#[derive(Clone)]
struct CachedPolicy {
    policy: QuotaPolicy,
    from_store: bool,
    fetched_at: DateTime<Utc>,
}

fn cache_is_fresh(fetched_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(fetched_at).num_seconds() < POLICY_CACHE_TTL_SECONDS
}

/// Computes whether a new session may start for a user. Read-only — safe to
/// call repeatedly, including as a client-facing preview.
#[derive(Clone)]
pub struct QuotaEnforcer {
    reference_tz: Tz,
    cache: Arc<RwLock<Option<CachedPolicy>>>,
}

impl QuotaEnforcer {
    pub fn new(reference_tz: Tz) -> Self {
        Self {
            reference_tz,
            cache: Arc::new(RwLock::new(None)),
        }
    }

    pub fn reference_tz(&self) -> Tz {
        self.reference_tz
    }

    /// Current effective policy and whether it came from the store or the
    /// hardcoded fallback.
    pub async fn policy(&self, db: &PgPool) -> (QuotaPolicy, bool) {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cache_is_fresh(cached.fetched_at, Utc::now()) {
                    return (cached.policy.clone(), cached.from_store);
                }
            }
        }

        let (policy, from_store) = match fetch_policy(db).await {
            Ok(Some(policy)) => (policy, true),
            Ok(None) => (QuotaPolicy::default(), false),
            Err(err) => {
                tracing::warn!(error = %err, "quota policy fetch failed; using defaults");
                (QuotaPolicy::default(), false)
            }
        };

        // The fallback is cached too, so a down store is retried once per
        // TTL instead of on every request
        let mut cache = self.cache.write().await;
        *cache = Some(CachedPolicy {
            policy: policy.clone(),
            from_store,
            fetched_at: Utc::now(),
        });

        (policy, from_store)
    }

    /// The quota gate. Anonymous callers and the exempt role are always
    /// allowed; otherwise the daily-count and cooldown checks run against
    /// the store, evaluated in the fixed reference timezone.
    pub async fn check_allowed(
        &self,
        db: &PgPool,
        identity: &Identity,
    ) -> Result<QuotaDecision, AppError> {
        let (policy, _) = self.policy(db).await;
        let limits = policy.limits();

        let Some(user_id) = identity.user_id else {
            return Ok(QuotaDecision::allowed(limits));
        };

        if identity.role == policy.exempt_role || !policy.enabled {
            return Ok(QuotaDecision::allowed(limits));
        }

        let now = Utc::now();
        let window_start = day_start(self.reference_tz, now);

        let used_today: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions WHERE user_id = $1 AND created_at >= $2",
        )
        .bind(user_id)
        .bind(window_start)
        .fetch_one(db)
        .await?;

        if used_today >= policy.max_sessions_per_day {
            return Ok(QuotaDecision::daily_limit(used_today, limits));
        }

        if policy.cooldown_minutes > 0 {
            let last_ended: Option<DateTime<Utc>> = sqlx::query_scalar(
                "SELECT ended_at FROM sessions \
                 WHERE user_id = $1 AND ended_at IS NOT NULL \
                 ORDER BY ended_at DESC LIMIT 1",
            )
            .bind(user_id)
            .fetch_optional(db)
            .await?;

            if let Some(ended_at) = last_ended {
                let remaining = cooldown_minutes_remaining(ended_at, now, policy.cooldown_minutes);
                if remaining > 0 {
                    return Ok(QuotaDecision::cooldown(remaining, limits));
                }
            }
        }

        Ok(QuotaDecision::allowed(limits))
    }
}

async fn fetch_policy(db: &PgPool) -> Result<Option<QuotaPolicy>, sqlx::Error> {
    let row = sqlx::query_as::<_, PolicyRow>(
        "SELECT enabled, max_sessions_per_day, max_duration_minutes, cooldown_minutes, \
                exempt_role \
         FROM quota_policies WHERE key = 'global'",
    )
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| QuotaPolicy {
        enabled: r.enabled,
        max_sessions_per_day: r.max_sessions_per_day,
        max_duration_minutes: r.max_duration_minutes,
        cooldown_minutes: r.cooldown_minutes,
        exempt_role: r.exempt_role,
    }))
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    enabled: bool,
    max_sessions_per_day: i64,
    max_duration_minutes: i64,
    cooldown_minutes: i64,
    exempt_role: String,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{POLICY_CACHE_TTL_SECONDS, cache_is_fresh};

    #[test]
    fn cache_expires_after_ttl() {
        let now = Utc::now();
        assert!(cache_is_fresh(now, now));
        assert!(cache_is_fresh(
            now - Duration::seconds(POLICY_CACHE_TTL_SECONDS - 1),
            now
        ));
        assert!(!cache_is_fresh(
            now - Duration::seconds(POLICY_CACHE_TTL_SECONDS),
            now
        ));
    }
}
