use std::sync::Arc;

use chrono::{DateTime, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::plan::Plan;
use crate::store::{UserRecord, UserStore};

/// The active quota window for a user: how many messages they have consumed,
/// the plan-derived cap, and when the window rolls over.
///
/// Windows are replaced wholesale at rollover, never patched field by field.
/// `message_limit` is captured from the plan at the moment the window is
/// computed and stays fixed until the next rollover, even if the plan changes
/// mid-window.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub messages_used: u32,
    pub message_limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl UsageWindow {
    /// A fresh window starting at `now`: zero consumption, plan-derived limit,
    /// reset at the next calendar-month boundary.
    pub fn new(plan: Plan, now: DateTime<Utc>) -> Self {
        Self {
            messages_used: 0,
            message_limit: plan.message_limit(),
            reset_at: next_reset_boundary(now),
        }
    }

    /// A window is stale once `now` reaches `reset_at`; stale windows must be
    /// refreshed before any read is trusted.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }

    pub fn remaining(&self) -> u32 {
        self.message_limit.saturating_sub(self.messages_used)
    }
}

/// One calendar month after `from`, truncated to the start of that day (UTC).
///
/// Windows are calendar-aligned monthly periods, not rolling 30-day spans;
/// month-end dates clamp (Jan 31 -> Feb 28/29) rather than overflowing into
/// the following month.
pub fn next_reset_boundary(from: DateTime<Utc>) -> DateTime<Utc> {
    // checked_add_months only fails at the far end of the representable range
    let advanced = from.checked_add_months(Months::new(1)).unwrap_or(from);
    advanced.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Owns window lifecycle against the user store. The tracker refreshes
/// expired windows and performs the atomic consumption increment; it never
/// enforces limits itself (that is the gatekeeper's job), which keeps the
/// counter authoritative even for callers that bypass the gate.
pub struct UsageTracker {
    store: Arc<dyn UserStore>,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn UserStore>) -> Self {
        Self { store }
    }

    /// Roll the user's window over if it has expired, persisting the
    /// replacement; otherwise return the stored window without writing.
    ///
    /// Idempotent: a second call within the same window observes the
    /// already-current window and performs no write. Two racing callers that
    /// both observe an expired window compute identical replacement values,
    /// so last-write-wins on the whole sub-document is safe.
    pub async fn refresh(
        &self,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<UsageWindow, Error> {
        if !user.usage.is_expired(now) {
            return Ok(user.usage);
        }

        let window = UsageWindow::new(user.plan, now);
        self.store.put_usage(&user.id, &window, now).await?;

        tracing::debug!(
            user_id = user.id.as_str(),
            message_limit = window.message_limit,
            reset_at = %window.reset_at,
            "Rolled usage window over"
        );

        Ok(window)
    }

    /// Atomically add `amount` to the current window's counter and return the
    /// post-increment window. Does not create windows; callers must refresh
    /// first.
    pub async fn increment(&self, user_id: &str, amount: u32) -> Result<UsageWindow, Error> {
        self.store.increment_usage(user_id, amount).await
    }
}
