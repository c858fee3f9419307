use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::plan::Plan;
use crate::usage::UsageWindow;
use crate::verification::VerificationState;

pub mod memory;
pub mod redis;

pub use memory::MemoryUserStore;
pub use redis::RedisUserStore;

/// A user document as it exists in the backing store. `usage` and
/// `verification` are optional because accounts created before metering
/// shipped lack those sub-documents; `load_user` backfills them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub email_verified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage: Option<UsageWindow>,
    #[serde(default)]
    pub verification: Option<VerificationState>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A fully-populated user as the gate logic sees it, after `load_user` has
/// filled in any missing sub-documents.
#[derive(Clone, Debug, PartialEq)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub plan: Plan,
    pub email_verified: Option<DateTime<Utc>>,
    pub usage: UsageWindow,
    pub verification: VerificationState,
}

/// Parameters for creating a user. Signup proper lives in the account
/// service; the gateway creates users only when seeding the in-memory
/// backend and in tests.
#[derive(Clone, Debug)]
pub struct CreateUserParams {
    pub id: Option<String>,
    pub email: String,
    pub name: Option<String>,
    pub plan: Plan,
}

impl CreateUserParams {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: None,
            email: email.into(),
            name: None,
            plan: Plan::Free,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.plan = plan;
        self
    }
}

/// Persistence boundary for user documents.
///
/// Writes are scoped to the sub-document they touch so that concurrent
/// writers cannot clobber each other's fields, and `increment_usage` must be
/// atomic in the backend (a read-modify-write cycle is not acceptable).
/// Every failure surfaces as an `Error`; callers never treat a failed write
/// as success.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch the raw document, or `None` if the user does not exist.
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserDocument>, Error>;

    /// Create a user with a fresh usage window and no pending challenge.
    async fn create_user(
        &self,
        params: CreateUserParams,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, Error>;

    /// Replace the user's usage window wholesale.
    async fn put_usage(
        &self,
        user_id: &str,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Atomically add `amount` to the usage counter and return the
    /// post-increment window. Fails if the user or their window is missing.
    async fn increment_usage(&self, user_id: &str, amount: u32) -> Result<UsageWindow, Error>;

    /// Store a new pending challenge: hash, expiry, and send timestamp are
    /// written together. Overwrites any previous challenge.
    async fn set_verification_code(
        &self,
        user_id: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
        sent_at: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Mark the user verified at `verified_at` and clear the pending
    /// challenge fields in the same write.
    async fn clear_verification(
        &self,
        user_id: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), Error>;
}

/// Load a user and migrate legacy documents: a missing usage window is
/// synthesized from the plan and persisted before the record is returned, so
/// downstream logic never sees a partially-populated user. A missing
/// verification sub-document is equivalent to an empty one and needs no
/// write.
pub async fn load_user(
    store: &dyn UserStore,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<UserRecord>, Error> {
    let Some(doc) = store.fetch_user(user_id).await? else {
        return Ok(None);
    };

    let usage = match doc.usage {
        Some(window) => window,
        None => {
            let window = UsageWindow::new(doc.plan, now);
            store.put_usage(user_id, &window, now).await?;
            tracing::debug!(user_id, "Backfilled missing usage window");
            window
        }
    };

    Ok(Some(UserRecord {
        id: doc.id,
        email: doc.email,
        name: doc.name,
        plan: doc.plan,
        email_verified: doc.email_verified,
        usage,
        verification: doc.verification.unwrap_or_default(),
    }))
}
