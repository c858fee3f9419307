use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{Error, ErrorDetails};
use crate::usage::UsageWindow;
use crate::verification::VerificationState;

use super::{CreateUserParams, UserDocument, UserRecord, UserStore};

/// In-memory store for development and tests. Atomicity comes from holding
/// the DashMap shard lock across each mutation, which is exactly the
/// guarantee the trait asks for.
#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<String, UserDocument>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw document as-is, used to model legacy accounts.
    pub fn insert_document(&self, doc: UserDocument) {
        self.users.insert(doc.id.clone(), doc);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserDocument>, Error> {
        Ok(self.users.get(user_id).map(|entry| entry.value().clone()))
    }

    async fn create_user(
        &self,
        params: CreateUserParams,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, Error> {
        let id = params
            .id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let usage = UsageWindow::new(params.plan, now);
        let doc = UserDocument {
            id: id.clone(),
            email: params.email.clone(),
            name: params.name.clone(),
            plan: params.plan,
            email_verified: None,
            usage: Some(usage),
            verification: Some(VerificationState::default()),
            created_at: now,
            updated_at: now,
        };
        self.users.insert(id.clone(), doc);

        Ok(UserRecord {
            id,
            email: params.email,
            name: params.name,
            plan: params.plan,
            email_verified: None,
            usage,
            verification: VerificationState::default(),
        })
    }

    async fn put_usage(
        &self,
        user_id: &str,
        window: &UsageWindow,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut entry = self.users.get_mut(user_id).ok_or_else(|| {
            Error::new(ErrorDetails::UserNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        entry.usage = Some(*window);
        entry.updated_at = now;
        Ok(())
    }

    async fn increment_usage(&self, user_id: &str, amount: u32) -> Result<UsageWindow, Error> {
        let mut entry = self.users.get_mut(user_id).ok_or_else(|| {
            Error::new(ErrorDetails::UserNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        let window = entry.usage.as_mut().ok_or_else(|| {
            Error::new(ErrorDetails::StoreWrite {
                message: format!("user `{user_id}` has no usage window to increment"),
            })
        })?;
        window.messages_used = window.messages_used.saturating_add(amount);
        Ok(*window)
    }

    async fn set_verification_code(
        &self,
        user_id: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
        sent_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut entry = self.users.get_mut(user_id).ok_or_else(|| {
            Error::new(ErrorDetails::UserNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        entry.verification = Some(VerificationState {
            code_hash: Some(code_hash.to_string()),
            expires_at: Some(expires_at),
            last_sent_at: Some(sent_at),
        });
        entry.updated_at = sent_at;
        Ok(())
    }

    async fn clear_verification(
        &self,
        user_id: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut entry = self.users.get_mut(user_id).ok_or_else(|| {
            Error::new(ErrorDetails::UserNotFound {
                user_id: user_id.to_string(),
            })
        })?;
        entry.email_verified = Some(verified_at);
        entry.verification = Some(VerificationState::default());
        entry.updated_at = verified_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::store::load_user;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_missing_user_is_none() {
        let store = MemoryUserStore::new();
        assert_eq!(store.fetch_user("missing").await.unwrap(), None);
        assert!(store.increment_usage("missing", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_load_user_backfills_missing_usage_window() {
        let store = MemoryUserStore::new();
        let created = utc(2025, 3, 1);
        store.insert_document(UserDocument {
            id: "legacy".to_string(),
            email: "old@example.com".to_string(),
            name: Some("Old Account".to_string()),
            plan: Plan::Pro,
            email_verified: Some(created),
            usage: None,
            verification: None,
            created_at: created,
            updated_at: created,
        });

        let now = utc(2025, 5, 10);
        let user = load_user(&store, "legacy", now).await.unwrap().unwrap();
        assert_eq!(user.usage.messages_used, 0);
        assert_eq!(user.usage.message_limit, Plan::Pro.message_limit());
        assert_eq!(user.usage.reset_at, utc(2025, 6, 10));
        assert!(user.verification.is_empty());

        // The synthesized window was persisted, not just returned
        let doc = store.fetch_user("legacy").await.unwrap().unwrap();
        assert_eq!(doc.usage, Some(user.usage));
    }

    #[tokio::test]
    async fn test_sub_document_writes_do_not_clobber_each_other() {
        let store = MemoryUserStore::new();
        let now = utc(2025, 5, 10);
        let user = store
            .create_user(CreateUserParams::new("ada@example.com"), now)
            .await
            .unwrap();

        store.increment_usage(&user.id, 3).await.unwrap();
        store
            .set_verification_code(&user.id, "abc123", now, now)
            .await
            .unwrap();

        let doc = store.fetch_user(&user.id).await.unwrap().unwrap();
        assert_eq!(doc.usage.unwrap().messages_used, 3);
        assert_eq!(
            doc.verification.unwrap().code_hash.as_deref(),
            Some("abc123")
        );
    }
}
