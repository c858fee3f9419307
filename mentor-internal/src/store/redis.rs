use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use crate::error::{Error, ErrorDetails};
use crate::plan::Plan;
use crate::usage::UsageWindow;
use crate::verification::VerificationState;

use uuid::Uuid;

use super::{CreateUserParams, UserDocument, UserRecord, UserStore};

const FIELD_EMAIL: &str = "email";
const FIELD_NAME: &str = "name";
const FIELD_PLAN: &str = "plan";
const FIELD_EMAIL_VERIFIED: &str = "email_verified";
const FIELD_USAGE_USED: &str = "usage_messages_used";
const FIELD_USAGE_LIMIT: &str = "usage_message_limit";
const FIELD_USAGE_RESET_AT: &str = "usage_reset_at";
const FIELD_VERIF_CODE_HASH: &str = "verif_code_hash";
const FIELD_VERIF_EXPIRES_AT: &str = "verif_expires_at";
const FIELD_VERIF_LAST_SENT_AT: &str = "verif_last_sent_at";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_UPDATED_AT: &str = "updated_at";

/// Guards against incrementing a counter that was never initialized, which
/// would otherwise silently create a limitless phantom window.
const INCREMENT_SCRIPT: &str = r"
    if redis.call('HEXISTS', KEYS[1], 'usage_reset_at') == 0 then
        return redis.error_reply('no usage window')
    end
    local used = redis.call('HINCRBY', KEYS[1], 'usage_messages_used', ARGV[1])
    local limit = redis.call('HGET', KEYS[1], 'usage_message_limit')
    local reset_at = redis.call('HGET', KEYS[1], 'usage_reset_at')
    return {used, limit, reset_at}
";

/// Redis-backed user store. Each user is a hash at `user:{id}` with flat
/// fields for the usage and verification sub-documents; timestamps are
/// RFC 3339 strings. Counter increments go through a Lua script so the
/// read-back of limit and reset time is atomic with the HINCRBY.
#[derive(Clone)]
pub struct RedisUserStore {
    connection: MultiplexedConnection,
}

impl RedisUserStore {
    /// Connect and verify the server responds before the gateway starts
    /// taking traffic.
    pub async fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid Redis URL: {e}"),
            })
        })?;
        let mut connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!("Failed to connect to Redis: {e}"),
                })
            })?;

        redis::cmd("PING")
            .query_async::<()>(&mut connection)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::AppState {
                    message: format!("Redis ping failed: {e}"),
                })
            })?;

        tracing::info!("Connected to Redis user store");

        Ok(Self { connection })
    }

    fn user_key(user_id: &str) -> String {
        format!("user:{user_id}")
    }
}

#[async_trait]
impl UserStore for RedisUserStore {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<UserDocument>, Error> {
        let mut con = self.connection.clone();
        let hash: HashMap<String, String> =
            con.hgetall(Self::user_key(user_id)).await.map_err(|e| {
                Error::new(ErrorDetails::StoreRead {
                    message: format!("HGETALL failed for user `{user_id}`: {e}"),
                })
            })?;

        if hash.is_empty() {
            return Ok(None);
        }

        document_from_hash(user_id, &hash).map(Some)
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

        let mut fields: Vec<(&str, String)> = vec![
            (FIELD_EMAIL, params.email.clone()),
            (FIELD_PLAN, params.plan.as_str().to_string()),
            (FIELD_USAGE_USED, usage.messages_used.to_string()),
            (FIELD_USAGE_LIMIT, usage.message_limit.to_string()),
            (FIELD_USAGE_RESET_AT, usage.reset_at.to_rfc3339()),
            (FIELD_CREATED_AT, now.to_rfc3339()),
            (FIELD_UPDATED_AT, now.to_rfc3339()),
        ];
        if let Some(name) = &params.name {
            fields.push((FIELD_NAME, name.clone()));
        }

        let mut con = self.connection.clone();
        con.hset_multiple::<_, _, _, ()>(Self::user_key(&id), &fields)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::StoreWrite {
                    message: format!("Failed to create user `{id}`: {e}"),
                })
            })?;

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
        let mut con = self.connection.clone();
        let fields: &[(&str, String)] = &[
            (FIELD_USAGE_USED, window.messages_used.to_string()),
            (FIELD_USAGE_LIMIT, window.message_limit.to_string()),
            (FIELD_USAGE_RESET_AT, window.reset_at.to_rfc3339()),
            (FIELD_UPDATED_AT, now.to_rfc3339()),
        ];
        con.hset_multiple::<_, _, _, ()>(Self::user_key(user_id), fields)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::StoreWrite {
                    message: format!("Failed to write usage window for user `{user_id}`: {e}"),
                })
            })
    }

    async fn increment_usage(&self, user_id: &str, amount: u32) -> Result<UsageWindow, Error> {
        let mut con = self.connection.clone();
        let (messages_used, message_limit, reset_at): (u32, u32, String) =
            Script::new(INCREMENT_SCRIPT)
                .key(Self::user_key(user_id))
                .arg(amount)
                .invoke_async(&mut con)
                .await
                .map_err(|e| {
                    Error::new(ErrorDetails::StoreWrite {
                        message: format!("Failed to increment usage for user `{user_id}`: {e}"),
                    })
                })?;

        Ok(UsageWindow {
            messages_used,
            message_limit,
            reset_at: parse_timestamp(user_id, FIELD_USAGE_RESET_AT, &reset_at)?,
        })
    }

    async fn set_verification_code(
        &self,
        user_id: &str,
        code_hash: &str,
        expires_at: DateTime<Utc>,
        sent_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut con = self.connection.clone();
        let fields: &[(&str, String)] = &[
            (FIELD_VERIF_CODE_HASH, code_hash.to_string()),
            (FIELD_VERIF_EXPIRES_AT, expires_at.to_rfc3339()),
            (FIELD_VERIF_LAST_SENT_AT, sent_at.to_rfc3339()),
            (FIELD_UPDATED_AT, sent_at.to_rfc3339()),
        ];
        con.hset_multiple::<_, _, _, ()>(Self::user_key(user_id), fields)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::StoreWrite {
                    message: format!(
                        "Failed to store verification code for user `{user_id}`: {e}"
                    ),
                })
            })
    }

    async fn clear_verification(
        &self,
        user_id: &str,
        verified_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut con = self.connection.clone();
        let key = Self::user_key(user_id);
        redis::pipe()
            .atomic()
            .hset(&key, FIELD_EMAIL_VERIFIED, verified_at.to_rfc3339())
            .ignore()
            .hset(&key, FIELD_UPDATED_AT, verified_at.to_rfc3339())
            .ignore()
            .hdel(
                &key,
                &[
                    FIELD_VERIF_CODE_HASH,
                    FIELD_VERIF_EXPIRES_AT,
                    FIELD_VERIF_LAST_SENT_AT,
                ],
            )
            .ignore()
            .query_async::<()>(&mut con)
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::StoreWrite {
                    message: format!("Failed to clear verification for user `{user_id}`: {e}"),
                })
            })
    }
}

fn document_from_hash(
    user_id: &str,
    hash: &HashMap<String, String>,
) -> Result<UserDocument, Error> {
    let required = |field: &str| -> Result<&String, Error> {
        hash.get(field).ok_or_else(|| {
            Error::new(ErrorDetails::StoreRead {
                message: format!("User `{user_id}` is missing required field `{field}`"),
            })
        })
    };

    let parse_count = |field: &str, value: &str| -> Result<u32, Error> {
        value.parse().map_err(|_| {
            Error::new(ErrorDetails::StoreRead {
                message: format!("User `{user_id}` has a non-numeric `{field}`: {value}"),
            })
        })
    };

    let usage = match hash.get(FIELD_USAGE_RESET_AT) {
        Some(reset_at) => Some(UsageWindow {
            messages_used: parse_count(FIELD_USAGE_USED, required(FIELD_USAGE_USED)?)?,
            message_limit: parse_count(FIELD_USAGE_LIMIT, required(FIELD_USAGE_LIMIT)?)?,
            reset_at: parse_timestamp(user_id, FIELD_USAGE_RESET_AT, reset_at)?,
        }),
        None => None,
    };

    let verification = VerificationState {
        code_hash: hash.get(FIELD_VERIF_CODE_HASH).cloned(),
        expires_at: hash
            .get(FIELD_VERIF_EXPIRES_AT)
            .map(|v| parse_timestamp(user_id, FIELD_VERIF_EXPIRES_AT, v))
            .transpose()?,
        last_sent_at: hash
            .get(FIELD_VERIF_LAST_SENT_AT)
            .map(|v| parse_timestamp(user_id, FIELD_VERIF_LAST_SENT_AT, v))
            .transpose()?,
    };

    Ok(UserDocument {
        id: user_id.to_string(),
        email: required(FIELD_EMAIL)?.clone(),
        name: hash.get(FIELD_NAME).cloned(),
        plan: hash.get(FIELD_PLAN).map_or(Plan::Free, |p| Plan::parse(p)),
        email_verified: hash
            .get(FIELD_EMAIL_VERIFIED)
            .map(|v| parse_timestamp(user_id, FIELD_EMAIL_VERIFIED, v))
            .transpose()?,
        usage,
        verification: Some(verification),
        created_at: parse_timestamp(user_id, FIELD_CREATED_AT, required(FIELD_CREATED_AT)?)?,
        updated_at: parse_timestamp(user_id, FIELD_UPDATED_AT, required(FIELD_UPDATED_AT)?)?,
    })
}

fn parse_timestamp(user_id: &str, field: &str, value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            Error::new(ErrorDetails::StoreRead {
                message: format!("User `{user_id}` has an invalid `{field}` timestamp: {e}"),
            })
        })
}
