// User, key-lease and attendance-log persistence.
//
// `UserStore` dispatches between PostgreSQL and an in-memory variant used
// by tests. Presence flags and the lease are mutated only through the
// operations here; every mutation appends its log row inside the same
// transaction, so a log event is never observable before the state it
// records is durable.

pub mod pool;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::slack::AppIdentity;

pub const ACTION_ENTER: &str = "入室";
pub const ACTION_EXIT: &str = "退室";
pub const ACTION_TAKE_KEY: &str = "鍵取得";
pub const ACTION_RETURN_KEY: &str = "鍵返却";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    UserNotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// The two physical rooms tracked by the attendance flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomKind {
    Room2218,
    GradRoom,
}

impl RoomKind {
    fn column(self) -> &'static str {
        match self {
            Self::Room2218 => "room2218",
            Self::GradRoom => "grad_room",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Room2218 => "2218号室",
            Self::GradRoom => "院生部屋",
        }
    }
}

/// A persisted user profile: provider identity plus the mutable presence
/// state owned by the attendance flow.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    pub name: String,
    pub email: String,
    pub avatar: String,
    pub provider: String,
    pub slack_user_id: String,
    pub slack_team_id: String,
    pub room2218: bool,
    pub grad_room: bool,
    pub has_key: bool,
    #[serde(skip_serializing)]
    pub encrypted_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub user_id: String,
    pub user_name: String,
    pub action: String,
    pub room: String,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new_user: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    users: HashMap<String, UserProfile>,
    /// Lease holder; mirrors the `key_lease` singleton row.
    holder_uid: Option<String>,
    logs: Vec<LogEntry>,
}

#[derive(Clone)]
pub enum UserStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryStore>>),
}

impl UserStore {
    pub fn postgres(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryStore::default())))
    }

    /// Create-or-update with asymmetric field sets.
    ///
    /// A new profile gets identity, lifecycle timestamps, the encrypted
    /// token and presence flags initialized to false. An existing profile
    /// gets identity, `last_activity` and the token refreshed only —
    /// presence flags and `created_at` are never touched, so a re-login
    /// cannot reset a returning user's room or key state.
    ///
    /// The existence check races with itself under concurrent first
    /// logins for the same identifier; both callers may then report
    /// `is_new_user`. Accepted: both write paths are idempotent on
    /// identity fields and presence initialization only matters on true
    /// first creation.
    pub async fn upsert(
        &self,
        identity: &AppIdentity,
        encrypted_token: &str,
    ) -> Result<UpsertOutcome, StoreError> {
        match self {
            Self::Postgres(pool) => upsert_pg(pool, identity, encrypted_token).await,
            Self::Memory(store) => upsert_memory(store, identity, encrypted_token).await,
        }
    }

    pub async fn get_user(&self, uid: &str) -> Result<Option<UserProfile>, StoreError> {
        match self {
            Self::Postgres(pool) => get_user_pg(pool, uid).await,
            Self::Memory(store) => Ok(store.read().await.users.get(uid).cloned()),
        }
    }

    pub async fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        match self {
            Self::Postgres(pool) => list_users_pg(pool).await,
            Self::Memory(store) => {
                let mut users: Vec<UserProfile> =
                    store.read().await.users.values().cloned().collect();
                users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uid.cmp(&b.uid)));
                Ok(users)
            }
        }
    }

    /// Take the key. Displaces the current holder, if any, in the same
    /// transaction: their flag is cleared, the caller's is set, and the
    /// lease is repointed — no interleaving can observe two holders.
    pub async fn acquire_key(&self, uid: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => acquire_key_pg(pool, uid).await,
            Self::Memory(store) => acquire_key_memory(store, uid).await,
        }
    }

    /// Return the key. Always clears the caller's own flag; clears the
    /// lease only if the caller actually holds it (self-correcting for a
    /// caller whose flag drifted).
    pub async fn release_key(&self, uid: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => release_key_pg(pool, uid).await,
            Self::Memory(store) => release_key_memory(store, uid).await,
        }
    }

    pub async fn set_room_presence(
        &self,
        uid: &str,
        room: RoomKind,
        present: bool,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => set_room_presence_pg(pool, uid, room, present).await,
            Self::Memory(store) => set_room_presence_memory(store, uid, room, present).await,
        }
    }

    /// Current lease holder uid, if any.
    pub async fn key_holder(&self) -> Result<Option<String>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let holder: Option<String> =
                    sqlx::query_scalar("SELECT holder_uid FROM key_lease WHERE id")
                        .fetch_one(pool)
                        .await
                        .map_err(into_internal)?;
                Ok(holder)
            }
            Self::Memory(store) => Ok(store.read().await.holder_uid.clone()),
        }
    }

    pub async fn encrypted_token(&self, uid: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let token: Option<Option<String>> =
                    sqlx::query_scalar("SELECT encrypted_token FROM users WHERE uid = $1")
                        .bind(uid)
                        .fetch_optional(pool)
                        .await
                        .map_err(into_internal)?;
                match token {
                    Some(token) => Ok(token),
                    None => Err(StoreError::UserNotFound(uid.to_owned())),
                }
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                let user = guard
                    .users
                    .get(uid)
                    .ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;
                Ok(user.encrypted_token.clone())
            }
        }
    }

    /// Drop the stored token after it failed decryption-for-use, so the
    /// next login replaces it instead of every send failing the same way.
    pub async fn delete_encrypted_token(&self, uid: &str) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("UPDATE users SET encrypted_token = NULL WHERE uid = $1")
                    .bind(uid)
                    .execute(pool)
                    .await
                    .map_err(into_internal)?;
                Ok(())
            }
            Self::Memory(store) => {
                if let Some(user) = store.write().await.users.get_mut(uid) {
                    user.encrypted_token = None;
                }
                Ok(())
            }
        }
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<LogEntry>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let logs = sqlx::query_as::<_, LogEntry>(
                    r#"
                    SELECT user_id, user_name, action, room, logged_at
                    FROM logs
                    ORDER BY logged_at DESC, id DESC
                    LIMIT $1
                    "#,
                )
                .bind(limit)
                .fetch_all(pool)
                .await
                .map_err(into_internal)?;
                Ok(logs)
            }
            Self::Memory(store) => {
                let guard = store.read().await;
                Ok(guard
                    .logs
                    .iter()
                    .rev()
                    .take(limit.max(0) as usize)
                    .cloned()
                    .collect())
            }
        }
    }
}

fn into_internal(error: sqlx::Error) -> StoreError {
    StoreError::Internal(error.into())
}

// ─── PostgreSQL ────────────────────────────────────────────────────────

async fn upsert_pg(
    pool: &PgPool,
    identity: &AppIdentity,
    encrypted_token: &str,
) -> Result<UpsertOutcome, StoreError> {
    let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM users WHERE uid = $1")
        .bind(&identity.uid)
        .fetch_optional(pool)
        .await
        .map_err(into_internal)?;

    if exists.is_some() {
        sqlx::query(
            r#"
            UPDATE users
            SET name = $2,
                email = $3,
                avatar = $4,
                provider = $5,
                slack_user_id = $6,
                slack_team_id = $7,
                encrypted_token = $8,
                last_activity = now()
            WHERE uid = $1
            "#,
        )
        .bind(&identity.uid)
        .bind(&identity.name)
        .bind(&identity.email)
        .bind(&identity.avatar)
        .bind(&identity.provider)
        .bind(&identity.slack_user_id)
        .bind(&identity.slack_team_id)
        .bind(encrypted_token)
        .execute(pool)
        .await
        .map_err(into_internal)?;

        return Ok(UpsertOutcome { is_new_user: false });
    }

    // ON CONFLICT keeps the racing-first-login case a token/identity
    // refresh instead of a duplicate-key failure; presence flags and
    // created_at are only written by the insert arm.
    sqlx::query(
        r#"
        INSERT INTO users (
            uid, name, email, avatar, provider,
            slack_user_id, slack_team_id,
            room2218, grad_room, has_key,
            encrypted_token, created_at, last_activity
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, FALSE, FALSE, FALSE, $8, now(), now())
        ON CONFLICT (uid) DO UPDATE
        SET name = EXCLUDED.name,
            email = EXCLUDED.email,
            avatar = EXCLUDED.avatar,
            provider = EXCLUDED.provider,
            slack_user_id = EXCLUDED.slack_user_id,
            slack_team_id = EXCLUDED.slack_team_id,
            encrypted_token = EXCLUDED.encrypted_token,
            last_activity = now()
        "#,
    )
    .bind(&identity.uid)
    .bind(&identity.name)
    .bind(&identity.email)
    .bind(&identity.avatar)
    .bind(&identity.provider)
    .bind(&identity.slack_user_id)
    .bind(&identity.slack_team_id)
    .bind(encrypted_token)
    .execute(pool)
    .await
    .map_err(into_internal)?;

    Ok(UpsertOutcome { is_new_user: true })
}

async fn get_user_pg(pool: &PgPool, uid: &str) -> Result<Option<UserProfile>, StoreError> {
    sqlx::query_as::<_, UserProfile>("SELECT * FROM users WHERE uid = $1")
        .bind(uid)
        .fetch_optional(pool)
        .await
        .map_err(into_internal)
}

async fn list_users_pg(pool: &PgPool) -> Result<Vec<UserProfile>, StoreError> {
    sqlx::query_as::<_, UserProfile>("SELECT * FROM users ORDER BY created_at, uid")
        .fetch_all(pool)
        .await
        .map_err(into_internal)
}

async fn acquire_key_pg(pool: &PgPool, uid: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.map_err(into_internal)?;

    // Row lock on the singleton lease serializes concurrent handovers:
    // a second acquire blocks here until the first commits, then sees
    // its write.
    let holder: Option<String> =
        sqlx::query_scalar("SELECT holder_uid FROM key_lease WHERE id FOR UPDATE")
            .fetch_one(&mut *tx)
            .await
            .map_err(into_internal)?;

    let user_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE uid = $1")
        .bind(uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(into_internal)?;
    let user_name = user_name.ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;

    if let Some(previous) = holder.filter(|holder| holder != uid) {
        sqlx::query("UPDATE users SET has_key = FALSE, last_activity = now() WHERE uid = $1")
            .bind(&previous)
            .execute(&mut *tx)
            .await
            .map_err(into_internal)?;
    }

    sqlx::query("UPDATE users SET has_key = TRUE, last_activity = now() WHERE uid = $1")
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(into_internal)?;

    sqlx::query("UPDATE key_lease SET holder_uid = $1 WHERE id")
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(into_internal)?;

    insert_log(&mut tx, uid, &user_name, ACTION_TAKE_KEY, "").await?;

    tx.commit().await.map_err(into_internal)?;
    Ok(())
}

async fn release_key_pg(pool: &PgPool, uid: &str) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.map_err(into_internal)?;

    let holder: Option<String> =
        sqlx::query_scalar("SELECT holder_uid FROM key_lease WHERE id FOR UPDATE")
            .fetch_one(&mut *tx)
            .await
            .map_err(into_internal)?;

    let user_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE uid = $1")
        .bind(uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(into_internal)?;
    let user_name = user_name.ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;

    sqlx::query("UPDATE users SET has_key = FALSE, last_activity = now() WHERE uid = $1")
        .bind(uid)
        .execute(&mut *tx)
        .await
        .map_err(into_internal)?;

    if holder.as_deref() == Some(uid) {
        sqlx::query("UPDATE key_lease SET holder_uid = NULL WHERE id")
            .execute(&mut *tx)
            .await
            .map_err(into_internal)?;
    }

    insert_log(&mut tx, uid, &user_name, ACTION_RETURN_KEY, "").await?;

    tx.commit().await.map_err(into_internal)?;
    Ok(())
}

async fn set_room_presence_pg(
    pool: &PgPool,
    uid: &str,
    room: RoomKind,
    present: bool,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await.map_err(into_internal)?;

    let user_name: Option<String> = sqlx::query_scalar("SELECT name FROM users WHERE uid = $1")
        .bind(uid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(into_internal)?;
    let user_name = user_name.ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;

    // Column name comes from the RoomKind enum, not request input.
    let statement = format!(
        "UPDATE users SET {} = $2, last_activity = now() WHERE uid = $1",
        room.column()
    );
    sqlx::query(&statement)
        .bind(uid)
        .bind(present)
        .execute(&mut *tx)
        .await
        .map_err(into_internal)?;

    let action = if present { ACTION_ENTER } else { ACTION_EXIT };
    insert_log(&mut tx, uid, &user_name, action, room.display_name()).await?;

    tx.commit().await.map_err(into_internal)?;
    Ok(())
}

async fn insert_log(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: &str,
    user_name: &str,
    action: &str,
    room: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO logs (user_id, user_name, action, room) VALUES ($1, $2, $3, $4)",
    )
    .bind(user_id)
    .bind(user_name)
    .bind(action)
    .bind(room)
    .execute(&mut **tx)
    .await
    .map_err(into_internal)?;
    Ok(())
}

// ─── In-memory ─────────────────────────────────────────────────────────

async fn upsert_memory(
    store: &RwLock<MemoryStore>,
    identity: &AppIdentity,
    encrypted_token: &str,
) -> Result<UpsertOutcome, StoreError> {
    let mut guard = store.write().await;
    let now = Utc::now();

    if let Some(user) = guard.users.get_mut(&identity.uid) {
        user.name = identity.name.clone();
        user.email = identity.email.clone();
        user.avatar = identity.avatar.clone();
        user.provider = identity.provider.clone();
        user.slack_user_id = identity.slack_user_id.clone();
        user.slack_team_id = identity.slack_team_id.clone();
        user.encrypted_token = Some(encrypted_token.to_owned());
        user.last_activity = now;
        return Ok(UpsertOutcome { is_new_user: false });
    }

    guard.users.insert(
        identity.uid.clone(),
        UserProfile {
            uid: identity.uid.clone(),
            name: identity.name.clone(),
            email: identity.email.clone(),
            avatar: identity.avatar.clone(),
            provider: identity.provider.clone(),
            slack_user_id: identity.slack_user_id.clone(),
            slack_team_id: identity.slack_team_id.clone(),
            room2218: false,
            grad_room: false,
            has_key: false,
            encrypted_token: Some(encrypted_token.to_owned()),
            created_at: now,
            last_activity: now,
        },
    );
    Ok(UpsertOutcome { is_new_user: true })
}

async fn acquire_key_memory(store: &RwLock<MemoryStore>, uid: &str) -> Result<(), StoreError> {
    let mut guard = store.write().await;
    let now = Utc::now();

    let user_name = guard
        .users
        .get(uid)
        .map(|user| user.name.clone())
        .ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;

    if let Some(previous) = guard.holder_uid.clone().filter(|holder| holder != uid) {
        if let Some(previous_user) = guard.users.get_mut(&previous) {
            previous_user.has_key = false;
            previous_user.last_activity = now;
        }
    }

    if let Some(user) = guard.users.get_mut(uid) {
        user.has_key = true;
        user.last_activity = now;
    }
    guard.holder_uid = Some(uid.to_owned());

    guard.logs.push(LogEntry {
        user_id: uid.to_owned(),
        user_name,
        action: ACTION_TAKE_KEY.to_owned(),
        room: String::new(),
        logged_at: now,
    });
    Ok(())
}

async fn release_key_memory(store: &RwLock<MemoryStore>, uid: &str) -> Result<(), StoreError> {
    let mut guard = store.write().await;
    let now = Utc::now();

    let user_name = guard
        .users
        .get(uid)
        .map(|user| user.name.clone())
        .ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;

    if let Some(user) = guard.users.get_mut(uid) {
        user.has_key = false;
        user.last_activity = now;
    }
    if guard.holder_uid.as_deref() == Some(uid) {
        guard.holder_uid = None;
    }

    guard.logs.push(LogEntry {
        user_id: uid.to_owned(),
        user_name,
        action: ACTION_RETURN_KEY.to_owned(),
        room: String::new(),
        logged_at: now,
    });
    Ok(())
}

async fn set_room_presence_memory(
    store: &RwLock<MemoryStore>,
    uid: &str,
    room: RoomKind,
    present: bool,
) -> Result<(), StoreError> {
    let mut guard = store.write().await;
    let now = Utc::now();

    let user_name = {
        let user = guard
            .users
            .get_mut(uid)
            .ok_or_else(|| StoreError::UserNotFound(uid.to_owned()))?;
        match room {
            RoomKind::Room2218 => user.room2218 = present,
            RoomKind::GradRoom => user.grad_room = present,
        }
        user.last_activity = now;
        user.name.clone()
    };

    let action = if present { ACTION_ENTER } else { ACTION_EXIT };
    guard.logs.push(LogEntry {
        user_id: uid.to_owned(),
        user_name,
        action: action.to_owned(),
        room: room.display_name().to_owned(),
        logged_at: now,
    });
    Ok(())
}
