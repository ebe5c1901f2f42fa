//! Datastore access: the user record contract and the persistence worker.
//!
//! The server reads and writes user records but owns no schema; records are
//! created and deleted by the surrounding web application. All datastore
//! traffic runs through a dedicated worker task consuming a bounded request
//! queue, so query latency never stalls the reactor's broadcast or keepalive
//! ticks, and a failure on one operation is logged without taking the
//! synchronizer down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, error, info};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::mpsc;

/// How many most-recently-active users a periodic pull fetches.
pub const PULL_LIMIT: i64 = 100;

/// Capacity of the request queue into the store worker. Requests beyond
/// this are dropped and retried on a later tick.
pub const STORE_QUEUE_DEPTH: usize = 64;

/// A user row as the collaborator datastore stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct UserRecord {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub nick: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datastore error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Unavailable(String),
}

/// Read/write contract against the user table. The server never creates or
/// deletes records through this.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// User bound to a session identifier, if any.
    async fn user_by_session(&self, session_id: &str) -> Result<Option<i64>, StoreError>;
    /// Full record for one user.
    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError>;
    /// The most recently active users, newest first.
    async fn recent_users(&self, limit: i64) -> Result<Vec<UserRecord>, StoreError>;
    /// Writes a position back; the row must already exist.
    async fn save_position(
        &self,
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), StoreError>;
}

/// Postgres-backed store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn user_by_session(&self, session_id: &str) -> Result<Option<i64>, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        let row: Option<(i64, f64, f64, f64, String)> =
            sqlx::query_as("SELECT id, lat, lon, alt, nick FROM users WHERE id = $1 LIMIT 1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, lat, lon, alt, nick)| UserRecord {
            id,
            lat,
            lon,
            alt,
            nick,
        }))
    }

    async fn recent_users(&self, limit: i64) -> Result<Vec<UserRecord>, StoreError> {
        let rows: Vec<(i64, f64, f64, f64, String)> = sqlx::query_as(
            "SELECT id, lat, lon, alt, nick FROM users ORDER BY last_login DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, lat, lon, alt, nick)| UserRecord {
                id,
                lat,
                lon,
                alt,
                nick,
            })
            .collect())
    }

    async fn save_position(
        &self,
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET lat = $1, lon = $2, alt = $3 WHERE id = $4")
            .bind(lat)
            .bind(lon)
            .bind(alt)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryUser {
    record: UserRecord,
    session_id: Option<String>,
}

/// In-memory store used by tests and for running the server without a
/// database. Recency follows insertion order, newest last in, first out.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<Vec<MemoryUser>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user record, optionally bound to a session id.
    pub fn insert_user(&self, record: UserRecord, session_id: Option<String>) {
        let mut users = self.users.lock().expect("store lock poisoned");
        users.retain(|u| u.record.id != record.id);
        users.push(MemoryUser { record, session_id });
    }

    /// Makes every subsequent `save_position` fail, for testing the push
    /// cycle's error isolation.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn position_of(&self, user_id: i64) -> Option<(f64, f64, f64)> {
        let users = self.users.lock().expect("store lock poisoned");
        users
            .iter()
            .find(|u| u.record.id == user_id)
            .map(|u| (u.record.lat, u.record.lon, u.record.alt))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_session(&self, session_id: &str) -> Result<Option<i64>, StoreError> {
        let users = self.users.lock().expect("store lock poisoned");
        Ok(users
            .iter()
            .find(|u| u.session_id.as_deref() == Some(session_id))
            .map(|u| u.record.id))
    }

    async fn user_by_id(&self, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
        let users = self.users.lock().expect("store lock poisoned");
        Ok(users
            .iter()
            .find(|u| u.record.id == user_id)
            .map(|u| u.record.clone()))
    }

    async fn recent_users(&self, limit: i64) -> Result<Vec<UserRecord>, StoreError> {
        let users = self.users.lock().expect("store lock poisoned");
        Ok(users
            .iter()
            .rev()
            .take(limit as usize)
            .map(|u| u.record.clone())
            .collect())
    }

    async fn save_position(
        &self,
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
    ) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("save failure injected".to_string()));
        }
        let mut users = self.users.lock().expect("store lock poisoned");
        if let Some(user) = users.iter_mut().find(|u| u.record.id == user_id) {
            user.record.lat = lat;
            user.record.lon = lon;
            user.record.alt = alt;
        }
        Ok(())
    }
}

/// Work orders for the store worker.
#[derive(Debug)]
pub enum StoreRequest {
    /// Session-to-user lookup; only `hello` issues this.
    ResolveSession { session_id: String },
    /// Load one user's record into the world cache.
    LoadUser { user_id: i64 },
    /// Periodic pull of the most recently active users.
    PullRecent,
    /// Flush one dirty user's position. `version` rides along so the
    /// reactor knows which snapshot was saved.
    SaveUser {
        user_id: i64,
        lat: f64,
        lon: f64,
        alt: f64,
        version: u64,
    },
}

/// Completions flowing back into the reactor loop.
#[derive(Debug)]
pub enum StoreEvent {
    SessionResolved {
        session_id: String,
        user_id: Option<i64>,
    },
    UserLoaded {
        user_id: i64,
        record: Option<UserRecord>,
    },
    RecentPulled {
        records: Vec<UserRecord>,
    },
    UserSaved {
        user_id: i64,
        version: u64,
    },
}

/// Spawns the dedicated store worker and returns the request queue handle.
///
/// Failed operations are logged and produce no event; the reactor's tick
/// cadence retries pulls and pushes naturally, and a client retries its own
/// `hello`.
pub fn spawn_store_worker(
    store: Arc<dyn UserStore>,
    events: mpsc::Sender<StoreEvent>,
) -> mpsc::Sender<StoreRequest> {
    let (tx, mut rx) = mpsc::channel::<StoreRequest>(STORE_QUEUE_DEPTH);

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let event = match request {
                StoreRequest::ResolveSession { session_id } => {
                    match store.user_by_session(&session_id).await {
                        Ok(user_id) => Some(StoreEvent::SessionResolved { session_id, user_id }),
                        Err(e) => {
                            error!("Session lookup for {} failed: {}", session_id, e);
                            None
                        }
                    }
                }
                StoreRequest::LoadUser { user_id } => match store.user_by_id(user_id).await {
                    Ok(record) => Some(StoreEvent::UserLoaded { user_id, record }),
                    Err(e) => {
                        error!("Loading user {} failed: {}", user_id, e);
                        None
                    }
                },
                StoreRequest::PullRecent => match store.recent_users(PULL_LIMIT).await {
                    Ok(records) => {
                        debug!("Pulled {} users from datastore", records.len());
                        Some(StoreEvent::RecentPulled { records })
                    }
                    Err(e) => {
                        error!("Periodic user pull failed: {}", e);
                        None
                    }
                },
                StoreRequest::SaveUser {
                    user_id,
                    lat,
                    lon,
                    alt,
                    version,
                } => match store.save_position(user_id, lat, lon, alt).await {
                    Ok(()) => Some(StoreEvent::UserSaved { user_id, version }),
                    Err(e) => {
                        // The user stays dirty and is retried next push tick.
                        error!("Saving user {} failed: {}", user_id, e);
                        None
                    }
                },
            };

            if let Some(event) = event {
                if events.send(event).await.is_err() {
                    info!("Reactor gone, store worker shutting down");
                    break;
                }
            }
        }
    });

    tx
}
