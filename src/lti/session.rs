//! Launch sessions: validated launches persisted under an opaque id.
//!
//! Every validated launch is stored for 24 hours so the tool UI can look it up
//! by `launch_id` on subsequent requests. A deep-linking launch is what the
//! instructor's selection is later answered against. Expired launches and nonces are
//! removed by [`LaunchSessions::cleanup_expired`], which the background
//! sweeper calls on an interval until shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::claims::MessageType;
use super::launch::ValidatedLaunch;
use super::nonce::NonceStore;

/// A launch persisted after validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLaunch {
    /// Opaque launch id
    pub launch_id: Uuid,
    /// Issuer the launch came from
    pub platform_id: String,
    /// Deployment the launch came from
    pub deployment_id: String,
    /// Platform `sub` of the launching user
    pub user_id: String,
    /// Course context, when present
    pub context_id: Option<String>,
    /// Resource link, when present
    pub resource_link_id: Option<String>,
    /// LTI message type
    pub message_type: MessageType,
    /// Full verified claim set
    pub raw_launch_data: Map<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// `created_at + ttl`
    pub expires_at: DateTime<Utc>,
}

impl StoredLaunch {
    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Storage backend for launches.
#[async_trait::async_trait]
pub trait LaunchSessionStore: Send + Sync + 'static {
    /// Persist a launch.
    async fn insert(&self, launch: StoredLaunch);

    /// Look up a launch by id, expired entries included.
    async fn get(&self, launch_id: &Uuid) -> Option<StoredLaunch>;

    /// Remove expired launches. Returns the number removed.
    async fn reap_expired(&self) -> usize;
}

/// In-memory launch store backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryLaunchStore {
    launches: DashMap<Uuid, StoredLaunch>,
}

impl InMemoryLaunchStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored launches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.launches.len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.launches.is_empty()
    }
}

#[async_trait::async_trait]
impl LaunchSessionStore for InMemoryLaunchStore {
    async fn insert(&self, launch: StoredLaunch) {
        self.launches.insert(launch.launch_id, launch);
    }

    async fn get(&self, launch_id: &Uuid) -> Option<StoredLaunch> {
        self.launches.get(launch_id).map(|l| l.clone())
    }

    async fn reap_expired(&self) -> usize {
        let before = self.launches.len();
        self.launches.retain(|_, l| !l.is_expired());
        before.saturating_sub(self.launches.len())
    }
}

/// Counts returned by one cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCounts {
    /// Expired nonces removed
    pub nonces: usize,
    /// Expired launches removed
    pub launches: usize,
}

/// Launch persistence plus expiry housekeeping.
pub struct LaunchSessions {
    store: Arc<dyn LaunchSessionStore>,
    nonces: Arc<dyn NonceStore>,
    ttl: Duration,
}

impl LaunchSessions {
    /// Create a session layer whose launches live for `ttl`.
    #[must_use]
    pub fn new(store: Arc<dyn LaunchSessionStore>, nonces: Arc<dyn NonceStore>, ttl: Duration) -> Self {
        Self { store, nonces, ttl }
    }

    /// Persist a validated launch and return the stored record.
    pub async fn store(&self, launch: &ValidatedLaunch) -> StoredLaunch {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(24));
        let ctx = &launch.context;
        let stored = StoredLaunch {
            launch_id: Uuid::new_v4(),
            platform_id: launch.platform_id.clone(),
            deployment_id: ctx.deployment_id.clone(),
            user_id: ctx.user.sub.clone(),
            context_id: ctx.context_id.clone(),
            resource_link_id: ctx.resource_link_id.clone(),
            message_type: ctx.message_type,
            raw_launch_data: launch.raw_claims.clone(),
            created_at,
            expires_at: created_at + ttl,
        };
        self.store.insert(stored.clone()).await;
        debug!(launch_id = %stored.launch_id, platform = %stored.platform_id, "Stored launch");
        stored
    }

    /// Look up an unexpired launch.
    pub async fn get(&self, launch_id: &Uuid) -> Option<StoredLaunch> {
        self.store.get(launch_id).await.filter(|l| !l.is_expired())
    }

    /// Delete expired nonces and launches.
    ///
    /// Idempotent; a second pass right after the first removes nothing.
    pub async fn cleanup_expired(&self) -> CleanupCounts {
        CleanupCounts {
            nonces: self.nonces.reap_expired().await,
            launches: self.store.reap_expired().await,
        }
    }
}

/// Spawn the background sweeper that periodically removes expired state.
///
/// Runs until a value arrives on the `shutdown` channel.
pub fn spawn_sweeper(
    sessions: Arc<LaunchSessions>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let counts = sessions.cleanup_expired().await;
                    if counts.nonces + counts.launches > 0 {
                        debug!(nonces = counts.nonces, launches = counts.launches, "Swept expired launch state");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Launch sweeper shutting down");
                    break;
                }
            }
        }
    })
}
