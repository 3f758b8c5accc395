//! Who may see whose presence.
//!
//! The presence service only reads the whitelist. Whoever changes group
//! membership is responsible for calling [`CachedWhitelist::invalidate`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;

use crate::db::Database;

#[derive(Debug)]
pub enum WhitelistError {
    Database(sqlx::Error),
}

impl std::fmt::Display for WhitelistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WhitelistError::Database(e) => write!(f, "Visibility lookup failed: {}", e),
        }
    }
}

impl std::error::Error for WhitelistError {}

impl From<sqlx::Error> for WhitelistError {
    fn from(e: sqlx::Error) -> Self {
        WhitelistError::Database(e)
    }
}

/// Source of the symmetric "can see each other" relation.
pub trait VisibilityWhitelist: Send + Sync {
    /// Ids of the users allowed to see `user_id`, excluding `user_id`.
    fn visible_peers(&self, user_id: i64) -> BoxFuture<'_, Result<Vec<i64>, WhitelistError>>;
}

/// Users sharing at least one group see each other.
#[derive(Clone)]
pub struct GroupWhitelist {
    db: Database,
}

impl GroupWhitelist {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl VisibilityWhitelist for GroupWhitelist {
    fn visible_peers(&self, user_id: i64) -> BoxFuture<'_, Result<Vec<i64>, WhitelistError>> {
        Box::pin(async move { Ok(self.db.groups().peers_of(user_id).await?) })
    }
}

/// Memoizes another whitelist until invalidated.
pub struct CachedWhitelist<W> {
    inner: W,
    cache: Mutex<HashMap<i64, Arc<Vec<i64>>>>,
}

impl<W: VisibilityWhitelist> CachedWhitelist<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Forget everything derived from `user_id`'s memberships after they
    /// changed: its own entry, every cached list it appears in and the
    /// entries of its current peers, which may now be missing it.
    ///
    /// Clears the whole cache when the current peers cannot be looked up.
    pub async fn invalidate(&self, user_id: i64) {
        let current = self.inner.visible_peers(user_id).await;
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.remove(&user_id);
        match current {
            Ok(peers) => {
                cache.retain(|id, cached| !cached.contains(&user_id) && !peers.contains(id))
            }
            Err(_) => cache.clear(),
        }
    }

    pub fn invalidate_all(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn cached(&self, user_id: i64) -> Option<Arc<Vec<i64>>> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .cloned()
    }
}

impl<W: VisibilityWhitelist> VisibilityWhitelist for CachedWhitelist<W> {
    fn visible_peers(&self, user_id: i64) -> BoxFuture<'_, Result<Vec<i64>, WhitelistError>> {
        Box::pin(async move {
            if let Some(peers) = self.cached(user_id) {
                return Ok(peers.as_ref().clone());
            }

            let peers = self.inner.visible_peers(user_id).await?;
            self.cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(user_id, Arc::new(peers.clone()));
            Ok(peers)
        })
    }
}

impl<W: VisibilityWhitelist> VisibilityWhitelist for Arc<W> {
    fn visible_peers(&self, user_id: i64) -> BoxFuture<'_, Result<Vec<i64>, WhitelistError>> {
        self.as_ref().visible_peers(user_id)
    }
}

/// Fixed whitelist built from groups of user ids.
#[derive(Debug, Clone, Default)]
pub struct StaticWhitelist {
    peers: HashMap<i64, BTreeSet<i64>>,
}

impl StaticWhitelist {
    pub fn from_groups(groups: &[&[i64]]) -> Self {
        let mut peers: HashMap<i64, BTreeSet<i64>> = HashMap::new();
        for group in groups {
            for &member in group.iter() {
                let entry = peers.entry(member).or_default();
                entry.extend(group.iter().copied().filter(|&other| other != member));
            }
        }
        Self { peers }
    }
}

impl VisibilityWhitelist for StaticWhitelist {
    fn visible_peers(&self, user_id: i64) -> BoxFuture<'_, Result<Vec<i64>, WhitelistError>> {
        let peers = self
            .peers
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        Box::pin(async move { Ok(peers) })
    }
}
