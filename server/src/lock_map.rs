//! This module provides the [LockMap] type, which serializes work on individual albums without serializing the
//! whole gallery: at most one task holds the lock for a given (collection, album) pair, while tasks working on
//! different albums proceed concurrently.

use {
    std::{collections::HashMap, fmt, hash::Hash, sync::Arc},
    tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock as AsyncRwLock},
};

/// Identifies an album within the gallery.
///
/// Real and pseudo-albums live in separate namespaces, so a directory can never share a lock with a pseudo-album
/// file whatever its name.  Every real key sorts before every pseudo key, which gives
/// [LockMap::lock_all] callers a real-then-pseudo lock order.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum AlbumKey {
    Real { collection: String, album: String },
    Pseudo { collection: String, album: String },
}

impl AlbumKey {
    pub fn new(collection: &str, album: &str) -> Self {
        Self::Real {
            collection: collection.into(),
            album: album.into(),
        }
    }

    pub fn pseudo(collection: &str, album: &str) -> Self {
        Self::Pseudo {
            collection: collection.into(),
            album: album.into(),
        }
    }
}

impl fmt::Display for AlbumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real { collection, album } => write!(f, "{}/{}", collection, album),
            Self::Pseudo { collection, album } => write!(f, "{}/{} (pseudo)", collection, album),
        }
    }
}

/// Lazily-populated table of named mutexes.
///
/// Locks are created on first use and kept until [LockMap::clean] finds them unused, so the table is bounded by
/// the number of distinct keys in play.
pub struct LockMap<K>(AsyncRwLock<HashMap<K, Arc<AsyncMutex<()>>>>);

impl<K> Default for LockMap<K> {
    /// Return an empty [LockMap].
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<K> fmt::Debug for LockMap<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockMap")
    }
}

impl<K: Eq + Hash + Ord + Clone> LockMap<K> {
    async fn get(&self, key: &K) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.0.read().await.get(key) {
            return lock.clone();
        }

        self.0.write().await.entry(key.clone()).or_default().clone()
    }

    /// Acquire the lock for the specified resource, waiting for any current holder to release it.
    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        self.get(key).await.lock_owned().await
    }

    /// Acquire the locks for several resources at once.
    ///
    /// Keys are locked in sorted order (and deduplicated) so two tasks locking overlapping sets cannot deadlock.
    pub async fn lock_all(&self, keys: &[K]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());

        for key in &keys {
            guards.push(self.lock(key).await);
        }

        guards
    }

    /// Remove any unused locks from the map.
    ///
    /// A lock is considered unused if there are no strong or weak references to it outside of the map itself.
    pub async fn clean(&self) {
        self.0
            .write()
            .await
            .retain(|_, lock| Arc::get_mut(lock).is_none());
    }

    pub async fn len(&self) -> usize {
        self.0.read().await.len()
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        std::{
            sync::atomic::{AtomicUsize, Ordering},
            time::Duration,
        },
        tokio::{task, time},
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(LockMap::<AlbumKey>::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8)
            .map(|_| {
                let (locks, inside, max) = (locks.clone(), inside.clone(), max.clone());

                task::spawn(async move {
                    let _guard = locks.lock(&AlbumKey::new("c", "Trip")).await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max.fetch_max(now, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(1, max.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn distinct_keys_are_independent() {
        let locks = LockMap::<AlbumKey>::default();

        let _a = locks.lock(&AlbumKey::new("c", "a")).await;

        // Would hang if "b" shared a lock with "a".
        time::timeout(Duration::from_secs(5), locks.lock(&AlbumKey::new("c", "b")))
            .await
            .unwrap();

        let guards = locks
            .lock_all(&[AlbumKey::new("d", "x"), AlbumKey::new("d", "x"), AlbumKey::new("d", "w")])
            .await;

        assert_eq!(2, guards.len());
        assert_eq!(4, locks.len().await);

        drop(guards);
        locks.clean().await;

        assert_eq!(1, locks.len().await);

        // A directory named like a pseudo-album file doesn't share its lock.
        let _real = locks.lock(&AlbumKey::new("c", "Favorites.pseudo")).await;

        time::timeout(Duration::from_secs(5), locks.lock(&AlbumKey::pseudo("c", "Favorites")))
            .await
            .unwrap();

        time::timeout(Duration::from_secs(5), locks.lock(&AlbumKey::pseudo("c", "Favorites.pseudo")))
            .await
            .unwrap();

        assert!(AlbumKey::new("z", "z") < AlbumKey::pseudo("a", "a"));
    }
}
