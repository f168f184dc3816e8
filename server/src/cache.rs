use {
    gallery_shared::Album,
    moka::sync::Cache,
    std::{convert::TryFrom, sync::Arc},
};

/// In-memory cache of fully loaded albums for one collection.
///
/// The cache is bounded by the total number of photos it holds and evicts least-recently-used albums past that.
/// Reads never block on reconciliation, so they may observe an album which is being refreshed.
#[derive(Clone, Debug)]
pub struct AlbumCache(Cache<String, Arc<Album>>);

impl AlbumCache {
    pub fn new(max_photos: u64) -> Self {
        Self(
            Cache::builder()
                .max_capacity(max_photos)
                .weigher(|_, album: &Arc<Album>| u32::try_from(album.photos.len().max(1)).unwrap_or(u32::MAX))
                .build(),
        )
    }

    pub fn get(&self, name: &str) -> Option<Arc<Album>> {
        self.0.get(name)
    }

    pub fn insert(&self, album: Album) -> Arc<Album> {
        let album = Arc::new(album);

        self.0.insert(album.name.clone(), album.clone());

        album
    }

    pub fn invalidate(&self, name: &str) {
        self.0.invalidate(name)
    }

    pub fn invalidate_all(&self) {
        self.0.invalidate_all()
    }
}
