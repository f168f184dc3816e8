//! Photo gallery backend core.
//!
//! A [Gallery] owns a set of [Collection]s, each with its own catalog, album cache, and batched writer, plus the
//! process-wide album lock table and the extraction and thumbnail worker pools.  The HTTP and WebDAV layers call
//! into the operations defined here.

use {
    crate::{
        collection::Collection,
        error::{check_name, GalleryError},
        lock_map::{AlbumKey, LockMap},
        pool::{Completion, Pool, PoolStatus},
        thumbnailer::Thumbnailer,
    },
    anyhow::{anyhow, Result},
    bytes::Bytes,
    futures::stream::{BoxStream, StreamExt},
    gallery_shared::{Album, AlbumInfo, CollectionInfo, File, Photo},
    serde_derive::Serialize,
    std::{
        collections::{BTreeMap, HashSet},
        ops::ControlFlow,
        path::Path,
        sync::Arc,
    },
    tokio::fs::{self, File as AsyncFile},
    tracing::{info, warn},
};

pub use {
    collection::{CollectionConfig, Config},
    media::{FsProber, MediaProber, Probe},
    pool::PoolConfig,
    sync::Reconcile,
    writer::WriterConfig,
};

pub mod cache;
pub mod collection;
pub mod error;
pub mod lock_map;
pub mod media;
mod mover;
pub mod pool;
pub mod pseudo;
pub mod store;
mod sync;
pub mod thumbnailer;
pub mod thumbs;
pub mod writer;

/// Snapshot of the gallery's background activity
#[derive(Serialize, Debug, Clone)]
pub struct GalleryStatus {
    pub extract: PoolStatus,
    pub thumbnails: PoolStatus,
    pub album_locks: usize,
}

pub struct Gallery {
    collections: Vec<Arc<Collection>>,
    locks: LockMap<AlbumKey>,
    prober: Arc<dyn MediaProber>,
    extract: Pool,
    thumbnailer: Thumbnailer,
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

impl Gallery {
    /// Open every collection named in `config` and start the worker pools.
    pub async fn open(config: &Config, prober: Arc<dyn MediaProber>) -> Result<Self> {
        let mut collections = Vec::<Arc<Collection>>::with_capacity(config.collections.len());

        for (index, collection) in config.collections.iter().enumerate() {
            check_name(&collection.name)?;

            if collections.iter().any(|c| c.name == collection.name) {
                return Err(anyhow!("duplicate collection name: {}", collection.name));
            }

            collections.push(Arc::new(
                Collection::open(index, collection, config.writer, config.album_cache_size).await?,
            ));
        }

        let extract = Pool::new(
            "extract",
            config.pool.extract_workers,
            config.pool.queue_size,
            Arc::default(),
        );

        let thumbnails = Pool::new(
            "thumbnail",
            config.pool.thumb_workers,
            config.pool.queue_size,
            Arc::default(),
        );

        Ok(Self {
            collections,
            locks: LockMap::default(),
            thumbnailer: Thumbnailer::new(thumbnails, prober.clone()),
            prober,
            extract,
        })
    }

    pub fn collection(&self, name: &str) -> Result<&Arc<Collection>> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| GalleryError::CollectionNotFound(name.into()).into())
    }

    /// Every collection, hidden or not, in configuration order.
    pub fn collections(&self) -> &[Arc<Collection>] {
        &self.collections
    }

    /// Visible collections, in configuration order.
    pub fn list_collections(&self) -> Vec<CollectionInfo> {
        self.collections
            .iter()
            .filter(|c| !c.hidden)
            .map(|c| c.info())
            .collect()
    }

    /// Real albums (top-level directories) and pseudo-albums of a collection, sorted by name.
    pub async fn list_albums(&self, collection: &str) -> Result<Vec<AlbumInfo>> {
        let collection = self.collection(collection)?;

        let mut albums = Vec::new();
        let mut dir = fs::read_dir(&collection.photo_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') && is_dir(&entry.path()).await {
                    albums.push(AlbumInfo {
                        name: name.to_owned(),
                        pseudo: false,
                    });
                }
            }
        }

        albums.extend(
            pseudo::list(&collection.photo_dir)
                .await?
                .into_iter()
                .map(|name| AlbumInfo { name, pseudo: true }),
        );

        albums.sort();

        Ok(albums)
    }

    /// Create an empty real album.
    pub async fn add_album(&self, collection: &str, name: &str) -> Result<()> {
        let collection = self.collection(collection)?;

        collection.check_writable()?;
        check_name(name)?;

        if Path::new(name).extension().and_then(|e| e.to_str()) == Some(pseudo::PSEUDO_EXTENSION) {
            return Err(GalleryError::InvalidName(name.to_owned().into()).into());
        }

        let dir = collection.album_dir(name);

        if fs::metadata(&dir).await.is_ok() || fs::metadata(collection.pseudo_path(name)).await.is_ok() {
            return Err(GalleryError::AlbumExists(name.into()).into());
        }

        fs::create_dir(&dir).await?;

        info!("created album {}/{}", collection.name, name);

        Ok(())
    }

    async fn real_album(&self, collection: &Arc<Collection>, name: &str, refresh: bool) -> Result<Arc<Album>> {
        if !refresh {
            if let Some(album) = collection.albums.get(name) {
                return Ok(album);
            }
        }

        let photos = self
            .reconcile(
                &collection.name,
                name,
                &if refresh {
                    Reconcile::refresh()
                } else {
                    Reconcile::full()
                },
            )
            .await?;

        Ok(collection
            .albums
            .get(name)
            .unwrap_or_else(|| Arc::new(Album::new(name, false, photos.into_values().collect()))))
    }

    /// Resolve a pseudo-album's references against the real albums they point into.
    ///
    /// Duplicate lines are collapsed and references to photos which no longer exist are ignored.
    async fn pseudo_album(&self, collection: &Arc<Collection>, name: &str) -> Result<Album> {
        let mut seen = HashSet::new();
        let mut wanted = BTreeMap::<(String, String), HashSet<String>>::new();

        for entry in pseudo::read_entries(&collection.pseudo_path(name)).await? {
            if seen.insert(entry.clone()) {
                wanted
                    .entry((entry.collection, entry.album))
                    .or_default()
                    .insert(entry.id);
            }
        }

        let mut photos = Vec::new();

        for ((source, album), ids) in wanted {
            let album = match self.collection(&source) {
                Ok(source) => self.real_album(source, &album, false).await,
                Err(e) => Err(e),
            };

            match album {
                Ok(album) => photos.extend(album.photos.iter().filter(|p| ids.contains(&p.id)).cloned()),
                Err(e) => warn!("skipping references from pseudo-album {}: {:?}", name, e),
            }
        }

        Ok(Album::new(name, true, photos))
    }

    /// Load an album, reconciling it with the filesystem unless it is already cached.
    ///
    /// `refresh` forces every photo to be probed again.  Directories take precedence over pseudo-albums of the
    /// same name.
    pub async fn get_album(&self, collection: &str, name: &str, refresh: bool) -> Result<Arc<Album>> {
        let collection = self.collection(collection)?.clone();

        if !is_dir(&collection.album_dir(name)).await
            && fs::metadata(collection.pseudo_path(name)).await.is_ok()
        {
            return Ok(Arc::new(self.pseudo_album(&collection, name).await?));
        }

        self.real_album(&collection, name, refresh).await
    }

    async fn find_photo(&self, collection: &Collection, album: &str, id: &str) -> Result<Photo> {
        if let Some(cached) = collection.albums.get(album) {
            if let Some(photo) = cached.photos.iter().find(|p| p.id == id) {
                return Ok(photo.clone());
            }
        }

        collection
            .store
            .get(album, id)
            .await?
            .ok_or_else(|| GalleryError::photo_not_found(album, id).into())
    }

    /// Stream one of a photo's original files.
    pub async fn photo_file(
        &self,
        collection: &str,
        album: &str,
        id: &str,
        index: usize,
    ) -> Result<(File, BoxStream<'static, Result<Bytes>>)> {
        let collection = self.collection(collection)?;

        let file = self
            .find_photo(collection, album, id)
            .await?
            .files
            .get(index)
            .cloned()
            .ok_or_else(|| GalleryError::FileNotFound(format!("{}/{}/{}", album, id, index)))?;

        let content = AsyncFile::open(collection.file_path(&file))
            .await
            .map_err(|_| GalleryError::FileNotFound(file.path.clone()))?;

        Ok((file, media::as_stream(content).boxed()))
    }

    /// Stream a photo's thumbnail, generating it first if necessary.
    pub async fn thumbnail(
        &self,
        collection: &str,
        album: &str,
        id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let collection = self.collection(collection)?;

        let photo = self.find_photo(collection, album, id).await?;

        self.thumbnailer.thumbnail(collection, &photo).await
    }

    /// Queue thumbnail generation for every cataloged photo without one.  Returns the number queued.
    pub async fn catch_up_thumbnails(&self) -> Result<usize> {
        self.queue_missing_thumbnails(None).await
    }

    /// Generate every missing thumbnail, returning once all of them have been written and cataloged.
    pub async fn generate_missing_thumbnails(&self) -> Result<usize> {
        let completion = Completion::new();

        let queued = self.queue_missing_thumbnails(Some(&completion)).await?;

        completion.wait().await;

        for collection in &self.collections {
            collection.writer.flush(true).await?;
        }

        Ok(queued)
    }

    async fn queue_missing_thumbnails(&self, completion: Option<&Completion>) -> Result<usize> {
        let mut queued = 0;

        for collection in &self.collections {
            for (album, photos) in collection.store.find_missing_thumbnails().await? {
                for photo in photos {
                    if thumbs::exists(&collection.thumbnail_path(&album, &photo.id)).await {
                        collection.writer.mark_thumb(&album, &photo.id, true).await?;
                    } else {
                        self.thumbnailer
                            .enqueue(collection.clone(), photo, completion.map(Completion::guard), None)
                            .await?;

                        queued += 1;
                    }
                }
            }
        }

        if queued > 0 {
            info!("queued {} missing thumbnails", queued);
        }

        Ok(queued)
    }

    /// Photos in the same collection with a file of the same byte size as one of this photo's files.
    pub async fn possible_duplicates(&self, collection: &str, album: &str, id: &str) -> Result<Vec<Photo>> {
        let collection = self.collection(collection)?;

        let photo = self.find_photo(collection, album, id).await?;

        let mut seen = HashSet::new();
        let mut result = Vec::new();

        for &size in &photo.sizes {
            for other in collection.store.find_by_size(size).await? {
                if (other.album != photo.album || other.id != photo.id)
                    && seen.insert((other.album.clone(), other.id.clone()))
                {
                    result.push(other);
                }
            }
        }

        Ok(result)
    }

    /// Move thumbnails of `collection` from the old content-hash layout.
    pub async fn migrate_thumbnails(&self, collection: &str) -> Result<usize> {
        let collection = self.collection(collection)?;

        thumbs::migrate(&collection.thumb_root, &collection.name, &collection.store).await
    }

    /// Reconcile every album not yet in any catalog, then queue missing thumbnails.
    pub async fn warm(&self) -> Result<()> {
        for collection in &self.collections {
            for album in self.list_albums(&collection.name).await? {
                if !album.pseudo {
                    if let Err(e) = self
                        .reconcile(&collection.name, &album.name, &Reconcile::skip_if_cached())
                        .await
                    {
                        warn!("unable to reconcile {}/{}: {:?}", collection.name, album.name, e);
                    }
                }
            }
        }

        self.catch_up_thumbnails().await?;

        Ok(())
    }

    /// Reconcile every previously reconciled album again, picking up external changes.
    pub async fn resync(&self) -> Result<()> {
        for collection in &self.collections {
            for album in collection.store.album_names().await? {
                match self.reconcile(&collection.name, &album, &Reconcile::full()).await {
                    Ok(_) => (),
                    Err(e) => {
                        if let Some(GalleryError::AlbumNotFound(_)) = GalleryError::of(&e) {
                            info!("album {}/{} has disappeared", collection.name, album);

                            let mut ids = Vec::new();

                            collection
                                .store
                                .for_each_in_album(&album, |photo| {
                                    ids.push(photo.id);
                                    ControlFlow::Continue(())
                                })
                                .await?;

                            for id in &ids {
                                collection.writer.delete(&album, id).await?;
                            }

                            collection.writer.flush(true).await?;
                            collection.albums.invalidate(&album);
                            collection.store.forget_album(&album).await?;
                        } else {
                            warn!("unable to reconcile {}/{}: {:?}", collection.name, album, e);
                        }
                    }
                }
            }
        }

        self.catch_up_thumbnails().await?;

        self.locks.clean().await;

        Ok(())
    }

    pub async fn status(&self) -> GalleryStatus {
        GalleryStatus {
            extract: self.extract.stats().snapshot(),
            thumbnails: self.thumbnailer.pool().stats().snapshot(),
            album_locks: self.locks.len().await,
        }
    }
}
