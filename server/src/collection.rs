use {
    crate::{
        cache::AlbumCache,
        error::GalleryError,
        pool::PoolConfig,
        pseudo,
        store::Store,
        thumbs,
        writer::{Writer, WriterConfig},
    },
    anyhow::{anyhow, Result},
    gallery_shared::{CollectionInfo, File},
    serde_derive::Deserialize,
    std::{
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::fs,
    tracing::info,
};

pub const DEFAULT_ALBUM_CACHE_SIZE: u64 = 100_000;

fn default_album_cache_size() -> u64 {
    DEFAULT_ALBUM_CACHE_SIZE
}

/// One entry in the `collections` list of a [Config] file
#[derive(Deserialize, Debug, Clone)]
pub struct CollectionConfig {
    pub name: String,

    /// Directory containing one subdirectory per album, plus any pseudo-album files
    pub photos: PathBuf,

    /// Directory holding the catalog and the `<name>-thumbs` tree
    pub thumbs: PathBuf,

    #[serde(default)]
    pub hidden: bool,

    #[serde(default)]
    pub read_only: bool,

    /// Treat `replace` moves into this collection as `rename`
    #[serde(default)]
    pub rename_on_replace: bool,
}

/// Gallery configuration, as read from a JSON file
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub collections: Vec<CollectionConfig>,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    /// Maximum number of photos held by each collection's album cache
    #[serde(default = "default_album_cache_size")]
    pub album_cache_size: u64,
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .await
            .map_err(|e| anyhow!("unable to read {}: {}", path.display(), e))?;

        Ok(serde_json::from_slice(&content)?)
    }
}

/// A top-level namespace of albums, with its own catalog, writer, and album cache
#[derive(Debug)]
pub struct Collection {
    pub name: String,
    pub index: usize,
    pub photo_dir: PathBuf,
    pub thumb_root: PathBuf,
    pub hidden: bool,
    pub read_only: bool,
    pub rename_on_replace: bool,
    pub store: Arc<Store>,
    pub writer: Writer,
    pub albums: AlbumCache,
}

impl Collection {
    /// Open the catalog for `config` and start its writer.
    ///
    /// The collection is unusable if its catalog cannot be opened, so that failure is returned as-is.
    pub async fn open(
        index: usize,
        config: &CollectionConfig,
        writer: WriterConfig,
        album_cache_size: u64,
    ) -> Result<Self> {
        fs::create_dir_all(&config.thumbs).await?;

        let store = Arc::new(
            Store::open(&config.thumbs.join(format!("{}-cache.db", config.name))).await?,
        );

        info!(
            "opened collection {} (photos in {}, thumbnails in {})",
            config.name,
            config.photos.display(),
            config.thumbs.display()
        );

        Ok(Self {
            name: config.name.clone(),
            index,
            photo_dir: config.photos.clone(),
            thumb_root: config.thumbs.clone(),
            hidden: config.hidden,
            read_only: config.read_only,
            rename_on_replace: config.rename_on_replace,
            writer: Writer::spawn(store.clone(), writer),
            store,
            albums: AlbumCache::new(album_cache_size),
        })
    }

    pub fn album_dir(&self, album: &str) -> PathBuf {
        self.photo_dir.join(album)
    }

    pub fn file_path(&self, file: &File) -> PathBuf {
        file.path.split('/').fold(self.photo_dir.clone(), |path, part| path.join(part))
    }

    pub fn thumbnail_path(&self, album: &str, id: &str) -> PathBuf {
        thumbs::thumbnail_path(&self.thumb_root, &self.name, album, id)
    }

    pub fn pseudo_path(&self, name: &str) -> PathBuf {
        pseudo::path(&self.photo_dir, name)
    }

    pub fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.name.clone(),
            index: self.index,
            read_only: self.read_only,
        }
    }

    pub fn check_writable(&self) -> Result<(), GalleryError> {
        if self.read_only {
            Err(GalleryError::ReadOnly(self.name.clone()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, tempfile::TempDir};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn config_and_layout() -> Result<()> {
        let dir = TempDir::new()?;
        let config_file = dir.path().join("gallery.json");

        fs::write(
            &config_file,
            serde_json::json!({
                "collections": [
                    {
                        "name": "Family",
                        "photos": dir.path().join("photos"),
                        "thumbs": dir.path().join("thumbs"),
                        "read_only": true
                    }
                ],
                "writer": { "batch_size": 10 }
            })
            .to_string(),
        )
        .await?;

        let config = Config::load(&config_file).await?;

        assert_eq!(10, config.writer.batch_size);
        assert_eq!(1000, config.writer.max_delay_ms);
        assert_eq!(DEFAULT_ALBUM_CACHE_SIZE, config.album_cache_size);
        assert!(!config.collections[0].hidden);

        let collection = Collection::open(0, &config.collections[0], config.writer, 10).await?;

        assert!(dir.path().join("thumbs").join("Family-cache.db").is_file());
        assert_eq!(
            dir.path().join("photos").join("Trip").join("IMG_1.JPG"),
            collection.file_path(&File {
                path: "Trip/IMG_1.JPG".into(),
                ..File::default()
            })
        );
        assert_eq!(
            Some(&GalleryError::ReadOnly("Family".into())),
            collection.check_writable().err().as_ref()
        );

        Ok(())
    }
}
