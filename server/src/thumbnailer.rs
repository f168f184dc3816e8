//! Thumbnail generation.
//!
//! Every thumbnail is rendered on the shared thumbnail [Pool], whether it was requested interactively or queued
//! by a background pass.  Interactive requests get the encoded bytes streamed back as soon as they exist, without
//! waiting for them to be read back from disk.

use {
    crate::{
        collection::Collection,
        media::{self, MediaProber},
        pool::{CompletionGuard, Pool},
        thumbs,
    },
    anyhow::{anyhow, Result},
    bytes::Bytes,
    futures::{
        channel::mpsc,
        stream::{BoxStream, StreamExt},
        SinkExt,
    },
    gallery_shared::Photo,
    std::{io::Write, path::Path, sync::Arc},
    tempfile::NamedTempFile,
    tokio::{
        fs::{self, File as AsyncFile},
        task,
    },
    tracing::debug,
};

#[derive(Clone)]
pub struct Thumbnailer {
    pool: Pool,
    prober: Arc<dyn MediaProber>,
}

/// Write `data` to `path` so that readers never observe a partial file.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("thumbnail path has no parent: {}", path.display()))?;

    fs::create_dir_all(dir).await?;

    task::block_in_place(|| -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;

        tmp.write_all(data)?;
        tmp.persist(path)?;

        Ok(())
    })
}

async fn generate(prober: &dyn MediaProber, collection: &Collection, photo: &Photo) -> Result<Bytes> {
    let file = photo
        .representative()
        .ok_or_else(|| anyhow!("no image or video file for {}/{}", photo.album, photo.id))?;

    let image = prober.decode(&collection.file_path(file)).await?;

    let data = Bytes::from(task::block_in_place(|| media::encode_thumbnail(&image))?);

    write_atomic(&collection.thumbnail_path(&photo.album, &photo.id), &data).await?;

    collection.writer.mark_thumb(&photo.album, &photo.id, true).await?;

    debug!("generated thumbnail for {}/{}/{}", collection.name, photo.album, photo.id);

    Ok(data)
}

impl Thumbnailer {
    pub fn new(pool: Pool, prober: Arc<dyn MediaProber>) -> Self {
        Self { pool, prober }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Queue generation of `photo`'s thumbnail.
    ///
    /// Blocks while the pool's queue is full.  `guard` (if any) is released when the task finishes, and `tee`
    /// (if any) receives the encoded bytes or the error.
    pub async fn enqueue(
        &self,
        collection: Arc<Collection>,
        photo: Photo,
        guard: Option<CompletionGuard>,
        tee: Option<mpsc::Sender<Result<Bytes>>>,
    ) -> Result<()> {
        let prober = self.prober.clone();

        self.pool
            .enqueue(async move {
                let _guard = guard;

                let result = generate(prober.as_ref(), &collection, &photo).await;

                match tee {
                    Some(mut tee) => {
                        let (result, message) = match result {
                            Ok(data) => (Ok(()), Ok(data)),
                            Err(e) => {
                                let message = anyhow!("{:?}", e);
                                (Err(e), Err(message))
                            }
                        };

                        // The requester may have gone away, which is fine.
                        let _ = tee.send(message).await;

                        result
                    }
                    None => result.map(drop),
                }
            })
            .await
    }

    /// Stream the thumbnail for `photo`, generating it first if it does not exist.
    pub async fn thumbnail(
        &self,
        collection: &Arc<Collection>,
        photo: &Photo,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let path = collection.thumbnail_path(&photo.album, &photo.id);

        if thumbs::exists(&path).await {
            return Ok(media::as_stream(AsyncFile::open(&path).await?).boxed());
        }

        let (tx, rx) = mpsc::channel(1);

        self.enqueue(collection.clone(), photo.clone(), None, Some(tx))
            .await?;

        Ok(rx.boxed())
    }
}
