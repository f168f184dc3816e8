//! Album reconciliation.
//!
//! Reconciling an album walks its directory, groups files into photos by path-derived id, diffs the result
//! against the catalog, probes whatever the catalog doesn't already know, and writes the merged result back.

use {
    crate::{error::GalleryError, lock_map::AlbumKey, pool::Completion, thumbs, Gallery},
    anyhow::{anyhow, Result},
    futures::future::{BoxFuture, FutureExt},
    gallery_shared::{photo_id, split_extension, Album, AlbumSummary, File, MediaKind, Photo},
    std::{
        collections::{BTreeMap, HashMap, HashSet},
        ops::ControlFlow,
        path::{Path, PathBuf},
        sync::Arc,
        time::Instant,
    },
    tokio::{fs, sync::Mutex as AsyncMutex, task},
    tracing::{debug, info, warn},
};

/// Options for [Gallery::reconcile]
#[derive(Debug, Clone, Default)]
pub struct Reconcile {
    /// Return immediately (with an empty result) if the album has been fully reconciled before
    pub skip_if_cached: bool,

    /// Probe every photo again, even those the catalog already knows
    pub force_refresh: bool,

    /// Only resolve these photo ids.  The album summary is left untouched.
    pub only: Option<HashSet<String>>,
}

impl Reconcile {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn skip_if_cached() -> Self {
        Self {
            skip_if_cached: true,
            ..Self::default()
        }
    }

    pub fn only(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            only: Some(ids.into_iter().collect()),
            ..Self::default()
        }
    }
}

/// A regular file found under an album directory
#[derive(Debug)]
struct Found {
    /// Path relative to the album directory, using `/`
    relative: String,
    size: u64,
}

fn find_files<'a>(
    root: &'a Path,
    dir: PathBuf,
    result: &'a mut Vec<Found>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let mut entries = fs::read_dir(&dir).await?;

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("error listing {}: {:?}", dir.display(), e);
                    break;
                }
            };

            let name = match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => name.to_owned(),
                Some(_) => continue,
                None => {
                    warn!("skipping non-UTF-8 name in {}", dir.display());
                    continue;
                }
            };

            let path = entry.path();

            // Files may vanish between listing and stat; that's fine.
            let metadata = match fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("skipping {}: {:?}", path.display(), e);
                    continue;
                }
            };

            if metadata.is_dir() {
                // Following links to directories could walk the same tree forever.
                if fs::symlink_metadata(&path)
                    .await
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(true)
                {
                    debug!("skipping linked directory {}", path.display());
                    continue;
                }

                if let Err(e) = find_files(root, path.clone(), result).await {
                    warn!("skipping directory {}: {:?}", path.display(), e);
                }
            } else if metadata.is_file() {
                let relative = path
                    .strip_prefix(root)?
                    .iter()
                    .map(|part| part.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                debug!("found {} ({})", relative, name);

                result.push(Found {
                    relative,
                    size: metadata.len(),
                });
            }
        }

        Ok(())
    }
    .boxed()
}

/// Group scanned files into (unprobed) photos.
fn group(
    collection: &str,
    album: &str,
    found: Vec<Found>,
    only: Option<&HashSet<String>>,
) -> (HashSet<String>, BTreeMap<String, Photo>) {
    let mut present = HashSet::new();
    let mut photos = BTreeMap::<String, Photo>::new();

    for Found { relative, size } in found {
        let id = photo_id(&relative);

        present.insert(id.clone());

        if only.map(|only| !only.contains(&id)).unwrap_or(false) {
            continue;
        }

        let (sub_album, name) = match relative.rfind('/') {
            Some(slash) => (&relative[..slash], &relative[slash + 1..]),
            None => ("", relative.as_str()),
        };

        let (kind, mime) = MediaKind::from_path(name);

        let photo = photos.entry(id.clone()).or_insert_with(|| Photo {
            id,
            title: split_extension(name).0.to_owned(),
            collection: collection.to_owned(),
            album: album.to_owned(),
            sub_album: sub_album.to_owned(),
            ..Photo::default()
        });

        photo.files.push(File {
            kind,
            mime: mime.into(),
            path: format!("{}/{}", album, relative),
            size,
            ..File::default()
        });
    }

    for photo in photos.values_mut() {
        photo.files.sort_by(|a, b| a.path.cmp(&b.path));
    }

    (present, photos)
}

/// True if `cached` was built from exactly the files in `scanned`.
fn same_files(cached: &Photo, scanned: &Photo) -> bool {
    cached.files.len() == scanned.files.len()
        && cached
            .files
            .iter()
            .zip(&scanned.files)
            .all(|(a, b)| a.path == b.path && a.size == b.size)
}

impl Gallery {
    /// Synchronize the catalog entries for `album` with the filesystem, returning the resolved photos by id.
    ///
    /// At most one reconciliation per album runs at a time.  Photos with unrecognized file types are included
    /// in the result but never written to the catalog.
    pub async fn reconcile(
        &self,
        collection: &str,
        album: &str,
        options: &Reconcile,
    ) -> Result<BTreeMap<String, Photo>> {
        let collection = self.collection(collection)?.clone();

        let _guard = self.locks.lock(&AlbumKey::new(&collection.name, album)).await;

        if options.skip_if_cached
            && !options.force_refresh
            && collection.store.album_summary(album).await?.is_some()
        {
            return Ok(BTreeMap::new());
        }

        let then = Instant::now();

        let dir = collection.album_dir(album);

        if !fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(GalleryError::AlbumNotFound(album.into()).into());
        }

        let mut found = Vec::new();

        find_files(&dir, dir.clone(), &mut found).await?;

        let scanned = found.len();

        let (present, photos) = group(&collection.name, album, found, options.only.as_ref());

        let mut stale = Vec::new();
        let mut cached = HashMap::new();

        collection
            .store
            .for_each_in_album(album, |photo| {
                if !present.contains(&photo.id) {
                    stale.push(photo.id);
                } else if photos.contains_key(&photo.id) {
                    cached.insert(photo.id.clone(), photo);
                }

                ControlFlow::Continue(())
            })
            .await?;

        for id in &stale {
            collection.writer.delete(album, id).await?;

            // Otherwise a later photo with the same id would be shown this one's thumbnail.
            if let Err(e) = thumbs::remove(&collection.thumbnail_path(album, id)).await {
                warn!("unable to remove thumbnail for {}/{}: {:?}", album, id, e);
            }
        }

        let mut result = BTreeMap::new();
        let mut pending = Vec::new();

        for (id, mut photo) in photos {
            match cached.remove(&id) {
                Some(mut cached) if !options.force_refresh && same_files(&cached, &photo) => {
                    if !cached.has_thumb && thumbs::exists(&collection.thumbnail_path(album, &id)).await {
                        collection.writer.mark_thumb(album, &id, true).await?;
                        cached.has_thumb = true;
                    }

                    result.insert(id, cached);
                }
                Some(cached) => {
                    photo.favorited_in = cached.favorited_in;
                    pending.push(photo);
                }
                None => pending.push(photo),
            }
        }

        let extracted = pending.len();

        let outer = Completion::new();
        let resolved = Arc::new(AsyncMutex::new(Vec::with_capacity(pending.len())));

        for photo in pending {
            let files = Completion::new();
            let paths = photo
                .files
                .iter()
                .map(|file| (file.kind, collection.file_path(file)))
                .collect::<Vec<_>>();
            let photo = Arc::new(AsyncMutex::new(photo));

            for (index, (kind, path)) in paths.into_iter().enumerate() {
                if !kind.is_recognized() {
                    continue;
                }

                let guard = files.guard();
                let prober = self.prober.clone();
                let photo = photo.clone();

                self.extract
                    .enqueue(async move {
                        let _guard = guard;

                        let probe = prober
                            .probe(&path)
                            .await
                            .map_err(|e| anyhow!("unable to probe {}: {:?}", path.display(), e))?;

                        let mut photo = photo.lock().await;
                        let file = &mut photo.files[index];

                        file.kind = probe.kind;
                        file.mime = probe.mime;
                        file.width = probe.width;
                        file.height = probe.height;
                        file.date = probe.date;
                        file.location = probe.location;

                        Ok(())
                    })
                    .await?;
            }

            let guard = outer.guard();
            let collection = collection.clone();
            let resolved = resolved.clone();

            // Photo-level fields depend on every file, so wait for all of them.
            task::spawn(async move {
                let _guard = guard;

                files.wait().await;

                let mut photo = photo.lock().await.clone();

                photo.derive();
                photo.has_thumb = thumbs::exists(&collection.thumbnail_path(&photo.album, &photo.id)).await;

                resolved.lock().await.push(photo);
            });
        }

        outer.wait().await;

        let resolved = std::mem::take(&mut *resolved.lock().await);

        for photo in resolved {
            if photo.kind.is_recognized() {
                collection.writer.upsert(photo.clone()).await?;
            } else {
                warn!(
                    "unrecognized media type for {}/{}/{}",
                    collection.name, album, photo.id
                );
            }

            result.insert(photo.id.clone(), photo);
        }

        let needs_thumbs = result
            .values()
            .filter(|photo| photo.kind.is_recognized() && !photo.has_thumb)
            .cloned()
            .collect::<Vec<_>>();

        collection.writer.flush(true).await?;

        if options.only.is_none() {
            let album = Album::new(album, false, result.values().cloned().collect());

            collection
                .store
                .put_album_summary(&AlbumSummary {
                    name: album.name.clone(),
                    count: album.count,
                    sub_albums: album.sub_albums.clone(),
                    needs_thumbs: !needs_thumbs.is_empty(),
                })
                .await?;

            collection.albums.insert(album);
        }

        info!(
            "reconciled {}/{} in {:?}: {} files scanned, {} photos extracted, {} deleted, {} need thumbnails",
            collection.name,
            album,
            then.elapsed(),
            scanned,
            extracted,
            stale.len(),
            needs_thumbs.len()
        );

        if !needs_thumbs.is_empty() {
            let thumbnailer = self.thumbnailer.clone();

            task::spawn(async move {
                for photo in needs_thumbs {
                    if let Err(e) = thumbnailer.enqueue(collection.clone(), photo, None, None).await {
                        warn!("unable to queue thumbnail: {:?}", e);
                        break;
                    }
                }
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn found(relative: &str) -> Found {
        Found {
            relative: relative.into(),
            size: 1,
        }
    }

    #[test]
    fn grouping() {
        let (present, photos) = group(
            "Family",
            "Trip",
            vec![
                found("IMG_1.JPG"),
                found("IMG_1.MOV"),
                found("day2/IMG_2.jpg"),
                found("notes.txt"),
            ],
            None,
        );

        assert_eq!(3, present.len());
        assert_eq!(
            vec!["day2$img_2", "img_1", "notes"],
            photos.keys().map(String::as_str).collect::<Vec<_>>()
        );

        let live = &photos["img_1"];

        assert_eq!("IMG_1", live.title);
        assert_eq!("", live.sub_album);
        assert_eq!(
            vec!["Trip/IMG_1.JPG", "Trip/IMG_1.MOV"],
            live.files.iter().map(|f| f.path.as_str()).collect::<Vec<_>>()
        );

        assert_eq!("day2", photos["day2$img_2"].sub_album);
        assert_eq!(MediaKind::Unrecognized, photos["notes"].files[0].kind);

        let only = ["img_1".to_owned()].into_iter().collect::<HashSet<_>>();
        let (present, photos) = group(
            "Family",
            "Trip",
            vec![found("IMG_1.JPG"), found("b.jpg")],
            Some(&only),
        );

        assert!(present.contains("b"));
        assert_eq!(vec!["img_1"], photos.keys().map(String::as_str).collect::<Vec<_>>());
    }
}
