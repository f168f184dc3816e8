//! Moving and deleting photos, and maintaining the pseudo-album references that point at them.
//!
//! Real album locks are always taken before pseudo-album locks, and several albums are always locked through
//! [LockMap::lock_all](crate::lock_map::LockMap::lock_all), so overlapping operations cannot deadlock.

use {
    crate::{
        collection::Collection,
        error::{check_name, GalleryError},
        lock_map::AlbumKey,
        is_dir, pseudo, thumbs, Gallery,
    },
    anyhow::{anyhow, Result},
    gallery_shared::{
        photo_id, split_extension, ConflictMode, File, MoveSummary, Photo, PseudoEntry, PseudoRef,
    },
    lazy_static::lazy_static,
    regex::Regex,
    std::{
        collections::HashSet,
        io::ErrorKind,
        ops::ControlFlow,
        path::{Path, PathBuf},
        sync::Arc,
    },
    tokio::fs,
    tracing::{info, warn},
};

/// Where one photo will end up
#[derive(Debug)]
struct Plan {
    source: Photo,
    /// New file names, parallel to `source.files`
    names: Vec<String>,
    id: String,
    title: String,
    renamed: bool,
    /// Existing destination photo to remove first (`replace` mode only)
    replaces: Option<Photo>,
}

/// Strip a trailing " (n)" added by an earlier rename.
fn base_stem(stem: &str) -> &str {
    lazy_static! {
        static ref SUFFIX_PATTERN: Regex = Regex::new(r"^(.*) \((\d+)\)$").unwrap();
    };

    SUFFIX_PATTERN
        .captures(stem)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(stem)
}

fn with_suffix(name: &str, n: Option<u32>) -> String {
    let (stem, extension) = split_extension(name);

    match n {
        Some(n) => format!("{} ({}){}", base_stem(stem), n, extension),
        None => name.to_owned(),
    }
}

/// Move a file, falling back to copy-and-remove across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).await.is_err() {
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }

    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Remove a photo's files, catalog entry, and thumbnail.
async fn remove_photo(collection: &Collection, photo: &Photo) -> Result<()> {
    for file in &photo.files {
        remove_if_present(&collection.file_path(file)).await?;
    }

    collection.writer.delete(&photo.album, &photo.id).await?;

    if let Err(e) = thumbs::remove(&collection.thumbnail_path(&photo.album, &photo.id)).await {
        warn!("unable to remove thumbnail for {}/{}: {:?}", photo.album, photo.id, e);
    }

    Ok(())
}

impl Gallery {
    fn pseudo_key(&self, reference: &PseudoRef) -> AlbumKey {
        AlbumKey::pseudo(&reference.collection, &reference.album)
    }

    fn pseudo_file(&self, reference: &PseudoRef) -> Result<PathBuf> {
        Ok(self.collection(&reference.collection)?.pseudo_path(&reference.album))
    }

    /// Rewrite (or, with `to` = `None`, drop) every reference to `from` in the given pseudo-albums.
    async fn rewrite_references(
        &self,
        references: &[PseudoRef],
        from: &PseudoEntry,
        to: Option<&PseudoEntry>,
    ) -> Result<()> {
        let keys = references.iter().map(|r| self.pseudo_key(r)).collect::<Vec<_>>();
        let _guards = self.locks.lock_all(&keys).await;

        for reference in references {
            let path = self.pseudo_file(reference)?;

            pseudo::rewrite(&path, |entry| {
                if entry == from {
                    to.cloned()
                } else {
                    Some(entry.clone())
                }
            })
            .await?;
        }

        Ok(())
    }

    async fn load_photos(&self, collection: &Collection, album: &str, ids: &[String]) -> Result<Vec<Photo>> {
        let mut photos = Vec::with_capacity(ids.len());

        for id in ids {
            photos.push(
                collection
                    .store
                    .get(album, id)
                    .await?
                    .ok_or_else(|| GalleryError::photo_not_found(album, id))?,
            );
        }

        Ok(photos)
    }

    async fn invalidate(&self, collection: &Collection, album: &str) -> Result<()> {
        collection.albums.invalidate(album);
        collection.store.forget_album(album).await
    }

    /// Move photos from one album to another, possibly across collections.
    ///
    /// Moved photos land in the root of the destination album.  Naming conflicts with existing destination files
    /// or with other photos in the same call are resolved according to `mode`.
    pub async fn move_photos(
        &self,
        mode: ConflictMode,
        src_collection: &str,
        src_album: &str,
        dst_collection: &str,
        dst_album: &str,
        ids: &[String],
    ) -> Result<MoveSummary> {
        let src = self.collection(src_collection)?.clone();
        let dst = self.collection(dst_collection)?.clone();

        src.check_writable()?;
        dst.check_writable()?;

        if src.name == dst.name && src_album == dst_album {
            return Err(GalleryError::Conflict(format!("{} is both source and destination", dst_album)).into());
        }

        if !fs::metadata(dst.album_dir(dst_album)).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(GalleryError::AlbumNotFound(dst_album.into()).into());
        }

        let mode = if mode == ConflictMode::Replace && dst.rename_on_replace {
            ConflictMode::Rename
        } else {
            mode
        };

        let _guards = self
            .locks
            .lock_all(&[AlbumKey::new(&src.name, src_album), AlbumKey::new(&dst.name, dst_album)])
            .await;

        let photos = self.load_photos(&src, src_album, ids).await?;

        let mut existing = Vec::new();

        dst.store
            .for_each_in_album(dst_album, |photo| {
                existing.push(photo);
                ControlFlow::Continue(())
            })
            .await?;

        let existing_ids = existing.iter().map(|p| p.id.clone()).collect::<HashSet<_>>();

        let mut summary = MoveSummary::default();
        let mut plans = Vec::<Plan>::new();
        let mut in_flight = HashSet::<String>::new();
        let mut in_flight_names = HashSet::<String>::new();

        for photo in photos {
            let mut n = None;

            loop {
                let names = photo
                    .files
                    .iter()
                    .map(|file| with_suffix(file.name(), n))
                    .collect::<Vec<_>>();

                let (id, title) = match names.first() {
                    Some(name) => (photo_id(name), split_extension(name).0.to_owned()),
                    None => (photo.id.clone(), photo.title.clone()),
                };

                let mut on_disk = false;

                for name in &names {
                    if fs::metadata(dst.album_dir(dst_album).join(name)).await.is_ok() {
                        on_disk = true;
                    }
                }

                let stored = existing_ids.contains(&id);
                let batched = in_flight.contains(&id)
                    || names.iter().any(|name| in_flight_names.contains(&name.to_lowercase()));

                if !(on_disk || stored || batched) {
                    in_flight.insert(id.clone());
                    in_flight_names.extend(names.iter().map(|name| name.to_lowercase()));

                    plans.push(Plan {
                        title,
                        renamed: n.is_some(),
                        source: photo,
                        names,
                        id,
                        replaces: None,
                    });

                    break;
                }

                match mode {
                    ConflictMode::Cancel => {
                        return Err(GalleryError::Conflict(format!("{}/{}", dst_album, id)).into());
                    }

                    ConflictMode::Skip => {
                        summary.skipped += 1;
                        break;
                    }

                    ConflictMode::Replace if !batched => {
                        in_flight.insert(id.clone());
                        in_flight_names.extend(names.iter().map(|name| name.to_lowercase()));

                        plans.push(Plan {
                            title,
                            renamed: false,
                            replaces: existing.iter().find(|p| p.id == id).cloned(),
                            source: photo,
                            names,
                            id,
                        });

                        break;
                    }

                    // In-batch collisions can't be replaced, so they fall back to renaming.
                    ConflictMode::Rename | ConflictMode::Replace => {
                        n = Some(n.map(|n| n + 1).unwrap_or(2));
                    }
                }
            }
        }

        let result = self.execute(&src, &dst, dst_album, plans, &mut summary).await;

        for (collection, album) in [(&src, src_album), (&dst, dst_album)] {
            collection.writer.flush(true).await?;
            self.invalidate(collection, album).await?;
        }

        result?;

        info!(
            "moved {} photos ({} files, {} renamed, {} skipped) from {}/{} to {}/{}",
            summary.moved,
            summary.files,
            summary.renamed,
            summary.skipped,
            src.name,
            src_album,
            dst.name,
            dst_album
        );

        Ok(summary)
    }

    async fn execute(
        &self,
        src: &Arc<Collection>,
        dst: &Arc<Collection>,
        dst_album: &str,
        plans: Vec<Plan>,
        summary: &mut MoveSummary,
    ) -> Result<()> {
        // References first, so no pseudo-album ever points at a photo which has already moved away.
        for plan in &plans {
            if !plan.source.favorited_in.is_empty() {
                self.rewrite_references(
                    &plan.source.favorited_in,
                    &plan.source.entry(),
                    Some(&PseudoEntry {
                        collection: dst.name.clone(),
                        album: dst_album.to_owned(),
                        id: plan.id.clone(),
                    }),
                )
                .await?;
            }
        }

        for plan in plans {
            if let Some(replaced) = &plan.replaces {
                remove_photo(dst, replaced).await?;

                if !replaced.favorited_in.is_empty() {
                    self.rewrite_references(&replaced.favorited_in, &replaced.entry(), None)
                        .await?;
                }
            }

            let mut files = Vec::with_capacity(plan.names.len());

            for (file, name) in plan.source.files.iter().zip(&plan.names) {
                let moved = File {
                    path: format!("{}/{}", dst_album, name),
                    ..file.clone()
                };

                move_file(&src.file_path(file), &dst.file_path(&moved))
                    .await
                    .map_err(|e| anyhow!("unable to move {} to {}: {:?}", file.path, moved.path, e))?;

                summary.files += 1;
                files.push(moved);
            }

            let old_thumbnail = src.thumbnail_path(&plan.source.album, &plan.source.id);

            let has_thumb = if thumbs::exists(&old_thumbnail).await {
                match thumbs::relocate(&old_thumbnail, &dst.thumbnail_path(dst_album, &plan.id)).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("unable to move thumbnail {}: {:?}", old_thumbnail.display(), e);

                        if let Err(e) = thumbs::remove(&old_thumbnail).await {
                            warn!("unable to remove thumbnail {}: {:?}", old_thumbnail.display(), e);
                        }

                        false
                    }
                }
            } else {
                false
            };

            src.writer.delete(&plan.source.album, &plan.source.id).await?;

            dst.writer
                .upsert(Photo {
                    id: plan.id,
                    title: plan.title,
                    collection: dst.name.clone(),
                    album: dst_album.to_owned(),
                    sub_album: String::new(),
                    files,
                    has_thumb,
                    ..plan.source
                })
                .await?;

            summary.moved += 1;

            if plan.renamed {
                summary.renamed += 1;
            }
        }

        Ok(())
    }

    /// Delete photos along with their files and thumbnails, then drop them from every pseudo-album naming them.
    pub async fn delete_photos(&self, collection: &str, album: &str, ids: &[String]) -> Result<usize> {
        let collection = self.collection(collection)?.clone();

        collection.check_writable()?;

        let photos = {
            let _guard = self.locks.lock(&AlbumKey::new(&collection.name, album)).await;

            let photos = self.load_photos(&collection, album, ids).await?;

            let mut result = Ok(());

            for photo in &photos {
                result = remove_photo(&collection, photo).await;

                if result.is_err() {
                    break;
                }
            }

            collection.writer.flush(true).await?;
            self.invalidate(&collection, album).await?;

            result?;

            photos
        };

        for photo in &photos {
            if !photo.favorited_in.is_empty() {
                self.rewrite_references(&photo.favorited_in, &photo.entry(), None)
                    .await?;
            }
        }

        info!("deleted {} photos from {}/{}", photos.len(), collection.name, album);

        Ok(photos.len())
    }

    /// Add a photo to a pseudo-album.
    pub async fn save_favorite(&self, collection: &str, album: &str, id: &str, target: &PseudoRef) -> Result<()> {
        self.update_favorite(collection, album, id, target, true).await
    }

    /// Remove a photo from a pseudo-album.
    pub async fn remove_favorite(&self, collection: &str, album: &str, id: &str, target: &PseudoRef) -> Result<()> {
        self.update_favorite(collection, album, id, target, false).await
    }

    async fn update_favorite(
        &self,
        collection: &str,
        album: &str,
        id: &str,
        target: &PseudoRef,
        add: bool,
    ) -> Result<()> {
        let collection = self.collection(collection)?.clone();
        let target_collection = self.collection(&target.collection)?;

        target_collection.check_writable()?;
        check_name(&target.album)?;

        // A pseudo-album shadowed by a directory could never be read back.
        if add
            && (is_dir(&target_collection.album_dir(&target.album)).await
                || is_dir(&target_collection.pseudo_path(&target.album)).await)
        {
            return Err(GalleryError::AlbumExists(target.album.clone()).into());
        }

        let _guard = self.locks.lock(&AlbumKey::new(&collection.name, album)).await;

        let mut photo = collection
            .store
            .get(album, id)
            .await?
            .ok_or_else(|| GalleryError::photo_not_found(album, id))?;

        let path = target_collection.pseudo_path(&target.album);

        {
            let _pseudo_guard = self.locks.lock(&self.pseudo_key(target)).await;

            if add {
                if !photo.favorited_in.contains(target) {
                    pseudo::append(&path, &photo.entry()).await?;
                    photo.favorited_in.push(target.clone());
                }
            } else {
                let entry = photo.entry();

                pseudo::rewrite(&path, |e| if *e == entry { None } else { Some(e.clone()) }).await?;
                photo.favorited_in.retain(|r| r != target);
            }
        }

        collection.writer.upsert(photo).await?;
        collection.writer.flush(true).await?;
        collection.albums.invalidate(album);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffixes() {
        assert_eq!("IMG_1.JPG", with_suffix("IMG_1.JPG", None));
        assert_eq!("IMG_1 (2).JPG", with_suffix("IMG_1.JPG", Some(2)));
        assert_eq!("IMG_1 (3).JPG", with_suffix("IMG_1 (2).JPG", Some(3)));
        assert_eq!("notes (2)", with_suffix("notes", Some(2)));
        assert_eq!("a (b) (2).png", with_suffix("a (b).png", Some(2)));
    }
}
