//! Thumbnail path scheme.
//!
//! Thumbnail locations are never stored; they are recomputed from (collection, album, photo id) and checked with
//! a `stat`.  Two 32-bit xxHash values pick two nested two-character base-36 shard directories (at most
//! 1296 x 1296 leaves) and a six-character base-36 file name under `<thumb root>/<collection>-thumbs/`.

use {
    crate::store::Store,
    anyhow::Result,
    sha2::{Digest, Sha256},
    std::{
        io::ErrorKind,
        ops::ControlFlow,
        path::{Path, PathBuf},
    },
    tokio::fs,
    tracing::{info, warn},
    xxhash_rust::xxh32::xxh32,
};

pub const THUMBNAIL_EXTENSION: &str = "jpg";

const ID_SEED: u32 = 0x7068_6f74;

const SHARDS: u32 = 36 * 36;

const NAMES: u64 = 36 * 36 * 36 * 36 * 36 * 36;

/// Render `value` as exactly `width` base-36 digits (most significant first).
fn base36(mut value: u64, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    let mut buffer = vec![b'0'; width];

    for slot in buffer.iter_mut().rev() {
        *slot = DIGITS[(value % 36) as usize];
        value /= 36;
    }

    String::from_utf8_lossy(&buffer).into_owned()
}

/// Directory holding every thumbnail of `collection`
pub fn thumbs_dir(thumb_root: &Path, collection: &str) -> PathBuf {
    thumb_root.join(format!("{}-thumbs", collection))
}

/// Deterministic thumbnail location for a photo.
pub fn thumbnail_path(thumb_root: &Path, collection: &str, album: &str, id: &str) -> PathBuf {
    let photo_hash = xxh32(id.as_bytes(), ID_SEED);
    let album_hash = xxh32(album.as_bytes(), photo_hash.rotate_left(16) ^ ID_SEED);

    let name = ((u64::from(photo_hash) << 32) | u64::from(album_hash)) % NAMES;

    let mut path = thumbs_dir(thumb_root, collection);
    path.push(base36(u64::from(photo_hash % SHARDS), 2));
    path.push(base36(u64::from(album_hash % SHARDS), 2));
    path.push(format!("{}.{}", base36(name, 6), THUMBNAIL_EXTENSION));
    path
}

/// Location used by the old content-hash scheme.  Only [migrate] should need this.
pub fn legacy_thumbnail_path(thumb_root: &Path, collection: &str, album: &str, id: &str) -> PathBuf {
    let digest = hex::encode(Sha256::digest(format!("{}/{}", album, id).as_bytes()));

    let mut path = thumbs_dir(thumb_root, collection);
    path.push(&digest[0..2]);
    path.push(format!("{}.{}", digest, THUMBNAIL_EXTENSION));
    path
}

pub async fn exists(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

/// Delete a thumbnail, if there is one.
pub async fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Move a thumbnail to a new location, creating shard directories as needed.
pub async fn relocate(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }

    fs::rename(from, to).await?;

    Ok(())
}

/// One-time migration of every thumbnail in `collection` from the legacy layout to the current one.
///
/// Returns the number of thumbnails moved.
pub async fn migrate(thumb_root: &Path, collection: &str, store: &Store) -> Result<usize> {
    let mut keys = Vec::new();

    store
        .for_each(
            |_| true,
            |photo| {
                keys.push((photo.album, photo.id));
                ControlFlow::Continue(())
            },
        )
        .await?;

    let mut moved = 0;

    for (album, id) in keys {
        let legacy = legacy_thumbnail_path(thumb_root, collection, &album, &id);

        if !exists(&legacy).await {
            continue;
        }

        let current = thumbnail_path(thumb_root, collection, &album, &id);

        if exists(&current).await {
            let _ = fs::remove_file(&legacy).await;
        } else if let Err(e) = relocate(&legacy, &current).await {
            warn!("unable to migrate thumbnail for {}/{}: {:?}", album, id, e);
        } else {
            moved += 1;
        }
    }

    info!("migrated {} thumbnails for collection {}", moved, collection);

    Ok(moved)
}
