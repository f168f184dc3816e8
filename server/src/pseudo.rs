//! Pseudo-album files.
//!
//! A pseudo-album (e.g. "Favorites") is a line-oriented file named `<album>.pseudo` in a collection's photo
//! directory.  Each line is a `collection:album:id` reference to a photo stored in a real album.  Entries are only
//! ever appended by favoriting; moves and deletes rewrite the file in place.

use {
    anyhow::Result,
    gallery_shared::PseudoEntry,
    std::{
        io::Write,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
    tokio::{
        fs::{self, OpenOptions},
        io::{AsyncWriteExt, ErrorKind},
        task,
    },
    tracing::warn,
};

pub const PSEUDO_EXTENSION: &str = "pseudo";

/// File name (without directory) used for the pseudo-album `name`, which doubles as its lock key.
pub fn file_name(name: &str) -> String {
    format!("{}.{}", name, PSEUDO_EXTENSION)
}

pub fn path(photo_dir: &Path, name: &str) -> PathBuf {
    photo_dir.join(file_name(name))
}

/// Read every well-formed entry of the pseudo-album at `path`.
///
/// A missing file is an empty album.  Malformed lines are logged and skipped.
pub async fn read_entries(path: &Path) -> Result<Vec<PseudoEntry>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match line.parse() {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping line in {}: {:?}", path.display(), e);
                None
            }
        })
        .collect())
}

pub async fn append(path: &Path, entry: &PseudoEntry) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(format!("{}\n", entry).as_bytes()).await?;
    file.flush().await?;

    Ok(())
}

/// Rewrite each entry of the pseudo-album at `path` through `f`, dropping entries for which it returns `None`.
///
/// The file is replaced atomically, and only if something changed.  Returns the number of entries changed or
/// dropped.
pub async fn rewrite(path: &Path, mut f: impl FnMut(&PseudoEntry) -> Option<PseudoEntry>) -> Result<usize> {
    let entries = read_entries(path).await?;

    let mut changed = 0;
    let mut content = String::new();

    for entry in &entries {
        match f(entry) {
            Some(new) => {
                if new != *entry {
                    changed += 1;
                }

                content.push_str(&new.to_string());
                content.push('\n');
            }
            None => changed += 1,
        }
    }

    if changed > 0 {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));

        task::block_in_place(|| -> Result<()> {
            let mut tmp = NamedTempFile::new_in(dir)?;

            tmp.write_all(content.as_bytes())?;
            tmp.persist(path)?;

            Ok(())
        })?;
    }

    Ok(changed)
}

/// Names of every pseudo-album in `photo_dir`, sorted.
pub async fn list(photo_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut dir = fs::read_dir(photo_dir).await?;

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();

        if path.extension().and_then(|e| e.to_str()) == Some(PSEUDO_EXTENSION) && path.is_file() {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_owned());
            }
        }
    }

    names.sort();

    Ok(names)
}

#[cfg(test)]
mod test {
    use {super::*, tempfile::TempDir};

    fn entry(s: &str) -> PseudoEntry {
        s.parse().unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn append_and_rewrite() -> Result<()> {
        let dir = TempDir::new()?;
        let favorites = path(dir.path(), "Favorites");

        assert!(read_entries(&favorites).await?.is_empty());

        append(&favorites, &entry("Family:Trip:a")).await?;
        append(&favorites, &entry("Family:Trip:b")).await?;
        fs::write(
            &favorites,
            format!("{}garbage line\n", fs::read_to_string(&favorites).await?),
        )
        .await?;
        append(&favorites, &entry("Family:Home:c")).await?;

        assert_eq!(
            vec![entry("Family:Trip:a"), entry("Family:Trip:b"), entry("Family:Home:c")],
            read_entries(&favorites).await?
        );

        let changed = rewrite(&favorites, |e| match e.id.as_str() {
            "a" => Some(entry("Family:Home:a")),
            "b" => None,
            _ => Some(e.clone()),
        })
        .await?;

        assert_eq!(2, changed);
        assert_eq!(
            vec![entry("Family:Home:a"), entry("Family:Home:c")],
            read_entries(&favorites).await?
        );

        assert_eq!(0, rewrite(&favorites, |e| Some(e.clone())).await?);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn listing() -> Result<()> {
        let dir = TempDir::new()?;

        fs::create_dir(dir.path().join("Trip")).await?;
        fs::write(path(dir.path(), "Favorites"), "").await?;
        fs::write(path(dir.path(), "Best"), "").await?;
        fs::write(dir.path().join("notes.txt"), "").await?;

        assert_eq!(vec!["Best", "Favorites"], list(dir.path()).await?);

        Ok(())
    }
}
