//! Persistent per-collection catalog of [Photo] records.
//!
//! Each photo is stored as a JSON document alongside the columns used as secondary indexes (album, sub-album,
//! capture date, thumbnail flag, and file sizes).  The connection sits behind a mutex, so every transaction on
//! a given catalog is serialized no matter how many reconciliation and worker tasks share it.

use {
    anyhow::{anyhow, Result},
    chrono::{DateTime, SecondsFormat, Utc},
    futures::TryStreamExt,
    gallery_shared::{AlbumSummary, Photo},
    sqlx::{
        query::Query,
        sqlite::{SqliteArguments, SqliteConnectOptions, SqliteRow},
        ConnectOptions, Connection, Row, Sqlite, SqliteConnection,
    },
    std::{
        collections::BTreeMap,
        convert::TryFrom,
        ops::{ControlFlow, DerefMut},
        path::{Path, PathBuf},
        str::FromStr,
    },
    tokio::sync::Mutex as AsyncMutex,
    tracing::{info, warn},
};

/// A single catalog mutation, as buffered by [crate::writer::Writer]
#[derive(Debug, Clone)]
pub enum Op {
    Upsert(Box<Photo>),
    Delete { album: String, id: String },
    /// Set the thumbnail flag of an existing record, leaving it absent if it has since been deleted
    MarkThumb { album: String, id: String, has_thumb: bool },
}

pub struct Store {
    conn: AsyncMutex<SqliteConnection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Store({:?})", self.path)
    }
}

fn datetime(date: Option<DateTime<Utc>>) -> Option<String> {
    date.map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn decode(row: &SqliteRow) -> Result<Photo> {
    Ok(serde_json::from_str(row.try_get::<&str, _>("data")?)?)
}

async fn write_photo(conn: &mut SqliteConnection, photo: &Photo) -> Result<()> {
    sqlx::query(
        "INSERT INTO photos (album, id, sub_album, datetime, has_thumb, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT (album, id) DO UPDATE SET \
         sub_album = excluded.sub_album, \
         datetime = excluded.datetime, \
         has_thumb = excluded.has_thumb, \
         data = excluded.data",
    )
    .bind(&photo.album)
    .bind(&photo.id)
    .bind(&photo.sub_album)
    .bind(datetime(photo.date))
    .bind(photo.has_thumb)
    .bind(serde_json::to_string(photo)?)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM sizes WHERE album = ?1 AND id = ?2")
        .bind(&photo.album)
        .bind(&photo.id)
        .execute(&mut *conn)
        .await?;

    for &size in &photo.sizes {
        sqlx::query("INSERT INTO sizes (album, id, size) VALUES (?1, ?2, ?3)")
            .bind(&photo.album)
            .bind(&photo.id)
            .bind(i64::try_from(size)?)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

async fn remove_photo(conn: &mut SqliteConnection, album: &str, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM sizes WHERE album = ?1 AND id = ?2")
        .bind(album)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM photos WHERE album = ?1 AND id = ?2")
        .bind(album)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn read_photo(conn: &mut SqliteConnection, album: &str, id: &str) -> Result<Option<Photo>> {
    sqlx::query("SELECT data FROM photos WHERE album = ?1 AND id = ?2")
        .bind(album)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .map(|row| decode(&row))
        .transpose()
}

impl Store {
    /// Open (creating if necessary) the catalog at `path`.
    ///
    /// Failure here is fatal for the owning collection.
    pub async fn open(path: &Path) -> Result<Self> {
        let conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await
            .map_err(|e| anyhow!("unable to open catalog {}: {}", path.display(), e))?;

        Self::init(conn, Some(path.to_owned())).await
    }

    /// Open a throwaway in-memory catalog.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnectOptions::from_str("sqlite::memory:")?
            .connect()
            .await?;

        Self::init(conn, None).await
    }

    async fn init(mut conn: SqliteConnection, path: Option<PathBuf>) -> Result<Self> {
        for statement in schema::DDL_STATEMENTS {
            sqlx::query(statement).execute(&mut conn).await?;
        }

        let name = path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".into());

        match sqlx::query("SELECT value FROM meta WHERE key = 'version'")
            .fetch_optional(&mut conn)
            .await?
        {
            Some(row) => {
                let version = row.try_get::<&str, _>(0)?.parse::<u32>()?;

                if version < schema::SCHEMA_VERSION {
                    warn!(
                        "catalog {} has schema version {}, older than expected version {}; \
                         records written by older versions may be incomplete",
                        name,
                        version,
                        schema::SCHEMA_VERSION
                    );
                } else if version > schema::SCHEMA_VERSION {
                    warn!(
                        "catalog {} has schema version {}, newer than expected version {}",
                        name,
                        version,
                        schema::SCHEMA_VERSION
                    );
                }
            }
            None => {
                info!("initializing catalog {} at version {}", name, schema::SCHEMA_VERSION);

                sqlx::query("INSERT INTO meta (key, value) VALUES ('version', ?1)")
                    .bind(schema::SCHEMA_VERSION.to_string())
                    .execute(&mut conn)
                    .await?;
            }
        }

        Ok(Self {
            conn: AsyncMutex::new(conn),
            path,
        })
    }

    pub async fn version(&self) -> Result<Option<u32>> {
        sqlx::query("SELECT value FROM meta WHERE key = 'version'")
            .fetch_optional(self.conn.lock().await.deref_mut())
            .await?
            .map(|row| -> Result<u32> { Ok(row.try_get::<&str, _>(0)?.parse()?) })
            .transpose()
    }

    pub async fn upsert(&self, photo: &Photo) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await?;

        write_photo(&mut tx, photo).await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn delete(&self, album: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await?;

        remove_photo(&mut tx, album, id).await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn get(&self, album: &str, id: &str) -> Result<Option<Photo>> {
        read_photo(self.conn.lock().await.deref_mut(), album, id).await
    }

    /// Apply a batch of mutations in a single transaction.
    pub async fn apply(&self, ops: &[Op]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.begin().await?;

        for op in ops {
            match op {
                Op::Upsert(photo) => write_photo(&mut tx, photo).await?,

                Op::Delete { album, id } => remove_photo(&mut tx, album, id).await?,

                Op::MarkThumb {
                    album,
                    id,
                    has_thumb,
                } => match read_photo(&mut tx, album, id).await {
                    Ok(Some(mut photo)) => {
                        photo.has_thumb = *has_thumb;
                        write_photo(&mut tx, &photo).await?
                    }
                    Ok(None) => (),
                    Err(e) => warn!("skipping unreadable record {}/{}: {:?}", album, id, e),
                },
            }
        }

        tx.commit().await?;

        Ok(())
    }

    /// Stream every record matched by `query` to `f` until `f` breaks.
    ///
    /// Records which fail to decode are logged and skipped.  `f` runs while the catalog is locked, so it must
    /// not call back into this store.
    async fn each<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
        mut f: impl FnMut(Photo) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let mut rows = query.fetch(conn.deref_mut());

        while let Some(row) = rows.try_next().await? {
            match decode(&row) {
                Ok(photo) => {
                    if f(photo).is_break() {
                        break;
                    }
                }
                Err(e) => warn!("skipping unreadable catalog record: {:?}", e),
            }
        }

        Ok(())
    }

    pub async fn for_each_in_album(
        &self,
        album: &str,
        f: impl FnMut(Photo) -> ControlFlow<()>,
    ) -> Result<()> {
        self.each(
            sqlx::query("SELECT data FROM photos WHERE album = ?1 ORDER BY id").bind(album),
            f,
        )
        .await
    }

    pub async fn for_each_in_sub_album(
        &self,
        album: &str,
        sub_album: &str,
        f: impl FnMut(Photo) -> ControlFlow<()>,
    ) -> Result<()> {
        self.each(
            sqlx::query("SELECT data FROM photos WHERE album = ?1 AND sub_album = ?2 ORDER BY id")
                .bind(album)
                .bind(sub_album),
            f,
        )
        .await
    }

    /// Visit photos captured in `[from, to)`, oldest first.
    pub async fn for_each_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        f: impl FnMut(Photo) -> ControlFlow<()>,
    ) -> Result<()> {
        self.each(
            sqlx::query(
                "SELECT data FROM photos WHERE datetime >= ?1 AND datetime < ?2 ORDER BY datetime, album, id",
            )
            .bind(datetime(Some(from)))
            .bind(datetime(Some(to))),
            f,
        )
        .await
    }

    /// Visit every photo satisfying `predicate`, in no particular order.
    pub async fn for_each(
        &self,
        predicate: impl Fn(&Photo) -> bool,
        mut f: impl FnMut(Photo) -> ControlFlow<()>,
    ) -> Result<()> {
        self.each(sqlx::query("SELECT data FROM photos"), |photo| {
            if predicate(&photo) {
                f(photo)
            } else {
                ControlFlow::Continue(())
            }
        })
        .await
    }

    /// Collect every photo without a generated thumbnail, grouped by album.
    pub async fn find_missing_thumbnails(&self) -> Result<BTreeMap<String, Vec<Photo>>> {
        let mut result = BTreeMap::<_, Vec<_>>::new();

        self.each(
            sqlx::query("SELECT data FROM photos WHERE has_thumb = 0 ORDER BY album, id"),
            |photo| {
                result.entry(photo.album.clone()).or_default().push(photo);
                ControlFlow::Continue(())
            },
        )
        .await?;

        Ok(result)
    }

    /// Find photos having at least one file of exactly `size` bytes.
    pub async fn find_by_size(&self, size: u64) -> Result<Vec<Photo>> {
        let mut result = Vec::new();

        self.each(
            sqlx::query(
                "SELECT p.data FROM photos p \
                 WHERE EXISTS (SELECT 1 FROM sizes s WHERE s.album = p.album AND s.id = p.id AND s.size = ?1) \
                 ORDER BY p.album, p.id",
            )
            .bind(i64::try_from(size)?),
            |photo| {
                result.push(photo);
                ControlFlow::Continue(())
            },
        )
        .await?;

        Ok(result)
    }

    pub async fn album_summary(&self, name: &str) -> Result<Option<AlbumSummary>> {
        sqlx::query("SELECT name, count, sub_albums, needs_thumbs FROM albums WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.conn.lock().await.deref_mut())
            .await?
            .map(|row| -> Result<AlbumSummary> {
                Ok(AlbumSummary {
                    name: row.try_get("name")?,
                    count: usize::try_from(row.try_get::<i64, _>("count")?)?,
                    sub_albums: serde_json::from_str(row.try_get::<&str, _>("sub_albums")?)?,
                    needs_thumbs: row.try_get("needs_thumbs")?,
                })
            })
            .transpose()
    }

    pub async fn album_names(&self) -> Result<Vec<String>> {
        Ok(sqlx::query("SELECT name FROM albums ORDER BY name")
            .fetch_all(self.conn.lock().await.deref_mut())
            .await?
            .iter()
            .map(|row| row.try_get("name"))
            .collect::<Result<_, _>>()?)
    }

    /// Record the result of a full reconciliation, marking the album as durably cached.
    pub async fn put_album_summary(&self, summary: &AlbumSummary) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO albums (name, count, sub_albums, needs_thumbs) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&summary.name)
        .bind(i64::try_from(summary.count)?)
        .bind(serde_json::to_string(&summary.sub_albums)?)
        .bind(summary.needs_thumbs)
        .execute(self.conn.lock().await.deref_mut())
        .await?;

        Ok(())
    }

    /// Drop the summary for `name`, so the next read reconciles it from scratch.
    pub async fn forget_album(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM albums WHERE name = ?1")
            .bind(name)
            .execute(self.conn.lock().await.deref_mut())
            .await?;

        Ok(())
    }
}
