/// Catalog schema version written by this code.  Catalogs carrying an older version are opened as-is and
/// reported, never migrated in place.
pub const SCHEMA_VERSION: u32 = 3;

pub static DDL_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
       key       TEXT NOT NULL PRIMARY KEY,
       value     TEXT NOT NULL
     )",
    "CREATE TABLE IF NOT EXISTS photos (
       album     TEXT NOT NULL,
       id        TEXT NOT NULL,
       sub_album TEXT NOT NULL,
       datetime  TEXT,
       has_thumb INTEGER NOT NULL,
       data      TEXT NOT NULL,

       PRIMARY KEY (album, id)
     )",
    "CREATE INDEX IF NOT EXISTS photos_sub_album ON photos (album, sub_album)",
    "CREATE INDEX IF NOT EXISTS photos_datetime ON photos (datetime)",
    "CREATE INDEX IF NOT EXISTS photos_has_thumb ON photos (has_thumb)",
    "CREATE TABLE IF NOT EXISTS sizes (
       album     TEXT NOT NULL,
       id        TEXT NOT NULL,
       size      INTEGER NOT NULL,

       FOREIGN KEY (album, id) REFERENCES photos(album, id) ON DELETE CASCADE
     )",
    "CREATE INDEX IF NOT EXISTS sizes_size ON sizes (size)",
    "CREATE INDEX IF NOT EXISTS sizes_photo ON sizes (album, id)",
    "CREATE TABLE IF NOT EXISTS albums (
       name         TEXT NOT NULL PRIMARY KEY,
       count        INTEGER NOT NULL,
       sub_albums   TEXT NOT NULL,
       needs_thumbs INTEGER NOT NULL
     )",
];
