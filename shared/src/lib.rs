//! Gallery shared data model
//!
//! This crate contains the [serde](https://crates.io/crates/serde)-enabled types describing what the gallery
//! catalog knows about photos, the files they are made of, and the albums and collections they live in.  The
//! server persists [Photo] records as JSON, so changes to these types must stay backwards compatible with
//! existing catalogs (new fields need `#[serde(default)]`).

use {
    anyhow::{anyhow, Error},
    chrono::{DateTime, Utc},
    serde_derive::{Deserialize, Serialize},
    std::{
        fmt::{self, Display},
        path::Path,
        str::FromStr,
    },
};

/// Token which replaces path separators when deriving a photo id from a relative path
pub const ID_SEPARATOR: &str = "$";

static IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
];

static VIDEO_EXTENSIONS: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("mov", "video/quicktime"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("3gp", "video/3gpp"),
];

/// Kind of a single physical file, as determined by its extension and confirmed by the media prober
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    #[default]
    Unrecognized,
}

impl MediaKind {
    /// Classify `path` by extension, returning the kind and MIME type.
    pub fn from_path(path: impl AsRef<Path>) -> (MediaKind, &'static str) {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        if let Some(extension) = extension {
            if let Some((_, mime)) = IMAGE_EXTENSIONS.iter().find(|(e, _)| *e == extension) {
                return (MediaKind::Image, mime);
            }

            if let Some((_, mime)) = VIDEO_EXTENSIONS.iter().find(|(e, _)| *e == extension) {
                return (MediaKind::Video, mime);
            }
        }

        (MediaKind::Unrecognized, "application/octet-stream")
    }

    pub fn is_recognized(self) -> bool {
        self != MediaKind::Unrecognized
    }
}

/// Resolved type of a [Photo], derived from the kinds of all its files
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhotoType {
    Image,
    Video,
    /// A still image paired with a motion clip sharing the same title stem
    Live,
    #[default]
    Unrecognized,
}

impl PhotoType {
    pub fn is_recognized(self) -> bool {
        self != PhotoType::Unrecognized
    }

    /// Derive a photo type from the kinds of its constituent files.
    ///
    /// A photo with both an image and a video file is [PhotoType::Live].  Otherwise the most common kind wins,
    /// with ties going to recognized kinds.
    pub fn derive(kinds: impl IntoIterator<Item = MediaKind>) -> PhotoType {
        let (mut images, mut videos, mut other) = (0, 0, 0);

        for kind in kinds {
            match kind {
                MediaKind::Image => images += 1,
                MediaKind::Video => videos += 1,
                MediaKind::Unrecognized => other += 1,
            }
        }

        if images > 0 && videos > 0 {
            PhotoType::Live
        } else if images > 0 && images >= other {
            PhotoType::Image
        } else if videos > 0 && videos >= other {
            PhotoType::Video
        } else {
            PhotoType::Unrecognized
        }
    }
}

/// Geographic position recorded at capture time
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// One physical file on disk, owned by exactly one [Photo]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct File {
    pub kind: MediaKind,

    pub mime: String,

    /// Path relative to the collection's photo directory, using `/` as the separator
    pub path: String,

    #[serde(default)]
    pub date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub location: Option<Location>,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,

    pub size: u64,
}

impl File {
    /// File name component of `path`
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Reference from a photo to a pseudo-album which lists it
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PseudoRef {
    pub collection: String,
    pub album: String,
}

/// Logical media item, possibly composed of several files (e.g. a still plus a motion clip)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Photo {
    /// Lowercase, path-derived id, unique within its album
    pub id: String,

    pub title: String,

    #[serde(rename = "type")]
    pub kind: PhotoType,

    pub collection: String,

    pub album: String,

    /// Directory of the photo's files relative to the album directory, or empty for the album root
    #[serde(default)]
    pub sub_album: String,

    #[serde(default)]
    pub date: Option<DateTime<Utc>>,

    #[serde(default)]
    pub location: Option<Location>,

    #[serde(default)]
    pub width: u32,

    #[serde(default)]
    pub height: u32,

    pub files: Vec<File>,

    /// Pseudo-albums this photo has been added to
    #[serde(default)]
    pub favorited_in: Vec<PseudoRef>,

    #[serde(default)]
    pub has_thumb: bool,

    /// Byte size of each file, used as a cheap duplicate hint
    #[serde(default)]
    pub sizes: Vec<u64>,
}

impl Photo {
    /// Pick the file which best represents this photo: the first image if there is one, otherwise the first
    /// video.
    pub fn representative(&self) -> Option<&File> {
        self.files
            .iter()
            .find(|f| f.kind == MediaKind::Image)
            .or_else(|| self.files.iter().find(|f| f.kind == MediaKind::Video))
    }

    /// Recompute the photo-level fields which are functions of all constituent files.
    ///
    /// This must only be called once every file has been probed.
    pub fn derive(&mut self) {
        self.kind = PhotoType::derive(self.files.iter().map(|f| f.kind));

        let (width, height, date, location) = match self.representative() {
            Some(file) => (file.width, file.height, file.date, file.location),
            None => (0, 0, None, None),
        };

        self.width = width;
        self.height = height;
        self.date = date.or_else(|| self.files.iter().filter_map(|f| f.date).min());
        self.location = location.or_else(|| self.files.iter().find_map(|f| f.location));
        self.sizes = self.files.iter().map(|f| f.size).collect();
    }

    pub fn entry(&self) -> PseudoEntry {
        PseudoEntry {
            collection: self.collection.clone(),
            album: self.album.clone(),
            id: self.id.clone(),
        }
    }
}

/// Derive a photo id from a path relative to its album directory.
///
/// The extension is stripped, the result lowercased, and path separators replaced with [ID_SEPARATOR], so
/// `Summer/IMG_1.JPG` and `Summer/IMG_1.MOV` both map to `summer$img_1`.
pub fn photo_id(relative: &str) -> String {
    let relative = relative.trim_start_matches('/');

    let stem = match relative.rfind('.') {
        Some(dot) if dot > relative.rfind('/').map(|slash| slash + 1).unwrap_or(0) => &relative[..dot],
        _ => relative,
    };

    stem.to_lowercase().replace('/', ID_SEPARATOR)
}

/// Split a relative path into its file stem and extension (including the dot, or empty).
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    }
}

/// One line of a pseudo-album file: a reference to a photo stored in a real album
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PseudoEntry {
    pub collection: String,
    pub album: String,
    pub id: String,
}

impl FromStr for PseudoEntry {
    type Err = Error;

    /// Parse a `PseudoEntry` of the form "collection:album:id".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut split = s.trim().splitn(3, ':');

        match (split.next(), split.next(), split.next()) {
            (Some(collection), Some(album), Some(id))
                if !collection.is_empty() && !album.is_empty() && !id.is_empty() =>
            {
                Ok(PseudoEntry {
                    collection: collection.into(),
                    album: album.into(),
                    id: id.into(),
                })
            }
            _ => Err(anyhow!("malformed pseudo-album entry: {:?}", s)),
        }
    }
}

impl Display for PseudoEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.collection, self.album, self.id)
    }
}

/// A fully loaded album, as served from the album cache
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Album {
    pub name: String,

    pub count: usize,

    /// Sorted, deduplicated sub-album names
    pub sub_albums: Vec<String>,

    pub pseudo: bool,

    /// Photos ordered by capture date, then title
    pub photos: Vec<Photo>,
}

impl Album {
    pub fn new(name: &str, pseudo: bool, mut photos: Vec<Photo>) -> Self {
        photos.sort_by(|a, b| (a.date, &a.title, &a.id).cmp(&(b.date, &b.title, &b.id)));

        let mut sub_albums = photos
            .iter()
            .filter(|p| !p.sub_album.is_empty())
            .map(|p| p.sub_album.clone())
            .collect::<Vec<_>>();

        sub_albums.sort();
        sub_albums.dedup();

        Self {
            name: name.into(),
            count: photos.len(),
            sub_albums,
            pseudo,
            photos,
        }
    }
}

/// Durable summary of the last full reconciliation of an album
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Default)]
pub struct AlbumSummary {
    pub name: String,
    pub count: usize,
    pub sub_albums: Vec<String>,
    pub needs_thumbs: bool,
}

/// Entry in an album listing
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct AlbumInfo {
    pub name: String,
    pub pseudo: bool,
}

/// Entry in a collection listing
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub index: usize,
    pub read_only: bool,
}

/// Policy applied when a moved photo would collide with an existing or in-flight destination
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Abort the whole move with an error
    Cancel,
    /// Leave the conflicting photo where it is
    Skip,
    /// Append the lowest free " (n)" suffix, starting at 2
    Rename,
    /// Overwrite the destination (treated as `Rename` by collections with `rename_on_replace`)
    Replace,
}

impl FromStr for ConflictMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(ConflictMode::Cancel),
            "skip" => Ok(ConflictMode::Skip),
            "rename" => Ok(ConflictMode::Rename),
            "replace" => Ok(ConflictMode::Replace),
            _ => Err(anyhow!("unrecognized conflict mode: {}", s)),
        }
    }
}

/// Outcome of a move
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Eq, PartialEq, Default)]
pub struct MoveSummary {
    pub moved: usize,
    pub skipped: usize,
    pub renamed: usize,
    pub files: usize,
}

#[cfg(test)]
mod test {
    use {super::*, maplit::hashset, std::collections::HashSet};

    fn file(path: &str) -> File {
        let (kind, mime) = MediaKind::from_path(path);

        File {
            kind,
            mime: mime.into(),
            path: path.into(),
            size: 10,
            ..File::default()
        }
    }

    #[test]
    fn ids() {
        assert_eq!("img_1", photo_id("IMG_1.JPG"));
        assert_eq!("summer$img_1", photo_id("Summer/IMG_1.MOV"));
        assert_eq!("a$b$c.d", photo_id("A/B/c.d.jpg"));
        assert_eq!("dir.x$noext", photo_id("dir.x/noext"));
        assert_eq!(
            hashset!["img_1".to_owned()],
            ["IMG_1.JPG", "IMG_1.MOV", "img_1.jpeg"]
                .iter()
                .map(|p| photo_id(p))
                .collect::<HashSet<_>>()
        );
    }

    #[test]
    fn types() {
        assert_eq!(MediaKind::Image, MediaKind::from_path("a/IMG_1.JPG").0);
        assert_eq!(MediaKind::Video, MediaKind::from_path("IMG_1.mov").0);
        assert_eq!(MediaKind::Unrecognized, MediaKind::from_path("notes.txt").0);
        assert_eq!(MediaKind::Unrecognized, MediaKind::from_path("README").0);

        use MediaKind::*;

        assert_eq!(PhotoType::Live, PhotoType::derive([Image, Video]));
        assert_eq!(PhotoType::Live, PhotoType::derive([Unrecognized, Image, Unrecognized, Video]));
        assert_eq!(PhotoType::Image, PhotoType::derive([Image]));
        assert_eq!(PhotoType::Image, PhotoType::derive([Image, Unrecognized]));
        assert_eq!(PhotoType::Video, PhotoType::derive([Video, Video]));
        assert_eq!(PhotoType::Unrecognized, PhotoType::derive([Image, Unrecognized, Unrecognized]));
        assert_eq!(PhotoType::Unrecognized, PhotoType::derive(std::iter::empty()));
    }

    #[test]
    fn derive() {
        let mut photo = Photo {
            id: "img_1".into(),
            files: vec![file("Trip/IMG_1.MOV"), file("Trip/IMG_1.JPG")],
            ..Photo::default()
        };

        photo.files[0].width = 1920;
        photo.files[1].width = 4032;
        photo.files[1].height = 3024;

        photo.derive();

        assert_eq!(PhotoType::Live, photo.kind);
        assert_eq!((4032, 3024), (photo.width, photo.height));
        assert_eq!(vec![10, 10], photo.sizes);
        assert_eq!("IMG_1.JPG", photo.representative().map(File::name).unwrap());
    }

    #[test]
    fn entries() {
        let entry = "Family:Trip 2019:summer$img_1".parse::<PseudoEntry>().unwrap();

        assert_eq!("Family", entry.collection);
        assert_eq!("Trip 2019", entry.album);
        assert_eq!("summer$img_1", entry.id);
        assert_eq!("Family:Trip 2019:summer$img_1", entry.to_string());

        assert!("Family:Trip".parse::<PseudoEntry>().is_err());
        assert!("::x".parse::<PseudoEntry>().is_err());
    }

    #[test]
    fn albums() {
        let photo = |id: &str, sub_album: &str| Photo {
            id: id.into(),
            title: id.into(),
            sub_album: sub_album.into(),
            ..Photo::default()
        };

        let album = Album::new(
            "Trip",
            false,
            vec![photo("c", "b"), photo("a", ""), photo("b", "a"), photo("d", "b")],
        );

        assert_eq!(4, album.count);
        assert_eq!(vec!["a".to_owned(), "b".to_owned()], album.sub_albums);
        assert_eq!(
            vec!["a", "b", "c", "d"],
            album.photos.iter().map(|p| p.id.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn extensions() {
        assert_eq!(("IMG_1 (2)", ".JPG"), split_extension("IMG_1 (2).JPG"));
        assert_eq!(("noext", ""), split_extension("noext"));
        assert_eq!((".hidden", ""), split_extension(".hidden"));
        assert_eq!(ConflictMode::Rename, "rename".parse().unwrap());
        assert!("merge".parse::<ConflictMode>().is_err());
    }
}
