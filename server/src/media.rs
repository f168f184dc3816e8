//! Media probing and thumbnail encoding.
//!
//! Decoding is delegated to a [MediaProber]: the gallery only needs a file's kind, dimensions, capture date, and
//! location, plus a decoded raster to shrink into a thumbnail.  [FsProber] is the default implementation, using
//! the `image` and `exif` crates for stills and `ffprobe`/`ffmpeg` subprocesses for video.

use {
    anyhow::{anyhow, Error, Result},
    bytes::{Bytes, BytesMut},
    chrono::{DateTime, Utc},
    exif::{In, Reader as ExifReader, Tag, Value},
    futures::{future::BoxFuture, FutureExt, Stream, TryStreamExt},
    gallery_shared::{Location, MediaKind},
    image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage, GenericImageView, ImageFormat},
    lazy_static::lazy_static,
    regex::Regex,
    serde_json::Value as Json,
    std::{fs::File, io::BufReader, path::Path},
    tokio::{fs, io::AsyncRead, process::Command, task},
    tokio_util::codec::{BytesCodec, FramedRead},
};

/// Target length of a thumbnail's shorter edge, in pixels
pub const THUMBNAIL_SHORT_EDGE: u32 = 200;

pub const JPEG_QUALITY: u8 = 90;

/// What a [MediaProber] learned about one file
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Probe {
    pub kind: MediaKind,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub date: Option<DateTime<Utc>>,
    pub location: Option<Location>,
}

/// Black-box access to media decoding backends
pub trait MediaProber: Send + Sync + 'static {
    /// Determine the kind, dimensions, capture date, and location of the file at `path`.
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Probe>>;

    /// Decode the file at `path` (or, for a video, its first frame) into an upright raster.
    fn decode<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<DynamicImage>>;
}

/// Default [MediaProber] backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProber;

impl MediaProber for FsProber {
    fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Probe>> {
        async move {
            let (kind, mime) = MediaKind::from_path(path);

            let mut probe = match kind {
                MediaKind::Image => {
                    let path = path.to_owned();

                    task::block_in_place(move || image_probe(&path))?
                }
                MediaKind::Video => video_probe(path).await?,
                MediaKind::Unrecognized => return Err(anyhow!("unrecognized media type: {}", path.display())),
            };

            probe.kind = kind;
            probe.mime = mime.into();

            if probe.date.is_none() {
                probe.date = Some(DateTime::<Utc>::from(fs::metadata(path).await?.modified()?));
            }

            Ok(probe)
        }
        .boxed()
    }

    fn decode<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<DynamicImage>> {
        async move {
            match MediaKind::from_path(path).0 {
                MediaKind::Image => {
                    let path = path.to_owned();

                    task::block_in_place(move || -> Result<DynamicImage> {
                        let image = image::open(&path)?;

                        Ok(orient(image, exif_orientation(&path).unwrap_or(1)))
                    })
                }

                MediaKind::Video => {
                    let still = still_image(path).await?;

                    Ok(task::block_in_place(|| {
                        image::load_from_memory_with_format(&still, ImageFormat::Jpeg)
                    })?)
                }

                MediaKind::Unrecognized => Err(anyhow!("unrecognized media type: {}", path.display())),
            }
        }
        .boxed()
    }
}

fn exif_data(path: &Path) -> Result<exif::Exif> {
    Ok(ExifReader::new().read_from_container(&mut BufReader::new(File::open(path)?))?)
}

fn ascii(exif: &exif::Exif, tag: Tag) -> Option<String> {
    match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Ascii(values) => values
            .first()
            .map(|value| String::from_utf8_lossy(value).into_owned()),
        _ => None,
    }
}

fn exif_date(exif: &exif::Exif) -> Option<DateTime<Utc>> {
    lazy_static! {
        static ref DATE_TIME_PATTERN: Regex =
            Regex::new(r"(\d{4}):(\d{2}):(\d{2}) (\d{2}):(\d{2}):(\d{2})").unwrap();
    };

    let datetime = ascii(exif, Tag::DateTimeOriginal).or_else(|| ascii(exif, Tag::DateTime))?;

    DATE_TIME_PATTERN
        .captures(&datetime)
        .map(|c| format!("{}-{}-{}T{}:{}:{}Z", &c[1], &c[2], &c[3], &c[4], &c[5], &c[6]))
        .and_then(|s| s.parse().ok())
}

fn degrees(exif: &exif::Exif, tag: Tag, reference: Tag, negative: &str) -> Option<f64> {
    let value = match &exif.get_field(tag, In::PRIMARY)?.value {
        Value::Rational(parts) if parts.len() == 3 => {
            parts[0].to_f64() + parts[1].to_f64() / 60.0 + parts[2].to_f64() / 3600.0
        }
        _ => return None,
    };

    if ascii(exif, reference).as_deref() == Some(negative) {
        Some(-value)
    } else {
        Some(value)
    }
}

fn exif_location(exif: &exif::Exif) -> Option<Location> {
    Some(Location {
        latitude: degrees(exif, Tag::GPSLatitude, Tag::GPSLatitudeRef, "S")?,
        longitude: degrees(exif, Tag::GPSLongitude, Tag::GPSLongitudeRef, "W")?,
    })
}

fn exif_orientation(path: &Path) -> Option<u32> {
    exif_data(path)
        .ok()?
        .get_field(Tag::Orientation, In::PRIMARY)?
        .value
        .get_uint(0)
}

/// Orientations 5 through 8 swap width and height.
fn orthogonal(orientation: u32) -> bool {
    (5..=8).contains(&orientation)
}

fn orient(image: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

fn image_probe(path: &Path) -> Result<Probe> {
    let (mut width, mut height) = image::image_dimensions(path)?;

    let (date, location) = match exif_data(path) {
        Ok(exif) => {
            let orientation = exif
                .get_field(Tag::Orientation, In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
                .unwrap_or(1);

            if orthogonal(orientation) {
                std::mem::swap(&mut width, &mut height);
            }

            (exif_date(&exif), exif_location(&exif))
        }
        Err(_) => (None, None),
    };

    Ok(Probe {
        width,
        height,
        date,
        location,
        ..Probe::default()
    })
}

async fn video_probe(path: &Path) -> Result<Probe> {
    let output = Command::new("ffprobe")
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_streams")
        .arg("-show_format")
        .arg(path)
        .output()
        .await?;

    if !output.status.success() {
        return Err(anyhow!(
            "error running ffprobe: {}",
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let json = serde_json::from_slice::<Json>(&output.stdout)?;

    let stream = json["streams"]
        .as_array()
        .and_then(|streams| streams.iter().find(|s| s["codec_type"] == "video"))
        .ok_or_else(|| anyhow!("no video stream in {}", path.display()))?;

    let dimension = |name: &str| stream[name].as_u64().and_then(|n| u32::try_from(n).ok()).unwrap_or(0);

    let (mut width, mut height) = (dimension("width"), dimension("height"));

    if matches!(stream["tags"]["rotate"].as_str(), Some("90") | Some("270") | Some("-90")) {
        std::mem::swap(&mut width, &mut height);
    }

    let date = json["format"]["tags"]["creation_time"]
        .as_str()
        .or_else(|| stream["tags"]["creation_time"].as_str())
        .and_then(|s| s.parse::<DateTime<Utc>>().ok());

    Ok(Probe {
        width,
        height,
        date,
        ..Probe::default()
    })
}

/// Grab the first frame of a video as a JPEG.
async fn still_image(path: &Path) -> Result<Vec<u8>> {
    let output = Command::new("ffmpeg")
        .arg("-i")
        .arg(path)
        .arg("-ss")
        .arg("00:00:00")
        .arg("-frames:v")
        .arg("1")
        .arg("-f")
        .arg("image2pipe")
        .arg("-vcodec")
        .arg("mjpeg")
        .arg("-")
        .output()
        .await?;

    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(anyhow!(
            "error running ffmpeg: {}",
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

/// Scale `(width, height)` so the shorter edge is `short_edge`, preserving aspect ratio and never upscaling.
pub fn bound((width, height): (u32, u32), short_edge: u32) -> (u32, u32) {
    let short = width.min(height);

    if short <= short_edge {
        return (width, height);
    }

    let scale = |n: u32| ((u64::from(n) * u64::from(short_edge) + u64::from(short) / 2) / u64::from(short)) as u32;

    if width <= height {
        (short_edge, scale(height).max(1))
    } else {
        (scale(width).max(1), short_edge)
    }
}

/// Shrink `image` to thumbnail size and encode it as a JPEG.
pub fn encode_thumbnail(image: &DynamicImage) -> Result<Vec<u8>> {
    let (width, height) = bound(image.dimensions(), THUMBNAIL_SHORT_EDGE);

    let resized = if (width, height) == image.dimensions() {
        image.to_rgb8()
    } else {
        image.resize_exact(width, height, FilterType::Lanczos3).to_rgb8()
    };

    let mut buffer = Vec::new();

    JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY).encode_image(&resized)?;

    Ok(buffer)
}

pub fn as_stream(input: impl AsyncRead + Send) -> impl Stream<Item = Result<Bytes>> + Send {
    FramedRead::new(input, BytesCodec::new())
        .map_ok(BytesMut::freeze)
        .map_err(Error::from)
}

#[cfg(test)]
pub mod test {
    use {
        super::*,
        image::{ImageBuffer, Rgb},
        std::{
            collections::HashMap,
            sync::{
                atomic::{AtomicUsize, Ordering},
                Mutex,
            },
        },
    };

    /// [MediaProber] which classifies files by extension, reports canned metadata, and counts its calls
    #[derive(Default)]
    pub struct ScriptedProber {
        pub probes: AtomicUsize,
        pub decodes: AtomicUsize,
        /// Canned capture dates, keyed by file name
        pub dates: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    impl ScriptedProber {
        pub fn probes(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }

        pub fn decodes(&self) -> usize {
            self.decodes.load(Ordering::SeqCst)
        }
    }

    impl MediaProber for ScriptedProber {
        fn probe<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Probe>> {
            async move {
                self.probes.fetch_add(1, Ordering::SeqCst);

                let (kind, mime) = MediaKind::from_path(path);

                if !kind.is_recognized() {
                    return Err(anyhow!("unrecognized media type: {}", path.display()));
                }

                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let date = self.dates.lock().unwrap().get(&name).copied();

                Ok(Probe {
                    kind,
                    mime: mime.into(),
                    width: 640,
                    height: 480,
                    date,
                    location: None,
                })
            }
            .boxed()
        }

        fn decode<'a>(&'a self, _path: &'a Path) -> BoxFuture<'a, Result<DynamicImage>> {
            async move {
                self.decodes.fetch_add(1, Ordering::SeqCst);

                Ok(DynamicImage::ImageRgb8(ImageBuffer::from_pixel(640, 480, Rgb([200, 30, 90]))))
            }
            .boxed()
        }
    }

    #[test]
    fn bounds() {
        assert_eq!((267, 200), bound((640, 480), 200));
        assert_eq!((200, 267), bound((480, 640), 200));
        assert_eq!((200, 200), bound((1000, 1000), 200));
        assert_eq!((150, 100), bound((150, 100), 200));
        assert_eq!((0, 0), bound((0, 0), 200));
    }

    #[test]
    fn encodes_jpeg() -> Result<()> {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(800, 400, image::Rgba([1, 2, 3, 255])));

        let encoded = encode_thumbnail(&image)?;
        let decoded = image::load_from_memory_with_format(&encoded, ImageFormat::Jpeg)?;

        assert_eq!((400, 200), decoded.dimensions());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn probes_plain_images() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("IMG_1.JPG");

        ImageBuffer::from_pixel(48, 32, Rgb([10u8, 20, 30])).save_with_format(&path, ImageFormat::Jpeg)?;

        let probe = FsProber.probe(&path).await?;

        assert_eq!(MediaKind::Image, probe.kind);
        assert_eq!("image/jpeg", probe.mime);
        assert_eq!((48, 32), (probe.width, probe.height));
        // No EXIF, so the modification time stands in.
        assert!(probe.date.is_some());
        assert_eq!(None, probe.location);

        assert_eq!((48, 32), FsProber.decode(&path).await?.dimensions());

        assert!(FsProber.probe(&dir.path().join("notes.txt")).await.is_err());

        Ok(())
    }
}
