use {anyhow::Error, std::borrow::Cow};

/// Operation-level failures which callers are expected to branch on.
///
/// These travel inside an [anyhow::Error]; use [GalleryError::of] to recover them.  Anything else is either an
/// I/O or catalog failure.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum GalleryError {
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("album not found: {0}")]
    AlbumNotFound(String),

    #[error("photo not found: {album}/{id}")]
    PhotoNotFound { album: String, id: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("album already exists: {0}")]
    AlbumExists(String),

    #[error("collection is read-only: {0}")]
    ReadOnly(String),

    #[error("destination conflict: {0}")]
    Conflict(String),

    #[error("invalid name: {0}")]
    InvalidName(Cow<'static, str>),
}

impl GalleryError {
    pub fn photo_not_found(album: &str, id: &str) -> Self {
        Self::PhotoNotFound {
            album: album.into(),
            id: id.into(),
        }
    }

    /// Find the `GalleryError` (if any) at the root of `error`.
    pub fn of(error: &Error) -> Option<&GalleryError> {
        error.root_cause().downcast_ref::<GalleryError>()
    }
}

/// Reject names which would escape their directory or break the pseudo-album line format.
pub fn check_name(name: &str) -> Result<(), GalleryError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(|c| matches!(c, '/' | '\\' | ':' | '\0'))
    {
        Err(GalleryError::InvalidName(Cow::Owned(name.to_owned())))
    } else {
        Ok(())
    }
}
