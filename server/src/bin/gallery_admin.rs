use {
    anyhow::Result,
    gallery_server::{Config, FsProber, Gallery, Reconcile},
    std::{path::PathBuf, sync::Arc},
    structopt::StructOpt,
    tracing::warn,
};

#[derive(StructOpt, Debug)]
#[structopt(name = "gallery-admin", about = "Photo gallery maintenance tool")]
enum Command {
    /// Reconcile albums with the filesystem
    Sync {
        /// JSON configuration file listing collections
        config: PathBuf,

        /// Collection to reconcile
        collection: String,

        /// Album to reconcile.  If not specified, every album in the collection is reconciled.
        album: Option<String>,

        /// Probe every photo again, even those already cataloged
        #[structopt(long)]
        refresh: bool,
    },

    /// Generate every missing thumbnail
    Thumbs {
        /// JSON configuration file listing collections
        config: PathBuf,
    },

    /// Move a collection's thumbnails from the old content-hash layout to the current one
    MigrateThumbs {
        /// JSON configuration file listing collections
        config: PathBuf,

        /// Collection whose thumbnails should be moved
        collection: String,
    },

    /// List a collection's albums
    Albums {
        /// JSON configuration file listing collections
        config: PathBuf,

        /// Collection to list
        collection: String,
    },
}

async fn open(config: &PathBuf) -> Result<Gallery> {
    Gallery::open(&Config::load(config).await?, Arc::new(FsProber)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    match Command::from_args() {
        Command::Sync {
            config,
            collection,
            album,
            refresh,
        } => {
            let gallery = open(&config).await?;

            let options = if refresh {
                Reconcile::refresh()
            } else {
                Reconcile::full()
            };

            let albums = match album {
                Some(album) => vec![album],
                None => gallery
                    .list_albums(&collection)
                    .await?
                    .into_iter()
                    .filter(|album| !album.pseudo)
                    .map(|album| album.name)
                    .collect(),
            };

            for album in albums {
                match gallery.reconcile(&collection, &album, &options).await {
                    Ok(photos) => println!("{}: {} photos", album, photos.len()),
                    Err(e) => warn!("unable to reconcile {}: {:?}", album, e),
                }
            }
        }

        Command::Thumbs { config } => {
            let gallery = open(&config).await?;

            let queued = gallery.generate_missing_thumbnails().await?;

            println!("generated {} thumbnails", queued);
        }

        Command::MigrateThumbs { config, collection } => {
            let gallery = open(&config).await?;

            println!(
                "moved {} thumbnails",
                gallery.migrate_thumbnails(&collection).await?
            );
        }

        Command::Albums { config, collection } => {
            let gallery = open(&config).await?;

            for album in gallery.list_albums(&collection).await? {
                println!(
                    "{}{}",
                    album.name,
                    if album.pseudo { " (pseudo)" } else { "" }
                );
            }
        }
    }

    Ok(())
}
