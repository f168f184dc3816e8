use {
    anyhow::Result,
    futures::TryFutureExt,
    gallery_server::{Config, FsProber, Gallery},
    std::{path::PathBuf, process, sync::Arc, time::Duration},
    structopt::StructOpt,
    tokio::{task, time},
    tracing::{error, info},
};

#[derive(StructOpt, Debug)]
#[structopt(name = "gallery-server", about = "Photo gallery catalog and thumbnail service")]
struct Options {
    /// JSON configuration file listing collections and tuning parameters
    #[structopt(long, default_value = "gallery.json")]
    config: PathBuf,

    /// Seconds to wait between full resynchronizations of every known album
    #[structopt(long, default_value = "600")]
    sync_interval_secs: u64,

    /// Override the configured number of metadata extraction workers
    #[structopt(long)]
    extract_workers: Option<usize>,

    /// Override the configured number of thumbnail workers
    #[structopt(long)]
    thumb_workers: Option<usize>,

    /// Override the configured worker queue capacity
    #[structopt(long)]
    queue_size: Option<usize>,

    /// Override the configured album cache size (in photos)
    #[structopt(long)]
    album_cache_size: Option<u64>,

    /// Reconcile every album not yet cataloged, and queue missing thumbnails, before the first sync interval
    #[structopt(long)]
    warm: bool,
}

impl Options {
    fn apply(&self, config: &mut Config) {
        if let Some(workers) = self.extract_workers {
            config.pool.extract_workers = workers;
        }

        if let Some(workers) = self.thumb_workers {
            config.pool.thumb_workers = workers;
        }

        if let Some(size) = self.queue_size {
            config.pool.queue_size = size;
        }

        if let Some(size) = self.album_cache_size {
            config.album_cache_size = size;
        }
    }
}

async fn sync_loop(gallery: Arc<Gallery>, interval: Duration, warm: bool) -> Result<()> {
    if warm {
        gallery.warm().await?;
    }

    loop {
        time::sleep(interval).await;

        gallery.resync().await?;

        info!("status: {}", serde_json::to_string(&gallery.status().await)?);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init_timed();

    let options = Options::from_args();

    let mut config = Config::load(&options.config).await?;

    options.apply(&mut config);

    let gallery = Arc::new(Gallery::open(&config, Arc::new(FsProber)).await?);

    info!(
        "serving {} collections from {}",
        gallery.collections().len(),
        options.config.display()
    );

    task::spawn(
        sync_loop(
            gallery.clone(),
            Duration::from_secs(options.sync_interval_secs),
            options.warm,
        )
        .map_err(|e| {
            error!("sync error: {:?}", e);
            process::exit(-1)
        }),
    )
    .await?
}
