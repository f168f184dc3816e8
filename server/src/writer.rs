//! Batched catalog writer.
//!
//! Individual upserts and deletes are buffered and committed to the [Store] in one transaction once the buffer
//! reaches a size limit or its oldest entry reaches an age limit, whichever comes first.  Callers which must see
//! their own writes (e.g. an interactive album load) call [Writer::flush] with `synchronous` set.

use {
    crate::store::{Op, Store},
    anyhow::{anyhow, Result},
    gallery_shared::Photo,
    serde_derive::Deserialize,
    std::{sync::Arc, time::Duration},
    tokio::{
        sync::{mpsc, oneshot},
        task,
        time::{self, Instant},
    },
    tracing::{debug, warn},
};

/// Tuning for a [Writer]
#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(default)]
pub struct WriterConfig {
    /// Commit as soon as this many operations are buffered
    pub batch_size: usize,

    /// Commit once the oldest buffered operation is this old
    pub max_delay_ms: u64,

    /// Operations which may be in flight to the writer before producers block
    pub queue_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            max_delay_ms: 1000,
            queue_size: 1024,
        }
    }
}

enum Message {
    Op(Op),
    Flush(Option<oneshot::Sender<Result<()>>>),
}

/// Handle to a background task which owns the write buffer for one [Store]
#[derive(Clone, Debug)]
pub struct Writer {
    tx: mpsc::Sender<Message>,
}

impl Writer {
    pub fn spawn(store: Arc<Store>, config: WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));

        task::spawn(run(store, rx, config));

        Self { tx }
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow!("catalog writer has shut down"))
    }

    pub async fn upsert(&self, photo: Photo) -> Result<()> {
        self.send(Message::Op(Op::Upsert(Box::new(photo)))).await
    }

    pub async fn delete(&self, album: &str, id: &str) -> Result<()> {
        self.send(Message::Op(Op::Delete {
            album: album.into(),
            id: id.into(),
        }))
        .await
    }

    pub async fn mark_thumb(&self, album: &str, id: &str, has_thumb: bool) -> Result<()> {
        self.send(Message::Op(Op::MarkThumb {
            album: album.into(),
            id: id.into(),
            has_thumb,
        }))
        .await
    }

    /// Commit everything buffered so far.
    ///
    /// If `synchronous` is true, wait until the commit has finished, so that every operation submitted through
    /// this writer before the call is visible to subsequent reads.  A synchronous flush fails if any operation
    /// could not be written since the previous synchronous flush.
    pub async fn flush(&self, synchronous: bool) -> Result<()> {
        if synchronous {
            let (tx, rx) = oneshot::channel();

            self.send(Message::Flush(Some(tx))).await?;

            rx.await
                .map_err(|_| anyhow!("catalog writer shut down before flushing"))?
        } else {
            self.send(Message::Flush(None)).await
        }
    }
}

/// Commit `buffer` in one transaction.  If that fails, retry each operation on its own so one bad record
/// doesn't take the rest of the batch with it.
async fn commit(store: &Store, buffer: &mut Vec<Op>) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    debug!("committing {} catalog operations", buffer.len());

    let result = match store.apply(buffer).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                "error committing {} catalog operations, retrying individually: {:?}",
                buffer.len(),
                e
            );

            let mut failed = 0;
            let mut last = None;

            for op in buffer.iter() {
                if let Err(e) = store.apply(std::slice::from_ref(op)).await {
                    warn!("error committing {:?}: {:?}", op, e);

                    failed += 1;
                    last = Some(e);
                }
            }

            match last {
                Some(e) => Err(anyhow!("{} of {} catalog operations failed: {:?}", failed, buffer.len(), e)),
                None => Ok(()),
            }
        }
    };

    buffer.clear();

    result
}

/// Commit `buffer`, remembering the first failure until a synchronous flush can report it.
async fn commit_into(store: &Store, buffer: &mut Vec<Op>, error: &mut Option<anyhow::Error>) {
    if let Err(e) = commit(store, buffer).await {
        error.get_or_insert(e);
    }
}

async fn run(store: Arc<Store>, mut rx: mpsc::Receiver<Message>, config: WriterConfig) {
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let mut buffer = Vec::with_capacity(config.batch_size);
    let mut deadline = Instant::now();
    let mut error = None;

    loop {
        let message = if buffer.is_empty() {
            rx.recv().await
        } else {
            match time::timeout_at(deadline, rx.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    commit_into(&store, &mut buffer, &mut error).await;
                    continue;
                }
            }
        };

        match message {
            Some(Message::Op(op)) => {
                if buffer.is_empty() {
                    deadline = Instant::now() + max_delay;
                }

                buffer.push(op);

                if buffer.len() >= config.batch_size {
                    commit_into(&store, &mut buffer, &mut error).await;
                }
            }

            Some(Message::Flush(done)) => {
                commit_into(&store, &mut buffer, &mut error).await;

                if let Some(done) = done {
                    let _ = done.send(error.take().map_or(Ok(()), Err));
                }
            }

            None => {
                if let Err(e) = commit(&store, &mut buffer).await {
                    warn!("error committing final catalog operations: {:?}", e);
                }

                break;
            }
        }
    }
}
