//! Mirroring a repository tree with a bounded worker pool
//!
//! A producer walks the source tree, diffs each repository against its
//! destination and sends one [`CopyTask`] per digest that needs work. A
//! fixed set of workers drains the channel. The first task that fails after
//! its retries cancels everything else and its error is returned.

use crate::copy::copy;
use crate::error::{RegistryError, Result};
use crate::hash::Hash;
use crate::image::{Descriptor, MediaType};
use crate::reference::{Reference, Repository};
use crate::registry::Backoff;
use crate::registry::retry::sleep;
use crate::remote::{self, Fetcher, Options, PushStats, Tags, Writer};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a repository holds under one digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestEntry {
    pub media_type: MediaType,
    pub tags: Vec<String>,
}

/// One unit of work: make `digest` and `tags` present in `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTask {
    pub digest: Hash,
    pub media_type: MediaType,
    /// Tags to create, in order. Empty means copy by digest only.
    pub tags: Vec<String>,
    pub source: Repository,
    pub destination: Repository,
    /// The destination already holds the manifest; only tags are missing.
    pub present: bool,
}

/// Tasks needed to bring `destination` up to date with `source`.
///
/// A digest missing from the destination is copied with all of its source
/// tags. A digest already present gets only the tags the destination lacks.
/// Destination-only digests and tags are left alone.
pub fn plan(
    source: &Repository,
    src: &BTreeMap<Hash, DigestEntry>,
    destination: &Repository,
    dst: &BTreeMap<Hash, DigestEntry>,
) -> Vec<CopyTask> {
    src.iter()
        .filter_map(|(digest, entry)| {
            let (tags, present) = match dst.get(digest) {
                None => (entry.tags.clone(), false),
                Some(existing) => {
                    let missing: Vec<String> = entry
                        .tags
                        .iter()
                        .filter(|t| !existing.tags.contains(t))
                        .cloned()
                        .collect();
                    if missing.is_empty() {
                        return None;
                    }
                    (missing, true)
                }
            };
            Some(CopyTask {
                digest: digest.clone(),
                media_type: entry.media_type.clone(),
                tags,
                source: source.clone(),
                destination: destination.clone(),
                present,
            })
        })
        .collect()
}

/// Totals for a recursive copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecursiveStats {
    pub repositories: usize,
    pub tasks: usize,
    pub retagged: usize,
    pub push: PushStats,
}

struct Job {
    task: CopyTask,
    done: Option<oneshot::Sender<()>>,
}

/// Copies every repository under a source root to the matching path under
/// a destination root.
#[derive(Clone)]
pub struct RecursiveCopier {
    options: Options,
    backoff: Backoff,
}

impl RecursiveCopier {
    pub fn new(options: Options) -> Self {
        RecursiveCopier {
            options,
            backoff: Backoff::copier_default(),
        }
    }

    /// Retry policy applied to each task as a whole.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(&self, src_root: &Repository, dst_root: &Repository) -> Result<RecursiveStats> {
        let cancel = self.options.cancel_token().child_token();
        let options = self.options.clone().with_cancel(cancel.clone());
        let jobs = options.jobs();

        let (tx, rx) = mpsc::channel::<Job>(jobs * 2);
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();
        for id in 0..jobs {
            workers.spawn(worker(
                id,
                rx.clone(),
                options.clone(),
                self.backoff,
                cancel.clone(),
            ));
        }

        let produced = produce(src_root, dst_root, &options, &tx, &cancel).await;
        drop(tx);
        if produced.is_err() {
            cancel.cancel();
        }

        let mut stats = RecursiveStats::default();
        let mut failure: Option<RegistryError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(worker_stats)) => {
                    stats.tasks += worker_stats.tasks;
                    stats.retagged += worker_stats.retagged;
                    stats.push.merge(worker_stats.push);
                }
                Ok(Err(e)) => keep_first(&mut failure, e),
                Err(join_error) => {
                    cancel.cancel();
                    keep_first(&mut failure, RegistryError::Config(format!("copy worker panicked: {}", join_error)));
                }
            }
        }

        match produced {
            Ok(repositories) => stats.repositories = repositories,
            Err(e) => keep_first(&mut failure, e),
        }
        match failure {
            Some(e) => Err(e),
            None => {
                info!(repositories = stats.repositories, tasks = stats.tasks, retagged = stats.retagged, "recursive copy finished");
                Ok(stats)
            }
        }
    }
}

/// Keep the first real error; `Canceled` only stands in until one arrives.
fn keep_first(slot: &mut Option<RegistryError>, err: RegistryError) {
    match slot {
        None => *slot = Some(err),
        Some(RegistryError::Canceled) if !matches!(err, RegistryError::Canceled) => *slot = Some(err),
        Some(_) => {}
    }
}

/// Destination for `repository`: the same path below `dst_root` as it has
/// below `src_root`.
pub fn map_repository(src_root: &Repository, dst_root: &Repository, repository: &Repository) -> Result<Repository> {
    let root = src_root.repository_str();
    let path = repository.repository_str();
    if path == root {
        return Ok(dst_root.clone());
    }
    match path.strip_prefix(root).and_then(|rest| rest.strip_prefix('/')) {
        Some(suffix) => dst_root.child(suffix),
        None => Err(RegistryError::InvalidReference(format!(
            "{} is not below {}",
            repository, src_root
        ))),
    }
}

/// Group a repository's tags by digest. Uses the registry's manifest map
/// when it sent one, otherwise HEADs every tag.
async fn digest_map(repository: &Repository, tags: &Tags, options: &Options) -> Result<BTreeMap<Hash, DigestEntry>> {
    let mut map: BTreeMap<Hash, DigestEntry> = BTreeMap::new();
    if !tags.manifests.is_empty() {
        for (digest, info) in &tags.manifests {
            let mut tags = info.tags.clone();
            tags.sort();
            map.insert(
                digest.clone(),
                DigestEntry {
                    media_type: info.media_type.clone(),
                    tags,
                },
            );
        }
        return Ok(map);
    }
    if tags.tags.is_empty() {
        return Ok(map);
    }

    let fetcher = Fetcher::new(repository, options).await?;
    let fetcher = &fetcher;
    let heads: Vec<(String, Descriptor)> = stream::iter(tags.tags.iter().cloned())
        .map(|tag| head_tag(fetcher, repository, tag))
        .buffer_unordered(options.jobs())
        .try_collect()
        .await?;
    for (tag, desc) in heads {
        let entry = map.entry(desc.digest).or_insert_with(|| DigestEntry {
            media_type: desc.media_type,
            tags: Vec::new(),
        });
        entry.tags.push(tag);
    }
    for entry in map.values_mut() {
        entry.tags.sort();
    }
    Ok(map)
}

async fn head_tag(fetcher: &Fetcher, repository: &Repository, tag: String) -> Result<(String, Descriptor)> {
    let reference = Reference::from(repository.tag(&tag)?);
    let desc = fetcher.head_manifest(&reference).await?;
    Ok((tag, desc))
}

async fn send(tx: &mpsc::Sender<Job>, job: Job, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RegistryError::Canceled),
        sent = tx.send(job) => sent.map_err(|_| RegistryError::Canceled),
    }
}

/// Walk the source tree and enqueue tasks. Returns the number of
/// repositories visited.
async fn produce(
    src_root: &Repository,
    dst_root: &Repository,
    options: &Options,
    tx: &mpsc::Sender<Job>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let mut repositories: Vec<(Repository, Tags)> = Vec::new();
    remote::walk(src_root, options, |repository, tags| {
        repositories.push((repository.clone(), tags?.clone()));
        Ok(())
    })
    .await?;

    for (source, src_tags) in &repositories {
        if cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        let destination = map_repository(src_root, dst_root, source)?;
        let src = digest_map(source, src_tags, options).await?;
        let dst = match remote::list(&destination, options).await {
            Ok(dst_tags) => digest_map(&destination, &dst_tags, options).await?,
            Err(e) if e.is_not_found() => BTreeMap::new(),
            Err(e) => return Err(e),
        };

        let (indexes, images): (Vec<CopyTask>, Vec<CopyTask>) = plan(source, &src, &destination, &dst)
            .into_iter()
            .partition(|t| t.media_type.is_index());
        debug!(source = %source, destination = %destination, images = images.len(), indexes = indexes.len(), "planned repository");

        // Indexes go out only after the images they may reference landed.
        let mut pending = Vec::new();
        for task in images {
            let done = if indexes.is_empty() {
                None
            } else {
                let (done_tx, done_rx) = oneshot::channel();
                pending.push(done_rx);
                Some(done_tx)
            };
            send(tx, Job { task, done }, cancel).await?;
        }
        for done in pending {
            done.await.map_err(|_| RegistryError::Canceled)?;
        }
        for task in indexes {
            send(tx, Job { task, done: None }, cancel).await?;
        }
    }
    Ok(repositories.len())
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    options: Options,
    backoff: Backoff,
    cancel: CancellationToken,
) -> Result<RecursiveStats> {
    let mut stats = RecursiveStats::default();
    loop {
        if cancel.is_cancelled() {
            return Ok(stats);
        }
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            return Ok(stats);
        };

        let task = &job.task;
        debug!(worker = id, digest = %task.digest, destination = %task.destination, "starting task");
        match run_with_retry(task, &options, &backoff, &cancel).await {
            Ok((push, retagged)) => {
                stats.tasks += 1;
                stats.retagged += retagged;
                stats.push.merge(push);
                if let Some(done) = job.done {
                    let _ = done.send(());
                }
            }
            Err(e) => {
                if !matches!(e, RegistryError::Canceled) {
                    warn!(digest = %task.digest, destination = %task.destination, error = %e, "copy task failed");
                }
                cancel.cancel();
                return Err(e);
            }
        }
    }
}

/// [`run_task`] under the copier's backoff. Only transient failures are
/// retried.
async fn run_with_retry(
    task: &CopyTask,
    options: &Options,
    backoff: &Backoff,
    cancel: &CancellationToken,
) -> Result<(PushStats, usize)> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RegistryError::Canceled);
        }
        match run_task(task, options).await {
            Ok(done) => return Ok(done),
            Err(e) if attempt < backoff.steps && e.is_retryable() => {
                let delay = backoff.delay(attempt);
                warn!(digest = %task.digest, error = %e, attempt = attempt + 1, ?delay, "retrying copy task");
                sleep(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Copy one digest and create its tags. Returns push stats and the number
/// of tags written without moving content.
async fn run_task(task: &CopyTask, options: &Options) -> Result<(PushStats, usize)> {
    let pinned = Reference::from(task.destination.digest(task.digest.clone()));
    let mut push = PushStats::default();
    let retag: &[String] = if task.present {
        &task.tags
    } else {
        let src = Reference::from(task.source.digest(task.digest.clone()));
        let target = match task.tags.first() {
            Some(tag) => Reference::from(task.destination.tag(tag)?),
            None => pinned.clone(),
        };
        push = copy(&src, &target, options).await?;
        task.tags.get(1..).unwrap_or_default()
    };
    if retag.is_empty() {
        return Ok((push, 0));
    }

    let writer = Writer::new(&task.destination, options, &[]).await?;
    let (raw, desc) = writer.fetcher().fetch_manifest(&pinned).await?;
    for tag in retag {
        writer.put_manifest(tag, raw.clone(), &desc.media_type).await?;
    }
    Ok((push, retag.len()))
}
