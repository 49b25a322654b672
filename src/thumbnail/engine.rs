//! Job coordination and the generation worker pool.
//!
//! All shared mutable state (the job table and both queues) lives behind a
//! single lock. Every operation on it is short and never awaits, so the
//! lock is only held for bookkeeping, never across generation.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::{Future, IntoFuture};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::queue::JobQueue;
use super::stats::{EngineStats, StatsRecorder};
use super::store::{open_store, CacheEntry, ThumbnailStore};
use super::{Generator, ImageGenerator, Payload, Priority, ThumbnailKey};
use crate::config::EngineConfig;
use crate::error::{CacheError, CacheResult, SetupError, ThumbnailError, ThumbnailResult};
use crate::index::{is_supported_image, DirectoryIndex};

type JobResult = ThumbnailResult<Payload>;

/// Worker pool sizing and limits
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Number of workers, fixed for the engine's lifetime (minimum 1)
    pub workers: usize,
    /// Wall-clock budget for a single generation
    pub job_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Running,
}

/// One in-flight generation. At most one exists per key.
struct Job {
    priority: Priority,
    state: JobState,
    waiters: Vec<oneshot::Sender<JobResult>>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<ThumbnailKey, Job>,
    queue: JobQueue<ThumbnailKey>,
}

struct Shared {
    store: Arc<dyn ThumbnailStore>,
    generator: Arc<dyn Generator>,
    state: Mutex<SchedulerState>,
    work_ready: Notify,
    job_timeout: Duration,
    stats: StatsRecorder,
    cancel: CancellationToken,
}

/// Handle to a pending or already-resolved thumbnail request.
///
/// Await it (or call [`Ticket::wait`]) to get the payload. Dropping it
/// abandons interest; the job itself still runs and fills the cache.
#[derive(Debug)]
pub struct Ticket {
    inner: TicketInner,
}

#[derive(Debug)]
enum TicketInner {
    Ready(JobResult),
    Pending(oneshot::Receiver<JobResult>),
}

impl Ticket {
    fn ready(result: JobResult) -> Self {
        Self {
            inner: TicketInner::Ready(result),
        }
    }

    fn pending(rx: oneshot::Receiver<JobResult>) -> Self {
        Self {
            inner: TicketInner::Pending(rx),
        }
    }

    /// True when the request was answered without creating or joining a job
    pub fn is_ready(&self) -> bool {
        matches!(self.inner, TicketInner::Ready(_))
    }

    pub async fn wait(self) -> JobResult {
        match self.inner {
            TicketInner::Ready(result) => result,
            // The sender only disappears when the engine is torn down
            TicketInner::Pending(rx) => rx.await.unwrap_or(Err(ThumbnailError::ShuttingDown)),
        }
    }
}

impl IntoFuture for Ticket {
    type Output = JobResult;
    type IntoFuture = Pin<Box<dyn Future<Output = JobResult> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

/// Summary of a batch pre-warm submission
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrewarmReport {
    pub requested: usize,
    /// Distinct, resolvable, supported paths
    pub valid: usize,
    pub already_cached: usize,
    pub queued: usize,
    pub skipped: usize,
}

/// Deduplicating, two-priority thumbnail engine.
///
/// Must be created inside a tokio runtime; workers are spawned immediately.
pub struct ThumbnailEngine {
    index: DirectoryIndex,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThumbnailEngine {
    pub fn new(
        index: DirectoryIndex,
        store: Arc<dyn ThumbnailStore>,
        generator: Arc<dyn Generator>,
        options: PoolOptions,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            generator,
            state: Mutex::new(SchedulerState::default()),
            work_ready: Notify::new(),
            job_timeout: options.job_timeout,
            stats: StatsRecorder::default(),
            cancel: CancellationToken::new(),
        });

        let worker_count = options.workers.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker_loop(Arc::clone(&shared), worker_id)))
            .collect();

        debug!("Thumbnail engine started with {worker_count} workers");
        Self {
            index,
            shared,
            workers,
        }
    }

    /// Build the index, store, generator and pool described by `config`
    pub fn from_config(config: &EngineConfig) -> Result<Self, SetupError> {
        let index = DirectoryIndex::new(&config.root, config.listing_order, config.skip_dirs.iter().cloned())?;
        let store = open_store(config)?;
        let generator = Arc::new(ImageGenerator::new(config.format, config.quality));

        Ok(Self::new(
            index,
            store,
            generator,
            PoolOptions {
                workers: config.workers,
                job_timeout: config.job_timeout(),
            },
        ))
    }

    pub fn index(&self) -> &DirectoryIndex {
        &self.index
    }

    pub fn store(&self) -> &Arc<dyn ThumbnailStore> {
        &self.shared.store
    }

    /// Build the key for a root-relative source path at its current
    /// modify time. Rejects paths outside the root and non-image files.
    pub fn key_for(&self, relative: impl AsRef<Path>, width: u32, height: u32) -> ThumbnailResult<ThumbnailKey> {
        let path = self.index.resolve(relative)?;

        let metadata = std::fs::metadata(&path).map_err(|_| ThumbnailError::NotFound(path.clone()))?;
        if !metadata.is_file() {
            return Err(ThumbnailError::NotFound(path));
        }
        if !is_supported_image(&path) {
            return Err(ThumbnailError::UnsupportedFormat(path));
        }

        ThumbnailKey::from_metadata(path.clone(), &metadata, width, height)
            .map_err(|_| ThumbnailError::NotFound(path))
    }

    /// Ask for a thumbnail without waiting.
    ///
    /// A cache hit resolves immediately and creates no job. Otherwise the
    /// caller joins the existing job for the key, escalating it if this
    /// request is interactive and the job is still queued as background,
    /// or a new job is queued at the caller's priority.
    ///
    /// The cache lookup runs on the calling thread and may read a payload
    /// file. From async code prefer [`ThumbnailEngine::request`].
    pub fn submit(&self, key: ThumbnailKey, priority: Priority) -> Ticket {
        if self.shared.cancel.is_cancelled() {
            return Ticket::ready(Err(ThumbnailError::ShuttingDown));
        }

        let cached = self.shared.store.get(&key);
        self.enqueue(key, priority, cached)
    }

    /// Ask for a thumbnail and wait for it.
    /// The cache lookup is done on the blocking pool.
    pub async fn request(&self, key: ThumbnailKey, priority: Priority) -> JobResult {
        if self.shared.cancel.is_cancelled() {
            return Err(ThumbnailError::ShuttingDown);
        }

        let store = Arc::clone(&self.shared.store);
        let lookup_key = key.clone();
        let cached = tokio::task::spawn_blocking(move || store.get(&lookup_key))
            .await
            .map_err(|e| ThumbnailError::WorkerLost(e.to_string()))?;

        self.enqueue(key, priority, cached).wait().await
    }

    /// Resolve a request given the outcome of its cache lookup
    fn enqueue(&self, key: ThumbnailKey, priority: Priority, cached: CacheResult<Option<CacheEntry>>) -> Ticket {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return Ticket::ready(Err(ThumbnailError::ShuttingDown));
        }

        match cached {
            Ok(Some(entry)) => {
                shared.stats.cache_hit();
                trace!("Cache hit for {key}");
                return Ticket::ready(Ok(entry.payload));
            }
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed for {key}, treating as miss: {e}"),
        }

        let (tx, rx) = oneshot::channel();
        let mut guard = shared.state.lock();
        let state = &mut *guard;

        if let Some(job) = state.jobs.get_mut(&key) {
            job.waiters.push(tx);
            shared.stats.deduplicated();

            if priority == Priority::Interactive && job.priority == Priority::Background {
                job.priority = Priority::Interactive;
                // Running jobs keep running; only queue position changes
                if job.state == JobState::Queued && state.queue.escalate(&key) {
                    shared.stats.escalated();
                    debug!("Escalated queued background job for {key}");
                }
            }
            return Ticket::pending(rx);
        }

        state.jobs.insert(
            key.clone(),
            Job {
                priority,
                state: JobState::Queued,
                waiters: vec![tx],
            },
        );
        debug!("Queued {priority:?} job for {key}");
        state.queue.push(key, priority);
        drop(guard);

        shared.work_ready.notify_one();
        Ticket::pending(rx)
    }

    /// Queue background generation for a batch of root-relative paths.
    ///
    /// Duplicates are collapsed and paths that cannot be keyed are skipped.
    /// Nothing is awaited; the returned report describes what was submitted.
    pub fn prewarm<I, P>(&self, paths: I, width: u32, height: u32) -> PrewarmReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = PrewarmReport::default();
        let mut seen = HashSet::new();

        for path in paths {
            report.requested += 1;
            let path = path.as_ref();
            if !seen.insert(path.to_path_buf()) {
                continue;
            }

            let key = match self.key_for(path, width, height) {
                Ok(key) => key,
                Err(e) => {
                    trace!("Skipping pre-warm of {}: {e}", path.display());
                    report.skipped += 1;
                    continue;
                }
            };

            report.valid += 1;
            if self.submit(key, Priority::Background).is_ready() {
                report.already_cached += 1;
            } else {
                report.queued += 1;
            }
        }

        debug!(
            "Pre-warm submitted: {} queued, {} cached, {} skipped",
            report.queued, report.already_cached, report.skipped
        );
        report
    }

    /// Pre-warm every supported image beneath a root-relative folder
    pub fn prewarm_folder(&self, relative: impl AsRef<Path>, width: u32, height: u32) -> ThumbnailResult<PrewarmReport> {
        let images = self.index.scan_images(relative)?;
        Ok(self.prewarm(images.iter().map(|image| image.relative.as_str()), width, height))
    }

    /// Drop queued background jobs whose source lies under `prefix`
    /// (an absolute path). Their waiters receive `Cancelled`. Running and
    /// interactive jobs are left alone. Returns the number of jobs dropped.
    pub fn cancel_background_under(&self, prefix: &Path) -> usize {
        let mut cancelled = Vec::new();
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let removed = state
                .queue
                .remove_background_where(|key| key.source_path.starts_with(prefix));
            for key in removed {
                if let Some(job) = state.jobs.remove(&key) {
                    cancelled.push(job);
                }
            }
        }

        let count = cancelled.len();
        for job in cancelled {
            for waiter in job.waiters {
                let _ = waiter.send(Err(ThumbnailError::Cancelled));
            }
        }

        if count > 0 {
            self.shared.stats.cancelled(count);
            debug!("Cancelled {count} background jobs under {}", prefix.display());
        }
        count
    }

    /// Source paths of every queued or running job, sorted
    pub fn pending_sources(&self) -> Vec<PathBuf> {
        let state = self.shared.state.lock();
        let mut sources: Vec<PathBuf> = state.jobs.keys().map(|key| key.source_path.clone()).collect();
        sources.sort();
        sources
    }

    pub fn stats(&self) -> EngineStats {
        let mut stats = self.shared.stats.snapshot();
        let state = self.shared.state.lock();
        stats.queued_interactive = state.queue.len(Priority::Interactive);
        stats.queued_background = state.queue.len(Priority::Background);
        stats.in_flight = state.jobs.len();
        stats
    }

    /// Stop the workers after their current job and fail everything still
    /// queued with `ShuttingDown`.
    pub async fn shutdown(mut self) {
        self.shared.cancel.cancel();

        for worker in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.await {
                error!("Thumbnail worker ended abnormally: {e}");
            }
        }

        let orphans: Vec<Job> = {
            let mut state = self.shared.state.lock();
            state.queue.drain_all();
            state.jobs.drain().map(|(_, job)| job).collect()
        };
        for job in orphans {
            for waiter in job.waiters {
                let _ = waiter.send(Err(ThumbnailError::ShuttingDown));
            }
        }

        debug!("Thumbnail engine stopped");
    }
}

impl Drop for ThumbnailEngine {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl Shared {
    /// Pop the next key and mark its job running.
    /// Keys whose job was cancelled while queued are skipped.
    fn next_job(&self) -> Option<(ThumbnailKey, Priority)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        while let Some((key, priority)) = state.queue.pop() {
            if let Some(job) = state.jobs.get_mut(&key) {
                job.state = JobState::Running;
                return Some((key, priority));
            }
        }
        None
    }

    /// Generate and cache one thumbnail.
    ///
    /// Returns `None` when the budget ran out. The current waiters have then
    /// been failed with `Timeout`, and the job stays registered until the
    /// abandoned task returns, so later requests for the key join it
    /// instead of starting a second generation.
    async fn run(self: &Arc<Self>, key: &ThumbnailKey) -> Option<JobResult> {
        let store = Arc::clone(&self.store);
        let generator = Arc::clone(&self.generator);
        let task_key = key.clone();

        let started = Instant::now();
        let mut task = tokio::task::spawn_blocking(move || generate_and_store(&*store, &*generator, &task_key));

        let result = match tokio::time::timeout(self.job_timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ThumbnailError::WorkerLost(join_error.to_string())),
            Err(_) => {
                self.stats.timed_out();
                self.stats.generation(started.elapsed(), false);
                warn!("Thumbnail generation for {key} exceeded {:?}", self.job_timeout);

                self.fail_waiters(
                    key,
                    ThumbnailError::Timeout {
                        path: key.source_path.clone(),
                        budget: self.job_timeout,
                    },
                );
                self.finish_abandoned(key.clone(), task);
                return None;
            }
        };

        match &result {
            Ok(GenerationOutcome::Generated(_)) => self.stats.generation(started.elapsed(), true),
            Ok(GenerationOutcome::AlreadyCached(_)) => self.stats.cache_hit(),
            Err(_) => self.stats.generation(started.elapsed(), false),
        }

        Some(result.map(GenerationOutcome::into_payload))
    }

    /// Fail everyone currently waiting on `key` but keep the job registered
    fn fail_waiters(&self, key: &ThumbnailKey, error: ThumbnailError) {
        let waiters = match self.state.lock().jobs.get_mut(key) {
            Some(job) => std::mem::take(&mut job.waiters),
            None => return,
        };

        for waiter in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Complete a timed-out job once its blocking task finally returns.
    /// The worker that started it is already free.
    fn finish_abandoned(self: &Arc<Self>, key: ThumbnailKey, task: JoinHandle<ThumbnailResult<GenerationOutcome>>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let result = match task.await {
                Ok(result) => result.map(GenerationOutcome::into_payload),
                Err(join_error) => Err(ThumbnailError::WorkerLost(join_error.to_string())),
            };
            trace!("Abandoned generation for {key} returned");
            shared.complete(&key, result);
        });
    }

    /// Hand the result to every waiter exactly once and forget the job
    fn complete(&self, key: &ThumbnailKey, result: JobResult) {
        let Some(job) = self.state.lock().jobs.remove(key) else {
            return;
        };

        match &result {
            Ok(payload) => debug!(
                "Finished {key} ({} bytes) for {} waiters",
                payload.len(),
                job.waiters.len()
            ),
            Err(e) => warn!("Thumbnail job failed for {key}: {e}"),
        }

        for waiter in job.waiters {
            // A dropped receiver just means that caller lost interest
            let _ = waiter.send(result.clone());
        }
    }
}

enum GenerationOutcome {
    Generated(Payload),
    AlreadyCached(Payload),
}

impl GenerationOutcome {
    fn into_payload(self) -> Payload {
        match self {
            GenerationOutcome::Generated(payload) | GenerationOutcome::AlreadyCached(payload) => payload,
        }
    }
}

/// Blocking body of one job: re-check the cache, generate, store.
fn generate_and_store(
    store: &dyn ThumbnailStore,
    generator: &dyn Generator,
    key: &ThumbnailKey,
) -> ThumbnailResult<GenerationOutcome> {
    // Another job for this key may have finished between the caller's
    // lookup and this job starting
    if let Ok(Some(entry)) = store.get(key) {
        return Ok(GenerationOutcome::AlreadyCached(entry.payload));
    }

    let bytes = generator.generate(&key.source_path, key.width, key.height)?;
    let payload: Payload = Arc::from(bytes);

    match store.put(key, Arc::clone(&payload)) {
        Ok(_) => {}
        Err(CacheError::WriteConflict { key: encoded }) => {
            error!("Cache write conflict for {encoded}; serving the fresh payload uncached");
        }
        Err(e) => warn!("Failed to cache thumbnail for {key}: {e}"),
    }

    Ok(GenerationOutcome::Generated(payload))
}

async fn worker_loop(shared: Arc<Shared>, worker_id: usize) {
    trace!("Thumbnail worker {worker_id} started");

    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let Some((key, priority)) = shared.next_job() else {
            // Idle until something is queued or the engine stops
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = shared.work_ready.notified() => {}
            }
            continue;
        };

        trace!("Worker {worker_id} running {priority:?} job for {key}");
        if let Some(result) = shared.run(&key).await {
            shared.complete(&key, result);
        }

        // Give the scheduler a chance to hand out newly arrived interactive
        // work before this worker takes another unit
        tokio::task::yield_now().await;
    }

    trace!("Thumbnail worker {worker_id} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SortOrder;
    use crate::thumbnail::store::{CacheUsage, MemoryStore, ReclaimReport};
    use crate::thumbnail::ImageGenerator;
    use parking_lot::Condvar;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Gate {
        open: bool,
        released: HashSet<String>,
    }

    /// Records calls and blocks every generation until released, either
    /// all at once or one source file name at a time
    struct GatedGenerator {
        calls: AtomicUsize,
        log: Mutex<Vec<String>>,
        started: mpsc::UnboundedSender<String>,
        gate: Mutex<Gate>,
        opened: Condvar,
    }

    impl GatedGenerator {
        fn new(open: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (started, started_rx) = mpsc::unbounded_channel();
            let generator = Arc::new(Self {
                calls: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
                started,
                gate: Mutex::new(Gate {
                    open,
                    ..Gate::default()
                }),
                opened: Condvar::new(),
            });
            (generator, started_rx)
        }

        fn release(&self) {
            self.gate.lock().open = true;
            self.opened.notify_all();
        }

        fn release_one(&self, name: &str) {
            self.gate.lock().released.insert(name.to_string());
            self.opened.notify_all();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl Generator for GatedGenerator {
        fn generate(&self, source: &Path, width: u32, height: u32) -> ThumbnailResult<Vec<u8>> {
            let name = source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(name.clone());
            let _ = self.started.send(name.clone());

            let mut gate = self.gate.lock();
            while !gate.open && !gate.released.contains(&name) {
                self.opened.wait(&mut gate);
            }

            Ok(format!("{}@{width}x{height}", source.display()).into_bytes())
        }
    }

    /// Sleeps on sources named "slow*", answers immediately otherwise
    struct SleepyGenerator;

    impl Generator for SleepyGenerator {
        fn generate(&self, source: &Path, _width: u32, _height: u32) -> ThumbnailResult<Vec<u8>> {
            let slow = source
                .file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("slow"));
            if slow {
                std::thread::sleep(Duration::from_secs(2));
            }
            Ok(b"done".to_vec())
        }
    }

    /// Memory store that remembers which threads performed lookups
    struct RecordingStore {
        inner: MemoryStore,
        lookup_threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThumbnailStore for RecordingStore {
        fn get(&self, key: &ThumbnailKey) -> CacheResult<Option<CacheEntry>> {
            self.lookup_threads.lock().push(std::thread::current().id());
            self.inner.get(key)
        }

        fn put(&self, key: &ThumbnailKey, payload: Payload) -> CacheResult<CacheEntry> {
            self.inner.put(key, payload)
        }

        fn usage(&self) -> CacheResult<CacheUsage> {
            self.inner.usage()
        }

        fn reclaim_stale(&self) -> CacheResult<ReclaimReport> {
            self.inner.reclaim_stale()
        }
    }

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, relative.as_bytes()).unwrap();
    }

    fn engine(root: &Path, generator: Arc<dyn Generator>, workers: usize, job_timeout: Duration) -> ThumbnailEngine {
        let index = DirectoryIndex::new(root, SortOrder::Descending, Vec::<String>::new()).unwrap();
        let store: Arc<dyn ThumbnailStore> = Arc::new(MemoryStore::new(1 << 20));
        ThumbnailEngine::new(index, store, generator, PoolOptions { workers, job_timeout })
    }

    fn key(engine: &ThumbnailEngine, relative: &str) -> ThumbnailKey {
        engine.key_for(relative, 64, 64).unwrap()
    }

    const LONG: Duration = Duration::from_secs(10);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_requests_share_one_generation() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 2, LONG);

        let k = key(&engine, "a.png");
        let tickets: Vec<Ticket> = (0..8)
            .map(|i| {
                let priority = if i % 2 == 0 { Priority::Interactive } else { Priority::Background };
                engine.submit(k.clone(), priority)
            })
            .collect();

        assert_eq!(started.recv().await.unwrap(), "a.png");
        generator.release();

        let mut payloads = Vec::new();
        for ticket in tickets {
            payloads.push(ticket.await.unwrap());
        }

        assert_eq!(generator.calls(), 1);
        assert!(payloads.windows(2).all(|pair| pair[0] == pair[1]));

        let stats = engine.stats();
        assert_eq!(stats.deduplicated, 7);
        assert_eq!(stats.generated, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interactive_work_overtakes_queued_background_work() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png", "c.png", "d.png"] {
            touch(dir.path(), name);
        }
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 1, LONG);

        let a = engine.submit(key(&engine, "a.png"), Priority::Background);
        assert_eq!(started.recv().await.unwrap(), "a.png");

        let b = engine.submit(key(&engine, "b.png"), Priority::Background);
        let c = engine.submit(key(&engine, "c.png"), Priority::Background);
        let d = engine.submit(key(&engine, "d.png"), Priority::Interactive);

        let stats = engine.stats();
        assert_eq!(stats.queued_background, 2);
        assert_eq!(stats.queued_interactive, 1);

        generator.release();
        for ticket in [a, b, c, d] {
            ticket.await.unwrap();
        }

        assert_eq!(generator.log(), ["a.png", "d.png", "b.png", "c.png"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interactive_work_overtakes_queued_background_work_with_two_workers() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "x.png", "b.png", "c.png", "d.png"] {
            touch(dir.path(), name);
        }
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 2, LONG);

        let a = engine.submit(key(&engine, "a.png"), Priority::Background);
        let x = engine.submit(key(&engine, "x.png"), Priority::Background);
        let mut running = vec![started.recv().await.unwrap(), started.recv().await.unwrap()];
        running.sort();
        assert_eq!(running, ["a.png", "x.png"]);

        let b = engine.submit(key(&engine, "b.png"), Priority::Background);
        let c = engine.submit(key(&engine, "c.png"), Priority::Background);
        let d = engine.submit(key(&engine, "d.png"), Priority::Interactive);

        // Free one worker at a time and watch what it picks up next
        generator.release_one("a.png");
        assert_eq!(started.recv().await.unwrap(), "d.png");
        generator.release_one("x.png");
        assert_eq!(started.recv().await.unwrap(), "b.png");
        generator.release();
        assert_eq!(started.recv().await.unwrap(), "c.png");

        for ticket in [a, x, b, c, d] {
            ticket.await.unwrap();
        }
        assert_eq!(generator.calls(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interactive_request_escalates_queued_background_job() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["x.png", "a.png", "k.png", "b.png"] {
            touch(dir.path(), name);
        }
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 1, LONG);

        let x = engine.submit(key(&engine, "x.png"), Priority::Background);
        assert_eq!(started.recv().await.unwrap(), "x.png");

        let a = engine.submit(key(&engine, "a.png"), Priority::Background);
        let k_background = engine.submit(key(&engine, "k.png"), Priority::Background);
        let b = engine.submit(key(&engine, "b.png"), Priority::Background);
        let k_interactive = engine.submit(key(&engine, "k.png"), Priority::Interactive);

        generator.release();
        let from_background = k_background.await.unwrap();
        let from_interactive = k_interactive.await.unwrap();
        for ticket in [x, a, b] {
            ticket.await.unwrap();
        }

        assert_eq!(from_background, from_interactive);
        assert_eq!(generator.log(), ["x.png", "k.png", "a.png", "b.png"]);

        let stats = engine.stats();
        assert_eq!(stats.escalations, 1);
        assert_eq!(stats.generated, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cached_result_is_served_without_generation() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        let (generator, _started) = GatedGenerator::new(true);
        let engine = engine(dir.path(), generator.clone(), 2, LONG);

        let first = engine.request(key(&engine, "a.png"), Priority::Interactive).await.unwrap();

        let ticket = engine.submit(key(&engine, "a.png"), Priority::Background);
        assert!(ticket.is_ready());
        let second = ticket.await.unwrap();

        assert_eq!(first, second);
        assert_eq!(generator.calls(), 1);
        assert_eq!(engine.stats().cache_hits, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn modified_source_is_generated_again() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        let (generator, _started) = GatedGenerator::new(true);
        let engine = engine(dir.path(), generator.clone(), 2, LONG);

        let before = key(&engine, "a.png");
        engine.request(before.clone(), Priority::Interactive).await.unwrap();

        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(dir.path().join("a.png"))
            .unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
            .unwrap();

        let after = key(&engine, "a.png");
        assert_ne!(before, after);
        engine.request(after, Priority::Interactive).await.unwrap();

        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn corrupt_source_fails_every_waiter_and_pool_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"definitely not a png").unwrap();
        image::RgbImage::new(40, 20).save(dir.path().join("fine.png")).unwrap();
        let engine = engine(dir.path(), Arc::new(ImageGenerator::default()), 1, LONG);

        let broken = key(&engine, "broken.png");
        let tickets: Vec<Ticket> = (0..3)
            .map(|_| engine.submit(broken.clone(), Priority::Interactive))
            .collect();
        for ticket in tickets {
            assert!(matches!(ticket.await, Err(ThumbnailError::Decode { .. })));
        }

        let payload = engine
            .request(engine.key_for("fine.png", 16, 16).unwrap(), Priority::Interactive)
            .await
            .unwrap();
        let thumb = image::load_from_memory(&payload).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (16, 8));

        let stats = engine.stats();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.generated, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_generation_times_out_without_stalling_the_pool() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "slow.png");
        touch(dir.path(), "quick.png");
        let engine = engine(dir.path(), Arc::new(SleepyGenerator), 1, Duration::from_millis(200));

        let slow = engine.request(key(&engine, "slow.png"), Priority::Interactive).await;
        assert!(matches!(slow, Err(ThumbnailError::Timeout { .. })));

        let quick = engine.request(key(&engine, "quick.png"), Priority::Interactive).await;
        assert_eq!(&*quick.unwrap(), b"done");
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn request_after_timeout_joins_the_abandoned_generation() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 1, Duration::from_millis(100));
        let k = key(&engine, "a.png");

        let first = engine.request(k.clone(), Priority::Interactive).await;
        assert!(matches!(first, Err(ThumbnailError::Timeout { .. })));
        assert_eq!(started.recv().await.unwrap(), "a.png");

        let retry = engine.submit(k.clone(), Priority::Interactive);
        assert!(!retry.is_ready());
        assert_eq!(engine.pending_sources(), vec![k.source_path.clone()]);

        generator.release();
        let payload = retry.await.unwrap();
        assert_eq!(generator.calls(), 1);

        // The late result was cached as well
        let cached = engine.submit(k, Priority::Background);
        assert!(cached.is_ready());
        assert_eq!(cached.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn request_looks_up_the_cache_off_the_async_thread() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        let store = Arc::new(RecordingStore {
            inner: MemoryStore::new(1 << 20),
            lookup_threads: Mutex::new(Vec::new()),
        });
        let index = DirectoryIndex::new(dir.path(), SortOrder::Descending, Vec::<String>::new()).unwrap();
        let (generator, _started) = GatedGenerator::new(true);
        let engine = ThumbnailEngine::new(
            index,
            store.clone(),
            generator.clone(),
            PoolOptions {
                workers: 1,
                job_timeout: LONG,
            },
        );

        let k = key(&engine, "a.png");
        store.inner.put(&k, Arc::from(b"cached".to_vec())).unwrap();

        let payload = engine.request(k, Priority::Interactive).await.unwrap();
        assert_eq!(&*payload, b"cached");
        assert_eq!(generator.calls(), 0);

        let async_thread = std::thread::current().id();
        let lookups = store.lookup_threads.lock().clone();
        assert_eq!(lookups.len(), 1);
        assert!(lookups.iter().all(|id| *id != async_thread));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_background_under_drops_only_queued_background_jobs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["other/x.png", "other/c.png", "sub/a.png", "sub/b.png", "sub/d.png"] {
            touch(dir.path(), name);
        }
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 1, LONG);

        let x = engine.submit(key(&engine, "other/x.png"), Priority::Background);
        assert_eq!(started.recv().await.unwrap(), "x.png");

        let a = engine.submit(key(&engine, "sub/a.png"), Priority::Background);
        let b = engine.submit(key(&engine, "sub/b.png"), Priority::Background);
        let c = engine.submit(key(&engine, "other/c.png"), Priority::Background);
        let d = engine.submit(key(&engine, "sub/d.png"), Priority::Interactive);

        let prefix = engine.index().root().join("sub");
        assert_eq!(engine.cancel_background_under(&prefix), 2);

        assert_eq!(a.await, Err(ThumbnailError::Cancelled));
        assert_eq!(b.await, Err(ThumbnailError::Cancelled));

        generator.release();
        for ticket in [x, c, d] {
            ticket.await.unwrap();
        }
        assert_eq!(generator.log(), ["x.png", "d.png", "c.png"]);
        assert_eq!(engine.stats().cancelled, 2);
    }

    #[tokio::test]
    async fn key_for_rejects_escapes_and_non_images() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes.txt");
        touch(dir.path(), "folder/a.png");
        let (generator, _started) = GatedGenerator::new(true);
        let engine = engine(dir.path(), generator, 1, LONG);

        assert!(matches!(
            engine.key_for("../outside.png", 64, 64),
            Err(ThumbnailError::InvalidPath(_))
        ));
        assert!(matches!(
            engine.key_for("notes.txt", 64, 64),
            Err(ThumbnailError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            engine.key_for("missing.png", 64, 64),
            Err(ThumbnailError::NotFound(_))
        ));
        assert!(matches!(
            engine.key_for("folder", 64, 64),
            Err(ThumbnailError::NotFound(_))
        ));

        let key = engine.key_for("/folder/a.png", 64, 32).unwrap();
        assert_eq!(key.source_path, engine.index().root().join("folder/a.png"));
        assert_eq!((key.width, key.height), (64, 32));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prewarm_reports_what_it_submitted() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.png");
        touch(dir.path(), "b.png");
        touch(dir.path(), "notes.txt");
        let (generator, _started) = GatedGenerator::new(true);
        let engine = engine(dir.path(), generator.clone(), 2, LONG);

        engine.request(key(&engine, "a.png"), Priority::Interactive).await.unwrap();

        let report = engine.prewarm(["a.png", "b.png", "b.png", "notes.txt", "missing.png"], 64, 64);
        assert_eq!(
            report,
            PrewarmReport {
                requested: 5,
                valid: 2,
                already_cached: 1,
                queued: 1,
                skipped: 2,
            }
        );

        // The queued job completes on its own; a later request finds it
        let b = key(&engine, "b.png");
        let _ = engine.request(b.clone(), Priority::Interactive).await.unwrap();
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_fails_queued_jobs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "x.png");
        touch(dir.path(), "y.png");
        let (generator, mut started) = GatedGenerator::new(false);
        let engine = engine(dir.path(), generator.clone(), 1, LONG);

        let x = engine.submit(key(&engine, "x.png"), Priority::Interactive);
        assert_eq!(started.recv().await.unwrap(), "x.png");
        let y = engine.submit(key(&engine, "y.png"), Priority::Background);

        tokio::join!(engine.shutdown(), async {
            tokio::task::yield_now().await;
            generator.release();
        });

        assert!(x.await.is_ok());
        assert_eq!(y.await, Err(ThumbnailError::ShuttingDown));
        assert_eq!(generator.log(), ["x.png"]);
    }
}
