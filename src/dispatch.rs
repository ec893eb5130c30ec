//! # Range Dispatcher
//!
//! Splits a file into byte ranges, fetches them concurrently across the
//! reachable edges, and streams the reassembled bytes in file order while
//! ranges complete out of order.
//!
//! ```text
//! ┌────────┐  permits   ┌─────────┐  responses  ┌────────┐
//! │  main  │──────────► │ fetcher │───────────► │ writer │──► pipe ──► reader
//! │  loop  │ ◄──────────│  tasks  │             └────────┘
//! └────┬───┘  returned  └─────────┘
//!      │
//!   job queue (front-push retries)
//! ```
//!
//! ## Ordering guarantee
//!
//! The consumer observes a strictly in-order byte stream because the pipe is
//! positional: the writer places each response at its absolute offset and
//! the reader only advances over the contiguously written prefix.
//!
//! ## Retry policy
//!
//! A failed or short fetch re-enters the queue at the front with its retry
//! count bumped, up to three times; after that the job cycles to the back.
//! Once every reachable edge has had three shots at the same range the
//! download is abandoned with a range-fetch error.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocols::RangeSource;

/// Length of the priming request used to learn the file size.
const PRIMING_RANGE_LEN: u64 = 1024;

/// Per-job retry budget before the job cycles to the back of the queue.
const MAX_RETRY: u32 = 3;

/// Response channel capacity. One slot is enough because the writer drains
/// eagerly; fetchers block here when the writer lags, which is the intended
/// backpressure.
const RESPONSE_CHANNEL_CAPACITY: usize = 1;

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation shared by the reader handle, the writer, and
/// every fetcher. Cancelling is idempotent.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking, so a cancel between the check and
            // the await cannot be missed.
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Job queue
// ============================================================================

#[derive(Clone, Debug)]
struct Job {
    index: u64,
    start: u64,
    end: u64,
    /// Bounded retry counter, never exceeds `MAX_RETRY`.
    retry: u32,
    /// Total failures, including those past the retry budget.
    failures: u32,
}

/// FIFO work queue with front-push for retries. `notify` stores a wakeup
/// permit so a push just before a waiter registers is never lost.
#[derive(Default)]
struct JobQueue {
    inner: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl JobQueue {
    fn push_back(&self, job: Job) {
        self.inner.lock().expect("queue poisoned").push_back(job);
        self.notify.notify_one();
    }

    fn push_front(&self, job: Job) {
        self.inner.lock().expect("queue poisoned").push_front(job);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Job> {
        self.inner.lock().expect("queue poisoned").pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

// ============================================================================
// Positional pipe
// ============================================================================

struct PipeState {
    /// Completed segments above the contiguous frontier, keyed by offset.
    pending: BTreeMap<u64, Bytes>,
    /// Contiguous segments not yet consumed by the reader.
    ready: VecDeque<Bytes>,
    /// End of the contiguous prefix written so far.
    frontier: u64,
    /// Monotone count of bytes accepted, contiguous or not.
    written: u64,
    /// Set once: `Ok` for clean EOF, `Err` carries the failure message.
    closed: Option<std::result::Result<(), String>>,
    waker: Option<Waker>,
}

struct PipeShared {
    state: Mutex<PipeState>,
}

/// Writer half: positional writes plus a single close.
#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Place `data` at absolute `offset`. Returns the monotone byte count
    /// after this write.
    pub fn write_at(&self, offset: u64, data: Bytes) -> Result<u64> {
        let mut guard = self.shared.state.lock().expect("pipe poisoned");
        let state = &mut *guard;
        if state.closed.is_some() {
            return Err(Error::PipeWrite("pipe already closed".to_string()));
        }

        state.written += data.len() as u64;
        state.pending.insert(offset, data);

        // Fold freshly contiguous segments into the readable queue.
        while let Some(segment) = state.pending.remove(&state.frontier) {
            state.frontier += segment.len() as u64;
            state.ready.push_back(segment);
        }

        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
        Ok(state.written)
    }

    /// Close the pipe. The first close wins; later calls are no-ops.
    pub fn close(&self, result: std::result::Result<(), Error>) {
        let mut state = self.shared.state.lock().expect("pipe poisoned");
        if state.closed.is_none() {
            state.closed = Some(result.map_err(|e| e.to_string()));
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }
}

/// Reader half: an in-order byte stream over the contiguously written
/// prefix. Dropping the reader cancels the download.
pub struct FileReader {
    shared: Arc<PipeShared>,
    cancel: CancelToken,
}

impl FileReader {
    /// Abort the download without dropping the reader.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock().expect("pipe poisoned");

        if let Some(front) = state.ready.front_mut() {
            let take = front.len().min(buf.remaining());
            buf.put_slice(&front.split_to(take));
            if front.is_empty() {
                state.ready.pop_front();
            }
            return Poll::Ready(Ok(()));
        }

        match &state.closed {
            Some(Ok(())) => Poll::Ready(Ok(())),
            Some(Err(msg)) => Poll::Ready(Err(io::Error::other(msg.clone()))),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn pipe(cancel: CancelToken) -> (PipeWriter, FileReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            frontier: 0,
            written: 0,
            closed: None,
            waker: None,
        }),
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        FileReader { shared, cancel },
    )
}

// ============================================================================
// Dispatcher
// ============================================================================

struct RangeResponse {
    offset: u64,
    data: Bytes,
}

#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions {
    pub range_size: u64,
    pub concurrency: usize,
    /// Reachable edge count; bounds escalation and caps the worker pool.
    pub edges: usize,
}

pub struct Dispatcher<S> {
    source: Arc<S>,
    cid: String,
    opts: DispatchOptions,
    cancel: CancelToken,
}

/// Marker passed through the permit channel; the id only shows up in logs.
#[derive(Clone, Copy, Debug)]
struct WorkerPermit {
    id: usize,
}

impl<S: RangeSource> Dispatcher<S> {
    pub fn new(source: Arc<S>, cid: impl Into<String>, opts: DispatchOptions) -> Self {
        Self {
            source,
            cid: cid.into(),
            opts,
            cancel: CancelToken::new(),
        }
    }

    /// Prime the download, spawn the pipeline, and hand back the stream.
    ///
    /// Returns the total file size and an in-order reader. Errors from the
    /// priming fetch surface here; later failures surface as reader errors.
    pub async fn run(self) -> Result<(u64, FileReader)> {
        let priming = self
            .source
            .fetch_range(&self.cid, 0, PRIMING_RANGE_LEN)
            .await?;
        let file_size = priming.total;
        debug!(cid = %self.cid, file_size, "priming fetch complete");

        let queue = Arc::new(JobQueue::default());
        let job_count = file_size.div_ceil(self.opts.range_size);
        for index in 0..job_count {
            let start = index * self.opts.range_size;
            let end = (start + self.opts.range_size).min(file_size);
            queue.push_back(Job {
                index,
                start,
                end,
                retry: 0,
                failures: 0,
            });
        }

        let workers = self.opts.concurrency.min(self.opts.edges.max(1));
        let (permit_tx, permit_rx) = mpsc::channel(workers);
        for id in 0..workers {
            permit_tx
                .send(WorkerPermit { id })
                .await
                .expect("permit channel capacity");
        }

        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let (pipe_writer, reader) = pipe(self.cancel.clone());

        tokio::spawn(write_responses(
            resp_rx,
            pipe_writer.clone(),
            file_size,
            self.source.clone(),
            self.cancel.clone(),
        ));

        tokio::spawn(dispatch_jobs(
            self.source,
            self.cid,
            queue,
            permit_tx,
            permit_rx,
            resp_tx,
            pipe_writer,
            self.cancel,
            self.opts.edges.max(1),
        ));

        Ok((file_size, reader))
    }
}

/// Writer task: positional writes in completion order, EOF when the monotone
/// byte count reaches the file size. Flushes the ledger exactly once on both
/// the completion and cancellation paths.
async fn write_responses<S: RangeSource>(
    mut resp_rx: mpsc::Receiver<RangeResponse>,
    writer: PipeWriter,
    file_size: u64,
    source: Arc<S>,
    cancel: CancelToken,
) {
    let mut count = 0u64;

    while count < file_size {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("download cancelled, flushing reports");
                source.end_of_file().await;
                writer.close(Err(Error::Cancelled));
                return;
            }
            resp = resp_rx.recv() => {
                let Some(resp) = resp else {
                    source.end_of_file().await;
                    writer.close(Err(Error::fetch("dispatcher stopped early")));
                    return;
                };
                let len = resp.data.len() as u64;
                match writer.write_at(resp.offset, resp.data) {
                    Ok(_) => count += len,
                    Err(e) => {
                        warn!(error = %e, "positional write failed");
                        source.end_of_file().await;
                        writer.close(Err(e));
                        return;
                    }
                }
            }
        }
    }

    source.end_of_file().await;
    writer.close(Ok(()));
    cancel.cancel();
}

/// Main loop: pair each permit with a job and spawn a fetcher for it.
#[allow(clippy::too_many_arguments)]
async fn dispatch_jobs<S: RangeSource>(
    source: Arc<S>,
    cid: String,
    queue: Arc<JobQueue>,
    permit_tx: mpsc::Sender<WorkerPermit>,
    mut permit_rx: mpsc::Receiver<WorkerPermit>,
    resp_tx: mpsc::Sender<RangeResponse>,
    pipe_writer: PipeWriter,
    cancel: CancelToken,
    edge_count: usize,
) {
    'main: loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break 'main,
            permit = permit_rx.recv() => match permit {
                Some(p) => p,
                None => break 'main,
            },
        };

        // An empty queue does not mean done: in-flight jobs may requeue.
        // The writer cancels when the byte count completes.
        let job = loop {
            if let Some(job) = queue.pop() {
                break job;
            }
            tokio::select! {
                _ = cancel.cancelled() => break 'main,
                _ = queue.wait() => {}
            }
        };

        let source = source.clone();
        let cid = cid.clone();
        let queue = queue.clone();
        let permit_tx = permit_tx.clone();
        let resp_tx = resp_tx.clone();
        let pipe_writer = pipe_writer.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            fetch_one(
                &source,
                &cid,
                job,
                permit,
                &queue,
                &permit_tx,
                &resp_tx,
                &pipe_writer,
                &cancel,
                edge_count,
            )
            .await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_one<S: RangeSource>(
    source: &Arc<S>,
    cid: &str,
    mut job: Job,
    permit: WorkerPermit,
    queue: &Arc<JobQueue>,
    permit_tx: &mpsc::Sender<WorkerPermit>,
    resp_tx: &mpsc::Sender<RangeResponse>,
    pipe_writer: &PipeWriter,
    cancel: &CancelToken,
    edge_count: usize,
) {
    let want = (job.end - job.start) as usize;

    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        result = source.fetch_range(cid, job.start, job.end) => result,
    };

    match outcome {
        Ok(chunk) if chunk.data.len() >= want => {
            let data = chunk.data.slice(..want);
            // Response first, permit after: a lagging writer backpressures
            // the pool instead of letting it spin on new jobs.
            let _ = resp_tx
                .send(RangeResponse {
                    offset: job.start,
                    data,
                })
                .await;
            let _ = permit_tx.send(permit).await;
        }
        Ok(chunk) => {
            debug!(
                index = job.index,
                want,
                got = chunk.data.len(),
                "short read"
            );
            requeue(job_failed(&mut job), queue, pipe_writer, cancel, edge_count);
            let _ = permit_tx.send(permit).await;
        }
        Err(e) => {
            warn!(
                worker = permit.id,
                index = job.index,
                start = job.start,
                end = job.end,
                retry = job.retry + 1,
                error = %e,
                "range fetch failed"
            );
            requeue(job_failed(&mut job), queue, pipe_writer, cancel, edge_count);
            let _ = permit_tx.send(permit).await;
        }
    }
}

fn job_failed(job: &mut Job) -> Job {
    job.failures += 1;
    job.retry = job.failures.min(MAX_RETRY);
    job.clone()
}

/// Put a failed job back. Fresh failures go to the front so the gap closes
/// quickly; exhausted jobs rotate to the back. Once every edge has had the
/// full retry budget, abandon the download.
fn requeue(
    job: Job,
    queue: &Arc<JobQueue>,
    pipe_writer: &PipeWriter,
    cancel: &CancelToken,
    edge_count: usize,
) {
    if job.failures >= MAX_RETRY * edge_count as u32 {
        warn!(
            index = job.index,
            failures = job.failures,
            "range rejected by all reachable edges, abandoning download"
        );
        pipe_writer.close(Err(Error::fetch(format!(
            "range [{}, {}) failed {} times",
            job.start, job.end, job.failures
        ))));
        cancel.cancel();
        return;
    }

    if job.failures < MAX_RETRY {
        queue.push_front(job);
    } else {
        queue.push_back(job);
    }
}
