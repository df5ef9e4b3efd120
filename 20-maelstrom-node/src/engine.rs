//! The message-processing engine.
//!
//! One decoder task feeds a bounded queue that a fixed pool of workers
//! drains. Each request is dispatched on its own task so a panicking or
//! stuck handler can be isolated; replies flow through a second queue into
//! the single writer loop that runs on the caller's task.
//!
//! ```text
//! input ─▶ decoder ─▶ [work queue] ─▶ worker × N ─▶ [reply queue] ─▶ writer ─▶ output
//! ```
//!
//! Replies are written in completion order. Consumers correlate them by
//! `in_reply_to`, never by position.
//!
//! The decoder keeps reading while the work queue is full, parking decoded
//! requests until there is room, so the end of input is always noticed and
//! the drain grace period starts even when every worker is stuck.

use std::collections::VecDeque;
use std::future::pending;
use std::io;
use std::num::NonZeroUsize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::{
    io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader},
    pin, select,
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle, JoinSet},
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::codec::{FrameReader, FrameWriter};
use crate::dispatch::Registry;
use crate::error::{DecodeError, DispatchError, EngineError};
use crate::identity::Identity;
use crate::message::{Body, Envelope, ErrorCode};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of an engine. Moves strictly forward and reaches `Stopped` once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// What to do with a request whose type has no registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum UnknownTypePolicy {
    /// Answer with a `not-supported` error reply.
    #[default]
    Reply,
    /// Log the request and send nothing back.
    Drop,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Capacity of both the work queue and the reply queue. Requests decoded
    /// while the work queue is full wait in the decoder.
    pub queue_capacity: usize,
    pub unknown_types: UnknownTypePolicy,
    /// How long in-flight requests may run once input is closed. `None` waits forever.
    pub drain_grace: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            unknown_types: UnknownTypePolicy::default(),
            drain_grace: Some(DEFAULT_DRAIN_GRACE),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config(
                "queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Counters reported when the engine stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Frames decoded into envelopes.
    pub received: u64,
    /// Success replies written.
    pub replied: u64,
    /// Error replies written, cancellations included.
    pub failed: u64,
    /// Unknown-type requests dropped by policy.
    pub dropped: u64,
    /// Frames skipped because they did not parse.
    pub malformed: u64,
    /// Requests answered with a timeout after the drain grace period.
    pub cancelled: u64,
}

#[derive(Default)]
struct Stats {
    received: AtomicU64,
    replied: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    cancelled: AtomicU64,
}

impl Stats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_written(&self, reply: &Envelope) {
        if reply.body.kind == "error" {
            Self::bump(&self.failed);
        } else {
            Self::bump(&self.replied);
        }
    }

    fn snapshot(&self) -> Summary {
        Summary {
            received: self.received.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    identity: Arc<Identity>,
    config: EngineConfig,
    phase: watch::Sender<Phase>,
}

impl Engine {
    pub fn new(registry: Registry, config: EngineConfig) -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            registry: Arc::new(registry),
            identity: Arc::new(Identity::new()),
            config,
            phase,
        }
    }

    /// The node identity this engine owns. Handlers see the same instance.
    pub fn identity(&self) -> Arc<Identity> {
        Arc::clone(&self.identity)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Processes `input` until it is closed and every accepted request has
    /// been answered, then closes `output`.
    ///
    /// Returns the first fatal error: a failed write, or a read error on
    /// `input` (reported after the in-flight work has drained).
    pub async fn run<R, W>(self, input: R, output: W) -> Result<Summary, EngineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        self.config.validate()?;
        let Engine {
            registry,
            identity,
            config,
            phase,
        } = self;

        let stats = Arc::new(Stats::default());
        let (work_tx, work_rx) = flume::bounded::<Envelope>(config.queue_capacity);
        let (reply_tx, mut reply_rx) = mpsc::channel::<Envelope>(config.queue_capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (closed_tx, mut input_closed) = oneshot::channel::<()>();

        phase.send_replace(Phase::Running);
        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "engine running"
        );

        let mut decoder = tokio::spawn(feed(
            FrameReader::new(BufReader::new(input)),
            work_tx,
            Arc::clone(&stats),
            closed_tx,
        ));

        let pool = Arc::new(Pool {
            registry,
            identity,
            policy: config.unknown_types,
            stats: Arc::clone(&stats),
        });
        let mut workers = JoinSet::new();
        for worker in 0..config.workers {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&pool),
                work_rx.clone(),
                reply_tx.clone(),
                cancel_rx.clone(),
            ));
        }
        // Workers hold the only remaining handles, so the reply queue closes
        // exactly when the last worker is done.
        drop(work_rx);
        drop(reply_tx);
        drop(cancel_rx);

        let mut writer = FrameWriter::new(output);
        let mut draining = false;
        let mut deadline: Option<Instant> = None;
        let mut cancelled = false;

        loop {
            select! {
                // An error here means the decoder is gone, which also closes the input.
                _ = &mut input_closed, if !draining => {
                    draining = true;
                    phase.send_replace(Phase::Draining);
                    info!("input closed, draining in-flight requests");
                    deadline = config.drain_grace.map(|grace| Instant::now() + grace);
                }
                () = expire(deadline), if !cancelled => {
                    warn!("drain grace period elapsed, cancelling in-flight requests");
                    cancelled = true;
                    cancel_tx.send_replace(true);
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if let Err(err) = writer.write(&reply).await {
                        decoder.abort();
                        workers.abort_all();
                        phase.send_replace(Phase::Stopped);
                        warn!(error = %err, "writing reply failed, stopping");
                        return Err(err.into());
                    }
                    stats.record_written(&reply);
                }
            }
        }

        if !draining {
            phase.send_replace(Phase::Draining);
        }
        let fed = flatten_feed(decoder.await);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "worker exited abnormally");
            }
        }

        let closed = writer.shutdown().await;
        phase.send_replace(Phase::Stopped);
        let summary = stats.snapshot();
        info!(?summary, "engine stopped");

        closed?;
        fed.map_err(EngineError::Input)?;
        Ok(summary)
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

fn flatten_feed(joined: Result<io::Result<()>, JoinError>) -> io::Result<()> {
    joined.unwrap_or_else(|err| Err(io::Error::other(err)))
}

/// Decoded requests on their way to the work queue.
struct Intake {
    backlog: VecDeque<Envelope>,
    open: bool,
    outcome: io::Result<()>,
    closed: Option<oneshot::Sender<()>>,
    stats: Arc<Stats>,
}

impl Intake {
    fn accept(&mut self, read: io::Result<Option<Result<Envelope, DecodeError>>>) {
        match read {
            Ok(Some(Ok(envelope))) => {
                Stats::bump(&self.stats.received);
                self.backlog.push_back(envelope);
            }
            Ok(Some(Err(err))) => {
                Stats::bump(&self.stats.malformed);
                warn!(line = err.line, frame = %err.frame, error = %err.source, "skipping malformed frame");
            }
            Ok(None) => self.close(Ok(())),
            Err(err) => self.close(Err(err)),
        }
    }

    fn close(&mut self, outcome: io::Result<()>) {
        self.open = false;
        self.outcome = outcome;
        if let Some(closed) = self.closed.take() {
            let _ = closed.send(());
        }
    }
}

/// Decodes frames in arrival order and hands envelopes to the workers.
///
/// Signals `closed` as soon as the input ends, then keeps running until
/// every decoded request has been queued.
async fn feed<R>(
    mut frames: FrameReader<R>,
    work: flume::Sender<Envelope>,
    stats: Arc<Stats>,
    closed: oneshot::Sender<()>,
) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut intake = Intake {
        backlog: VecDeque::new(),
        open: true,
        outcome: Ok(()),
        closed: Some(closed),
        stats,
    };

    loop {
        let Some(envelope) = intake.backlog.pop_front() else {
            if !intake.open {
                break;
            }
            let read = frames.next_frame().await;
            intake.accept(read);
            continue;
        };

        let sending = work.send_async(envelope);
        pin!(sending);
        loop {
            select! {
                sent = &mut sending => {
                    if sent.is_err() {
                        warn!(parked = intake.backlog.len(), "no workers left, stopping input");
                        return intake.outcome;
                    }
                    break;
                }
                read = frames.next_frame(), if intake.open => intake.accept(read),
            }
        }
    }
    debug!(lines = frames.lines_read(), "input exhausted");
    intake.outcome
}

/// State shared by all workers.
struct Pool {
    registry: Arc<Registry>,
    identity: Arc<Identity>,
    policy: UnknownTypePolicy,
    stats: Arc<Stats>,
}

type DispatchResult = Result<Option<Envelope>, DispatchError>;

/// A spawned dispatch that is aborted if its worker stops waiting for it.
struct InFlight(JoinHandle<DispatchResult>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_worker(
    worker: usize,
    pool: Arc<Pool>,
    work: flume::Receiver<Envelope>,
    replies: mpsc::Sender<Envelope>,
    mut cancel: watch::Receiver<bool>,
) {
    while let Ok(request) = work.recv_async().await {
        let Some(reply) = pool.process(worker, request, &mut cancel).await else {
            continue;
        };
        if replies.send(reply).await.is_err() {
            break;
        }
    }
    debug!(worker, "worker finished");
}

impl Pool {
    async fn process(
        &self,
        worker: usize,
        request: Envelope,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Envelope> {
        if *cancel.borrow() {
            return Some(self.cancelled(worker, &request));
        }

        let request = Arc::new(request);
        let mut in_flight = InFlight(tokio::spawn({
            let registry = Arc::clone(&self.registry);
            let identity = Arc::clone(&self.identity);
            let request = Arc::clone(&request);
            async move { registry.dispatch(&request, &identity).await }
        }));

        select! {
            joined = &mut in_flight.0 => self.settle(worker, &request, joined),
            () = cancellation(cancel) => Some(self.cancelled(worker, &request)),
        }
    }

    fn cancelled(&self, worker: usize, request: &Envelope) -> Envelope {
        Stats::bump(&self.stats.cancelled);
        warn!(
            worker,
            msg_type = %request.body.kind,
            msg_id = ?request.body.msg_id,
            "cancelling request unfinished after drain grace period"
        );
        self.error_reply(
            request,
            ErrorCode::Timeout,
            "request cancelled: node shut down before it completed",
        )
    }

    fn settle(
        &self,
        worker: usize,
        request: &Envelope,
        joined: Result<DispatchResult, JoinError>,
    ) -> Option<Envelope> {
        match joined {
            Ok(Ok(reply)) => reply,
            Ok(Err(DispatchError::UnknownType { tag })) if self.policy == UnknownTypePolicy::Drop => {
                Stats::bump(&self.stats.dropped);
                warn!(worker, msg_type = %tag, src = %request.src, "dropping request of unknown type");
                None
            }
            Ok(Err(err)) => {
                debug!(worker, msg_type = %request.body.kind, code = %err.code(), error = %err, "request failed");
                Some(self.error_reply(request, err.code(), err.to_string()))
            }
            Err(err) => {
                warn!(worker, msg_type = %request.body.kind, error = %err, "handler crashed");
                Some(self.error_reply(
                    request,
                    ErrorCode::Crash,
                    format!("handler crashed: {err}"),
                ))
            }
        }
    }

    fn error_reply(&self, request: &Envelope, code: ErrorCode, text: impl Into<String>) -> Envelope {
        self.identity.reply(request, Body::error(code, text))
    }
}

/// Resolves once the engine asks in-flight requests to stop.
async fn cancellation(cancel: &mut watch::Receiver<bool>) {
    let signalled = cancel.wait_for(|cancelled| *cancelled).await.is_ok();
    if !signalled {
        // Sender gone: the engine has stopped and nothing will cancel us.
        pending::<()>().await;
    }
}
