//! Execution lanes
//!
//! Each lane is a worker thread draining an ordered queue, the host-side
//! stand-in for a device stream. Operations queued on one lane never block
//! another lane unless a [`CompletionToken`] dependency is declared.

use crate::token::CompletionToken;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};
use uniseq_types::{LaneKind, Result, UniseqError};

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum LaneItem {
    Task { label: &'static str, task: Task },
    Wait(CompletionToken),
    Record(CompletionToken),
    Flush(mpsc::SyncSender<Result<()>>),
}

/// Lane construction options
#[derive(Debug, Clone, Default)]
pub struct LaneOptions {
    /// Upper bound of a random delay inserted before every task
    ///
    /// Used to simulate variable completion timing; `None` runs tasks
    /// back to back.
    pub jitter: Option<Duration>,
    /// Seed of the jitter generator
    pub seed: u64,
}

impl LaneOptions {
    /// Options with randomized task timing
    pub fn jittered(jitter: Duration, seed: u64) -> Self {
        Self {
            jitter: Some(jitter),
            seed,
        }
    }
}

/// Operation counters for one lane
#[derive(Debug, Default)]
pub struct LaneStats {
    tasks: AtomicU64,
    waits: AtomicU64,
    records: AtomicU64,
    skipped: AtomicU64,
}

impl LaneStats {
    /// Tasks executed
    pub fn tasks(&self) -> u64 {
        self.tasks.load(Ordering::Relaxed)
    }

    /// Token waits retired
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    /// Tokens recorded
    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    /// Tasks and waits skipped because the lane was poisoned
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// An ordered execution lane backed by one worker thread
pub struct Lane {
    kind: LaneKind,
    sender: Option<mpsc::Sender<LaneItem>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<LaneStats>,
}

impl Lane {
    /// Start a lane worker
    pub fn spawn(kind: LaneKind, options: LaneOptions) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let stats = Arc::new(LaneStats::default());
        let jitter = options
            .jitter
            .map(|max| (max, StdRng::seed_from_u64(options.seed)));

        let worker = LaneWorker {
            kind,
            receiver,
            stats: Arc::clone(&stats),
            jitter,
            poisoned: None,
        };
        let handle = thread::Builder::new()
            .name(format!("uniseq-{}", kind))
            .spawn(move || worker.run())
            .map_err(|e| UniseqError::runtime(format!("failed to spawn {} lane: {}", kind, e)))?;

        debug!("Lane {} started", kind);
        Ok(Self {
            kind,
            sender: Some(sender),
            worker: Some(handle),
            stats,
        })
    }

    /// Lane identity
    pub fn kind(&self) -> LaneKind {
        self.kind
    }

    /// Operation counters
    pub fn stats(&self) -> &LaneStats {
        &self.stats
    }

    fn submit(&self, item: LaneItem) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| UniseqError::runtime(format!("{} lane is shut down", self.kind)))?;
        sender
            .send(item)
            .map_err(|_| UniseqError::runtime(format!("{} lane worker has stopped", self.kind)))
    }

    /// Queue a task; it runs after everything queued before it on this lane
    pub fn enqueue<F>(&self, label: &'static str, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit(LaneItem::Task {
            label,
            task: Box::new(task),
        })
    }

    /// Record a token that settles once all previously queued work retires
    pub fn record(&self) -> Result<CompletionToken> {
        let token = CompletionToken::recorded_on(self.kind);
        self.submit(LaneItem::Record(token.clone()))?;
        Ok(token)
    }

    /// Make every later operation on this lane wait for `token`
    ///
    /// Does not block the issuing thread.
    pub fn wait(&self, token: &CompletionToken) -> Result<()> {
        self.submit(LaneItem::Wait(token.clone()))
    }

    /// Block until every queued operation has retired
    ///
    /// Returns the first failure seen since the previous synchronization
    /// and clears it, so the lane is usable again afterwards.
    pub fn synchronize(&self) -> Result<()> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.submit(LaneItem::Flush(sender))?;
        receiver
            .recv()
            .map_err(|_| UniseqError::runtime(format!("{} lane worker has stopped", self.kind)))?
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.sender.take();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("Lane {} worker panicked during shutdown", self.kind);
            }
        }
        debug!("Lane {} stopped", self.kind);
    }
}

struct LaneWorker {
    kind: LaneKind,
    receiver: mpsc::Receiver<LaneItem>,
    stats: Arc<LaneStats>,
    jitter: Option<(Duration, StdRng)>,
    poisoned: Option<UniseqError>,
}

impl LaneWorker {
    fn run(mut self) {
        while let Ok(item) = self.receiver.recv() {
            match item {
                LaneItem::Task { label, task } => self.run_task(label, task),
                LaneItem::Wait(token) => self.wait(token),
                LaneItem::Record(token) => self.record(token),
                LaneItem::Flush(reply) => {
                    let result = match self.poisoned.take() {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                    // The issuer may have given up on the reply
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn run_task(&mut self, label: &'static str, task: Task) {
        if self.poisoned.is_some() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            trace!("Lane {} skipping {} after failure", self.kind, label);
            return;
        }

        if let Some((max, rng)) = self.jitter.as_mut() {
            let micros = rng.gen_range(0..=max.as_micros() as u64);
            thread::sleep(Duration::from_micros(micros));
        }

        trace!("Lane {} running {}", self.kind, label);
        let outcome = panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|_| {
            Err(UniseqError::runtime(format!(
                "task {} panicked on {} lane",
                label, self.kind
            )))
        });
        self.stats.tasks.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = outcome {
            warn!("Lane {} task {} failed: {}", self.kind, label, err);
            self.poisoned = Some(err);
        }
    }

    fn wait(&mut self, token: CompletionToken) {
        if self.poisoned.is_some() {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Err(err) = token.wait_blocking() {
            warn!(
                "Lane {} observed failed token {} from {:?}",
                self.kind,
                token.id(),
                token.origin()
            );
            self.poisoned = Some(err);
        }
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&mut self, token: CompletionToken) {
        match &self.poisoned {
            Some(err) => token.fail(err.clone()),
            None => token.signal(),
        }
        self.stats.records.fetch_add(1, Ordering::Relaxed);
    }
}

/// The three lanes of one worker process
///
/// Created once at worker startup and lent to every attention layer, so no
/// layer owns hidden global stream state.
pub struct LaneSet {
    input: Lane,
    compute: Lane,
    output: Lane,
}

impl LaneSet {
    /// Start all three lanes without jitter
    pub fn new() -> Result<Self> {
        Self::with_options(LaneOptions::default())
    }

    /// Start all three lanes; each lane derives its own jitter seed
    pub fn with_options(options: LaneOptions) -> Result<Self> {
        let spawn = |kind: LaneKind, offset: u64| {
            Lane::spawn(
                kind,
                LaneOptions {
                    jitter: options.jitter,
                    seed: options.seed.wrapping_mul(31).wrapping_add(offset),
                },
            )
        };
        Ok(Self {
            input: spawn(LaneKind::InputComm, 0)?,
            compute: spawn(LaneKind::Compute, 1)?,
            output: spawn(LaneKind::OutputComm, 2)?,
        })
    }

    /// Input-communication lane
    pub fn input(&self) -> &Lane {
        &self.input
    }

    /// Computation lane
    pub fn compute(&self) -> &Lane {
        &self.compute
    }

    /// Output-communication lane
    pub fn output(&self) -> &Lane {
        &self.output
    }

    /// Lane by identity
    pub fn lane(&self, kind: LaneKind) -> &Lane {
        match kind {
            LaneKind::InputComm => &self.input,
            LaneKind::Compute => &self.compute,
            LaneKind::OutputComm => &self.output,
        }
    }

    /// Synchronize every lane, returning the first failure
    ///
    /// All three lanes are flushed even when an earlier one reports an
    /// error.
    pub fn synchronize_all(&self) -> Result<()> {
        let mut first_err = None;
        for kind in LaneKind::ALL {
            if let Err(err) = self.lane(kind).synchronize() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
