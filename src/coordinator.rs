//! Transfer coordination
//!
//! One coordinator task owns all mutable state of a session: segments,
//! endpoint health and the session state machine. Segment workers run in a
//! bounded `JoinSet` and report back over a channel, so completions and
//! failures are applied one at a time.
//!
//! ```text
//! planning -> running -> completed
//!                |  ^
//!                v  |
//!             paused  ---> failed (cancel)
//! ```

use crate::config::EngineConfig;
use crate::endpoint::{EndpointPool, SourceEndpoint};
use crate::error::{EngineError, Result};
use crate::fetch::SegmentFetcher;
use crate::planner;
use crate::progress::ProgressReporter;
use crate::protocol::{
    ByteRange, ContentDescriptor, EndpointHealth, ExpectedChecksum, ProgressEvent,
    SegmentChecksums, SessionId, SessionState, TransferEvent, TransferOutcome,
};
use crate::storage::{Reassembler, ResumeStore, Segment, SegmentState};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Reason recorded in the session state after a cancel
pub const CANCELLED_REASON: &str = "cancelled";

/// Commands from a handle to its coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Resume,
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    pub state: SessionState,
    pub progress: ProgressEvent,
    pub segments: Vec<Segment>,
    pub endpoints: Vec<SourceEndpoint>,
}

/// Handle to a running session
///
/// Cloning is cheap; all clones control the same session.
#[derive(Clone)]
pub struct TransferHandle {
    id: SessionId,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    outcome: watch::Receiver<Option<TransferOutcome>>,
}

impl TransferHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Stop dispatching and interrupt in-flight fetches; verified work is kept
    pub fn pause(&self) -> Result<()> {
        self.command("pause", Command::Pause)
    }

    /// Continue a paused session
    pub fn resume(&self) -> Result<()> {
        self.command("resume", Command::Resume)
    }

    /// Cancel the session
    ///
    /// Idempotent. In-flight fetches get the configured grace period to stop
    /// before they are aborted; the resume ledger is preserved.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.read().state.clone()
    }

    pub fn progress(&self) -> ProgressEvent {
        self.snapshot.read().progress.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Wait for the session to end
    pub async fn wait(&self) -> TransferOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(|o| o.is_some()).await {
            Ok(value) => match value.as_ref() {
                Some(outcome) => outcome.clone(),
                None => lost_outcome(),
            },
            Err(_) => lost_outcome(),
        };
        result
    }

    fn command(&self, action: &'static str, command: Command) -> Result<()> {
        let state = self.state();
        if state.is_finished() || self.cancel.is_cancelled() {
            return Err(EngineError::InvalidState {
                action,
                current_state: state.to_string(),
            });
        }
        self.commands
            .send(command)
            .map_err(|_| EngineError::InvalidState {
                action,
                current_state: "stopped".to_string(),
            })
    }
}

fn lost_outcome() -> TransferOutcome {
    TransferOutcome::Failed {
        reason: "session task ended without an outcome".to_string(),
        failed_ranges: Vec::new(),
    }
}

/// Everything needed to run one session
pub(crate) struct SessionSetup {
    pub config: Arc<EngineConfig>,
    pub descriptor: ContentDescriptor,
    pub endpoints: Vec<String>,
    pub checksum: Option<ExpectedChecksum>,
    pub supports_ranges: bool,
    pub fetcher: SegmentFetcher,
    pub store: Arc<dyn ResumeStore>,
    pub events: broadcast::Sender<TransferEvent>,
}

/// Start a session and return its handle
pub(crate) fn spawn(setup: SessionSetup) -> TransferHandle {
    let id = SessionId::new();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = watch::channel(None);
    let cancel = CancellationToken::new();

    let pool = EndpointPool::new(
        setup.endpoints.iter().cloned(),
        setup.config.endpoint_failure_threshold,
    );
    let snapshot = Arc::new(RwLock::new(SessionSnapshot {
        id,
        name: setup.descriptor.name.clone(),
        state: SessionState::Planning,
        progress: ProgressEvent {
            total_size: setup.descriptor.total_size,
            ..Default::default()
        },
        segments: Vec::new(),
        endpoints: pool.snapshot(),
    }));

    let coordinator = Coordinator {
        id,
        progress: Arc::new(ProgressReporter::new(
            id,
            setup.descriptor.total_size,
            setup.events.clone(),
        )),
        pool,
        setup,
        state: SessionState::Planning,
        segments: Vec::new(),
        commands: commands_rx,
        cancel: cancel.clone(),
        snapshot: Arc::clone(&snapshot),
    };

    let span = tracing::info_span!("session", id = %id);
    tokio::spawn(
        async move {
            let outcome = coordinator.run().await;
            let _ = outcome_tx.send(Some(outcome));
        }
        .instrument(span),
    );

    TransferHandle {
        id,
        commands: commands_tx,
        cancel,
        snapshot,
        outcome: outcome_rx,
    }
}

/// Result of one worker run
struct WorkerDone {
    range: ByteRange,
    bytes: u64,
}

struct Report {
    index: usize,
    endpoint: usize,
    elapsed: Duration,
    result: std::result::Result<WorkerDone, Failure>,
}

/// Sends the worker's report exactly once, even if the task panics or is aborted
struct ReportGuard {
    tx: mpsc::UnboundedSender<Report>,
    index: usize,
    endpoint: usize,
    started: Instant,
    sent: bool,
}

impl ReportGuard {
    fn finish(mut self, result: std::result::Result<WorkerDone, Failure>) {
        self.sent = true;
        let _ = self.tx.send(Report {
            index: self.index,
            endpoint: self.endpoint,
            elapsed: self.started.elapsed(),
            result,
        });
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Report {
                index: self.index,
                endpoint: self.endpoint,
                elapsed: self.started.elapsed(),
                result: Err(Failure::Source(EngineError::Cancelled)),
            });
        }
    }
}

/// Where a worker failure came from
#[derive(Debug)]
enum Failure {
    /// The endpoint or the transfer itself
    Source(EngineError),
    /// The part file or the resume ledger
    Local(EngineError),
}

impl Failure {
    /// Fetch errors are the endpoint's, except writes into the part file
    fn from_fetch(error: EngineError) -> Self {
        match error {
            EngineError::Storage { .. } => Failure::Local(error),
            other => Failure::Source(other),
        }
    }
}

/// Shared by all workers of a session
struct WorkerContext {
    reassembler: Reassembler,
    fetcher: SegmentFetcher,
    checksums: Option<SegmentChecksums>,
    progress: Arc<ProgressReporter>,
}

async fn run_worker(
    ctx: Arc<WorkerContext>,
    segment: Segment,
    endpoint: SourceEndpoint,
    cancel: CancellationToken,
    guard: ReportGuard,
) {
    let result = async {
        let mut writer = ctx
            .reassembler
            .writer(&segment)
            .await
            .map_err(Failure::Local)?;
        let progress = Arc::clone(&ctx.progress);
        let bytes = ctx
            .fetcher
            .fetch(
                &segment,
                &endpoint,
                ctx.checksums.as_ref(),
                &mut writer,
                &cancel,
                move |delta| progress.record(delta),
            )
            .await
            .map_err(Failure::from_fetch)?;
        // Fetched bytes are worth keeping even if a pause or cancel raced in
        let range = ctx
            .reassembler
            .commit(writer, segment.index)
            .await
            .map_err(Failure::Local)?;
        Ok::<_, Failure>(WorkerDone { range, bytes })
    }
    .await;
    guard.finish(result);
}

struct Coordinator {
    id: SessionId,
    setup: SessionSetup,
    state: SessionState,
    segments: Vec<Segment>,
    pool: EndpointPool,
    progress: Arc<ProgressReporter>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

/// How the main loop ended
enum Finish {
    AllVerified,
    Cancelled,
    Failed(EngineError),
}

impl Coordinator {
    async fn run(mut self) -> TransferOutcome {
        let ctx = match self.prepare().await {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                let failed = self.unverified_ranges();
                return self.fail(e, failed);
            }
        };

        match self.run_segments(&ctx).await {
            Finish::AllVerified => self.complete(&ctx).await,
            Finish::Cancelled => {
                let verified_ranges = ctx.reassembler.verified_ranges().await;
                tracing::info!(
                    "Session cancelled with {} verified segment(s) kept",
                    verified_ranges.len()
                );
                self.set_state(SessionState::Failed {
                    reason: CANCELLED_REASON.to_string(),
                });
                let _ = self.setup.events.send(TransferEvent::Cancelled { id: self.id });
                self.publish();
                TransferOutcome::Cancelled { verified_ranges }
            }
            Finish::Failed(e) => {
                let failed = match e {
                    EngineError::NoHealthyEndpoints { ref failed_ranges } => failed_ranges.clone(),
                    _ => self.unverified_ranges(),
                };
                self.fail(e, failed)
            }
        }
    }

    /// Plan, open the output and restore verified segments
    async fn prepare(&mut self) -> Result<WorkerContext> {
        let descriptor = self.setup.descriptor.clone();
        let planned =
            planner::plan_for(&descriptor, &self.setup.config, self.setup.supports_ranges)?;
        self.segments = planned.clone();

        let (reassembler, mut segments) = Reassembler::open(
            &self.setup.config.output_dir,
            descriptor.clone(),
            planned,
            Arc::clone(&self.setup.store),
        )
        .await?;

        let verified_bytes: u64 = segments
            .iter()
            .filter(|s| s.is_verified())
            .filter_map(|s| s.len())
            .sum();
        self.progress.set_baseline(verified_bytes);

        if self.pool.is_empty() && segments.iter().any(|s| !s.is_verified()) {
            self.segments = segments;
            return Err(EngineError::NoHealthyEndpoints {
                failed_ranges: self.unverified_ranges(),
            });
        }

        planner::assign(&mut segments, &self.pool);
        self.segments = segments;
        tracing::info!(
            "Planned {} segment(s) for {} over {} endpoint(s)",
            self.segments.len(),
            descriptor.name,
            self.pool.len()
        );

        Ok(WorkerContext {
            reassembler,
            fetcher: self.setup.fetcher.clone(),
            checksums: descriptor.checksums.clone(),
            progress: Arc::clone(&self.progress),
        })
    }

    async fn run_segments(&mut self, ctx: &Arc<WorkerContext>) -> Finish {
        let (report_tx, mut reports) = mpsc::unbounded_channel::<Report>();
        let mut workers = JoinSet::new();
        let mut epoch = self.cancel.child_token();
        let mut in_flight = 0usize;
        let mut paused = false;
        let mut deadline: Option<Instant> = None;

        self.set_state(SessionState::Running);

        loop {
            if self.cancel.is_cancelled() {
                if in_flight == 0 {
                    return Finish::Cancelled;
                }
            } else if !paused {
                in_flight += self.dispatch(ctx, &mut workers, &report_tx, &epoch);
            }
            self.publish_counts(in_flight);

            if in_flight == 0 && !self.cancel.is_cancelled() {
                if self.segments.iter().all(|s| s.is_verified()) {
                    return Finish::AllVerified;
                }
                if !paused && !self.has_pending() {
                    return Finish::Failed(self.stuck_error());
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if deadline.is_none() => {
                    let grace = self.setup.config.cancel_grace_duration();
                    tracing::info!("Cancel requested, waiting up to {:?} for {} fetch(es)", grace, in_flight);
                    deadline = Some(Instant::now() + grace);
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::warn!("Aborting {} fetch(es) after the cancel grace period", in_flight);
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    return Finish::Cancelled;
                }
                Some(command) = self.commands.recv() => {
                    match command {
                        Command::Pause if !paused && !self.cancel.is_cancelled() => {
                            paused = true;
                            epoch.cancel();
                            self.set_state(SessionState::Paused);
                        }
                        Command::Resume if paused && !self.cancel.is_cancelled() => {
                            paused = false;
                            epoch = self.cancel.child_token();
                            self.set_state(SessionState::Running);
                        }
                        other => tracing::debug!("Ignoring {:?} while {}", other, self.state),
                    }
                }
                Some(report) = reports.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    if let Some(error) = self.apply_report(report) {
                        tracing::error!("Stopping session after a local storage failure: {}", error);
                        epoch.cancel();
                        workers.abort_all();
                        while workers.join_next().await.is_some() {}
                        return Finish::Failed(error);
                    }
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Segment worker panicked: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Start workers for pending segments up to the concurrency limit
    fn dispatch(
        &mut self,
        ctx: &Arc<WorkerContext>,
        workers: &mut JoinSet<()>,
        report_tx: &mpsc::UnboundedSender<Report>,
        epoch: &CancellationToken,
    ) -> usize {
        let limit = self.setup.config.concurrency.max(1);
        let mut started = 0;
        let busy = self
            .segments
            .iter()
            .filter(|s| s.state == SegmentState::InFlight)
            .count();

        for i in 0..self.segments.len() {
            if busy + started >= limit {
                break;
            }
            let segment = &mut self.segments[i];
            if segment.state != SegmentState::Pending {
                continue;
            }

            let endpoint = segment
                .endpoint
                .filter(|&e| self.pool.is_usable(e))
                .or_else(|| self.pool.best_excluding(&segment.excluded));
            let Some(endpoint) = endpoint else {
                tracing::warn!("No usable endpoint left for segment {}", segment.index);
                segment.state = SegmentState::Failed {
                    error: "no usable endpoint".to_string(),
                };
                continue;
            };
            let Some(snapshot) = self.pool.get(endpoint).cloned() else {
                continue;
            };

            segment.state = SegmentState::InFlight;
            segment.endpoint = Some(endpoint);
            tracing::debug!(
                "Dispatching segment {} {} to {}",
                segment.index,
                segment.range(),
                snapshot.uri
            );

            let guard = ReportGuard {
                tx: report_tx.clone(),
                index: segment.index,
                endpoint,
                started: Instant::now(),
                sent: false,
            };
            let span = tracing::debug_span!("segment", index = segment.index);
            workers.spawn(
                run_worker(
                    Arc::clone(ctx),
                    segment.clone(),
                    snapshot,
                    epoch.clone(),
                    guard,
                )
                .instrument(span),
            );
            started += 1;
        }
        started
    }

    /// Apply a worker report, returning an error that must end the session
    fn apply_report(&mut self, report: Report) -> Option<EngineError> {
        let Report {
            index,
            endpoint,
            elapsed,
            result,
        } = report;
        let Some(segment) = self.segments.get_mut(index) else {
            tracing::error!("Report for unknown segment {}", index);
            return None;
        };

        match result {
            Ok(done) => {
                segment.state = SegmentState::Verified;
                segment.end = done.range.end;
                if let Some(health) = self.pool.report_success(endpoint, done.bytes, elapsed) {
                    self.emit_health(endpoint, health);
                }
                if let (None, Some(end)) = (self.setup.descriptor.total_size, done.range.end) {
                    self.progress.set_total_size(end);
                }
                let _ = self.setup.events.send(TransferEvent::SegmentVerified {
                    id: self.id,
                    index,
                    range: done.range,
                });
            }
            Err(Failure::Source(EngineError::Cancelled)) => {
                // Interrupted by pause or cancel; not the endpoint's fault
                segment.state = SegmentState::Pending;
            }
            Err(Failure::Source(e)) => self.handle_failure(index, endpoint, e),
            Err(Failure::Local(e)) => {
                segment.state = SegmentState::Failed {
                    error: e.to_string(),
                };
                let _ = self.setup.events.send(TransferEvent::SegmentFailed {
                    id: self.id,
                    index,
                    endpoint: self.pool.get(endpoint).map(|e| e.uri.clone()).unwrap_or_default(),
                    error: e.to_string(),
                });
                return Some(e);
            }
        }
        None
    }

    fn handle_failure(&mut self, index: usize, endpoint: usize, error: EngineError) {
        let uri = self
            .pool
            .get(endpoint)
            .map(|e| e.uri.clone())
            .unwrap_or_default();
        tracing::warn!("Segment {} failed on {}: {}", index, uri, error);
        let _ = self.setup.events.send(TransferEvent::SegmentFailed {
            id: self.id,
            index,
            endpoint: uri,
            error: error.to_string(),
        });

        if let Some(health) = self.pool.report_failure(endpoint) {
            self.emit_health(endpoint, health);
            if health == EndpointHealth::Dead {
                let moved = planner::reassign_from_dead(&mut self.segments, &self.pool);
                if !moved.is_empty() {
                    tracing::info!("Reassigned {} segment(s) from a dead endpoint", moved.len());
                }
            }
        }

        let max_retries = self.setup.config.max_retries;
        let budget = (max_retries + 1).saturating_mul(self.pool.len().max(1) as u32);
        let Some(segment) = self.segments.get_mut(index) else {
            return;
        };
        segment.retries += 1;
        if error.is_checksum_mismatch() && !segment.excluded.contains(&endpoint) {
            segment.excluded.push(endpoint);
        }

        let mut avoid = segment.excluded.clone();
        avoid.push(endpoint);
        let next = if segment.retries > budget {
            None
        } else {
            self.pool.best_excluding(&avoid).or_else(|| {
                (self.pool.is_usable(endpoint) && segment.retries <= max_retries)
                    .then_some(endpoint)
            })
        };

        match next {
            Some(next) => {
                segment.state = SegmentState::Pending;
                segment.endpoint = Some(next);
            }
            None => {
                tracing::warn!(
                    "Segment {} {} failed after {} attempt(s)",
                    segment.index,
                    segment.range(),
                    segment.retries
                );
                segment.state = SegmentState::Failed {
                    error: error.to_string(),
                };
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.segments
            .iter()
            .any(|s| s.state == SegmentState::Pending)
    }

    fn stuck_error(&self) -> EngineError {
        let failed_ranges = self.unverified_ranges();
        if self.pool.usable_count() == 0 {
            return EngineError::NoHealthyEndpoints { failed_ranges };
        }
        let reasons: Vec<String> = self
            .segments
            .iter()
            .filter_map(|s| match s.state {
                SegmentState::Failed { ref error } => Some(format!("{}: {}", s.range(), error)),
                _ => None,
            })
            .take(3)
            .collect();
        EngineError::network(
            crate::error::NetworkErrorKind::Other,
            format!(
                "{} segment(s) could not complete ({})",
                failed_ranges.len(),
                reasons.join("; ")
            ),
        )
    }

    fn unverified_ranges(&self) -> Vec<ByteRange> {
        self.segments
            .iter()
            .filter(|s| !s.is_verified())
            .map(|s| s.range())
            .collect()
    }

    async fn complete(&mut self, ctx: &Arc<WorkerContext>) -> TransferOutcome {
        match ctx.reassembler.finish(self.setup.checksum.as_ref()).await {
            Ok(path) => {
                tracing::info!("Completed {}", path.display());
                self.set_state(SessionState::Completed);
                self.progress.emit();
                let _ = self.setup.events.send(TransferEvent::Completed {
                    id: self.id,
                    path: path.clone(),
                });
                self.publish();
                TransferOutcome::Completed { path }
            }
            Err(e) => {
                let failed = if e.is_checksum_mismatch() {
                    // The ledger was reset; every range has to be fetched again
                    for segment in &mut self.segments {
                        segment.state = SegmentState::Pending;
                    }
                    self.unverified_ranges()
                } else {
                    Vec::new()
                };
                self.fail(e, failed)
            }
        }
    }

    fn fail(&mut self, error: EngineError, failed_ranges: Vec<ByteRange>) -> TransferOutcome {
        let reason = error.to_string();
        tracing::error!(
            "Session failed ({}) with {} incomplete range(s): {}",
            error.kind_label(),
            failed_ranges.len(),
            reason
        );
        self.set_state(SessionState::Failed {
            reason: reason.clone(),
        });
        let _ = self.setup.events.send(TransferEvent::Failed {
            id: self.id,
            error: reason.clone(),
            failed_ranges: failed_ranges.clone(),
        });
        self.publish();
        TransferOutcome::Failed {
            reason,
            failed_ranges,
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        let old = std::mem::replace(&mut self.state, next.clone());
        tracing::info!("Session {} -> {}", old, next);
        let _ = self.setup.events.send(TransferEvent::StateChanged {
            id: self.id,
            old_state: old,
            new_state: next,
        });
        self.publish();
    }

    fn emit_health(&self, endpoint: usize, health: EndpointHealth) {
        if let Some(e) = self.pool.get(endpoint) {
            let _ = self.setup.events.send(TransferEvent::EndpointHealthChanged {
                id: self.id,
                endpoint: e.uri.clone(),
                health,
            });
        }
    }

    fn publish_counts(&self, in_flight: usize) {
        let verified = self.segments.iter().filter(|s| s.is_verified()).count();
        self.progress
            .set_segments(verified, self.segments.len(), in_flight);
        self.publish();
    }

    fn publish(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.state = self.state.clone();
        snapshot.progress = self.progress.snapshot();
        snapshot.segments = self.segments.clone();
        snapshot.endpoints = self.pool.snapshot();
    }
}
