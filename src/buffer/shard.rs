//! Per-shard buffer state machine.
//!
//! ```text
//!            first qualifying failure
//!   ┌──────┐ (cooldown + policy ok)  ┌───────────┐
//!   │ Idle │ ──────────────────────▶ │ Buffering │
//!   └──────┘                         └───────────┘
//!      ▲  ▲          Shutdown              │ newer primary term,
//!      │  └────────────────────────────────┤ or max duration elapsed
//!      │          ┌──────────┐             │
//!      └───────── │ Draining │ ◀───────────┘
//!                 └──────────┘
//! ```
//!
//! All state lives behind one mutex per shard. The lock is never held across
//! an `.await`; a parked caller waits on its own oneshot receiver.

use super::dry_run::{BufferMode, EpisodeHistory};
use super::entry::BufferedRequest;
use super::manager::Shared;
use crate::config::{BufferConfig, FullBufferPolicy};
use crate::metrics::{BufferEvent, Observation};
use crate::types::{
    EvictReason, NotBufferedCause, ShardKey, ShardState, SkipReason, StopReason, Term,
    WaitOutcome,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Episode deadline used when the configured duration does not fit an
/// `Instant`. Only reachable through a provider that skips validation.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Point-in-time view of one shard buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardBufferStatus {
    pub key: ShardKey,
    pub state: ShardState,
    /// Requests currently parked.
    pub queued: usize,
    /// Whether the running episode is a dry-run.
    pub dry_run: bool,
    /// Time since the running episode started.
    pub buffering_for: Option<Duration>,
    /// Age of the oldest parked request.
    pub oldest_request_age: Option<Duration>,
    /// Newest primary term observed.
    pub last_term: Option<Term>,
    /// Episodes completed so far.
    pub live_episodes: u64,
    pub dry_run_episodes: u64,
}

/// One buffering episode. Present exactly while the shard is Buffering.
#[derive(Debug)]
struct Episode {
    id: u64,
    started_at: Instant,
    /// When the max-duration timer drains the episode.
    deadline: Instant,
    dry_run: bool,
    /// Queue size for the whole episode, even if configuration changes.
    max_buffer_size: usize,
    /// Peak queue length (live) or requests seen (dry-run).
    peak: usize,
    timer: JoinHandle<()>,
    /// Global buffering slot, returned when the episode is dropped.
    _slot: Option<OwnedSemaphorePermit>,
}

#[derive(Debug)]
struct Inner {
    state: ShardState,
    queue: VecDeque<BufferedRequest>,
    episode: Option<Episode>,
    last_term: Option<Term>,
    history: EpisodeHistory,
    next_episode_id: u64,
}

/// Requests taken out of the queue by a stop, released after unlocking.
struct Drain {
    requests: VecDeque<BufferedRequest>,
    reason: StopReason,
    duration: Duration,
    dry_run: bool,
}

enum Admission {
    NotBuffered(NotBufferedCause),
    Parked {
        id: u64,
        rx: oneshot::Receiver<WaitOutcome>,
        window: Duration,
    },
}

/// Buffer for a single (keyspace, shard).
#[derive(Debug)]
pub(crate) struct ShardBuffer {
    key: ShardKey,
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    inner: Mutex<Inner>,
}

impl ShardBuffer {
    pub(crate) fn new(key: ShardKey, shared: Arc<Shared>) -> Self {
        Self {
            key,
            shared,
            next_request_id: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                state: ShardState::Idle,
                queue: VecDeque::new(),
                episode: None,
                last_term: None,
                history: EpisodeHistory::default(),
                next_episode_id: 1,
            }),
        }
    }

    pub(crate) fn state(&self) -> ShardState {
        self.inner.lock().state
    }

    pub(crate) fn status(&self) -> ShardBufferStatus {
        let inner = self.inner.lock();
        let now = Instant::now();
        ShardBufferStatus {
            key: self.key.clone(),
            state: inner.state,
            queued: inner.queue.len(),
            dry_run: inner.episode.as_ref().is_some_and(|e| e.dry_run),
            buffering_for: inner
                .episode
                .as_ref()
                .map(|e| now.saturating_duration_since(e.started_at)),
            oldest_request_age: inner
                .queue
                .front()
                .map(|r| now.saturating_duration_since(r.enqueued_at())),
            last_term: inner.last_term,
            live_episodes: inner.history.live_episodes,
            dry_run_episodes: inner.history.dry_run_episodes,
        }
    }

    /// Queue the caller until the failover ends, it is evicted, or `cancel`
    /// fires. Returns immediately when the request is not buffered.
    pub(crate) async fn enqueue_and_wait(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        let (id, mut rx, window) = match self.admit() {
            Admission::NotBuffered(cause) => return WaitOutcome::NotBuffered(cause),
            Admission::Parked { id, rx, window } => (id, rx, window),
        };
        let mut guard = ParkedGuard {
            buffer: self,
            id,
            armed: true,
        };

        let reason = tokio::select! {
            biased;
            outcome = &mut rx => {
                guard.armed = false;
                return self.resolve(outcome);
            }
            _ = cancel.cancelled() => EvictReason::ContextDone,
            _ = tokio::time::sleep(window) => EvictReason::WindowExceeded,
        };
        guard.armed = false;

        if self.remove_parked(id, reason) {
            return WaitOutcome::Evicted(reason);
        }
        // The entry now belongs to a drain or eviction; its outcome is on the way.
        self.resolve(rx.await)
    }

    /// Observe a primary term. Returns true if this drained the buffer.
    pub(crate) fn record_primary_observed(&self, term: Term) -> bool {
        let drain = {
            let mut inner = self.inner.lock();
            let previous = inner.last_term;
            if previous.is_some_and(|last| term <= last) {
                debug!(
                    keyspace = self.key.keyspace(),
                    shard = self.key.shard(),
                    term,
                    last_term = previous,
                    "Ignoring stale primary term"
                );
                return false;
            }
            inner.last_term = Some(term);

            if inner.state == ShardState::Buffering {
                self.begin_drain(&mut inner, StopReason::FailoverEndDetected, None)
            } else {
                // The first term is the primary we found at startup, not a reparent.
                if previous.is_some() {
                    self.shared
                        .cooldown
                        .record_reparent_seen(&self.key, Instant::now());
                }
                None
            }
        };

        match drain {
            Some(drain) => {
                self.finish_drain(drain);
                true
            }
            None => false,
        }
    }

    /// Stop the running episode with `reason`.
    ///
    /// With `episode` set, only that episode is stopped; a later one is left
    /// alone.
    pub(crate) fn stop_buffering(&self, reason: StopReason, episode: Option<u64>) -> bool {
        let drain = {
            let mut inner = self.inner.lock();
            self.begin_drain(&mut inner, reason, episode)
        };
        match drain {
            Some(drain) => {
                self.finish_drain(drain);
                true
            }
            None => false,
        }
    }

    /// Evict everything with `ContextDone` and go Idle.
    pub(crate) fn shutdown(&self) {
        self.stop_buffering(StopReason::Shutdown, None);
    }

    fn admit(self: &Arc<Self>) -> Admission {
        let config = self.shared.config.config_for(&self.key);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if self.shared.is_shut_down() {
            return self.skip(SkipReason::Shutdown);
        }

        let state = inner.state;
        match state {
            // The failover end was recorded when the drain started.
            ShardState::Draining => return self.skip(SkipReason::LastFailoverTooRecent),
            ShardState::Idle => {
                if let Some(reason) = self.shared.cooldown.should_skip(
                    &self.key,
                    now,
                    config.min_time_between_failovers,
                ) {
                    return self.skip(reason);
                }
                let mode = self.shared.policy.decide(&self.key, &config, &inner.history);
                match mode {
                    BufferMode::Disabled => return self.skip(SkipReason::Disabled),
                    BufferMode::DryRun => self.start_episode(&mut inner, &config, now, true, None),
                    BufferMode::Live => match self.shared.acquire_slot() {
                        Ok(slot) => self.start_episode(&mut inner, &config, now, false, slot),
                        Err(_) => {
                            debug!(
                                keyspace = self.key.keyspace(),
                                shard = self.key.shard(),
                                "All buffering slots taken by other shards"
                            );
                            return self.skip(SkipReason::BufferFull);
                        }
                    },
                }
            }
            ShardState::Buffering => {}
        }

        let inner = &mut *inner;
        let Some(episode) = inner.episode.as_mut() else {
            warn!(
                keyspace = self.key.keyspace(),
                shard = self.key.shard(),
                "Buffering without an episode, not buffering request"
            );
            return Admission::NotBuffered(NotBufferedCause::Fault);
        };

        if episode.dry_run {
            episode.peak += 1;
            self.shared
                .stats
                .incr(&self.key, BufferEvent::RequestBufferedDryRun);
            return Admission::NotBuffered(NotBufferedCause::DryRun);
        }

        if inner.queue.len() >= episode.max_buffer_size {
            match config.full_buffer_policy {
                FullBufferPolicy::RejectNew => return self.skip(SkipReason::BufferFull),
                FullBufferPolicy::EvictOldest => {
                    if let Some(oldest) = inner.queue.pop_front() {
                        self.record_eviction(&oldest, EvictReason::BufferFull, now);
                        oldest.deliver(WaitOutcome::Evicted(EvictReason::BufferFull));
                    }
                }
            }
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (request, rx) = BufferedRequest::new(id, now);
        inner.queue.push_back(request);
        episode.peak = episode.peak.max(inner.queue.len());
        self.shared
            .stats
            .incr(&self.key, BufferEvent::RequestBuffered);

        Admission::Parked {
            id,
            rx,
            window: config.window,
        }
    }

    fn start_episode(
        self: &Arc<Self>,
        inner: &mut Inner,
        config: &BufferConfig,
        now: Instant,
        dry_run: bool,
        slot: Option<OwnedSemaphorePermit>,
    ) {
        let id = inner.next_episode_id;
        inner.next_episode_id += 1;

        let deadline = now
            .checked_add(config.max_failover_duration)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let timer = self.spawn_max_duration_timer(id, deadline);
        inner.state = ShardState::Buffering;
        inner.episode = Some(Episode {
            id,
            started_at: now,
            deadline,
            dry_run,
            max_buffer_size: config.max_buffer_size,
            peak: 0,
            timer,
            _slot: slot,
        });

        self.shared.stats.incr(&self.key, BufferEvent::Started);
        self.shared
            .stats
            .observe(&self.key, Observation::BufferSize(config.max_buffer_size));
        info!(
            keyspace = self.key.keyspace(),
            shard = self.key.shard(),
            dry_run,
            max_failover_duration = ?config.max_failover_duration,
            "Starting buffering"
        );
    }

    fn spawn_max_duration_timer(
        self: &Arc<Self>,
        episode: u64,
        deadline: Instant,
    ) -> JoinHandle<()> {
        let buffer = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(buffer) = buffer.upgrade() {
                buffer.stop_buffering(StopReason::MaxDurationExceeded, Some(episode));
            }
        })
    }

    /// Take the queue out of a Buffering shard and record the episode end.
    fn begin_drain(
        &self,
        inner: &mut Inner,
        reason: StopReason,
        expected_episode: Option<u64>,
    ) -> Option<Drain> {
        if inner.state != ShardState::Buffering {
            return None;
        }
        let current = inner.episode.as_ref().map(|e| e.id);
        if expected_episode.is_some() && expected_episode != current {
            return None;
        }
        let episode = inner.episode.take()?;
        let now = Instant::now();

        if reason != StopReason::MaxDurationExceeded {
            episode.timer.abort();
        }
        inner.state = if reason == StopReason::Shutdown {
            ShardState::Idle
        } else {
            ShardState::Draining
        };
        let requests = std::mem::take(&mut inner.queue);

        if episode.dry_run {
            inner.history.dry_run_episodes += 1;
        } else {
            inner.history.live_episodes += 1;
        }
        self.shared.cooldown.record_failover_end(&self.key, now);

        let duration = now.saturating_duration_since(episode.started_at);
        let stats = &self.shared.stats;
        stats.incr(&self.key, BufferEvent::Stopped(reason));
        stats.observe(&self.key, Observation::FailoverDuration(duration));
        stats.observe(
            &self.key,
            Observation::Utilization {
                percent: (episode.peak * 100 / episode.max_buffer_size.max(1)) as u64,
                dry_run: episode.dry_run,
            },
        );
        stats.observe(
            &self.key,
            Observation::PeakRequests {
                count: episode.peak,
                dry_run: episode.dry_run,
            },
        );

        Some(Drain {
            requests,
            reason,
            duration,
            dry_run: episode.dry_run,
        })
    }

    /// Deliver outcomes in FIFO order, then go Idle.
    fn finish_drain(&self, drain: Drain) {
        let count = drain.requests.len() as u64;
        let outcome = if drain.reason == StopReason::Shutdown {
            self.shared.stats.incr_by(
                &self.key,
                BufferEvent::RequestEvicted(EvictReason::ContextDone),
                count,
            );
            WaitOutcome::Evicted(EvictReason::ContextDone)
        } else {
            self.shared
                .stats
                .incr_by(&self.key, BufferEvent::RequestDrained, count);
            WaitOutcome::Released
        };

        for request in drain.requests {
            request.deliver(outcome);
        }

        {
            let mut inner = self.inner.lock();
            if inner.state == ShardState::Draining {
                inner.state = ShardState::Idle;
            }
        }

        info!(
            keyspace = self.key.keyspace(),
            shard = self.key.shard(),
            reason = %drain.reason,
            dry_run = drain.dry_run,
            released = count,
            duration = ?drain.duration,
            "Stopped buffering"
        );
    }

    /// Remove a still-queued entry on behalf of its own caller.
    ///
    /// A window expiry at or past the episode deadline leaves the entry to the
    /// max-duration drain, which releases it instead.
    fn remove_parked(&self, id: u64, reason: EvictReason) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if reason == EvictReason::WindowExceeded
            && inner.episode.as_ref().is_some_and(|e| now >= e.deadline)
        {
            return false;
        }
        let Some(position) = inner.queue.iter().position(|r| r.id() == id) else {
            return false;
        };
        if let Some(request) = inner.queue.remove(position) {
            self.record_eviction(&request, reason, now);
        }
        true
    }

    fn record_eviction(&self, request: &BufferedRequest, reason: EvictReason, now: Instant) {
        self.shared
            .stats
            .incr(&self.key, BufferEvent::RequestEvicted(reason));
        debug!(
            keyspace = self.key.keyspace(),
            shard = self.key.shard(),
            %reason,
            buffered_for = ?now.saturating_duration_since(request.enqueued_at()),
            "Evicted buffered request"
        );
    }

    fn skip(&self, reason: SkipReason) -> Admission {
        self.shared
            .stats
            .incr(&self.key, BufferEvent::RequestSkipped(reason));
        debug!(
            keyspace = self.key.keyspace(),
            shard = self.key.shard(),
            %reason,
            "Not buffering request"
        );
        Admission::NotBuffered(NotBufferedCause::Skipped(reason))
    }

    fn resolve(&self, outcome: Result<WaitOutcome, oneshot::error::RecvError>) -> WaitOutcome {
        outcome.unwrap_or_else(|_| {
            warn!(
                keyspace = self.key.keyspace(),
                shard = self.key.shard(),
                "Release signal dropped without an outcome"
            );
            WaitOutcome::NotBuffered(NotBufferedCause::Fault)
        })
    }
}

/// Removes the caller's entry if the waiting future is dropped while parked.
struct ParkedGuard<'a> {
    buffer: &'a ShardBuffer,
    id: u64,
    armed: bool,
}

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.buffer.remove_parked(self.id, EvictReason::ContextDone);
        }
    }
}
