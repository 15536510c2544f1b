//! Write-behind flushing.
//!
//! The tick thread turns each dirty guild's change log into a sequenced
//! [`PersistenceJob`] and hands it to a bounded worker pool. Workers hand the
//! job back with its result over a completion channel that the tick thread
//! drains once per tick. A guild has at most one job in flight, so its jobs
//! reach the store in increasing sequence order.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use thiserror::Error;

use crate::config::{FlushConfig, RetryConfig};
use crate::job::{JobLane, Mutation, PersistenceJob};
use crate::model::GuildId;
use crate::registry::GuildRegistry;
use crate::repository::{BatchWriter, StoreError};

#[derive(Debug)]
pub struct JobCompletion {
    pub job: PersistenceJob,
    pub result: Result<(), StoreError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushEvent {
    Persisted {
        guild: GuildId,
        sequence: u64,
    },
    RetryScheduled {
        guild: GuildId,
        sequence: u64,
        attempt: u32,
        delay: Duration,
    },
    Quarantined {
        guild: GuildId,
        sequence: u64,
        error: String,
    },
    /// Final job of a disbanded guild drained; its id and name are free.
    Released {
        guild: GuildId,
    },
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("flush did not finish within {timeout:?}; {pending} guilds still pending")]
    Timeout { timeout: Duration, pending: usize },
}

struct FlushWorkers {
    job_tx: Option<Sender<PersistenceJob>>,
    priority_tx: Option<Sender<PersistenceJob>>,
    completion_rx: Receiver<JobCompletion>,
    handles: Vec<JoinHandle<()>>,
}

impl FlushWorkers {
    fn spawn(writer: Arc<dyn BatchWriter>, config: &FlushConfig) -> io::Result<Self> {
        let (job_tx, job_rx) = bounded::<PersistenceJob>(config.queue_capacity());
        let (priority_tx, priority_rx) = unbounded::<PersistenceJob>();
        let (completion_tx, completion_rx) = unbounded::<JobCompletion>();

        let mut handles = Vec::with_capacity(config.worker_threads());
        for index in 0..config.worker_threads() {
            let writer = Arc::clone(&writer);
            let job_rx = job_rx.clone();
            let priority_rx = priority_rx.clone();
            let completion_tx = completion_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("guild-flush-{index}"))
                .spawn(move || worker_loop(writer.as_ref(), &priority_rx, &job_rx, &completion_tx))?;
            handles.push(handle);
        }

        tracing::info!(
            target: "guilds::flush",
            workers = config.worker_threads(),
            queue_capacity = config.queue_capacity(),
            "flush.workers_started"
        );
        Ok(Self {
            job_tx: Some(job_tx),
            priority_tx: Some(priority_tx),
            completion_rx,
            handles,
        })
    }

    fn send(&self, job: PersistenceJob) -> Result<(), TrySendError<PersistenceJob>> {
        let sender = match job.lane {
            JobLane::Normal => self.job_tx.as_ref(),
            JobLane::Priority => self.priority_tx.as_ref(),
        };
        match sender {
            Some(sender) => sender.try_send(job),
            None => Err(TrySendError::Disconnected(job)),
        }
    }

    fn stop(&mut self) {
        self.job_tx.take();
        self.priority_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!(target: "guilds::flush", "flush.worker_panicked");
            }
        }
    }
}

impl Drop for FlushWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    writer: &dyn BatchWriter,
    priority_rx: &Receiver<PersistenceJob>,
    job_rx: &Receiver<PersistenceJob>,
    completion_tx: &Sender<JobCompletion>,
) {
    loop {
        let job = match priority_rx.try_recv() {
            Ok(job) => job,
            Err(_) => select! {
                recv(priority_rx) -> msg => match msg {
                    Ok(job) => job,
                    Err(_) => break,
                },
                recv(job_rx) -> msg => match msg {
                    Ok(job) => job,
                    Err(_) => break,
                },
            },
        };
        run_job(writer, job, completion_tx);
    }

    // Senders are gone; finish whatever is still buffered.
    for job in priority_rx.try_iter().chain(job_rx.try_iter()) {
        run_job(writer, job, completion_tx);
    }
}

fn run_job(writer: &dyn BatchWriter, job: PersistenceJob, completion_tx: &Sender<JobCompletion>) {
    let result = writer.apply_batch(&job);
    let guild = job.guild;
    if completion_tx.send(JobCompletion { job, result }).is_err() {
        tracing::debug!(target: "guilds::flush", guild = %guild, "flush.completion_dropped");
    }
}

#[derive(Default)]
struct GuildFlushState {
    next_sequence: u64,
    in_flight: Option<u64>,
    attempts: u32,
    retry_at: Option<Instant>,
    /// Set once the guild is disbanded: everything its last job must write.
    final_ops: Option<Vec<Mutation>>,
}

impl GuildFlushState {
    fn starting_after(last_sequence: u64) -> Self {
        Self {
            next_sequence: last_sequence + 1,
            ..Self::default()
        }
    }

    fn ready(&self, now: Instant) -> bool {
        self.in_flight.is_none() && self.retry_at.map_or(true, |at| at <= now)
    }
}

pub struct WriteBehindScheduler {
    workers: FlushWorkers,
    states: HashMap<GuildId, GuildFlushState>,
    retry: RetryConfig,
}

impl WriteBehindScheduler {
    pub fn start(writer: Arc<dyn BatchWriter>, config: &FlushConfig) -> io::Result<Self> {
        Ok(Self {
            workers: FlushWorkers::spawn(writer, config)?,
            states: HashMap::new(),
            retry: config.retry().clone(),
        })
    }

    /// Continues a loaded guild's sequence after the last one the store applied.
    pub fn register(&mut self, guild: GuildId, last_sequence: u64) {
        self.states.insert(guild, GuildFlushState::starting_after(last_sequence));
    }

    fn state(&mut self, guild: GuildId) -> &mut GuildFlushState {
        self.states
            .entry(guild)
            .or_insert_with(|| GuildFlushState::starting_after(0))
    }

    pub fn in_flight(&self) -> usize {
        self.states.values().filter(|state| state.in_flight.is_some()).count()
    }

    pub fn is_in_flight(&self, guild: GuildId) -> bool {
        self.states
            .get(&guild)
            .map_or(false, |state| state.in_flight.is_some())
    }

    /// Disbanded guilds whose final job has not drained yet.
    pub fn retiring(&self) -> usize {
        self.states.values().filter(|state| state.final_ops.is_some()).count()
    }

    /// Hands one job per ready dirty guild to the workers. Never blocks.
    pub fn flush(&mut self, registry: &mut GuildRegistry, now: Instant) -> usize {
        let mut dispatched = self.dispatch_finals(now);

        for guild in registry.dirty_ids() {
            if registry.get(guild).map_or(true, |g| g.read_only) {
                continue;
            }
            let state = self.state(guild);
            if !state.ready(now) {
                continue;
            }

            let job = PersistenceJob::new(guild, state.next_sequence, registry.take_pending(guild));
            let sequence = job.sequence;
            match self.workers.send(job) {
                Ok(()) => {
                    let state = self.state(guild);
                    state.in_flight = Some(sequence);
                    state.next_sequence += 1;
                    dispatched += 1;
                }
                Err(TrySendError::Full(job)) => {
                    registry.requeue_front(guild, job.ops);
                    tracing::debug!(target: "guilds::flush", guild = %guild, "flush.queue_full");
                    break;
                }
                Err(TrySendError::Disconnected(job)) => {
                    registry.requeue_front(guild, job.ops);
                    tracing::error!(target: "guilds::flush", guild = %guild, "flush.workers_gone");
                    break;
                }
            }
        }

        if dispatched > 0 {
            tracing::debug!(target: "guilds::flush", dispatched, "flush.dispatched");
        }
        dispatched
    }

    /// Schedules the last job of a disbanded guild on the priority lane.
    /// If a job is still in flight the final one follows once it drains.
    pub fn retire(&mut self, guild: GuildId, final_ops: Vec<Mutation>, now: Instant) {
        let state = self.state(guild);
        state.final_ops = Some(final_ops);
        // Disband does not wait out a backoff.
        state.retry_at = None;
        tracing::info!(
            target: "guilds::flush",
            guild = %guild,
            waiting_on = ?state.in_flight,
            "flush.retire_scheduled"
        );
        self.dispatch_finals(now);
    }

    fn dispatch_finals(&mut self, now: Instant) -> usize {
        let ready: Vec<GuildId> = self
            .states
            .iter()
            .filter(|(_, state)| state.final_ops.is_some() && state.ready(now))
            .map(|(guild, _)| *guild)
            .collect();

        let mut dispatched = 0;
        for guild in ready {
            let state = self.state(guild);
            let ops = state.final_ops.take().unwrap_or_default();
            let job = PersistenceJob::new(guild, state.next_sequence, ops).priority();
            let sequence = job.sequence;
            match self.workers.send(job) {
                Ok(()) => {
                    let state = self.state(guild);
                    state.in_flight = Some(sequence);
                    state.next_sequence += 1;
                    dispatched += 1;
                }
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                    self.state(guild).final_ops = Some(job.ops);
                    tracing::error!(target: "guilds::flush", guild = %guild, "flush.workers_gone");
                }
            }
        }
        dispatched
    }

    /// Applies every completion that has arrived. Called at the start of a tick.
    pub fn drain_completions(&mut self, registry: &mut GuildRegistry, now: Instant) -> Vec<FlushEvent> {
        let completions: Vec<JobCompletion> = self.workers.completion_rx.try_iter().collect();
        let mut events = Vec::with_capacity(completions.len());
        for completion in completions {
            events.push(self.handle_completion(registry, completion, now));
        }
        // A retiring guild's final job follows its last regular one immediately.
        self.dispatch_finals(now);
        events
    }

    fn handle_completion(
        &mut self,
        registry: &mut GuildRegistry,
        completion: JobCompletion,
        now: Instant,
    ) -> FlushEvent {
        let JobCompletion { job, result } = completion;
        let guild = job.guild;
        let sequence = job.sequence;
        let is_final = job.deletes_guild();
        let retry = self.retry.clone();
        let state = self.state(guild);
        if state.in_flight != Some(sequence) {
            tracing::warn!(
                target: "guilds::flush",
                guild = %guild,
                sequence,
                expected = ?state.in_flight,
                "flush.unexpected_completion"
            );
        }
        state.in_flight = None;

        match result {
            Ok(()) => {
                state.attempts = 0;
                state.retry_at = None;
                if is_final {
                    self.states.remove(&guild);
                    registry.release_retired(guild);
                    tracing::info!(target: "guilds::flush", guild = %guild, sequence, "flush.released");
                    return FlushEvent::Released { guild };
                }
                registry.mark_persisted(guild);
                tracing::debug!(target: "guilds::flush", guild = %guild, sequence, "flush.persisted");
                FlushEvent::Persisted { guild, sequence }
            }
            Err(err) if err.is_corruption() && (is_final || state.final_ops.is_some()) => {
                // The disband must still land or the guild comes back on load.
                // Its rows are scoped to the guild, so writing them past the
                // store's sequence is safe.
                if let StoreError::SequenceConflict { last_applied, .. } = &err {
                    state.next_sequence = state.next_sequence.max(last_applied + 1);
                }
                state.attempts += 1;
                let attempt = state.attempts;
                let delay = retry.backoff_delay(attempt);
                state.retry_at = Some(now + delay);
                match state.final_ops.as_mut() {
                    Some(final_ops) => {
                        let mut ops = job.ops;
                        ops.append(final_ops);
                        *final_ops = ops;
                    }
                    None => state.final_ops = Some(job.ops),
                }
                tracing::error!(
                    target: "guilds::flush",
                    guild = %guild,
                    sequence,
                    next_sequence = state.next_sequence,
                    attempt,
                    error = %err,
                    "flush.retire_resequenced"
                );
                FlushEvent::RetryScheduled {
                    guild,
                    sequence,
                    attempt,
                    delay,
                }
            }
            Err(err) if err.is_corruption() => {
                tracing::error!(
                    target: "guilds::flush",
                    guild = %guild,
                    sequence,
                    error = %err,
                    "flush.corruption_quarantined"
                );
                registry.requeue_front(guild, job.ops);
                registry.quarantine(guild);
                FlushEvent::Quarantined {
                    guild,
                    sequence,
                    error: err.to_string(),
                }
            }
            Err(err) => {
                state.attempts += 1;
                let attempt = state.attempts;
                let delay = retry.backoff_delay(attempt);
                state.retry_at = Some(now + delay);
                match state.final_ops.as_mut() {
                    Some(final_ops) => {
                        let mut ops = job.ops;
                        ops.append(final_ops);
                        *final_ops = ops;
                    }
                    None if is_final => state.final_ops = Some(job.ops),
                    None => registry.requeue_front(guild, job.ops),
                }

                tracing::warn!(
                    target: "guilds::flush",
                    guild = %guild,
                    sequence,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "flush.retry_scheduled"
                );
                if attempt >= retry.alert_after_attempts() {
                    tracing::error!(
                        target: "guilds::flush",
                        guild = %guild,
                        attempt,
                        error = %err,
                        "flush.retry_alert"
                    );
                }
                FlushEvent::RetryScheduled {
                    guild,
                    sequence,
                    attempt,
                    delay,
                }
            }
        }
    }

    fn outstanding(&self, registry: &GuildRegistry) -> usize {
        let dirty = registry
            .dirty_ids()
            .into_iter()
            .filter(|guild| registry.get(*guild).map_or(false, |g| !g.read_only))
            .filter(|guild| !self.is_in_flight(*guild))
            .count();
        dirty + self.in_flight() + self.states.values().filter(|s| s.final_ops.is_some() && s.in_flight.is_none()).count()
    }

    /// Keeps flushing until nothing is dirty or in flight. Blocks the caller;
    /// used for save-all on shutdown, never from a live tick.
    pub fn flush_blocking(
        &mut self,
        registry: &mut GuildRegistry,
        timeout: Duration,
    ) -> Result<Vec<FlushEvent>, FlushError> {
        let deadline = Instant::now() + timeout;
        let mut events = self.drain_completions(registry, Instant::now());

        loop {
            let now = Instant::now();
            self.flush(registry, now);
            if self.outstanding(registry) == 0 {
                return Ok(events);
            }
            if now >= deadline {
                let pending = self.outstanding(registry);
                tracing::warn!(target: "guilds::flush", pending, "flush.blocking_timeout");
                return Err(FlushError::Timeout { timeout, pending });
            }

            let wait = deadline.saturating_duration_since(now).min(Duration::from_millis(50));
            match self.workers.completion_rx.recv_timeout(wait) {
                Ok(completion) => {
                    events.push(self.handle_completion(registry, completion, Instant::now()));
                    events.extend(self.drain_completions(registry, Instant::now()));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let pending = self.outstanding(registry);
                    return Err(FlushError::Timeout { timeout, pending });
                }
            }
        }
    }

    /// Stops accepting jobs and joins the workers after they drain their queues.
    pub fn shutdown(mut self) {
        self.workers.stop();
        tracing::info!(target: "guilds::flush", "flush.workers_stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::config::GuildConfig;
    use crate::model::PlayerId;

    #[derive(Default)]
    struct RecordingWriter {
        applied: Mutex<Vec<(GuildId, u64, usize)>>,
        jobs: Mutex<Vec<PersistenceJob>>,
        transient_failures: AtomicUsize,
        /// Sequence conflicts to report before accepting writes, as if the
        /// store had already applied this many sequences past the job.
        conflicts: AtomicUsize,
        corrupt: bool,
    }

    impl BatchWriter for RecordingWriter {
        fn apply_batch(&self, job: &PersistenceJob) -> Result<(), StoreError> {
            if self.corrupt {
                return Err(StoreError::SequenceConflict {
                    guild: job.guild,
                    last_applied: job.sequence,
                    attempted: job.sequence,
                });
            }
            let conflicts = self.conflicts.load(Ordering::SeqCst);
            if conflicts > 0 {
                self.conflicts.store(conflicts - 1, Ordering::SeqCst);
                return Err(StoreError::SequenceConflict {
                    guild: job.guild,
                    last_applied: job.sequence + 10,
                    attempted: job.sequence,
                });
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                    Some("database is locked".into()),
                )));
            }
            self.applied
                .lock()
                .expect("applied lock")
                .push((job.guild, job.sequence, job.ops.len()));
            self.jobs.lock().expect("jobs lock").push(job.clone());
            Ok(())
        }
    }

    fn fixture(writer: Arc<RecordingWriter>, json: &str) -> (GuildRegistry, WriteBehindScheduler) {
        let config = Arc::new(GuildConfig::from_json_str(json).expect("config"));
        let scheduler = WriteBehindScheduler::start(writer, config.flush()).expect("workers");
        (GuildRegistry::new(config, GuildId(1)), scheduler)
    }

    fn wait_for_events(
        scheduler: &mut WriteBehindScheduler,
        registry: &mut GuildRegistry,
        count: usize,
    ) -> Vec<FlushEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut events = Vec::new();
        while events.len() < count && Instant::now() < deadline {
            events.extend(scheduler.drain_completions(registry, Instant::now()));
            thread::sleep(Duration::from_millis(2));
        }
        events
    }

    #[test]
    fn sequences_increase_per_guild_and_dirty_clears() {
        let writer = Arc::new(RecordingWriter::default());
        let (mut registry, mut scheduler) = fixture(Arc::clone(&writer), "{}");
        let owner = PlayerId::random();
        let id = registry.create_guild("alpha", owner, 1).expect("create");
        scheduler.register(id, 4);

        assert_eq!(scheduler.flush(&mut registry, Instant::now()), 1);
        registry.set_pvp(owner, id, true).expect("pvp");
        assert_eq!(scheduler.flush(&mut registry, Instant::now()), 0, "one job in flight per guild");

        let events = wait_for_events(&mut scheduler, &mut registry, 1);
        assert_eq!(events, vec![FlushEvent::Persisted { guild: id, sequence: 5 }]);
        assert!(registry.get(id).expect("guild").dirty, "newer change still pending");

        assert_eq!(scheduler.flush(&mut registry, Instant::now()), 1);
        wait_for_events(&mut scheduler, &mut registry, 1);
        assert!(!registry.get(id).expect("guild").dirty);

        let applied = writer.applied.lock().expect("lock");
        let sequences: Vec<u64> = applied.iter().map(|(_, seq, _)| *seq).collect();
        assert_eq!(sequences, vec![5, 6]);
    }

    #[test]
    fn transient_failure_requeues_and_backs_off() {
        let writer = Arc::new(RecordingWriter {
            transient_failures: AtomicUsize::new(1),
            ..RecordingWriter::default()
        });
        let (mut registry, mut scheduler) = fixture(
            Arc::clone(&writer),
            r#"{ "flush": { "retry": { "initial_backoff_ms": 20, "max_backoff_ms": 100, "multiplier": 2.0, "alert_after_attempts": 3 } } }"#,
        );
        let id = registry.create_guild("alpha", PlayerId::random(), 1).expect("create");

        let started = Instant::now();
        scheduler.flush(&mut registry, started);
        let events = wait_for_events(&mut scheduler, &mut registry, 1);
        assert!(matches!(
            events.as_slice(),
            [FlushEvent::RetryScheduled { attempt: 1, sequence: 1, .. }]
        ));
        assert!(registry.get(id).expect("guild").dirty);
        assert!(registry.has_pending(id));
        assert_eq!(scheduler.flush(&mut registry, started), 0, "still backing off");

        let events = scheduler
            .flush_blocking(&mut registry, Duration::from_secs(5))
            .expect("drains after backoff");
        assert!(events.contains(&FlushEvent::Persisted { guild: id, sequence: 2 }));
        assert!(!registry.get(id).expect("guild").dirty);
    }

    #[test]
    fn corruption_quarantines_the_guild() {
        let writer = Arc::new(RecordingWriter {
            corrupt: true,
            ..RecordingWriter::default()
        });
        let (mut registry, mut scheduler) = fixture(writer, "{}");
        let owner = PlayerId::random();
        let id = registry.create_guild("alpha", owner, 1).expect("create");

        scheduler.flush(&mut registry, Instant::now());
        let events = wait_for_events(&mut scheduler, &mut registry, 1);
        assert!(matches!(events.as_slice(), [FlushEvent::Quarantined { .. }]));
        assert_eq!(registry.quarantined(), vec![id]);
        assert!(registry.set_pvp(owner, id, true).is_err());
        assert_eq!(scheduler.flush(&mut registry, Instant::now()), 0);
        scheduler.flush_blocking(&mut registry, Duration::from_millis(200)).expect("quarantined guilds are skipped");
    }

    #[test]
    fn retire_waits_for_in_flight_job_then_releases() {
        let writer = Arc::new(RecordingWriter::default());
        let (mut registry, mut scheduler) = fixture(Arc::clone(&writer), "{}");
        let owner = PlayerId::random();
        let id = registry.create_guild("alpha", owner, 1).expect("create");

        scheduler.flush(&mut registry, Instant::now());
        assert!(scheduler.is_in_flight(id));
        registry.apply_ledger(id, 10, "deposit", Some(owner), 2).expect("deposit");
        let retired = registry.disband(owner, id).expect("disband");
        scheduler.retire(id, retired.final_ops, Instant::now());
        assert_eq!(scheduler.retiring(), 1);

        let events = scheduler
            .flush_blocking(&mut registry, Duration::from_secs(5))
            .expect("final job drains");
        assert_eq!(events.last(), Some(&FlushEvent::Released { guild: id }));
        assert!(!registry.is_retired(id));
        assert_eq!(scheduler.retiring(), 0);

        let applied = writer.applied.lock().expect("lock");
        assert_eq!(applied.iter().map(|(_, seq, _)| *seq).collect::<Vec<_>>(), vec![1, 2]);
        scheduler.shutdown();
    }

    fn retire_with_pending_deposit(
        writer: &Arc<RecordingWriter>,
        json: &str,
    ) -> (GuildRegistry, WriteBehindScheduler, GuildId) {
        let (mut registry, mut scheduler) = fixture(Arc::clone(writer), json);
        let owner = PlayerId::random();
        let id = registry.create_guild("alpha", owner, 1).expect("create");

        scheduler.flush(&mut registry, Instant::now());
        assert!(scheduler.is_in_flight(id));
        registry.apply_ledger(id, 10, "deposit", Some(owner), 2).expect("deposit");
        let retired = registry.disband(owner, id).expect("disband");
        scheduler.retire(id, retired.final_ops, Instant::now());
        (registry, scheduler, id)
    }

    const FAST_RETRY: &str =
        r#"{ "flush": { "retry": { "initial_backoff_ms": 10, "max_backoff_ms": 50, "multiplier": 2.0, "alert_after_attempts": 3 } } }"#;

    #[test]
    fn retire_after_transient_failure_writes_everything_then_releases() {
        let writer = Arc::new(RecordingWriter {
            transient_failures: AtomicUsize::new(1),
            ..RecordingWriter::default()
        });
        let (mut registry, mut scheduler, id) = retire_with_pending_deposit(&writer, FAST_RETRY);

        let events = scheduler
            .flush_blocking(&mut registry, Duration::from_secs(5))
            .expect("final job drains");
        assert!(matches!(
            events.first(),
            Some(FlushEvent::RetryScheduled { sequence: 1, attempt: 1, .. })
        ));
        assert_eq!(events.last(), Some(&FlushEvent::Released { guild: id }));
        assert!(!registry.is_retired(id));
        assert_eq!(scheduler.retiring(), 0);

        let jobs = writer.jobs.lock().expect("lock");
        assert_eq!(jobs.len(), 1, "failed job folds into the final one");
        let final_job = &jobs[0];
        assert_eq!(final_job.sequence, 2);
        let rank = final_job
            .ops
            .iter()
            .position(|op| matches!(op, Mutation::UpsertRank(_)))
            .expect("creation ops carried over");
        let ledger = final_job
            .ops
            .iter()
            .position(|op| matches!(op, Mutation::AppendLedger(_)))
            .expect("deposit written");
        assert!(rank < ledger, "failed job's ops come first");
        assert_eq!(final_job.ops.last(), Some(&Mutation::DeleteGuild));
    }

    #[test]
    fn retiring_guild_survives_a_sequence_conflict() {
        let writer = Arc::new(RecordingWriter {
            conflicts: AtomicUsize::new(1),
            ..RecordingWriter::default()
        });
        let (mut registry, mut scheduler, id) = retire_with_pending_deposit(&writer, FAST_RETRY);

        let events = scheduler
            .flush_blocking(&mut registry, Duration::from_secs(5))
            .expect("final job drains");
        assert!(!events.iter().any(|event| matches!(event, FlushEvent::Quarantined { .. })));
        assert_eq!(events.last(), Some(&FlushEvent::Released { guild: id }));
        assert!(registry.quarantined().is_empty());
        assert!(!registry.is_retired(id));

        let jobs = writer.jobs.lock().expect("lock");
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].sequence > 11, "resequenced past the store");
        assert!(jobs[0].deletes_guild());
        assert!(jobs[0].ops.iter().any(|op| matches!(op, Mutation::AppendLedger(_))));
    }
}
