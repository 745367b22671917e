//! Execution Queue - serializes robot program runs
//!
//! The robot is a single physical resource, so scripts from every caller
//! go through one FIFO and at most one of them is in flight at a time. An
//! entry is in flight from the moment it is taken off the FIFO until the
//! status feed reports the program finished. Load/play failures drop the
//! entry and the queue moves on.
//!
//! All state transitions happen under one lock that is never held across
//! I/O. A single driver task performs the load/play calls; submitters and
//! the completion path only mutate state and wake it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditSink};
use crate::command::CommandChannel;
use crate::signals::{Signal, Signals};
use crate::status::{RobotEvent, RobotEventReceiver};
use crate::{Result, RobotError};

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Position within the work accepted since the queue was last idle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionProgress {
    pub current: usize,
    pub total: usize,
}

/// Point-in-time view of the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub pending: Vec<String>,
    /// Script being loaded and started
    pub dispatching: Option<String>,
    /// Script started and awaiting `ProgramFinished`
    pub running: Option<String>,
    pub progress: ExecutionProgress,
}

impl QueueSnapshot {
    pub fn busy(&self) -> bool {
        self.dispatching.is_some() || self.running.is_some()
    }

    pub fn is_idle(&self) -> bool {
        !self.busy() && self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    script: String,
    batch: Uuid,
}

#[derive(Debug)]
enum Slot {
    Idle,
    /// `playing` is set once `play` is on the wire. A `ProgramFinished`
    /// seen from then on belongs to this entry and is kept in
    /// `finished_early` until the `play` call returns.
    Dispatching {
        ticket: u64,
        entry: QueueEntry,
        playing: bool,
        finished_early: bool,
    },
    Running { ticket: u64, entry: QueueEntry },
}

impl Slot {
    fn is_idle(&self) -> bool {
        matches!(self, Slot::Idle)
    }

    fn ticket(&self) -> Option<u64> {
        match self {
            Slot::Idle => None,
            Slot::Dispatching { ticket, .. } | Slot::Running { ticket, .. } => Some(*ticket),
        }
    }
}

/// Outcome counts for one submitted batch
#[derive(Debug)]
struct BatchTally {
    id: Uuid,
    total: usize,
    done: usize,
    failed: usize,
}

struct QueueState {
    pending: VecDeque<QueueEntry>,
    slot: Slot,
    batches: Vec<BatchTally>,
    progress: ExecutionProgress,
    next_ticket: u64,
}

impl QueueState {
    /// Count one entry of `batch`; returns the tally once every entry is accounted for
    fn tally(&mut self, batch: Uuid, succeeded: bool) -> Option<BatchTally> {
        let position = self.batches.iter().position(|tally| tally.id == batch)?;
        let tally = &mut self.batches[position];
        if succeeded {
            tally.done += 1;
        } else {
            tally.failed += 1;
        }
        if tally.done + tally.failed < tally.total {
            return None;
        }
        Some(self.batches.remove(position))
    }

    /// Record a finished entry. Returns the batch id and size if this
    /// completed a batch with no failures.
    fn complete(&mut self, entry: &QueueEntry, signals: &Signals, wake: &Notify) -> Option<(Uuid, usize)> {
        self.progress.current = (self.progress.current + 1).min(self.progress.total);
        signals.emit(Signal::Progress {
            current: self.progress.current,
            total: self.progress.total,
        });

        let clean = self
            .tally(entry.batch, true)
            .filter(|tally| tally.failed == 0)
            .map(|tally| (tally.id, tally.total));
        if let Some((_, total)) = clean {
            signals.emit(Signal::BatchComplete { total });
        }
        self.settle(wake);
        clean
    }

    /// Record a dropped entry; its batch will not report completion
    fn fail(&mut self, entry: &QueueEntry) {
        if let Some(tally) = self.tally(entry.batch, false) {
            debug!(
                "Batch {} ended with {} of {} script(s) dropped",
                tally.id, tally.failed, tally.total
            );
        }
    }

    /// Called whenever the slot empties; resets progress once no work is left
    fn settle(&mut self, wake: &Notify) {
        if !self.pending.is_empty() {
            wake.notify_one();
        } else if self.slot.is_idle() {
            self.progress = ExecutionProgress::default();
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    channel: Arc<dyn CommandChannel>,
    signals: Signals,
    audit: Arc<dyn AuditSink>,
    wake: Notify,
    shutdown: AtomicBool,
    finish_timeout: Option<Duration>,
}

/// Handle to the execution queue. Clones share the same queue.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
    driver: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ExecutionQueue {
    /// Create the queue and spawn its driver task.
    ///
    /// `finish_timeout` bounds how long a started script may run without a
    /// `ProgramFinished`; `None` waits indefinitely.
    pub fn spawn(
        channel: Arc<dyn CommandChannel>,
        signals: Signals,
        audit: Arc<dyn AuditSink>,
        finish_timeout: Option<Duration>,
    ) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                slot: Slot::Idle,
                batches: Vec::new(),
                progress: ExecutionProgress::default(),
                next_ticket: 1,
            }),
            channel,
            signals,
            audit,
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
            finish_timeout,
        });

        let driver = tokio::spawn(drive(Arc::clone(&inner)));
        info!("Execution queue started");

        Self {
            inner,
            driver: Arc::new(Mutex::new(Some(driver))),
        }
    }

    /// Append `scripts` to the tail of the queue, in order, as one batch.
    ///
    /// Returns the number of scripts accepted. Blank names are dropped; an
    /// empty submission changes nothing. Submission is fire-and-forget:
    /// execution failures go to the audit log, not back to the caller.
    pub async fn submit<I, S>(&self, scripts: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        for script in scripts {
            let script = script.into();
            let trimmed = script.trim();
            if trimmed.is_empty() {
                warn!("Ignoring blank script name");
                continue;
            }
            names.push(trimmed.to_string());
        }

        if names.is_empty() {
            debug!("Empty submission ignored");
            return 0;
        }

        let batch = Uuid::new_v4();
        let count = names.len();
        let listing = names.join(", ");
        let deferred = {
            let mut state = self.inner.lock_state();
            state
                .pending
                .extend(names.into_iter().map(|script| QueueEntry { script, batch }));
            state.batches.push(BatchTally {
                id: batch,
                total: count,
                done: 0,
                failed: 0,
            });
            state.progress.total += count;
            self.inner.signals.emit(Signal::Progress {
                current: state.progress.current,
                total: state.progress.total,
            });

            let deferred = !state.slot.is_idle();
            if !deferred {
                self.inner.wake.notify_one();
            }
            deferred
        };

        info!(
            "Queued batch {} with {} script(s){}",
            batch,
            count,
            if deferred { " behind running work" } else { "" }
        );
        self.inner
            .audit_record(&format!("Queued {} script(s): {}", count, listing), AuditCategory::Queue)
            .await;
        count
    }

    /// Completion signal from the status feed.
    ///
    /// Applies to the script in flight once its `play` has been sent;
    /// ignored while idle or while a program is still being loaded.
    pub async fn on_program_finished(&self) {
        let (script, completed) = {
            let mut state = self.inner.lock_state();
            let entry = match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::Running { entry, .. } => entry,
                Slot::Dispatching { ticket, entry, playing: true, .. } => {
                    debug!("Script {} finished before play returned", entry.script);
                    state.slot = Slot::Dispatching {
                        ticket,
                        entry,
                        playing: true,
                        finished_early: true,
                    };
                    return;
                }
                other => {
                    debug!("ProgramFinished ignored while {:?}", other);
                    state.slot = other;
                    return;
                }
            };

            let completed = state.complete(&entry, &self.inner.signals, &self.inner.wake);
            (entry.script, completed)
        };

        self.inner.announce_finished(&script, completed).await;
    }

    /// React to one classified status event
    pub async fn handle_event(&self, event: RobotEvent) {
        match event {
            RobotEvent::ProgramFinished => self.on_program_finished().await,
            RobotEvent::ErrorCondition(text) => {
                let condition = RobotError::RobotErrorCondition(text);
                self.inner
                    .audit_record(&condition.to_string(), AuditCategory::RobotError)
                    .await;
            }
            RobotEvent::Message(text) => debug!("Robot message passed through queue: {}", text),
        }
    }

    /// Consume classified status events until the listener goes away
    pub fn attach(&self, mut events: RobotEventReceiver) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                queue.handle_event(event).await;
            }
            debug!("Status event stream closed");
        })
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock_state();
        let (dispatching, running) = match &state.slot {
            Slot::Idle => (None, None),
            Slot::Dispatching { entry, .. } => (Some(entry.script.clone()), None),
            Slot::Running { entry, .. } => (None, Some(entry.script.clone())),
        };
        QueueSnapshot {
            pending: state.pending.iter().map(|entry| entry.script.clone()).collect(),
            dispatching,
            running,
            progress: state.progress,
        }
    }

    pub fn progress(&self) -> ExecutionProgress {
        self.inner.lock_state().progress
    }

    pub fn is_busy(&self) -> bool {
        !self.inner.lock_state().slot.is_idle()
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock_state();
        state.slot.is_idle() && state.pending.is_empty()
    }

    /// Resolve once every accepted script has finished or been dropped
    pub async fn wait_idle(&self) {
        let mut poll = tokio::time::interval(IDLE_POLL_INTERVAL);
        while !self.is_idle() {
            poll.tick().await;
        }
    }

    /// Stop the driver task; queued entries are left untouched
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
        self.inner.wake.notify_one();
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            driver.abort();
        }
        info!("Execution queue stopped");
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn audit_record(&self, message: &str, category: AuditCategory) {
        if let Err(e) = self.audit.record(message, category).await {
            warn!("Failed to record audit entry: {}", e);
        }
    }

    async fn announce_finished(&self, script: &str, completed: Option<(Uuid, usize)>) {
        info!("Script {} finished", script);
        if let Some((batch, total)) = completed {
            info!("Batch {} of {} script(s) complete", batch, total);
            self.audit_record(&format!("Batch of {} script(s) complete", total), AuditCategory::Queue)
                .await;
        }
    }

    /// Take the next entry if nothing is in flight
    fn begin_next(&self) -> Option<(u64, String)> {
        let mut state = self.lock_state();
        if !state.slot.is_idle() {
            return None;
        }
        let entry = state.pending.pop_front()?;
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let script = entry.script.clone();
        state.slot = Slot::Dispatching {
            ticket,
            entry,
            playing: false,
            finished_early: false,
        };
        Some((ticket, script))
    }

    fn begin_play(&self, ticket: u64) {
        let mut state = self.lock_state();
        if let Slot::Dispatching { ticket: current, playing, .. } = &mut state.slot {
            if *current == ticket {
                *playing = true;
            }
        }
    }

    async fn dispatch(&self, ticket: u64, script: &str) -> Result<()> {
        self.channel
            .load_program(script)
            .await
            .map_err(|e| RobotError::ScriptExecution {
                script: script.to_string(),
                reason: format!("load failed: {}", e),
            })?;
        self.begin_play(ticket);
        self.channel
            .play()
            .await
            .map_err(|e| RobotError::ScriptExecution {
                script: script.to_string(),
                reason: format!("play failed: {}", e),
            })
    }

    /// `play` returned: await completion, or apply one that already arrived
    async fn mark_running(self: &Arc<Self>, ticket: u64) {
        let finished = {
            let mut state = self.lock_state();
            match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::Dispatching { ticket: current, entry, finished_early, .. } if current == ticket => {
                    if finished_early {
                        let completed = state.complete(&entry, &self.signals, &self.wake);
                        Some((entry.script, completed))
                    } else {
                        info!("Script {} started", entry.script);
                        state.slot = Slot::Running { ticket, entry };
                        None
                    }
                }
                other => {
                    state.slot = other;
                    return;
                }
            }
        };

        if let Some((script, completed)) = finished {
            self.announce_finished(&script, completed).await;
            return;
        }

        if let Some(timeout) = self.finish_timeout {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.expire(ticket, timeout).await;
            });
        }
    }

    /// Release the slot after a failed dispatch; the entry is not retried
    async fn drop_failed(&self, ticket: u64, error: RobotError) {
        {
            let mut state = self.lock_state();
            if state.slot.ticket() != Some(ticket) {
                return;
            }
            if let Slot::Dispatching { entry, .. } = std::mem::replace(&mut state.slot, Slot::Idle) {
                state.fail(&entry);
            }
            // Work still pending is picked up by the driver loop itself
            if state.pending.is_empty() {
                state.settle(&self.wake);
            }
        }

        error!("{}", error);
        self.audit_record(&error.to_string(), AuditCategory::ScriptError).await;
    }

    /// A started script outlived the finish timeout
    async fn expire(&self, ticket: u64, timeout: Duration) {
        let script = {
            let mut state = self.lock_state();
            let entry = match std::mem::replace(&mut state.slot, Slot::Idle) {
                Slot::Running { ticket: current, entry } if current == ticket => entry,
                other => {
                    state.slot = other;
                    return;
                }
            };
            state.fail(&entry);
            state.settle(&self.wake);
            entry.script
        };

        let error = RobotError::ScriptExecution {
            script,
            reason: format!("no completion reported within {}s", timeout.as_secs_f64()),
        };
        error!("{}", error);
        self.audit_record(&error.to_string(), AuditCategory::ScriptError).await;
    }
}

async fn drive(inner: Arc<Inner>) {
    loop {
        inner.wake.notified().await;
        if inner.shutdown.load(Ordering::Relaxed) {
            break;
        }

        while let Some((ticket, script)) = inner.begin_next() {
            info!("Starting script {}", script);
            match inner.dispatch(ticket, &script).await {
                Ok(()) => {
                    inner.mark_running(ticket).await;
                    break;
                }
                Err(e) => inner.drop_failed(ticket, e).await,
            }
        }
    }
    debug!("Queue driver exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAudit;
    use crate::command::RobotCommand;
    use crate::SignalReceiver;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::mpsc;

    /// Records every command, fails the ones listed in `fail_on` and holds
    /// the call open after writing the ones listed in `linger_after`
    struct RecordingChannel {
        sent: mpsc::UnboundedSender<String>,
        fail_on: Mutex<HashSet<String>>,
        linger_after: Mutex<HashMap<String, Duration>>,
    }

    impl RecordingChannel {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (sent, receiver) = mpsc::unbounded_channel();
            let channel = Arc::new(Self {
                sent,
                fail_on: Mutex::new(HashSet::new()),
                linger_after: Mutex::new(HashMap::new()),
            });
            (channel, receiver)
        }

        fn fail_on(&self, command: &str) {
            self.fail_on.lock().unwrap().insert(command.to_string());
        }

        fn linger_after(&self, command: &str, delay: Duration) {
            self.linger_after.lock().unwrap().insert(command.to_string(), delay);
        }
    }

    #[async_trait]
    impl CommandChannel for RecordingChannel {
        async fn send(&self, command: RobotCommand) -> Result<()> {
            let text = command.to_string();
            if self.fail_on.lock().unwrap().contains(&text) {
                return Err(RobotError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection reset",
                )));
            }
            let linger = self.linger_after.lock().unwrap().get(&text).copied();
            self.sent.send(text).unwrap();
            if let Some(delay) = linger {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        }
    }

    struct Harness {
        queue: ExecutionQueue,
        sent: mpsc::UnboundedReceiver<String>,
        channel: Arc<RecordingChannel>,
        audit: Arc<MemoryAudit>,
        observer: SignalReceiver,
    }

    fn harness(finish_timeout: Option<Duration>) -> Harness {
        let (channel, sent) = RecordingChannel::new();
        let audit = Arc::new(MemoryAudit::new());
        let signals = Signals::new();
        let observer = signals.subscribe();
        let queue = ExecutionQueue::spawn(channel.clone(), signals, audit.clone(), finish_timeout);
        Harness { queue, sent, channel, audit, observer }
    }

    async fn next_command(sent: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), sent.recv())
            .await
            .expect("timed out waiting for command")
            .expect("command channel closed")
    }

    async fn assert_no_command(sent: &mut mpsc::UnboundedReceiver<String>) {
        let extra = tokio::time::timeout(Duration::from_millis(100), sent.recv()).await;
        assert!(extra.is_err(), "unexpected command: {:?}", extra);
    }

    async fn wait_until<F>(queue: &ExecutionQueue, predicate: F)
    where
        F: Fn(&QueueSnapshot) -> bool,
    {
        for _ in 0..200 {
            if predicate(&queue.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue never reached expected state: {:?}", queue.snapshot());
    }

    /// Report completion once the current script has actually been started
    async fn finish(queue: &ExecutionQueue) {
        wait_until(queue, |s| s.running.is_some()).await;
        queue.on_program_finished().await;
    }

    fn drain(observer: &mut SignalReceiver) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(signal) = observer.try_recv() {
            signals.push(signal);
        }
        signals
    }

    #[tokio::test]
    async fn test_batch_runs_in_order_and_completes() {
        let mut h = harness(None);

        assert_eq!(h.queue.submit(["home.urp", "pour_A.urp"]).await, 2);
        assert_eq!(next_command(&mut h.sent).await, "load home.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        assert_no_command(&mut h.sent).await;

        finish(&h.queue).await;
        assert_eq!(next_command(&mut h.sent).await, "load pour_A.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");

        finish(&h.queue).await;
        assert!(h.queue.snapshot().is_idle());
        assert_eq!(h.queue.progress(), ExecutionProgress::default());

        let signals = drain(&mut h.observer);
        assert_eq!(
            signals,
            vec![
                Signal::Progress { current: 0, total: 2 },
                Signal::Progress { current: 1, total: 2 },
                Signal::Progress { current: 2, total: 2 },
                Signal::BatchComplete { total: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_load_drops_entry_without_batch_complete() {
        let mut h = harness(None);
        h.channel.fail_on("load pour_A.urp");

        h.queue.submit(["home.urp", "pour_A.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load home.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;

        wait_until(&h.queue, |s| s.is_idle()).await;
        assert_no_command(&mut h.sent).await;

        let signals = drain(&mut h.observer);
        assert!(!signals.iter().any(|s| matches!(s, Signal::BatchComplete { .. })));

        let failures: Vec<_> = h
            .audit
            .entries()
            .into_iter()
            .filter(|e| e.category == AuditCategory::ScriptError)
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("pour_A.urp"));
    }

    #[tokio::test]
    async fn test_failed_entry_is_skipped_not_retried() {
        let mut h = harness(None);
        h.channel.fail_on("load pour_A.urp");

        h.queue.submit(["home.urp", "pour_A.urp", "garnish.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load home.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;

        assert_eq!(next_command(&mut h.sent).await, "load garnish.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;

        assert!(h.queue.snapshot().is_idle());
        assert_no_command(&mut h.sent).await;
    }

    #[tokio::test]
    async fn test_later_batch_waits_for_earlier_batch() {
        let mut h = harness(None);

        h.queue.submit(["a.urp", "b.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");

        h.queue.submit(vec!["c.urp".to_string()]).await;
        assert_no_command(&mut h.sent).await;
        assert_eq!(h.queue.snapshot().pending, vec!["b.urp", "c.urp"]);
        assert_eq!(h.queue.progress(), ExecutionProgress { current: 0, total: 3 });

        finish(&h.queue).await;
        assert_eq!(next_command(&mut h.sent).await, "load b.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;
        assert_eq!(next_command(&mut h.sent).await, "load c.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;

        let completions: Vec<_> = drain(&mut h.observer)
            .into_iter()
            .filter(|s| matches!(s, Signal::BatchComplete { .. }))
            .collect();
        assert_eq!(
            completions,
            vec![Signal::BatchComplete { total: 2 }, Signal::BatchComplete { total: 1 }]
        );
    }

    #[tokio::test]
    async fn test_clean_batch_completes_after_failed_batch() {
        let mut h = harness(None);
        h.channel.fail_on("load bad.urp");

        h.queue.submit(["a.urp", "bad.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        h.queue.submit(["c.urp"]).await;

        finish(&h.queue).await;
        assert_eq!(next_command(&mut h.sent).await, "load c.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;
        assert!(h.queue.snapshot().is_idle());

        let signals = drain(&mut h.observer);
        assert_eq!(
            signals,
            vec![
                Signal::Progress { current: 0, total: 2 },
                Signal::Progress { current: 0, total: 3 },
                Signal::Progress { current: 1, total: 3 },
                Signal::Progress { current: 2, total: 3 },
                Signal::BatchComplete { total: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_while_play_returns_still_advances() {
        let mut h = harness(None);
        h.channel.linger_after("play", Duration::from_millis(50));

        h.queue.submit(["short.urp", "next.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load short.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");

        // The program ends before the play call has returned
        assert_eq!(h.queue.snapshot().dispatching.as_deref(), Some("short.urp"));
        h.queue.on_program_finished().await;

        assert_eq!(next_command(&mut h.sent).await, "load next.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        wait_until(&h.queue, |s| s.running.as_deref() == Some("next.urp")).await;
        assert_eq!(h.queue.progress(), ExecutionProgress { current: 1, total: 2 });

        h.queue.on_program_finished().await;
        assert!(h.queue.snapshot().is_idle());
        assert_eq!(
            drain(&mut h.observer).last(),
            Some(&Signal::BatchComplete { total: 2 })
        );
    }

    #[tokio::test]
    async fn test_finish_while_loading_is_ignored() {
        let mut h = harness(None);
        h.channel.linger_after("load a.urp", Duration::from_millis(50));

        h.queue.submit(["a.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        h.queue.on_program_finished().await;

        assert_eq!(next_command(&mut h.sent).await, "play");
        wait_until(&h.queue, |s| s.running.is_some()).await;
        assert_eq!(h.queue.progress(), ExecutionProgress { current: 0, total: 1 });
    }

    #[tokio::test]
    async fn test_empty_submission_is_noop() {
        let mut h = harness(None);

        assert_eq!(h.queue.submit(Vec::<String>::new()).await, 0);
        assert_eq!(h.queue.submit(["  ", ""]).await, 0);

        assert_no_command(&mut h.sent).await;
        assert!(!h.queue.is_busy());
        assert!(drain(&mut h.observer).is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_finished_while_idle_is_ignored() {
        let mut h = harness(None);

        h.queue.on_program_finished().await;
        h.queue.handle_event(RobotEvent::ProgramFinished).await;

        assert_eq!(h.queue.progress(), ExecutionProgress::default());
        assert!(h.queue.snapshot().is_idle());
        assert_no_command(&mut h.sent).await;
        assert!(drain(&mut h.observer).is_empty());
    }

    #[tokio::test]
    async fn test_error_condition_is_audited_without_advancing() {
        let mut h = harness(None);

        h.queue.submit(["a.urp", "b.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        wait_until(&h.queue, |s| s.running.is_some()).await;

        h.queue
            .handle_event(RobotEvent::ErrorCondition("PROTECTIVE_STOP".to_string()))
            .await;

        assert_no_command(&mut h.sent).await;
        assert_eq!(h.queue.snapshot().running.as_deref(), Some("a.urp"));
        let entries = h.audit.entries();
        assert!(entries
            .iter()
            .any(|e| e.category == AuditCategory::RobotError && e.message.contains("PROTECTIVE_STOP")));
    }

    #[tokio::test]
    async fn test_attached_event_stream_drives_queue() {
        let mut h = harness(None);
        let (events, receiver) = mpsc::unbounded_channel();
        let pump = h.queue.attach(receiver);

        h.queue.submit(["a.urp", "b.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        wait_until(&h.queue, |s| s.running.is_some()).await;

        events.send(RobotEvent::ProgramFinished).unwrap();
        assert_eq!(next_command(&mut h.sent).await, "load b.urp");

        drop(events);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_finish_timeout_drops_silent_script() {
        let mut h = harness(Some(Duration::from_millis(50)));

        h.queue.submit(["stuck.urp", "next.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load stuck.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");

        // Advances without any ProgramFinished
        assert_eq!(next_command(&mut h.sent).await, "load next.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");

        wait_until(&h.queue, |s| s.is_idle()).await;
        let expired: Vec<_> = h
            .audit
            .entries()
            .into_iter()
            .filter(|e| e.category == AuditCategory::ScriptError)
            .map(|e| e.message)
            .collect();
        assert_eq!(expired.len(), 2);
        assert!(expired[0].contains("stuck.urp"));
        assert!(expired[1].contains("next.urp"));
        assert!(!drain(&mut h.observer)
            .iter()
            .any(|s| matches!(s, Signal::BatchComplete { .. })));
    }

    #[tokio::test]
    async fn test_stale_finish_timer_is_ignored() {
        let mut h = harness(Some(Duration::from_millis(200)));

        h.queue.submit(["a.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        finish(&h.queue).await;

        h.queue.submit(["b.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load b.urp");
        assert_eq!(next_command(&mut h.sent).await, "play");
        finish(&h.queue).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(h
            .audit
            .entries()
            .iter()
            .all(|e| e.category != AuditCategory::ScriptError));
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_last_finish() {
        let mut h = harness(None);
        assert!(h.queue.is_idle());
        h.queue.wait_idle().await;

        h.queue.submit(["a.urp"]).await;
        assert_eq!(next_command(&mut h.sent).await, "load a.urp");
        let waiter = tokio::spawn({
            let queue = h.queue.clone();
            async move { queue.wait_idle().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        finish(&h.queue).await;
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("queue never went idle")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatch() {
        let mut h = harness(None);

        h.queue.shutdown();
        h.queue.submit(["a.urp"]).await;

        assert_no_command(&mut h.sent).await;
        assert_eq!(h.queue.snapshot().pending, vec!["a.urp"]);
    }
}
