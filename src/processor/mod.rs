pub mod buffer;
mod dispatcher;
pub mod sampler;
pub mod summarizer;
pub mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EventsConfig;
use crate::dedup::ContextDeduplicator;
use crate::diagnostic::DiagnosticStore;
use crate::event::Event;
use crate::output::EventOutputFormatter;
use crate::sender::EventSender;

use self::buffer::EventBuffer;
use self::dispatcher::Dispatcher;
use self::worker::{BusyWorkers, DeliveryStatus, DeliveryWorkerPool};

/// Work items consumed by the dispatcher.
pub(crate) enum MessageKind {
    Event(Event),
    Flush,
    FlushDedupCache,
    DiagnosticInit,
    DiagnosticStats,
    Sync,
    Shutdown,
}

/// Single-fire completion signal. Dropping it without firing also releases
/// the waiter.
pub(crate) struct Completion(Option<oneshot::Sender<()>>);

impl Completion {
    pub(crate) fn fire(self) {
        if let Some(tx) = self.0 {
            let _ = tx.send(());
        }
    }
}

pub(crate) struct Message {
    kind: MessageKind,
    reply: Completion,
}

/// Mode flags shared between the facade and the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    offline: AtomicBool,
    in_background: AtomicBool,
    closed: AtomicBool,
    diagnostic_init_sent: AtomicBool,
}

impl SharedState {
    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }

    fn is_in_background(&self) -> bool {
        self.in_background.load(Ordering::Acquire)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Producer side of the dispatcher inbox.
struct Inbox {
    tx: mpsc::Sender<Message>,
    capacity_exceeded: AtomicBool,
}

impl Inbox {
    /// Posts without waiting. A full inbox drops the message and warns once
    /// per overflow episode.
    fn post(&self, kind: MessageKind) -> bool {
        self.offer(Message {
            kind,
            reply: Completion(None),
        })
    }

    /// Posts and waits for the dispatcher to finish the message.
    async fn post_and_wait(&self, kind: MessageKind) {
        let (tx, rx) = oneshot::channel();
        let message = Message {
            kind,
            reply: Completion(Some(tx)),
        };
        if self.offer(message) {
            // An error means the message was dropped, which also ends the wait.
            let _ = rx.await;
        }
    }

    /// Posts, waiting for room in the inbox instead of dropping. A closed
    /// inbox makes this a no-op.
    async fn send(&self, kind: MessageKind) {
        let message = Message {
            kind,
            reply: Completion(None),
        };
        let _ = self.tx.send(message).await;
    }

    /// Like [`send`](Self::send), then waits for the dispatcher to finish
    /// the message.
    async fn send_and_wait(&self, kind: MessageKind) {
        let (tx, rx) = oneshot::channel();
        let message = Message {
            kind,
            reply: Completion(Some(tx)),
        };
        if self.tx.send(message).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn offer(&self, message: Message) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.capacity_exceeded.store(false, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.capacity_exceeded.swap(true, Ordering::Relaxed) {
                    warn!("Events are being produced faster than they can be processed, some events will be dropped");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Cancellation handles of the periodic tasks currently scheduled.
#[derive(Default)]
struct ScheduledTasks {
    flush: Option<CancellationToken>,
    diagnostics: Option<CancellationToken>,
    dedup_flush: Option<CancellationToken>,
}

impl ScheduledTasks {
    fn cancel_all(&mut self) {
        for token in [
            self.flush.take(),
            self.diagnostics.take(),
            self.dedup_flush.take(),
        ]
        .into_iter()
        .flatten()
        {
            token.cancel();
        }
    }
}

/// Thread-safe entry point of the analytics event pipeline.
///
/// Every method except [`flush_blocking`](Self::flush_blocking) and
/// [`close`](Self::close) returns immediately and may be called from any
/// thread. Events are shaped and delivered on tasks of the tokio runtime
/// the processor was started on.
pub struct EventProcessor {
    inbox: Arc<Inbox>,
    state: Arc<SharedState>,
    /// State lock: serializes mode changes and task (re)scheduling.
    tasks: Mutex<ScheduledTasks>,
    runtime: Handle,
    flush_interval: Duration,
    diagnostic_interval: Duration,
    diagnostics_enabled: bool,
}

impl EventProcessor {
    /// Starts configuring a processor that delivers through `sender`.
    pub fn builder<S: EventSender>(config: EventsConfig, sender: Arc<S>) -> EventProcessorBuilder<S> {
        EventProcessorBuilder {
            config,
            sender,
            dedup: None,
            diagnostic_store: None,
        }
    }

    /// Queues an event. Dropped silently once the processor is closed.
    pub fn send_event(&self, event: impl Into<Event>) {
        if !self.state.is_closed() {
            self.inbox.post(MessageKind::Event(event.into()));
        }
    }

    /// Requests delivery of everything buffered so far.
    pub fn flush_async(&self) {
        if !self.state.is_closed() {
            self.inbox.post(MessageKind::Flush);
        }
    }

    /// Like [`flush_async`](Self::flush_async), but waits until the
    /// dispatcher has handled the request.
    pub async fn flush_blocking(&self) {
        if !self.state.is_closed() {
            self.inbox.post_and_wait(MessageKind::Flush).await;
        }
    }

    /// Ignored once the processor is closed.
    pub fn set_in_background(&self, in_background: bool) {
        let mut tasks = self.tasks.lock();
        if self.state.is_closed() {
            return;
        }
        if self.state.in_background.swap(in_background, Ordering::AcqRel) == in_background {
            return;
        }
        self.update_scheduled_tasks(&mut tasks, in_background, self.state.is_offline());
    }

    /// Ignored once the processor is closed.
    pub fn set_offline(&self, offline: bool) {
        let mut tasks = self.tasks.lock();
        if self.state.is_closed() {
            return;
        }
        if self.state.offline.swap(offline, Ordering::AcqRel) == offline {
            return;
        }
        self.update_scheduled_tasks(&mut tasks, self.state.is_in_background(), offline);
    }

    /// True once the processor has been closed or has failed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Flushes, waits for in-flight deliveries and shuts the pipeline down.
    /// Unlike the other posts, the final flush and shutdown wait for room in
    /// a full inbox. Later calls return immediately.
    pub async fn close(&self) {
        if self
            .state
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.tasks.lock().cancel_all();
        self.inbox.send(MessageKind::Flush).await;
        self.inbox.send_and_wait(MessageKind::Shutdown).await;
    }

    /// Waits until every handed-off payload has been delivered.
    pub async fn wait_until_inactive(&self) {
        self.inbox.post_and_wait(MessageKind::Sync).await;
    }

    /// Requests a statistics diagnostic event now instead of at the next
    /// scheduled interval.
    pub fn post_diagnostic(&self) {
        self.inbox.post(MessageKind::DiagnosticStats);
    }

    fn update_scheduled_tasks(&self, tasks: &mut ScheduledTasks, in_background: bool, offline: bool) {
        tasks.flush = self.enable_or_disable_task(
            !offline,
            tasks.flush.take(),
            self.flush_interval,
            || MessageKind::Flush,
        );

        tasks.diagnostics = self.enable_or_disable_task(
            !offline && !in_background && self.diagnostics_enabled,
            tasks.diagnostics.take(),
            self.diagnostic_interval,
            || MessageKind::DiagnosticStats,
        );

        // Covers starting offline or in the background, which skips the
        // init event until the first transition to online foreground.
        if !in_background
            && !offline
            && self.diagnostics_enabled
            && !self.state.diagnostic_init_sent.load(Ordering::Acquire)
        {
            self.inbox.post(MessageKind::DiagnosticInit);
        }
    }

    fn enable_or_disable_task(
        &self,
        should_enable: bool,
        current: Option<CancellationToken>,
        period: Duration,
        message: fn() -> MessageKind,
    ) -> Option<CancellationToken> {
        match (should_enable, current) {
            (true, Some(token)) => Some(token),
            (true, None) => Some(spawn_periodic(&self.runtime, self.inbox.clone(), period, message)),
            (false, Some(token)) => {
                token.cancel();
                None
            }
            (false, None) => None,
        }
    }
}

impl Drop for EventProcessor {
    fn drop(&mut self) {
        // Periodic tasks hold the inbox open; without them the dispatcher
        // exits once the last sender is gone.
        self.tasks.lock().cancel_all();
    }
}

fn spawn_periodic(
    runtime: &Handle,
    inbox: Arc<Inbox>,
    period: Duration,
    message: fn() -> MessageKind,
) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    inbox.post(message());
                }
            }
        }
    });
    token
}

/// Configures and starts an [`EventProcessor`].
pub struct EventProcessorBuilder<S> {
    config: EventsConfig,
    sender: Arc<S>,
    dedup: Option<Box<dyn ContextDeduplicator>>,
    diagnostic_store: Option<Arc<DiagnosticStore>>,
}

impl<S: EventSender> EventProcessorBuilder<S> {
    /// Enables index events, suppressing repeats for contexts the
    /// deduplicator has already seen.
    pub fn context_deduplicator(mut self, dedup: impl ContextDeduplicator + 'static) -> Self {
        self.dedup = Some(Box::new(dedup));
        self
    }

    /// Enables diagnostic events.
    pub fn diagnostic_store(mut self, store: Arc<DiagnosticStore>) -> Self {
        self.diagnostic_store = Some(store);
        self
    }

    /// Spawns the dispatcher and delivery workers on the current tokio
    /// runtime and schedules the periodic tasks.
    pub fn start(self) -> Result<EventProcessor> {
        let Self {
            config,
            sender,
            dedup,
            diagnostic_store,
        } = self;

        config.validate()?;
        let runtime = Handle::try_current().context("event processor must be started inside a tokio runtime")?;

        let capacity = config.capacity();
        let workers = config.worker_count();
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let state = Arc::new(SharedState::default());
        state.offline.store(config.initially_offline, Ordering::Release);
        state
            .in_background
            .store(config.initially_in_background, Ordering::Release);

        let busy = Arc::new(BusyWorkers::new());
        let status = Arc::new(DeliveryStatus::default());
        let events_uri: Arc<str> = Arc::from(config.events_uri.as_str());

        let pool = DeliveryWorkerPool::start(
            &runtime,
            workers,
            sender.clone(),
            EventOutputFormatter::new(&config),
            events_uri.clone(),
            busy.clone(),
            status.clone(),
        );

        let dedup_interval = dedup
            .as_ref()
            .and_then(|d| d.flush_interval().or(config.context_keys_flush_interval))
            .filter(|d| !d.is_zero());
        let diagnostics_enabled = diagnostic_store.is_some();

        let dispatcher = Dispatcher {
            buffer: EventBuffer::new(capacity),
            dedup,
            diagnostic_store,
            sender,
            workers: pool,
            busy,
            status,
            state: state.clone(),
            events_uri,
            deduplicated_users: 0,
        };
        runtime.spawn(dispatcher.run(rx));

        info!(
            capacity,
            workers,
            flush_interval = ?config.flush_interval,
            diagnostics = diagnostics_enabled,
            offline = config.initially_offline,
            in_background = config.initially_in_background,
            "started event processor",
        );

        let processor = EventProcessor {
            inbox: Arc::new(Inbox {
                tx,
                capacity_exceeded: AtomicBool::new(false),
            }),
            state,
            tasks: Mutex::new(ScheduledTasks::default()),
            runtime,
            flush_interval: config.flush_interval,
            diagnostic_interval: config.diagnostic_recording_interval,
            diagnostics_enabled,
        };

        {
            let mut tasks = processor.tasks.lock();
            processor.update_scheduled_tasks(
                &mut tasks,
                config.initially_in_background,
                config.initially_offline,
            );
            // The dedup flush runs regardless of offline or background mode.
            if let Some(interval) = dedup_interval {
                tasks.dedup_flush = processor.enable_or_disable_task(
                    true,
                    None,
                    interval,
                    || MessageKind::FlushDedupCache,
                );
            }
        }

        Ok(processor)
    }
}
