use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::buffer::EventBuffer;
use super::sampler::should_sample;
use super::worker::{BusyWorkers, DeliveryStatus, DeliveryWorkerPool};
use super::{Message, MessageKind, SharedState};
use crate::dedup::ContextDeduplicator;
use crate::diagnostic::{DiagnosticEvent, DiagnosticStore};
use crate::event::{now_millis, Event, FeatureRequestEvent, IndexEvent};
use crate::sender::EventSender;

/// Maximum messages taken from the inbox per wakeup.
const MESSAGE_BATCH_SIZE: usize = 50;

/// Single consumer of the processor inbox. Owns the event buffer, the
/// summary counters and the deduplicator.
pub(crate) struct Dispatcher<S> {
    pub(crate) buffer: EventBuffer,
    pub(crate) dedup: Option<Box<dyn ContextDeduplicator>>,
    pub(crate) diagnostic_store: Option<Arc<DiagnosticStore>>,
    pub(crate) sender: Arc<S>,
    pub(crate) workers: DeliveryWorkerPool,
    pub(crate) busy: Arc<BusyWorkers>,
    pub(crate) status: Arc<DeliveryStatus>,
    pub(crate) state: Arc<SharedState>,
    pub(crate) events_uri: Arc<str>,
    pub(crate) deduplicated_users: u64,
}

impl<S: EventSender> Dispatcher<S> {
    /// Runs until a shutdown message is processed or the inbox closes.
    ///
    /// A panic anywhere in message handling leaves the processor closed:
    /// queued messages are discarded with their waiters released, and
    /// nothing further is delivered.
    pub(crate) async fn run(mut self, mut inbox: mpsc::Receiver<Message>) {
        let outcome = AssertUnwindSafe(self.run_loop(&mut inbox))
            .catch_unwind()
            .await;

        let Err(panic) = outcome else {
            return;
        };

        error!(
            error = panic_message(panic.as_ref()),
            "Event processor task was terminated by an unrecoverable error. No more analytics events will be sent."
        );
        self.state.closed.store(true, Ordering::Release);
        self.status.disable();
        self.workers.stop();

        inbox.close();
        let mut discarded = 0usize;
        while let Ok(message) = inbox.try_recv() {
            message.reply.fire();
            discarded += 1;
        }
        debug!(discarded, "released queued messages after failure");
    }

    async fn run_loop(&mut self, inbox: &mut mpsc::Receiver<Message>) {
        let mut batch = Vec::with_capacity(MESSAGE_BATCH_SIZE);
        loop {
            let Some(first) = inbox.recv().await else {
                debug!("event inbox closed");
                return;
            };
            batch.push(first);
            while batch.len() < MESSAGE_BATCH_SIZE {
                match inbox.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(_) => break,
                }
            }

            for Message { kind, reply } in batch.drain(..) {
                if let MessageKind::Shutdown = kind {
                    self.shutdown().await;
                    reply.fire();
                    info!("event processor shut down");
                    return;
                }
                self.handle(kind).await;
                reply.fire();
            }
        }
    }

    async fn handle(&mut self, kind: MessageKind) {
        match kind {
            MessageKind::Event(event) => self.process_event(event),
            MessageKind::Flush => {
                if !self.state.is_offline() {
                    self.trigger_flush();
                }
            }
            MessageKind::FlushDedupCache => {
                if let Some(dedup) = self.dedup.as_mut() {
                    dedup.flush();
                }
            }
            MessageKind::DiagnosticInit => {
                if !self.state.is_offline()
                    && !self.state.is_in_background()
                    && !self.state.diagnostic_init_sent.load(Ordering::Acquire)
                {
                    if let Some(store) = &self.diagnostic_store {
                        self.spawn_diagnostic(store.init_event());
                    }
                }
            }
            MessageKind::DiagnosticStats => {
                if !self.state.is_offline() && !self.state.is_in_background() {
                    self.send_and_reset_diagnostics();
                }
            }
            MessageKind::Sync => {
                let busy = self.busy.clone();
                busy.wait_idle().await;
            }
            MessageKind::Shutdown => {}
        }
    }

    /// Applies summarization, deduplication, debug derivation and sampling
    /// to one incoming event.
    pub(crate) fn process_event(&mut self, event: Event) {
        if self.status.is_disabled() {
            return;
        }

        // Migration events are never summarized and never produce index or
        // debug events.
        if let Event::MigrationOp(_) = &event {
            if should_sample(event.sampling_ratio()) {
                self.buffer.add(event);
            }
            return;
        }

        // Invalid but non-empty contexts are still counted; the formatter
        // leaves their events out of the payload.
        let context = event.context();
        if context.is_empty() {
            return;
        }

        let mut add_full_event = true;
        let mut debug_event = None;
        if let Event::FeatureRequest(fe) = &event {
            if !fe.exclude_from_summaries {
                self.buffer.add_to_summary(fe);
            }
            add_full_event = fe.track_events;
            if self.should_debug(fe) {
                debug_event = Some(Event::FeatureRequest(fe.to_debug_event()));
            }
        }

        let mut add_index_event = false;
        let dedup = self.dedup.as_mut().filter(|_| context.is_valid());
        if let Some(dedup) = dedup {
            match &event {
                Event::FeatureRequest(_) | Event::Custom(_) => {
                    add_index_event = dedup.process_context(context);
                    if !add_index_event {
                        self.deduplicated_users += 1;
                    }
                }
                Event::Identify(_) => {
                    dedup.process_context(context);
                }
                _ => {}
            }
        }

        let ratio = event.sampling_ratio();
        if add_index_event {
            self.buffer.add(Event::Index(IndexEvent {
                creation_date: event.creation_date(),
                context: context.clone(),
            }));
        }
        if add_full_event && should_sample(ratio) {
            self.buffer.add(event);
        }
        if let Some(debug_event) = debug_event {
            if should_sample(ratio) {
                self.buffer.add(debug_event);
            }
        }
    }

    /// A debug copy is due while `debug_events_until_date` is ahead of both
    /// the local clock and the last server time we have seen.
    fn should_debug(&self, fe: &FeatureRequestEvent) -> bool {
        let until = fe.debug_events_until_date;
        until > 0 && until > self.status.last_known_past_time() && until > now_millis()
    }

    /// Moves the buffer into a payload and offers it to the workers. If
    /// they are all busy the payload is put back for the next attempt.
    pub(crate) fn trigger_flush(&mut self) {
        if self.status.is_disabled() || self.buffer.is_empty() {
            return;
        }

        let payload = self.buffer.take_payload();
        if let Some(store) = &self.diagnostic_store {
            store.record_events_in_batch(payload.output_count() as u64);
        }

        self.busy.increment();
        if let Err(payload) = self.workers.try_handoff(payload) {
            debug!(
                events = payload.events.len(),
                "skipped flushing because all workers are busy"
            );
            self.buffer.restore_payload(payload);
            self.busy.decrement();
        }
    }

    fn send_and_reset_diagnostics(&mut self) {
        if self.status.is_disabled() {
            return;
        }
        let Some(store) = &self.diagnostic_store else {
            return;
        };
        let dropped = self.buffer.get_and_clear_dropped_count();
        let event = store.create_event_and_reset(dropped, self.deduplicated_users);
        self.deduplicated_users = 0;
        self.spawn_diagnostic(event);
    }

    fn spawn_diagnostic(&self, event: DiagnosticEvent) {
        let sender = self.sender.clone();
        let status = self.status.clone();
        let state = self.state.clone();
        let events_uri = self.events_uri.clone();

        tokio::spawn(async move {
            let data = match event.to_json() {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "failed to serialize diagnostic event");
                    return;
                }
            };
            let result = sender.send_diagnostic_event(data, &events_uri).await;
            status.handle_response(&result);
            if event.is_init() {
                state.diagnostic_init_sent.store(true, Ordering::Release);
            }
        });
    }

    async fn shutdown(&mut self) {
        let busy = self.busy.clone();
        busy.wait_idle().await;
        self.status.disable();
        self.workers.stop();

        let sender = self.sender.clone();
        if let Err(e) = sender.close().await {
            error!(error = %e, "unexpected error when closing event sender");
            debug!(error = ?e, "event sender close failure detail");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
