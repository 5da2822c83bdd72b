use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::buffer::FlushPayload;
use crate::output::EventOutputFormatter;
use crate::sender::{EventSender, SendResult};

/// Number of flush payloads that have been handed off but not yet
/// delivered.
#[derive(Debug)]
pub struct BusyWorkers {
    count: watch::Sender<usize>,
}

impl BusyWorkers {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    pub fn increment(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    pub fn decrement(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn get(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolves once no payload is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for BusyWorkers {
    fn default() -> Self {
        Self::new()
    }
}

/// Collector feedback shared by the dispatcher, the workers and diagnostic
/// send tasks.
#[derive(Debug, Default)]
pub struct DeliveryStatus {
    last_known_past_time: AtomicU64,
    disabled: AtomicBool,
}

impl DeliveryStatus {
    /// Applies the server clock and shutdown signal carried by a response.
    pub fn handle_response(&self, result: &SendResult) {
        if let Some(t) = result.time_from_server {
            let millis = u64::try_from(t.timestamp_millis()).unwrap_or(0);
            self.last_known_past_time.store(millis, Ordering::Release);
        }
        if result.must_shutdown {
            self.disable();
        }
    }

    /// Latest server time we know has already passed, in Unix millis.
    pub fn last_known_past_time(&self) -> u64 {
        self.last_known_past_time.load(Ordering::Acquire)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }
}

/// Fixed set of tasks delivering flush payloads.
///
/// Payloads arrive through a one-slot queue: a rejected `try_handoff` means
/// every worker is still busy with an earlier payload.
#[derive(Debug)]
pub struct DeliveryWorkerPool {
    handoff: mpsc::Sender<FlushPayload>,
    stop: CancellationToken,
}

impl DeliveryWorkerPool {
    pub fn start<S: EventSender>(
        runtime: &Handle,
        workers: usize,
        sender: Arc<S>,
        formatter: EventOutputFormatter,
        events_uri: Arc<str>,
        busy: Arc<BusyWorkers>,
        status: Arc<DeliveryStatus>,
    ) -> Self {
        let (handoff, rx) = mpsc::channel::<FlushPayload>(1);
        let rx = Arc::new(Mutex::new(rx));
        let stop = CancellationToken::new();

        for id in 0..workers {
            let worker = Worker {
                id,
                rx: rx.clone(),
                stop: stop.clone(),
                sender: sender.clone(),
                formatter: formatter.clone(),
                events_uri: events_uri.clone(),
                busy: busy.clone(),
                status: status.clone(),
            };
            runtime.spawn(worker.run());
        }

        Self { handoff, stop }
    }

    /// Offers a payload without waiting. On rejection the payload is
    /// returned to the caller untouched.
    pub fn try_handoff(&self, payload: FlushPayload) -> Result<(), FlushPayload> {
        self.handoff.try_send(payload).map_err(|e| e.into_inner())
    }

    /// Stops every worker once its current delivery, if any, completes.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

struct Worker<S> {
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<FlushPayload>>>,
    stop: CancellationToken,
    sender: Arc<S>,
    formatter: EventOutputFormatter,
    events_uri: Arc<str>,
    busy: Arc<BusyWorkers>,
    status: Arc<DeliveryStatus>,
}

impl<S: EventSender> Worker<S> {
    async fn run(self) {
        loop {
            let payload = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                payload = self.next_payload() => match payload {
                    Some(p) => p,
                    None => break,
                },
            };

            let delivery = AssertUnwindSafe(self.deliver(payload)).catch_unwind().await;
            if delivery.is_err() {
                error!(worker = self.id, "event delivery task panicked");
            }
            self.busy.decrement();
        }
        debug!(worker = self.id, "delivery worker stopped");
    }

    async fn next_payload(&self) -> Option<FlushPayload> {
        self.rx.lock().await.recv().await
    }

    async fn deliver(&self, payload: FlushPayload) {
        let (data, count) = match self.formatter.format(&payload.events, &payload.summary) {
            Ok(out) => out,
            Err(e) => {
                error!(worker = self.id, error = %e, "failed to serialize analytics events");
                debug!(worker = self.id, error = ?e, "serialization failure detail");
                return;
            }
        };

        let result = self
            .sender
            .send_analytics_events(data, count, &self.events_uri)
            .await;
        self.status.handle_response(&result);

        debug!(
            worker = self.id,
            events = count,
            success = result.success,
            must_shutdown = result.must_shutdown,
            "delivered analytics batch",
        );
    }
}
