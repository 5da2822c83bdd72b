use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

use flag_events::event::{CustomEvent, FeatureRequestEvent};
use flag_events::{
    Context, ContextDeduplicator, DiagnosticStore, EventProcessor, EventSender, EventsConfig,
    SdkDiagnosticParams, SendResult,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Delivery {
    body: Value,
    count: usize,
    base_uri: String,
}

/// Captures every payload handed to the transport.
struct MockEventSender {
    analytics: mpsc::UnboundedSender<Delivery>,
    diagnostics: mpsc::UnboundedSender<Delivery>,
    analytics_result: SendResult,
    /// When set, each analytics delivery waits for a permit.
    gate: Option<Arc<Semaphore>>,
    closed: AtomicBool,
}

struct Captured {
    analytics: mpsc::UnboundedReceiver<Delivery>,
    diagnostics: mpsc::UnboundedReceiver<Delivery>,
}

fn mock_sender(analytics_result: SendResult, gate: Option<Arc<Semaphore>>) -> (Arc<MockEventSender>, Captured) {
    let (analytics_tx, analytics_rx) = mpsc::unbounded_channel();
    let (diagnostics_tx, diagnostics_rx) = mpsc::unbounded_channel();
    let sender = MockEventSender {
        analytics: analytics_tx,
        diagnostics: diagnostics_tx,
        analytics_result,
        gate,
        closed: AtomicBool::new(false),
    };
    let captured = Captured {
        analytics: analytics_rx,
        diagnostics: diagnostics_rx,
    };
    (Arc::new(sender), captured)
}

fn ok_sender() -> (Arc<MockEventSender>, Captured) {
    mock_sender(SendResult::ok(None), None)
}

impl EventSender for MockEventSender {
    async fn send_analytics_events(&self, data: Vec<u8>, event_count: usize, base_uri: &str) -> SendResult {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        let body = serde_json::from_slice(&data).expect("analytics payload is JSON");
        let _ = self.analytics.send(Delivery {
            body,
            count: event_count,
            base_uri: base_uri.to_string(),
        });
        self.analytics_result
    }

    async fn send_diagnostic_event(&self, data: Vec<u8>, base_uri: &str) -> SendResult {
        let body = serde_json::from_slice(&data).expect("diagnostic payload is JSON");
        let _ = self.diagnostics.send(Delivery {
            body,
            count: 1,
            base_uri: base_uri.to_string(),
        });
        SendResult::ok(None)
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Captured {
    async fn next_analytics(&mut self) -> Delivery {
        timeout(RECV_TIMEOUT, self.analytics.recv())
            .await
            .expect("analytics payload delivered in time")
            .expect("sender still alive")
    }

    async fn next_diagnostic(&mut self, kind: &str) -> Delivery {
        loop {
            let delivery = timeout(RECV_TIMEOUT, self.diagnostics.recv())
                .await
                .expect("diagnostic event delivered in time")
                .expect("sender still alive");
            if delivery.body["kind"] == kind {
                return delivery;
            }
        }
    }

    async fn assert_no_analytics(&mut self) {
        let got = timeout(QUIET_PERIOD, self.analytics.recv()).await;
        assert!(got.is_err(), "unexpected analytics payload: {got:?}");
    }

    async fn assert_no_diagnostics(&mut self) {
        let got = timeout(QUIET_PERIOD, self.diagnostics.recv()).await;
        assert!(got.is_err(), "unexpected diagnostic event: {got:?}");
    }
}

/// Reports each context once until flushed.
struct SeenOnce {
    seen: HashSet<String>,
    interval: Option<Duration>,
}

impl SeenOnce {
    fn new(interval: Option<Duration>) -> Self {
        Self {
            seen: HashSet::new(),
            interval,
        }
    }
}

impl ContextDeduplicator for SeenOnce {
    fn flush_interval(&self) -> Option<Duration> {
        self.interval
    }

    fn process_context(&mut self, context: &Context) -> bool {
        self.seen.insert(context.fully_qualified_key().unwrap_or_default())
    }

    fn flush(&mut self) {
        self.seen.clear();
    }
}

struct PanickingDedup;

impl ContextDeduplicator for PanickingDedup {
    fn flush_interval(&self) -> Option<Duration> {
        None
    }

    fn process_context(&mut self, _context: &Context) -> bool {
        panic!("deduplicator blew up");
    }

    fn flush(&mut self) {}
}

fn diagnostic_store() -> Arc<DiagnosticStore> {
    Arc::new(DiagnosticStore::new(SdkDiagnosticParams {
        sdk_key: "sdk-key-123456".into(),
        sdk_name: "test-sdk".into(),
        sdk_version: "9.9.9".into(),
        platform_name: "test-platform".into(),
        ..Default::default()
    }))
}

fn feature(key: &str, context_key: &str) -> FeatureRequestEvent {
    FeatureRequestEvent::new(key, Context::user(context_key), Value::from("on"), Value::from("off"))
}

fn custom(key: &str) -> CustomEvent {
    CustomEvent::new(key, Context::user("u"))
}

fn kinds(body: &Value) -> Vec<String> {
    body.as_array()
        .expect("payload is an array")
        .iter()
        .map(|e| e["kind"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_untracked_evaluations_yield_index_and_summary() {
    let (sender, mut captured) = ok_sender();
    let ep = EventProcessor::builder(EventsConfig::default(), sender)
        .context_deduplicator(SeenOnce::new(None))
        .start()
        .expect("start processor");

    ep.send_event(feature("flag-a", "u"));
    ep.send_event(feature("flag-b", "u"));
    ep.flush_blocking().await;

    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.count, 2);
    assert_eq!(kinds(&delivery.body), vec!["index", "summary"]);
    let features = &delivery.body[1]["features"];
    assert_eq!(features["flag-a"]["counters"][0]["count"], 1);
    assert_eq!(features["flag-b"]["counters"][0]["count"], 1);
    assert_eq!(features["flag-a"]["contextKinds"][0], "user");
    ep.close().await;
}

#[tokio::test]
async fn test_diagnostic_stats_report_batch_and_deduplication() {
    let (sender, mut captured) = ok_sender();
    let ep = EventProcessor::builder(EventsConfig::default(), sender)
        .context_deduplicator(SeenOnce::new(None))
        .diagnostic_store(diagnostic_store())
        .start()
        .expect("start processor");

    ep.send_event(feature("flag-a", "u"));
    ep.send_event(feature("flag-b", "u"));
    ep.flush_blocking().await;
    captured.next_analytics().await;

    ep.post_diagnostic();
    let stats = captured.next_diagnostic("diagnostic").await.body;
    assert_eq!(stats["eventsInLastBatch"], 2);
    assert_eq!(stats["deduplicatedUsers"], 1);
    assert_eq!(stats["droppedEvents"], 0);
    assert_eq!(stats["id"]["sdkKeySuffix"], "123456");
    ep.close().await;
}

#[tokio::test]
async fn test_diagnostic_init_sent_at_start() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        events_uri: "http://collector.test".into(),
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .diagnostic_store(diagnostic_store())
        .start()
        .expect("start processor");

    let init = captured.next_diagnostic("diagnostic-init").await;
    assert_eq!(init.base_uri, "http://collector.test");
    assert_eq!(init.body["sdk"]["name"], "test-sdk");
    assert_eq!(init.body["sdk"]["version"], "9.9.9");
    assert_eq!(init.body["platform"]["name"], "test-platform");
    assert!(init.body["id"]["diagnosticId"].is_string());

    // Only once per processor.
    ep.set_in_background(true);
    ep.set_in_background(false);
    captured.assert_no_diagnostics().await;
    ep.close().await;
}

#[tokio::test]
async fn test_buffer_capacity_counts_dropped_events() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        capacity: 2,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .diagnostic_store(diagnostic_store())
        .start()
        .expect("start processor");
    // Lets the dispatcher drain the init message before the inbox fills.
    captured.next_diagnostic("diagnostic-init").await;

    for i in 0..5 {
        ep.send_event(custom(&format!("e{i}")));
        ep.wait_until_inactive().await;
    }
    ep.flush_blocking().await;

    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.count, 2);
    assert_eq!(delivery.body[0]["key"], "e0");
    assert_eq!(delivery.body[1]["key"], "e1");

    ep.post_diagnostic();
    let stats = captured.next_diagnostic("diagnostic").await.body;
    assert_eq!(stats["droppedEvents"], 3);
    ep.close().await;
}

#[tokio::test]
async fn test_full_inbox_drops_events() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        capacity: 1,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .start()
        .expect("start processor");

    // Nothing yields in between, so only the first message fits.
    ep.send_event(custom("kept"));
    ep.send_event(custom("dropped-1"));
    ep.send_event(custom("dropped-2"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    ep.wait_until_inactive().await;
    ep.flush_blocking().await;

    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.count, 1);
    assert_eq!(delivery.body[0]["key"], "kept");
    ep.close().await;
}

#[tokio::test]
async fn test_dedup_cache_flushes_periodically() {
    let (sender, mut captured) = ok_sender();
    let ep = EventProcessor::builder(EventsConfig::default(), sender)
        .context_deduplicator(SeenOnce::new(Some(Duration::from_millis(50))))
        .start()
        .expect("start processor");

    ep.send_event(custom("first"));
    ep.flush_blocking().await;
    assert_eq!(kinds(&captured.next_analytics().await.body), vec!["index", "custom"]);

    tokio::time::sleep(Duration::from_millis(150)).await;

    ep.send_event(custom("second"));
    ep.flush_blocking().await;
    assert_eq!(kinds(&captured.next_analytics().await.body), vec!["index", "custom"]);
    ep.close().await;
}

#[tokio::test]
async fn test_must_shutdown_stops_all_delivery() {
    let (sender, mut captured) = mock_sender(SendResult::failed(true), None);
    let ep = EventProcessor::builder(EventsConfig::default(), sender)
        .diagnostic_store(diagnostic_store())
        .start()
        .expect("start processor");
    captured.next_diagnostic("diagnostic-init").await;

    ep.send_event(custom("rejected"));
    ep.flush_blocking().await;
    captured.next_analytics().await;
    ep.wait_until_inactive().await;

    ep.send_event(custom("after"));
    ep.flush_blocking().await;
    captured.assert_no_analytics().await;

    ep.post_diagnostic();
    captured.assert_no_diagnostics().await;
    ep.close().await;
}

#[tokio::test]
async fn test_offline_skips_periodic_flush() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        flush_interval: Duration::from_millis(50),
        initially_offline: true,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .start()
        .expect("start processor");

    ep.send_event(custom("queued"));
    captured.assert_no_analytics().await;

    ep.set_offline(false);
    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.body[0]["key"], "queued");
    ep.close().await;
}

#[tokio::test]
async fn test_background_keeps_flushing_without_diagnostics() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        flush_interval: Duration::from_millis(50),
        diagnostic_recording_interval: Duration::from_millis(50),
        initially_in_background: true,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .diagnostic_store(diagnostic_store())
        .start()
        .expect("start processor");

    ep.send_event(custom("bg"));
    assert_eq!(captured.next_analytics().await.body[0]["key"], "bg");
    captured.assert_no_diagnostics().await;

    ep.set_in_background(false);
    captured.next_diagnostic("diagnostic-init").await;
    captured.next_diagnostic("diagnostic").await;
    ep.close().await;
}

#[tokio::test]
async fn test_close_delivers_pending_events() {
    let (sender, mut captured) = ok_sender();
    let ep = EventProcessor::builder(EventsConfig::default(), sender.clone())
        .start()
        .expect("start processor");

    for i in 0..10 {
        ep.send_event(custom(&format!("e{i}")));
    }
    ep.close().await;

    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.count, 10);
    assert!(sender.closed.load(Ordering::SeqCst));
    assert!(ep.is_closed());

    ep.send_event(custom("late"));
    ep.flush_async();
    captured.assert_no_analytics().await;
}

#[tokio::test]
async fn test_close_waits_for_room_in_full_inbox() {
    let (sender, mut captured) = ok_sender();
    let config = EventsConfig {
        capacity: 3,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender.clone())
        .start()
        .expect("start processor");

    // Fill the inbox without yielding, so the final flush finds it full.
    for i in 0..3 {
        ep.send_event(custom(&format!("e{i}")));
    }
    ep.close().await;

    assert!(sender.closed.load(Ordering::SeqCst));
    assert!(ep.is_closed());
    let delivery = captured.next_analytics().await;
    assert_eq!(delivery.count, 3);
}

#[tokio::test]
async fn test_busy_workers_keep_events_for_next_flush() {
    let gate = Arc::new(Semaphore::new(0));
    let (sender, mut captured) = mock_sender(SendResult::ok(None), Some(gate.clone()));
    let config = EventsConfig {
        event_sending_thread_pool_size: 1,
        ..Default::default()
    };
    let ep = EventProcessor::builder(config, sender)
        .start()
        .expect("start processor");

    // The only worker takes the first payload and blocks on the gate.
    ep.send_event(custom("e1"));
    ep.flush_blocking().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The second payload waits in the handoff slot.
    ep.send_event(custom("e2"));
    ep.flush_blocking().await;

    // The slot is taken, so this flush is skipped and e3 stays buffered.
    ep.send_event(custom("e3"));
    ep.flush_blocking().await;

    gate.add_permits(10);
    ep.wait_until_inactive().await;
    ep.flush_blocking().await;

    let mut keys = Vec::new();
    for _ in 0..3 {
        let delivery = captured.next_analytics().await;
        assert_eq!(delivery.count, 1);
        keys.push(delivery.body[0]["key"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(keys, vec!["e1", "e2", "e3"]);
    ep.close().await;
}

#[tokio::test]
async fn test_dispatcher_panic_closes_processor() {
    let (sender, mut captured) = ok_sender();
    // Held so the capture channel stays open after the pipeline is gone.
    let _keep = sender.clone();
    let ep = EventProcessor::builder(EventsConfig::default(), sender)
        .context_deduplicator(PanickingDedup)
        .start()
        .expect("start processor");

    ep.send_event(feature("flag", "u"));
    timeout(RECV_TIMEOUT, ep.flush_blocking())
        .await
        .expect("flush waiter released after failure");
    assert!(ep.is_closed());

    ep.send_event(custom("ignored"));
    timeout(RECV_TIMEOUT, ep.close())
        .await
        .expect("close returns after failure");
    captured.assert_no_analytics().await;
}
