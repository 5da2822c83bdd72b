use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::Value;

use flag_events::event::{CustomEvent, Event, FeatureRequestEvent};
use flag_events::output::EventOutputFormatter;
use flag_events::processor::summarizer::{EventSummarizer, EventSummary};
use flag_events::{Context, EventsConfig, SingleContext};

fn context(i: u32) -> Context {
    Context::multi(vec![
        SingleContext::new("user", &format!("user-{i}"))
            .name("Sandy")
            .set("email", "sandy@example.com")
            .set("address", serde_json::json!({"city": "Oakland", "street": "Main"}))
            .private("email"),
        SingleContext::new("org", &format!("org:{}", i % 16)),
    ])
}

fn evaluations(n: u32) -> Vec<FeatureRequestEvent> {
    (0..n)
        .map(|i| {
            let mut fe = FeatureRequestEvent::new(
                &format!("flag-{}", i % 32),
                context(i),
                Value::from(i % 3 == 0),
                Value::from(false),
            );
            fe.version = Some(u64::from(i % 4));
            fe.variation = Some(i % 3);
            fe.track_events = i % 5 == 0;
            fe
        })
        .collect()
}

fn build_payload() -> (Vec<Event>, EventSummary) {
    let mut summarizer = EventSummarizer::new();
    let mut events = Vec::new();
    for (i, fe) in evaluations(256).into_iter().enumerate() {
        summarizer.summarize_event(&fe);
        if fe.track_events {
            events.push(Event::from(fe));
        } else if i % 7 == 0 {
            let mut custom = CustomEvent::new("checkout", fe.context);
            custom.metric_value = Some(19.99);
            events.push(Event::from(custom));
        }
    }
    (events, summarizer.get_summary_and_reset())
}

fn bench_summarize(c: &mut Criterion) {
    let events = evaluations(1_024);

    c.bench_function("summarizer/summarize_1024", |b| {
        b.iter(|| {
            let mut summarizer = EventSummarizer::new();
            for fe in &events {
                summarizer.summarize_event(black_box(fe));
            }
            black_box(summarizer.get_summary_and_reset().total_count())
        })
    });
}

fn bench_format(c: &mut Criterion) {
    let config = EventsConfig {
        private_attributes: vec!["/address/city".to_string()],
        ..Default::default()
    };
    let formatter = EventOutputFormatter::new(&config);
    let (events, summary) = build_payload();

    c.bench_function("formatter/format_mixed_batch", |b| {
        b.iter(|| {
            let (data, count) = formatter
                .format(black_box(&events), black_box(&summary))
                .expect("format payload");
            black_box((data.len(), count))
        })
    });
}

fn bench_context_key(c: &mut Criterion) {
    let ctx = context(42);

    c.bench_function("context/fully_qualified_key_multi", |b| {
        b.iter(|| black_box(&ctx).fully_qualified_key())
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_summarize(c);
    bench_format(c);
    bench_context_key(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
