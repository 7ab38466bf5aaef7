//! Benchmarks for channel selection.
//!
//! Run with: cargo bench --bench channel_selection

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use passthrough_relay::{
    api::models::Channel,
    services::{
        channel_selector::{pick_channel, SeededRandom},
        usage_extractor::extract,
    },
};
use std::collections::HashMap;

fn create_channels(count: usize, tiers: usize) -> Vec<Channel> {
    (0..count)
        .map(|i| Channel {
            id: i as i64 + 1,
            name: format!("channel{}", i),
            channel_type: 1,
            base_url: format!("http://localhost:{}", 8000 + i),
            key: format!("key{}", i),
            tags: vec!["bugment".to_string()],
            groups: vec!["default".to_string()],
            models: vec!["m".to_string()],
            priority: (i % tiers) as i64 * 10,
            weight: (i % 10 + 1) as u32,
            enabled: true,
            auto_ban: false,
            model_mapping: HashMap::new(),
            header_override: HashMap::new(),
        })
        .collect()
}

fn bench_pick_channel(c: &mut Criterion) {
    let mut group = c.benchmark_group("pick_channel");
    let rng = SeededRandom::new(42);

    for channel_count in [2, 5, 10, 20, 50].iter() {
        let channels = create_channels(*channel_count, 3);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::from_parameter(channel_count),
            channel_count,
            |b, _| {
                b.iter(|| black_box(pick_channel(black_box(&channels), 0, &rng)));
            },
        );
    }

    group.finish();
}

fn bench_pick_channel_retry_escalation(c: &mut Criterion) {
    let channels = create_channels(20, 5);
    let rng = SeededRandom::new(7);

    c.bench_function("pick_channel_retry_escalation", |b| {
        b.iter(|| {
            for retry in 0..5 {
                black_box(pick_channel(&channels, retry, &rng));
            }
        });
    });
}

fn bench_stream_usage_extraction(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_usage_extraction");

    for chunk_count in [10, 100, 1000].iter() {
        let mut raw = String::new();
        for i in 0..*chunk_count {
            raw.push_str(&format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"token{}\"}}}}]}}\n\n",
                i
            ));
        }
        raw.push_str("data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20}}\n\n");
        raw.push_str("data: [DONE]\n\n");
        let raw = raw.into_bytes();

        group.throughput(Throughput::Bytes(raw.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_count),
            &raw,
            |b, raw| {
                b.iter(|| black_box(extract(black_box(raw), true)));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_pick_channel,
    bench_pick_channel_retry_escalation,
    bench_stream_usage_extraction
);
criterion_main!(benches);
