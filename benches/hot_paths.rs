use std::sync::Arc;

use collectoor::buffer::{RecordHandler, SegmentBuffer};
use collectoor::cache::{MergeCollection, TopNCollection, Window};
use collectoor::config::BufferConfig;
use collectoor::pipeline::{Aggregates, Downsampling, EndpointMetric, SegmentPipeline, SlowTrace};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn segment_payload(i: i64) -> Vec<u8> {
    let start = 1_704_207_845_678 + i * 1_000;
    serde_json::to_vec(&serde_json::json!({
        "trace_id": format!("trace-{i}"),
        "segment_id": format!("seg-{i}"),
        "service": format!("svc-{}", i % 8),
        "instance": "bench-1",
        "spans": [
            {
                "span_id": 0,
                "kind": "entry",
                "operation": format!("/orders/{}", i % 32),
                "start_time": start,
                "end_time": start + 40 + i % 900,
            },
            {
                "span_id": 1,
                "parent_span_id": 0,
                "kind": "exit",
                "operation": "db.query",
                "start_time": start + 1,
                "end_time": start + 30,
                "peer": "db:5432",
            },
        ],
    }))
    .expect("serialize segment")
}

fn metric(i: i64) -> EndpointMetric {
    EndpointMetric {
        time_bucket: 202_401_021_504,
        downsampling: Downsampling::Minute,
        service: format!("svc-{}", i % 8),
        endpoint: format!("/orders/{}", i % 32),
        calls: 1,
        errors: 0,
        duration_sum_ms: i % 900,
        duration_min_ms: i % 900,
        duration_max_ms: i % 900,
    }
}

fn bench_write_record(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let buffer = SegmentBuffer::open(&BufferConfig {
        buffer_path: dir.path().to_path_buf(),
        max_segment_file_size: 64 * 1024 * 1024,
        ..Default::default()
    })
    .expect("open buffer");
    let writer = buffer.writer();
    let payload = segment_payload(1);

    c.bench_function("buffer/write_record", |b| {
        b.iter(|| writer.write_record(black_box(&payload)).expect("write"))
    });
}

fn bench_window_put(c: &mut Criterion) {
    let window = Window::new(MergeCollection::<EndpointMetric>::new);
    let metrics: Vec<_> = (0..256).map(metric).collect();

    c.bench_function("window/merge_put", |b| {
        b.iter(|| {
            for m in &metrics {
                window.put(black_box(m.clone()));
            }
        })
    });
}

fn bench_top_n_put(c: &mut Criterion) {
    let window = Window::new(|| TopNCollection::new(50, SlowTrace::by_duration));
    let traces: Vec<_> = (0..256)
        .map(|i| SlowTrace {
            service: format!("svc-{}", i % 8),
            endpoint: "/orders".to_string(),
            trace_id: format!("trace-{i}"),
            segment_id: format!("seg-{i}"),
            start_time: 0,
            duration_ms: (i * 7_919) % 5_000,
            is_error: false,
        })
        .collect();

    c.bench_function("window/top_n_put", |b| {
        b.iter(|| {
            for t in &traces {
                window.put(black_box(t.clone()));
            }
        })
    });
}

fn bench_pipeline_handle(c: &mut Criterion) {
    let aggregates = Arc::new(Aggregates::new(50));
    let pipeline = SegmentPipeline::new(
        Arc::clone(&aggregates),
        std::time::Duration::from_millis(500),
    );
    pipeline.set_ready(true);
    let payloads: Vec<_> = (0..64).map(segment_payload).collect();

    c.bench_function("pipeline/handle_segment", |b| {
        b.iter(|| {
            for p in &payloads {
                black_box(pipeline.handle(black_box(p)));
            }
            // Keep the append cache from growing across iterations.
            black_box(aggregates.segments.read().len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_write_record(c);
    bench_window_put(c);
    bench_top_n_put(c);
    bench_pipeline_handle(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
