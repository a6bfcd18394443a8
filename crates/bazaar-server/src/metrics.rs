use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter_vec, Histogram, HistogramVec,
    IntCounterVec,
};
use std::time::Instant;

pub static OPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "bazaar_ops_total",
        "Entity operations by outcome",
        &["entity", "op", "outcome"]
    )
    .expect("bazaar_ops_total registers once")
});

pub static OP_DURATION_SEC: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "bazaar_op_duration_seconds",
        "Entity operation latency",
        &["entity", "op"]
    )
    .expect("bazaar_op_duration_seconds registers once")
});

pub static SNAPSHOT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!("bazaar_snapshot_total", "Snapshots by result", &["result"])
        .expect("bazaar_snapshot_total registers once")
});

pub static SNAPSHOT_DURATION_SEC: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("bazaar_snapshot_duration_seconds", "Snapshot duration")
        .expect("bazaar_snapshot_duration_seconds registers once")
});

pub static QUERY_COMPILE_MICROS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "bazaar_query_compile_micros",
        "Pipeline compile time (µs)",
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0]
    )
    .expect("bazaar_query_compile_micros registers once")
});

/// Records one finished entity operation.
pub fn record(entity: &str, op: &str, started: Instant, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    OPS_TOTAL.with_label_values(&[entity, op, outcome]).inc();
    OP_DURATION_SEC
        .with_label_values(&[entity, op])
        .observe(started.elapsed().as_secs_f64());
}

pub fn record_snapshot(started: Instant, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    SNAPSHOT_TOTAL.with_label_values(&[result]).inc();
    SNAPSHOT_DURATION_SEC.observe(started.elapsed().as_secs_f64());
}
