use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::error;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static EMBEDDINGS: OnceLock<IntCounterVec> = OnceLock::new();
static CITATIONS_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static INDEX_QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static ANSWER_LATENCY: OnceLock<Histogram> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("chat_rag_requests_total", "Total requests per route"),
            &["route", "status"],
        )
        .unwrap()
    });

    let embeddings = EMBEDDINGS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("chat_rag_embeddings_total", "Messages indexed, by outcome"),
            &["outcome"],
        )
        .unwrap()
    });

    let citations_rejected = CITATIONS_REJECTED.get_or_init(|| {
        IntCounter::new(
            "chat_rag_citations_rejected_total",
            "Model citations that failed verification",
        )
        .unwrap()
    });

    let queue_depth = INDEX_QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("chat_rag_index_queue_depth", "Messages waiting to be indexed").unwrap()
    });

    let answer_latency = ANSWER_LATENCY.get_or_init(|| {
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "chat_rag_answer_latency_seconds",
                "End-to-end time to produce a validated answer",
            )
            .buckets(vec![0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 15.0, 30.0]),
        )
        .unwrap()
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(embeddings.clone())).ok();
    REGISTRY.register(Box::new(citations_rejected.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(answer_latency.clone())).ok();
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_embeddings(outcome: &str, count: u64) {
    if let Some(counter) = EMBEDDINGS.get() {
        counter.with_label_values(&[outcome]).inc_by(count);
    }
}

pub fn inc_citations_rejected(count: u64) {
    if let Some(counter) = CITATIONS_REJECTED.get() {
        counter.inc_by(count);
    }
}

pub fn set_queue_depth(depth: usize) {
    if let Some(gauge) = INDEX_QUEUE_DEPTH.get() {
        gauge.set(depth as i64);
    }
}

pub fn observe_answer_latency(seconds: f64) {
    if let Some(histogram) = ANSWER_LATENCY.get() {
        histogram.observe(seconds);
    }
}

pub async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_gathered_after_init() {
        init_metrics();
        inc_request("/ai/chat", "200");
        inc_embeddings("completed", 2);
        set_queue_depth(3);

        let names: Vec<String> = REGISTRY.gather().iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"chat_rag_requests_total".to_string()));
        assert!(names.contains(&"chat_rag_index_queue_depth".to_string()));
    }
}
