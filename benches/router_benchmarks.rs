//! Performance benchmarks for the routing hot paths.
//!
//! Benchmarks cover:
//!   - Supervisor selection over registries of increasing size
//!   - Acquire/release of a supervisor slot
//!   - Full route → response cycle over the in-process transport
//!
//! Run: `cargo bench`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use std::sync::Arc;

use async_trait::async_trait;
use cartrita::config::RouterConfig;
use cartrita::coordination::{
    Envelope, MessageType, RouteTable, SupervisorRecord, SupervisorRegistry, TaskRequest,
    TaskResponse, TaskRouter,
};
use cartrita::transport::{InProcessTransport, MessageHandler, Transport};
use serde_json::json;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

fn registry_with(pools: usize) -> SupervisorRegistry {
    SupervisorRegistry::with_seeds((0..pools).map(|i| {
        let mut record = SupervisorRecord::seed(
            format!("intel-{i}"),
            format!("Intel {i}"),
            "intelligence",
            vec!["writer.content.create".into()],
            16,
        );
        record.task_count = u32::try_from(i % 16).unwrap_or(0);
        record
    }))
}

/// Supervisor that answers every task request immediately.
struct EchoSupervisor {
    id: String,
    transport: Arc<InProcessTransport>,
}

#[async_trait]
impl MessageHandler for EchoSupervisor {
    async fn on_message(&self, envelope: Envelope) {
        if envelope.message_type != MessageType::TaskRequest {
            return;
        }
        let Some(task_id) = envelope.correlation_id.clone() else {
            return;
        };
        let payload = serde_json::to_value(TaskResponse::completed(task_id, json!("ok")))
            .unwrap_or_default();
        let reply = envelope.reply(MessageType::TaskResponse, self.id.clone(), payload);
        let _ = self.transport.send_message(reply).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Benchmark: selection
// ─────────────────────────────────────────────────────────────────────────────

fn bench_selection(c: &mut Criterion) {
    let mut group = c.benchmark_group("supervisor_select");
    for pools in [3usize, 32, 256] {
        let registry = registry_with(pools);
        group.bench_with_input(BenchmarkId::from_parameter(pools), &registry, |b, registry| {
            b.iter(|| registry.select(black_box("intelligence")).map(|s| s.id.len()));
        });
    }
    group.finish();

    c.bench_function("supervisor_acquire_release", |b| {
        let mut registry = registry_with(32);
        b.iter(|| {
            if let Some(id) = registry.acquire(black_box("intelligence")) {
                registry.release(&id);
            }
        });
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// Benchmark: route → response cycle
// ─────────────────────────────────────────────────────────────────────────────

fn bench_route_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    let transport = Arc::new(InProcessTransport::new());
    let router = rt.block_on(async {
        let router = TaskRouter::new(
            RouterConfig::default(),
            vec![SupervisorRecord::seed(
                "intelligence",
                "Intelligence Supervisor",
                "intelligence",
                vec!["writer.content.create".into()],
                64,
            )],
            RouteTable::new(),
            transport.clone(),
        );
        transport.register_handler(
            "intelligence",
            Arc::new(EchoSupervisor {
                id: "intelligence".into(),
                transport: transport.clone(),
            }),
        );
        router
    });

    c.bench_function("route_task_roundtrip", |b| {
        b.to_async(&rt).iter(|| {
            let router = router.clone();
            async move {
                router
                    .route_task(
                        black_box(TaskRequest::new("writer.content.create", json!({"n": 1}))),
                        None,
                    )
                    .await
                    .expect("echo supervisor answers")
            }
        });
    });
}

criterion_group!(benches, bench_selection, bench_route_cycle);
criterion_main!(benches);
