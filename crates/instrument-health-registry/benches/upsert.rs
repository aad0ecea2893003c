use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use instrument_health_core::{SessionIdentity, StatusEvent};
use instrument_health_registry::StatusRegistry;

/// Registry pre-populated with `count` connected sessions
fn populated_registry(count: usize) -> (StatusRegistry, Vec<SessionIdentity>) {
    let registry = StatusRegistry::in_memory().unwrap();
    let identities: Vec<SessionIdentity> = (0..count)
        .map(|i| SessionIdentity::resolved("PM100D", format!("P{i:05}")).unwrap())
        .collect();
    for identity in &identities {
        registry.upsert(identity, StatusEvent::construction());
        registry.upsert(identity, StatusEvent::HandshakeSucceeded);
    }
    (registry, identities)
}

fn bench_warning_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("warning_cycle");

    for count in [1usize, 16, 128] {
        let (registry, identities) = populated_registry(count);
        let target = identities[count / 2].clone();

        group.bench_with_input(BenchmarkId::from_parameter(count), &target, |b, identity| {
            b.iter(|| {
                let failed = registry.upsert(
                    black_box(identity),
                    StatusEvent::RecoverableFailure {
                        error: "timeout".to_string(),
                    },
                );
                let recovered = registry.upsert(black_box(identity), StatusEvent::RecoverySucceeded);
                black_box((failed, recovered));
            });
        });
    }

    group.finish();
}

fn bench_ignored_event(c: &mut Criterion) {
    let (registry, identities) = populated_registry(16);
    let identity = identities[0].clone();

    c.bench_function("ignored_event", |b| {
        b.iter(|| {
            let record = registry.upsert(black_box(&identity), StatusEvent::RecoverySucceeded);
            black_box(record);
        });
    });
}

fn bench_list(c: &mut Criterion) {
    let (registry, _) = populated_registry(128);

    c.bench_function("list_128", |b| {
        b.iter(|| black_box(registry.list()));
    });
}

criterion_group!(benches, bench_warning_cycle, bench_ignored_event, bench_list);
criterion_main!(benches);
