use std::collections::BTreeMap;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use serde_json::json;

use stateful_detector::{
    ConditionType, DataCondition, DataConditionGroup, DataPacket, Detector, DetectorId,
    GroupedValuesBehavior, HandlerContext, InMemoryStores, MetricThresholdBehavior, PriorityLevel,
    ProjectId, StatefulDetectorHandler, Thresholds,
};

fn conditions() -> DataConditionGroup {
    DataConditionGroup::any(vec![
        DataCondition::new(1, ConditionType::Gt, json!(50), json!("medium")),
        DataCondition::new(2, ConditionType::Gt, json!(90), json!("high")),
    ])
}

fn handler(kind: &str) -> StatefulDetectorHandler {
    let stores = InMemoryStores::default();
    let thresholds = Thresholds::new(BTreeMap::from([
        (PriorityLevel::Medium, 3),
        (PriorityLevel::High, 2),
    ]))
    .unwrap_or_default();
    let detector = Detector::new(DetectorId(1), ProjectId(1), "bench", kind)
        .with_condition_group(conditions())
        .with_thresholds(thresholds);
    let ctx = HandlerContext::new(Arc::new(stores.counters), Arc::new(stores.states));
    if kind == GroupedValuesBehavior::SLUG {
        StatefulDetectorHandler::new(Arc::new(detector), Arc::new(GroupedValuesBehavior), ctx)
    } else {
        StatefulDetectorHandler::new(Arc::new(detector), Arc::new(MetricThresholdBehavior), ctx)
    }
}

fn bench_single_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate/metric");
    group.throughput(Throughput::Elements(1));
    group.bench_function("alternating", |b| {
        let mut handler = handler(MetricThresholdBehavior::SLUG);
        let mut sequence = 0u64;
        b.iter(|| {
            sequence += 1;
            // Cycles through OK, partial breaches, triggers and resolutions.
            let value = [10, 60, 95, 95, 10, 60, 60, 60][(sequence % 8) as usize];
            let packet = DataPacket::new("bench", sequence, json!({ "value": value }));
            handler.evaluate(&packet)
        });
    });
    group.bench_function("duplicate", |b| {
        let mut handler = handler(MetricThresholdBehavior::SLUG);
        let packet = DataPacket::new("bench", 1, json!({"value": 95}));
        let _ = handler.evaluate(&packet);
        b.iter(|| handler.evaluate(&packet));
    });
    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate/grouped");
    for keys in [16usize, 256] {
        let groups: serde_json::Map<String, serde_json::Value> = (0..keys)
            .map(|i| (format!("host-{i}"), json!(i % 100)))
            .collect();
        group.throughput(Throughput::Elements(keys as u64));
        group.bench_function(format!("{keys}_keys"), |b| {
            b.iter_batched(
                || {
                    (
                        handler(GroupedValuesBehavior::SLUG),
                        DataPacket::new("bench", 1, json!({ "groups": groups.clone() })),
                    )
                },
                |(mut handler, packet)| handler.evaluate(&packet),
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_value, bench_fan_out);
criterion_main!(benches);
