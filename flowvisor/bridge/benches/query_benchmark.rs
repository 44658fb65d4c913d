use bridge::{ControllerConfig, FlowSpaceRuntime, MemoryStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowspace::{
    Dpid, FieldMatch, FlowEntry, FlowMatch, FlowSpaceRecord, HeaderFields, MatchField,
};
use std::sync::Arc;

/// Entries spread over 8 switches, matching on one TCP port each.
fn populated_store(size: u64) -> MemoryStore {
    let records = (1..=size).map(|id| {
        let rule_match = FlowMatch::any()
            .with(MatchField::TpDst, FieldMatch::Exact(id % 1024))
            .unwrap_or_default();
        let entry = FlowEntry::builder()
            .id(id)
            .name(format!("entry-{}", id))
            .dpid(Dpid::new(id % 8))
            .priority((id % 100) as u32)
            .rule_match(rule_match)
            .slice_action(format!("slice-{}", id % 16), 7u32)
            .build()
            .unwrap();
        FlowSpaceRecord::from_entry(&entry)
    });
    MemoryStore::with_records(records).unwrap()
}

fn query_match_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_match");
    for size in [100u64, 1_000, 10_000] {
        let runtime =
            FlowSpaceRuntime::start(Arc::new(populated_store(size)), &ControllerConfig::default())
                .unwrap();
        let api = runtime.api();
        let header = HeaderFields::new()
            .with(MatchField::TpDst, 80)
            .with(MatchField::NwSrc, 0x0a00_0001);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(api.query_match(black_box(Dpid::new(0)), &header)))
        });
        group.bench_with_input(BenchmarkId::new("first_match", size), &size, |b, _| {
            b.iter(|| black_box(api.matches(Dpid::new(0), &header).next()))
        });

        runtime.shutdown_blocking();
    }
    group.finish();
}

criterion_group!(benches, query_match_bench);
criterion_main!(benches);
