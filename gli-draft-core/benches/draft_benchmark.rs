use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use gli_draft_core::{ContractType, DraftPatch, DraftStore, SystemClock};
use std::hint::black_box;
use std::sync::Arc;

fn bench_update_partial(c: &mut Criterion) {
    let mut group = c.benchmark_group("DraftStore");
    group.throughput(Throughput::Elements(1));

    group.bench_function("update_partial_address", |b| {
        let mut store = DraftStore::new(Arc::new(SystemClock));
        store.create(ContractType::Sale, "Bench");
        let patch = DraftPatch::new().set("property.address", "Calle Mayor 1");

        b.iter(|| {
            let version = store.update_partial(black_box(&patch)).unwrap();
            black_box(version);
        })
    });

    group.finish();
}

fn bench_export_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("DraftStore");
    group.throughput(Throughput::Elements(1));

    let mut source = DraftStore::new(Arc::new(SystemClock));
    let id = source.create(ContractType::Sale, "Bench");
    let text = source.export_as_text(id).unwrap();

    group.bench_function("import_from_text", |b| {
        // Fresh store per sample batch keeps the map from growing unbounded
        b.iter_batched(
            || DraftStore::new(Arc::new(SystemClock)),
            |mut store| {
                black_box(store.import_from_text(black_box(&text)).unwrap());
            },
            criterion::BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_update_partial, bench_export_import);
criterion_main!(benches);
