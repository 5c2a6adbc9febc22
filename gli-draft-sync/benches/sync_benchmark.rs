use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use gli_draft_core::{ContractDraft, ContractType, DraftPatch, Clock, ManualClock};
use gli_draft_sync::channel::{OfflineQueue, QueuedUpdate};
use gli_draft_sync::protocol::{CollaborationMessage, Envelope, Frame, Participant};
use gli_draft_sync::{Codec, Lz4Codec};
use std::hint::black_box;

fn sample_update() -> (ContractDraft, Frame) {
    let clock = ManualClock::at_epoch_2024();
    let draft = ContractDraft::new(ContractType::Sale, "Bench", clock.now());
    let msg = CollaborationMessage::ContractUpdate(Envelope::new(
        draft.id,
        &Participant::new("u-bench", "Bench"),
        clock.now_millis(),
        DraftPatch::new()
            .set("property.address", "Calle Mayor 1")
            .set("financial.price", 250_000),
    ));
    (draft, msg.into())
}

fn bench_frame_codec(c: &mut Criterion) {
    let (_, frame) = sample_update();
    let encoded = frame.encode().unwrap();

    let mut group = c.benchmark_group("Frame");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("encode_contract_update", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
    group.bench_function("decode_contract_update", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
    group.finish();
}

fn bench_backup_compression(c: &mut Criterion) {
    let (draft, _) = sample_update();
    // Roughly a full archive: fifty drafts as JSON
    let drafts: Vec<ContractDraft> = (0..50).map(|_| draft.clone()).collect();
    let payload = serde_json::to_vec(&drafts).unwrap();
    let compressed = Lz4Codec.encode(&payload).unwrap();

    let mut group = c.benchmark_group("Lz4Codec");
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("compress_50_drafts", |b| {
        b.iter(|| black_box(Lz4Codec.encode(black_box(&payload)).unwrap()))
    });
    group.bench_function("decompress_50_drafts", |b| {
        b.iter(|| black_box(Lz4Codec.decode(black_box(&compressed)).unwrap()))
    });
    group.finish();
}

fn bench_offline_queue(c: &mut Criterion) {
    let (draft, _) = sample_update();
    let patch = DraftPatch::new().set("property.address", "Calle Mayor 1");

    let mut group = c.benchmark_group("OfflineQueue");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("enqueue_drain_1k", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(1000);
            for n in 0..1000 {
                queue.enqueue(QueuedUpdate {
                    contract_id: draft.id,
                    timestamp: n,
                    patch: patch.clone(),
                });
            }
            black_box(queue.drain());
        })
    });
    group.finish();
}

criterion_group!(benches, bench_frame_codec, bench_backup_compression, bench_offline_queue);
criterion_main!(benches);
