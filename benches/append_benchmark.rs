use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use lightning_eventstore::storage::{
    Event, EventStore, EventTypeContext, SerializedObject, StorageProperties,
};
use std::hint::black_box;
use std::time::Duration;
use tempfile::tempdir;

fn payload(size: usize) -> Event {
    Event::non_domain(SerializedObject::new("Payload", vec![0x5a; size]))
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.measurement_time(Duration::from_secs(10));

    for size in [64usize, 1024, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("single_event", size), &size, |b, &size| {
            let dir = tempdir().unwrap();
            let properties = StorageProperties::new(dir.path()).with_segment_size(64 * 1024 * 1024);
            let store = EventStore::open(EventTypeContext::events("bench"), &properties).unwrap();
            let event = payload(size);

            b.iter(|| {
                store.append(black_box(std::slice::from_ref(&event))).unwrap();
            });
            store.close();
        });
    }

    for batch in [10usize, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("transaction", batch), &batch, |b, &batch| {
            let dir = tempdir().unwrap();
            let properties = StorageProperties::new(dir.path()).with_segment_size(64 * 1024 * 1024);
            let store = EventStore::open(EventTypeContext::events("bench"), &properties).unwrap();
            let events: Vec<Event> = (0..batch).map(|_| payload(256)).collect();

            b.iter(|| {
                store.append(black_box(&events)).unwrap();
            });
            store.close();
        });
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    let dir = tempdir().unwrap();
    let properties = StorageProperties::new(dir.path()).with_segment_size(4 * 1024 * 1024);
    let store = EventStore::open(EventTypeContext::events("bench"), &properties).unwrap();
    for _ in 0..10_000 {
        store.append(&[payload(256)]).unwrap();
    }

    group.throughput(Throughput::Elements(10_000));
    group.bench_function("scan_all", |b| {
        b.iter(|| {
            let count = store.events(black_box(0)).count();
            assert_eq!(count, 10_000);
        });
    });
    group.finish();
    store.close();
}

criterion_group!(benches, bench_append, bench_read);
criterion_main!(benches);
