use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use tstore::chunk::ChunkStream;

const SOURCE_SIZE: usize = 32 * 1024 * 1024; // 32MB

fn bench_chunk_stream(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let source: Vec<u8> = (0..SOURCE_SIZE).map(|i| (i % 251) as u8).collect();

    let mut group = c.benchmark_group("chunk_stream");
    group.throughput(Throughput::Bytes(SOURCE_SIZE as u64));
    group.sample_size(20);

    for chunk_size in [64 * 1024, 1024 * 1024, 5 * 1024 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    runtime.block_on(async {
                        let mut stream =
                            ChunkStream::spawn(Cursor::new(source.clone()), chunk_size).unwrap();
                        let mut hasher = blake3::Hasher::new();
                        while let Some(chunk) = stream.next().await {
                            hasher.update(&chunk.data);
                        }
                        black_box(stream.finish().await.unwrap());
                        black_box(hasher.finalize());
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_chunk_stream);
criterion_main!(benches);
