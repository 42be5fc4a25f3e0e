use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use incload::loader::protocol::{BlockHeader, RequestCommand, RequestType};
use incload::verity_tree_size_for_file;

fn bench_request_codec(c: &mut Criterion) {
    let command = RequestCommand {
        request_type: RequestType::BlockMissing,
        file_idx: 7,
        block_idx: 123_456,
    };

    c.bench_function("request_encode", |b| {
        b.iter(|| black_box(command).encode())
    });

    let encoded = command.encode();
    c.bench_function("request_decode", |b| {
        b.iter(|| RequestCommand::decode(black_box(encoded.clone())).unwrap())
    });
}

fn bench_chunk_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_parse");

    for block_count in [1usize, 16, 64].iter() {
        // One chunk of `block_count` headers with 4 KiB payloads.
        let mut chunk = Vec::new();
        for i in 0..*block_count {
            let header = BlockHeader {
                file_idx: 3,
                block_type: 0,
                compression_type: 0,
                block_idx: i as i32,
                block_size: 4096,
            };
            chunk.extend_from_slice(&header.encode());
            chunk.extend_from_slice(&[0u8; 4096]);
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(block_count),
            block_count,
            |b, _| {
                b.iter(|| {
                    let mut rest: &[u8] = black_box(&chunk);
                    let mut parsed = 0usize;
                    while !rest.is_empty() {
                        let header = BlockHeader::read_from(&mut rest).unwrap();
                        rest = &rest[header.block_size as usize..];
                        parsed += 1;
                    }
                    parsed
                });
            },
        );
    }
    group.finish();
}

fn bench_tree_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("verity_tree_size");

    for size in [4096u64, 1 << 20, 1 << 30, 1 << 40].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, size| {
            b.iter(|| verity_tree_size_for_file(black_box(*size)));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_request_codec,
    bench_chunk_parse,
    bench_tree_size
);
criterion_main!(benches);
