use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use secure_channel::config::KdfParams;
use secure_channel::core::wire::{FrameReader, FrameWriter};
use secure_channel::transport::cipher::{self, Iv, Role, Salt, IV_HALF_LEN, SALT_HALF_LEN};
use tokio::runtime::Runtime;

fn material() -> (Salt, Iv) {
    (
        Salt::from_halves(&[1u8; SALT_HALF_LEN], &[2u8; SALT_HALF_LEN]),
        Iv::from_halves(&[3u8; IV_HALF_LEN], &[4u8; IV_HALF_LEN]),
    )
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    let (salt, iv) = material();

    for (label, kdf) in [("fast", KdfParams::insecure_fast()), ("default", KdfParams::default())] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let _ = cipher::open_pair(
                    b"correct horse battery staple",
                    &salt,
                    &iv,
                    Role::Initiator,
                    &kdf,
                    tokio::io::empty(),
                    tokio::io::sink(),
                )
                .unwrap();
            })
        });
    }

    group.finish();
}

fn bench_stream(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cipher_stream");
    let kdf = KdfParams::insecure_fast();

    for size in [64usize, 4 * 1024, 64 * 1024] {
        let payload = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("round_trip_{size}"), |b| {
            b.to_async(&rt).iter_batched(
                || {
                    let (salt, iv) = material();
                    let (a, z) = tokio::io::duplex(128 * 1024);
                    let (_, sealing) = cipher::open_pair(
                        b"pw", &salt, &iv, Role::Initiator, &kdf, tokio::io::empty(), a,
                    )
                    .unwrap();
                    let (opening, _) = cipher::open_pair(
                        b"pw", &salt, &iv, Role::Responder, &kdf, z, tokio::io::sink(),
                    )
                    .unwrap();
                    (FrameWriter::new(sealing), FrameReader::new(opening))
                },
                |(mut writer, mut reader)| {
                    let payload = &payload;
                    async move {
                        let mut received = vec![0u8; payload.len()];
                        let (written, read) =
                            tokio::join!(writer.write_arr(payload), reader.read_arr(&mut received));
                        written.unwrap();
                        read.unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_key_derivation, bench_stream);
criterion_main!(benches);
