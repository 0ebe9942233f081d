use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use soe_server::network::byte_buffer::ByteBuffer;
use soe_server::network::crc::memcrc_seeded;
use soe_server::network::soe::filter::{self, FilterParams};
use soe_server::network::soe::{
    pack_data_channel_messages, split_data_channel_message, unpack_data_channel_messages,
};

#[allow(clippy::unwrap_used)]
fn bench_pack_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack_unpack");
    let message_sizes = [8usize, 64, 254, 300];

    for &size in &message_sizes {
        let messages: Vec<ByteBuffer> = (0..8).map(|_| ByteBuffer::from(vec![0x5Au8; size])).collect();
        group.throughput(Throughput::Bytes((size * messages.len()) as u64));

        group.bench_function(format!("pack_8x{size}b"), |b| {
            b.iter_batched(
                || messages.clone(),
                |messages| pack_data_channel_messages(messages).unwrap(),
                BatchSize::SmallInput,
            )
        });

        let packed = pack_data_channel_messages(messages.clone()).unwrap();
        group.bench_function(format!("unpack_8x{size}b"), |b| {
            b.iter_batched(
                || packed.clone(),
                |packed| unpack_data_channel_messages(packed).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("split");
    for &size in &[1024usize, 16 * 1024] {
        let message = ByteBuffer::from(vec![0x11u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("split_{size}b"), |b| {
            b.iter_batched(
                || message.clone(),
                |message| split_data_channel_message(message, 488).unwrap(),
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let params = FilterParams {
        crc_seed: 0x1234_5678,
        crc_length: 2,
        compression: true,
        compression_threshold: 32,
    };
    let mut packet = vec![0x00, 0x09, 0x00, 0x01];
    packet.extend((0..488u32).map(|i| (i % 7) as u8));
    group.throughput(Throughput::Bytes(packet.len() as u64));

    group.bench_function("crc_492b", |b| b.iter(|| memcrc_seeded(&packet, params.crc_seed)));
    group.bench_function("encode_492b", |b| b.iter(|| filter::encode(&packet, &params)));

    let encoded = filter::encode(&packet, &params);
    group.bench_function("decode_492b", |b| b.iter(|| filter::decode(&encoded, &params).unwrap()));

    group.finish();
}

criterion_group!(benches, bench_pack_unpack, bench_split, bench_filter);
criterion_main!(benches);
