use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use usb_audio_stream::audio::{RingBuffer, SampleByteBuffer};

fn ring_buffer_batches(c: &mut Criterion) {
    let buffer: RingBuffer<i32> = RingBuffer::new(4096);
    let input: Vec<i32> = (0..384).collect();
    let mut output = vec![0i32; 384];

    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Elements(input.len() as u64));
    group.bench_function("push_pop_slice_384", |b| {
        b.iter(|| {
            buffer.push_slice(black_box(&input)).unwrap();
            buffer.pop_slice(black_box(&mut output)).unwrap();
        })
    });
    group.finish();
}

fn sample_buffer_packets(c: &mut Criterion) {
    // 45-frame stereo 16-bit packets against a capacity that is not a multiple
    let mut buffer = SampleByteBuffer::new(22_579);
    let packet = [0x5au8; 180];
    let mut out = [0u8; 180];

    let mut group = c.benchmark_group("sample_buffer");
    group.throughput(Throughput::Bytes(packet.len() as u64));
    group.bench_function("store_consume_packet", |b| {
        b.iter(|| {
            black_box(buffer.store_bytes(black_box(&packet)));
            black_box(buffer.consume_into(&mut out));
        })
    });
    group.finish();
}

criterion_group!(benches, ring_buffer_batches, sample_buffer_packets);
criterion_main!(benches);
