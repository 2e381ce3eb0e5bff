//! Hot-path benchmarks: window summary, FEC decode, and the full receive path.
//!
//! Run with: cargo bench --package wlanprobe-transport

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use wlanprobe_transport::loss::LossSimulator;
use wlanprobe_transport::receiver::{ProbeReceiver, ReceiverConfig};
use wlanprobe_transport::sender::ProbeSender;
use wlanprobe_transport::stats::{DelayWindow, LossTally};
use wlanprobe_transport::wire::{Frame, Packet};

fn bench_summarize(c: &mut Criterion) {
    let mut group = c.benchmark_group("delay_window");

    for size in [100usize, 1_000, 10_000] {
        let mut window = DelayWindow::new(size);
        for i in 0..size {
            window.push(((i * 7919) % 1_000) as f64 / 10.0);
        }
        let loss = LossTally {
            expected: 1_000,
            received: 970,
            recovered: 25,
        };
        group.bench_function(format!("summarize_{size}"), |b| {
            b.iter(|| black_box(window.summarize("peer", &loss)));
        });
    }

    group.bench_function("push_full_window", |b| {
        let mut window = DelayWindow::new(1_000);
        let mut x = 0.0;
        b.iter(|| {
            x += 0.5;
            window.push(black_box(x));
        });
    });

    group.finish();
}

fn bench_receive(c: &mut Criterion) {
    let mut tx = ProbeSender::new(1, 8);
    let wire: Vec<_> = (0..4_096u64)
        .flat_map(|i| tx.next_frames(i * 20_000))
        .map(|f| f.encode())
        .collect();

    let mut group = c.benchmark_group("receiver");
    group.throughput(Throughput::Elements(1));

    group.bench_function("decode_and_receive", |b| {
        let mut rx = ProbeReceiver::new(ReceiverConfig::default(), LossSimulator::new(0.03, 1));
        let mut idx = 0;
        let mut recv_us = 0u64;
        b.iter(|| {
            // Restart the stream once it wraps so sequences stay fresh.
            if idx == wire.len() {
                idx = 0;
                rx = ProbeReceiver::new(ReceiverConfig::default(), LossSimulator::new(0.03, 1));
            }
            let bytes = wire[idx].clone();
            idx += 1;
            recv_us += 10_000;
            if let Some(Frame {
                packet: Packet::Probe(p),
                ..
            }) = Frame::decode(bytes)
            {
                black_box(rx.receive(&p, recv_us));
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_summarize, bench_receive);
criterion_main!(benches);
