use criterion::{criterion_group, criterion_main, Criterion};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use streamguard::guard_core::types::{PacketManifest, TcpIpFlow, TCP_ACK, TCP_RST, TCP_SYN};
use streamguard::guard_core::Config;
use streamguard::Sensor;
use tempfile::TempDir;

fn flow(producer: u8, port: u16) -> TcpIpFlow {
    TcpIpFlow::new(
        IpAddr::V4(Ipv4Addr::new(10, 1, producer, 1)),
        port,
        IpAddr::V4(Ipv4Addr::new(10, 2, 0, 1)),
        443,
    )
}

fn connection(f: TcpIpFlow) -> Vec<PacketManifest> {
    let mut packets = vec![
        PacketManifest::tcp(f, 100, 0, TCP_SYN, Vec::new()),
        PacketManifest::tcp(f.reverse(), 900, 101, TCP_SYN | TCP_ACK, Vec::new()),
        PacketManifest::tcp(f, 101, 901, TCP_ACK, Vec::new()),
    ];
    for i in (0..4u32).rev() {
        packets.push(PacketManifest::tcp(f, 101 + i * 61, 901, TCP_ACK, vec![i as u8; 61]));
    }
    packets.push(PacketManifest::tcp(f, 101 + 4 * 61, 901, TCP_RST, Vec::new()));
    packets
}

fn benchmark_concurrent_processing(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        worker_threads: 4,
        ..Config::default()
    };
    let sensor = Arc::new(Sensor::start(config).unwrap());

    let mut group = c.benchmark_group("concurrent_processing");
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(10);
    group.warm_up_time(Duration::from_millis(50));

    // 多个生产者线程同时向工作线程池提交
    group.bench_function("four_producers", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4u8)
                .map(|producer| {
                    let sensor = sensor.clone();
                    thread::spawn(move || {
                        for port in 0..32u16 {
                            for p in connection(flow(producer, 30000 + port)) {
                                sensor.submit(p);
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            sensor.flush();
        });
    });

    group.finish();
    if let Ok(sensor) = Arc::try_unwrap(sensor) {
        let report = sensor.shutdown();
        assert_eq!(report.pages_leaked, 0);
    }
}

criterion_group!(benches, benchmark_concurrent_processing);
criterion_main!(benches);
