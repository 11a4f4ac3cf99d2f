use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use streamguard::guard_core::types::{PacketManifest, TcpIpFlow, TCP_ACK, TCP_FIN, TCP_SYN};
use streamguard::guard_core::Config;
use streamguard::Sensor;
use tempfile::TempDir;

fn flow(port: u16) -> TcpIpFlow {
    TcpIpFlow::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        port,
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        80,
    )
}

// 一条完整会话：握手、逆序的数据段、双向 FIN
fn session(port: u16, segments: u32, size: usize) -> Vec<PacketManifest> {
    let f = flow(port);
    let mut packets = vec![
        PacketManifest::tcp(f, 0, 0, TCP_SYN, Vec::new()),
        PacketManifest::tcp(f.reverse(), 0, 1, TCP_SYN | TCP_ACK, Vec::new()),
        PacketManifest::tcp(f, 1, 1, TCP_ACK, Vec::new()),
    ];
    for i in (0..segments).rev() {
        packets.push(PacketManifest::tcp(f, 1 + i * size as u32, 1, TCP_ACK, vec![b'x'; size]));
    }
    let end = 1 + segments * size as u32;
    packets.push(PacketManifest::tcp(f, end, 1, TCP_ACK | TCP_FIN, Vec::new()));
    packets.push(PacketManifest::tcp(f.reverse(), 1, end + 1, TCP_ACK | TCP_FIN, Vec::new()));
    packets
}

fn benchmark_coalesce(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let config = Config {
        log_dir: dir.path().to_path_buf(),
        worker_threads: 2,
        ..Config::default()
    };
    let sensor = Sensor::start(config).unwrap();

    let mut group = c.benchmark_group("coalesce");
    group.measurement_time(Duration::from_secs(1));
    group.sample_size(10);

    // 测试单条会话的同步处理
    let mut port = 1024u16;
    group.bench_function("reversed_session_sync", |b| {
        b.iter(|| {
            port = port.wrapping_add(1).max(1024);
            for p in session(port, 16, 1459) {
                black_box(sensor.process(&p).ok());
            }
        });
    });

    // 测试批量并行处理
    group.bench_function("batch_64_sessions", |b| {
        b.iter(|| {
            let packets: Vec<PacketManifest> = (0..64u16).flat_map(|i| session(20000 + i, 8, 509)).collect();
            black_box(sensor.process_batch(packets));
        });
    });

    group.finish();
    let report = sensor.shutdown();
    assert_eq!(report.pages_leaked, 0);
}

criterion_group!(benches, benchmark_coalesce);
criterion_main!(benches);
