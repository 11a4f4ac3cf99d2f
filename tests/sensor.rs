use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use streamguard::guard_core::types::{
    PacketManifest, StreamCollector, TcpIpFlow, TCP_ACK, TCP_FIN, TCP_SYN,
};
use streamguard::guard_core::{Config, ConfigError, EngineError};
use streamguard::{replay, Sensor};
use tempfile::TempDir;

fn client_flow(port: u16) -> TcpIpFlow {
    TcpIpFlow::new(
        IpAddr::from_str("192.0.2.10").unwrap(),
        port,
        IpAddr::from_str("198.51.100.7").unwrap(),
        443,
    )
}

fn config(dir: &TempDir) -> Config {
    Config {
        log_dir: dir.path().to_path_buf(),
        worker_threads: 2,
        page_pool_capacity: 256,
        max_pages_per_flow: 64,
        ..Config::default()
    }
}

fn handshake(flow: TcpIpFlow) -> Vec<PacketManifest> {
    vec![
        PacketManifest::tcp(flow, 7000, 0, TCP_SYN, Vec::new()),
        PacketManifest::tcp(flow.reverse(), 9000, 7001, TCP_SYN | TCP_ACK, Vec::new()),
        PacketManifest::tcp(flow, 7001, 9001, TCP_ACK, Vec::new()),
    ]
}

#[test]
fn test_invalid_config_is_fatal() {
    let dir = TempDir::new().unwrap();
    let bad = Config { ring_capacity: 0, ..config(&dir) };
    match Sensor::start(bad) {
        Err(EngineError::Config(ConfigError::NotPositive { field })) => {
            assert_eq!(field, "ring_capacity")
        }
        other => panic!("expected config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_sensor_reports_attacks_and_shuts_down_cleanly() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(StreamCollector::new());
    let sensor = Sensor::with_sink(config(&dir), sink.clone()).unwrap();

    let flow = client_flow(40001);
    let mut packets = handshake(flow);
    packets.push(PacketManifest::tcp(flow, 7006, 9001, TCP_ACK, b"world".to_vec()));
    packets.push(PacketManifest::tcp(flow, 7001, 9001, TCP_ACK, b"hello".to_vec()));
    // 与已交付数据冲突的伪造段
    packets.push(PacketManifest::tcp(flow, 7001, 9001, TCP_ACK, b"HELLO".to_vec()));
    // 第二个 SYN-ACK 携带不同 ISN
    packets.push(PacketManifest::tcp(flow.reverse(), 1234, 7001, TCP_SYN | TCP_ACK, Vec::new()));
    // 留在环中的乱序段，关闭时回收
    packets.push(PacketManifest::tcp(flow, 8000, 9001, TCP_ACK, b"pending".to_vec()));

    assert_eq!(replay(&sensor, packets), 8);
    assert_eq!(sink.stream(&flow), b"helloworld");
    assert_eq!(sensor.pager().used(), 1);

    let report = sensor.shutdown();
    assert_eq!(report.pages_released, 1);
    assert_eq!(report.pages_leaked, 0);
    assert_eq!(report.events_written, 2);
    assert_eq!(report.events_failed, 0);
    assert_eq!(report.processor.total_packets, 8);

    let path = dir.path().join(format!("{}.attackreport.json", flow.key()));
    let kinds: Vec<String> = std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["Type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["injection".to_string(), "hijack".to_string()]);
}

#[test]
fn test_many_flows_close_without_leaks() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(StreamCollector::new());
    let sensor = Sensor::with_sink(config(&dir), sink.clone()).unwrap();

    let mut packets = Vec::new();
    for port in 0..50u16 {
        let flow = client_flow(41000 + port);
        packets.extend(handshake(flow));
        packets.push(PacketManifest::tcp(flow, 7004, 9001, TCP_ACK, b"def".to_vec()));
        packets.push(PacketManifest::tcp(flow, 7001, 9001, TCP_ACK, b"abc".to_vec()));
        packets.push(PacketManifest::tcp(flow, 7007, 9001, TCP_ACK | TCP_FIN, Vec::new()));
        packets.push(PacketManifest::tcp(flow.reverse(), 9001, 7008, TCP_ACK | TCP_FIN, Vec::new()));
    }
    let batch = sensor.process_batch(packets);
    assert_eq!(batch.flows, 50);
    assert_eq!(batch.failed_packets, 0);

    assert_eq!(sensor.table().connection_count(), 0);
    for port in 0..50u16 {
        assert_eq!(sink.stream(&client_flow(41000 + port)), b"abcdef");
    }

    let report = sensor.shutdown();
    assert_eq!(report.pages_leaked, 0);
    assert_eq!(report.events_written, 0);
    assert_eq!(report.table.closed, 50);
}
