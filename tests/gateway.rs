//! End-to-end gateway tests over real sockets.

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use trackside::{
    DecodeRegistry, Gateway, GatewayConfig, PointBatch, UdpIngest, Value, batch_channel,
    compile_str,
};

/// Length-prefixed payload protocol: byte 0 announces how many payload
/// bytes follow; each payload byte becomes one point.
const LENGTH_PREFIXED: &str = r#"
chunks:
  - type: FixedLengthChunk
    length: 1
    sections:
      - from: { byte: 1 }
        decoding: { method: u8 }
        for: { varName: [frame_len] }
        desc: length prefix
  - type: FixedLengthChunk
    length: "${frame_len}"
    sections:
      - from: { byte: 1, repeat: "${frame_len}" }
        decoding: { method: u8 }
        to: { device: "unit_${device_id}", type: telemetry, fields: [octet] }
        desc: payload bytes
"#;

struct Harness {
    addr: std::net::SocketAddr,
    batches: mpsc::Receiver<PointBatch>,
    cancel: CancellationToken,
    gateway: JoinHandle<()>,
}

async fn start(config: GatewayConfig, protocol: &str) -> Harness {
    let registry = DecodeRegistry::with_builtins();
    let plan = compile_str(protocol, &registry).expect("protocol compiles");
    let gateway = Gateway::new(config, plan);
    let cancel = gateway.cancellation_token();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (tx, batches) = batch_channel(16);
    let gateway = tokio::spawn(async move {
        gateway.serve(listener, tx).await.expect("gateway serves");
    });

    Harness { addr, batches, cancel, gateway }
}

async fn recv_batch(harness: &mut Harness) -> PointBatch {
    timeout(Duration::from_secs(5), harness.batches.recv())
        .await
        .expect("batch within deadline")
        .expect("channel open")
}

/// Read until the peer closes the socket; returns true if EOF arrived
/// within the deadline.
async fn peer_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(timeout(Duration::from_secs(5), stream.read(&mut buf)).await, Ok(Ok(0)))
}

#[tokio::test(flavor = "multi_thread")]
async fn frames_flow_end_to_end() {
    let mut harness = start(GatewayConfig::default(), LENGTH_PREFIXED).await;

    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    client.write_all(&[0x03, 0x0A, 0x0B, 0x0C]).await.expect("first frame");

    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.frame_id, 0);
    assert_eq!(batch.points.len(), 3);
    let octets: Vec<&Value> = batch.points.iter().map(|point| &point.fields["octet"]).collect();
    assert_eq!(octets, [&Value::UInt(0x0A), &Value::UInt(0x0B), &Value::UInt(0x0C)]);
    // Whitelist is off, so the device id falls back to the remote address.
    assert_eq!(batch.points[0].device.name, "unit_127.0.0.1");
    assert_eq!(batch.points[0].device.kind, "telemetry");
    assert!(batch.timestamp_ms > 0);

    // Second frame on the same connection: ids advance, context persists.
    client.write_all(&[0x01, 0xFF]).await.expect("second frame");
    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.frame_id, 1);
    assert_eq!(batch.points[0].fields["octet"], Value::UInt(0xFF));

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn whitelist_rejects_unknown_peer_before_reading() {
    let config = GatewayConfig {
        require_alias: true,
        devices: HashMap::from([("203.0.113.1".to_string(), "vobc1".to_string())]),
        ..GatewayConfig::default()
    };
    let mut harness = start(config, LENGTH_PREFIXED).await;

    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    assert!(peer_closed(&mut client).await, "rejected connection should close");

    // Nothing was decoded, so nothing was emitted.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.batches.try_recv().is_err());

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn whitelisted_peer_gets_its_alias_as_device_id() {
    let config = GatewayConfig {
        require_alias: true,
        devices: HashMap::from([("127.0.0.1".to_string(), "vobc1".to_string())]),
        ..GatewayConfig::default()
    };
    let mut harness = start(config, LENGTH_PREFIXED).await;

    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    client.write_all(&[0x01, 0x2A]).await.expect("frame");

    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.points[0].device.name, "unit_vobc1");

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_connection_is_closed_by_deadline() {
    let config = GatewayConfig { idle_timeout_secs: 1, ..GatewayConfig::default() };
    let mut harness = start(config, LENGTH_PREFIXED).await;

    let mut idle = TcpStream::connect(harness.addr).await.expect("connect idle");
    assert!(peer_closed(&mut idle).await, "idle connection should be closed");

    // The deadline killed one connection, not the listener: a fresh peer
    // is still serviced.
    let mut active = TcpStream::connect(harness.addr).await.expect("connect active");
    active.write_all(&[0x01, 0x07]).await.expect("frame");
    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.points[0].fields["octet"], Value::UInt(7));

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frame_closes_only_its_connection() {
    let mut harness = start(GatewayConfig::default(), LENGTH_PREFIXED).await;

    let mut bad = TcpStream::connect(harness.addr).await.expect("connect bad");
    let mut good = TcpStream::connect(harness.addr).await.expect("connect good");

    // Announce 5 payload bytes, deliver 2, then half-close: torn frame.
    bad.write_all(&[0x05, 0x01, 0x02]).await.expect("partial frame");
    bad.shutdown().await.expect("half close");
    assert!(peer_closed(&mut bad).await, "torn frame should close the connection");

    good.write_all(&[0x02, 0x11, 0x22]).await.expect("good frame");
    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.points.len(), 2);

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connections_have_isolated_contexts() {
    let mut harness = start(GatewayConfig::default(), LENGTH_PREFIXED).await;

    let mut first = TcpStream::connect(harness.addr).await.expect("connect first");
    let mut second = TcpStream::connect(harness.addr).await.expect("connect second");

    // Different frame_len exports on each connection; if contexts leaked,
    // one stream's announced length would corrupt the other's decode.
    first.write_all(&[0x02, 0xAA, 0xBB]).await.expect("first frame");
    second.write_all(&[0x01, 0xCC]).await.expect("second frame");

    let mut sizes: Vec<usize> = vec![
        recv_batch(&mut harness).await.points.len(),
        recv_batch(&mut harness).await.points.len(),
    ];
    sizes.sort_unstable();
    assert_eq!(sizes, [1, 2]);

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_live_connections() {
    let mut harness = start(GatewayConfig::default(), LENGTH_PREFIXED).await;

    let mut client = TcpStream::connect(harness.addr).await.expect("connect");
    client.write_all(&[0x01, 0x01]).await.expect("frame");
    let _ = recv_batch(&mut harness).await;

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway drains connections");
    assert!(peer_closed(&mut client).await, "socket closed after shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn connection_cap_rejects_excess_peers() {
    let config = GatewayConfig { max_connections: Some(1), ..GatewayConfig::default() };
    let mut harness = start(config, LENGTH_PREFIXED).await;

    let mut kept = TcpStream::connect(harness.addr).await.expect("connect kept");
    kept.write_all(&[0x01, 0x01]).await.expect("frame");
    let _ = recv_batch(&mut harness).await;

    let mut rejected = TcpStream::connect(harness.addr).await.expect("connect rejected");
    assert!(peer_closed(&mut rejected).await, "over-cap connection should close");

    // The kept connection is still serviced.
    kept.write_all(&[0x01, 0x02]).await.expect("second frame");
    let batch = recv_batch(&mut harness).await;
    assert_eq!(batch.points[0].fields["octet"], Value::UInt(2));

    harness.cancel.cancel();
    harness.gateway.await.expect("gateway exits");
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_datagrams_decode_as_single_frames() {
    let registry = DecodeRegistry::with_builtins();
    let plan = compile_str(LENGTH_PREFIXED, &registry).expect("protocol compiles");
    let config = GatewayConfig::default();
    let gateway = Gateway::new(config, plan);
    let cancel = gateway.cancellation_token();

    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
    let addr = socket.local_addr().expect("udp addr");
    let (tx, mut batches) = batch_channel(16);
    let ingest = UdpIngest::new(gateway.plan(), gateway.identity(), tx, cancel.clone());
    let ingest = tokio::spawn(async move { ingest.run(socket).await.expect("udp ingest runs") });

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.send_to(&[0x02, 0x10, 0x20], addr).await.expect("datagram");

    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("batch within deadline")
        .expect("channel open");
    assert_eq!(batch.points.len(), 2);
    assert_eq!(batch.points[0].device.name, "unit_127.0.0.1");

    // A malformed datagram is dropped without killing the ingest.
    client.send_to(&[0x09, 0x01], addr).await.expect("short datagram");
    client.send_to(&[0x01, 0x55], addr).await.expect("good datagram");
    let batch = timeout(Duration::from_secs(5), batches.recv())
        .await
        .expect("batch within deadline")
        .expect("channel open");
    assert_eq!(batch.points[0].fields["octet"], Value::UInt(0x55));

    cancel.cancel();
    ingest.await.expect("ingest exits");
}
