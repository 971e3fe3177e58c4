//! End-to-end queries against the DNS forwarder: black-hole answers for
//! blacklisted names, verbatim forwarding for everything else.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use st_config::DnsDaemonConfig;
use st_daemons::dnsd::{Daemon, BLACK_HOLE_ANSWER};

/// Hand-build an A-record query for the given name.
fn build_query(name: &str) -> Vec<u8> {
    let mut packet = vec![0xe5, 0x75, 0x01, 0x20, 0, 1, 0, 0, 0, 0, 0, 0];
    for label in name.split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&[0, 1, 0, 1]);
    packet
}

/// A fake upstream resolver that answers every query with a canned blob.
async fn start_fake_upstream(reply: &'static [u8]) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((_, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(reply, peer).await;
        }
    });
    addr
}

fn config(udp_port: u16, tcp_port: u16, forwarder: std::net::SocketAddr) -> DnsDaemonConfig {
    DnsDaemonConfig {
        address: "127.0.0.1".to_string(),
        allow_query_ip_prefixes: vec!["127.".to_string()],
        per_ip_limit: 100,
        udp_port,
        udp_forwarders: vec![forwarder.to_string()],
        tcp_port,
        tcp_forwarders: vec![forwarder.to_string()],
    }
}

#[tokio::test]
async fn udp_blackhole_and_passthrough() {
    let upstream = start_fake_upstream(b"upstream-reply").await;
    let daemon = Arc::new(Daemon::new(&config(23715, 0, upstream)).unwrap());
    let serving = daemon.clone();
    let handle = tokio::spawn(async move { serving.start_and_block().await });
    sleep(Duration::from_millis(300)).await;
    daemon.replace_blacklist(["doubleclick.net".to_string()]);

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect("127.0.0.1:23715").await.unwrap();
    let mut buf = [0u8; 2048];

    // A blacklisted A query earns the canned black-hole answer.
    let query = build_query("doubleclick.net");
    client.send(&query).await.unwrap();
    let read = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let answer = &buf[..read];
    assert_eq!(&answer[..2], &query[..2]);
    assert_eq!(&answer[2..4], &[0x81, 0x80]);
    assert_eq!(answer[7], 1);
    let tail = &answer[answer.len() - BLACK_HOLE_ANSWER.len()..];
    // TTL 1466 and RDATA 0.0.0.0.
    assert_eq!(u16::from_be_bytes([tail[8], tail[9]]), 1466);
    assert_eq!(&tail[12..], &[0, 0, 0, 0]);

    // Any other name goes upstream.
    client.send(&build_query("example.org")).await.unwrap();
    let read = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..read], b"upstream-reply");

    // A packet too short to be a name query passes through verbatim.
    client.send(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();
    let read = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..read], b"upstream-reply");

    daemon.stop();
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn tcp_blackhole_answer() {
    // The TCP path answers blacklisted names without consulting upstream,
    // so the forwarder address only has to parse.
    let upstream = start_fake_upstream(b"unused").await;
    let daemon = Arc::new(Daemon::new(&config(0, 23716, upstream)).unwrap());
    let serving = daemon.clone();
    let handle = tokio::spawn(async move { serving.start_and_block().await });
    sleep(Duration::from_millis(300)).await;
    daemon.replace_blacklist(["doubleclick.net".to_string()]);

    let query = build_query("doubleclick.net");
    let mut conn = TcpStream::connect("127.0.0.1:23716").await.unwrap();
    conn.write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    conn.write_all(&query).await.unwrap();

    let mut length_bytes = [0u8; 2];
    timeout(Duration::from_secs(5), conn.read_exact(&mut length_bytes))
        .await
        .unwrap()
        .unwrap();
    let length = u16::from_be_bytes(length_bytes) as usize;
    let mut answer = vec![0u8; length];
    timeout(Duration::from_secs(5), conn.read_exact(&mut answer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&answer[..2], &query[..2]);
    assert_eq!(&answer[2..4], &[0x81, 0x80]);
    assert_eq!(answer[7], 1);

    daemon.stop();
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(outcome.is_ok(), "{outcome:?}");
}
