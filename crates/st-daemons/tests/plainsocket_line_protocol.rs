//! End-to-end conversations with the plain-text line protocol daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

use st_config::PlainSocketDaemonConfig;
use st_core::testsupport::get_test_command_processor;
use st_daemons::plainsocket::Daemon;

fn config(tcp_port: u16, udp_port: u16, per_ip_limit: usize) -> PlainSocketDaemonConfig {
    PlainSocketDaemonConfig {
        address: "127.0.0.1".to_string(),
        tcp_port,
        udp_port,
        per_ip_limit,
    }
}

async fn start(daemon: &Arc<Daemon>) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let serving = daemon.clone();
    let handle = tokio::spawn(async move { serving.start_and_block().await });
    sleep(Duration::from_millis(200)).await;
    handle
}

#[tokio::test]
async fn tcp_conversations() {
    let processor = Arc::new(get_test_command_processor());
    let daemon = Arc::new(Daemon::new(&config(23711, 0, 100), processor).unwrap());
    let handle = start(&daemon).await;

    let mut conn = TcpStream::connect("127.0.0.1:23711").await.unwrap();
    let (reader, mut writer) = conn.split();
    let mut lines = BufReader::new(reader).lines();

    // A command with a bad PIN earns the mismatch text.
    writer.write_all(b"pin mismatch\r\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "Failed to match PIN/shortcut");

    // With the good PIN the command executes.
    writer.write_all(b"verysecret .s echo hi\r\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    assert_eq!(reply, "hi");

    // Replies arrive in submission order on one connection.
    writer
        .write_all(b"verysecret .s echo first\nverysecret .s echo second\r\n")
        .await
        .unwrap();
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "first");
    assert_eq!(lines.next_line().await.unwrap().unwrap(), "second");

    // Stopping twice has no negative consequence.
    daemon.stop();
    daemon.stop();
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(outcome.is_ok(), "{outcome:?}");
}

#[tokio::test]
async fn tcp_rate_limit_flood() {
    let processor = Arc::new(get_test_command_processor());
    let daemon = Arc::new(Daemon::new(&config(23712, 0, 10), processor).unwrap());
    let handle = start(&daemon).await;

    let mut success = 0;
    for _ in 0..100 {
        let mut conn = match TcpStream::connect("127.0.0.1:23712").await {
            Ok(conn) => conn,
            Err(_) => continue,
        };
        if conn.write_all(b"verysecret .s echo hi\r\n").await.is_err() {
            continue;
        }
        let (reader, _) = conn.split();
        let mut lines = BufReader::new(reader).lines();
        match timeout(Duration::from_millis(500), lines.next_line()).await {
            Ok(Ok(Some(reply))) if reply == "hi" => success += 1,
            _ => {}
        }
    }
    // The connection and the command line each count, so a limit of ten
    // admits about five command replies per window; window rollover may
    // admit a few more.
    assert!(
        (5..=15).contains(&success),
        "unexpected number of successful replies: {success}"
    );

    daemon.stop();
    let _ = timeout(Duration::from_secs(5), handle).await.unwrap();
}

#[tokio::test]
async fn udp_conversations() {
    let processor = Arc::new(get_test_command_processor());
    let daemon = Arc::new(Daemon::new(&config(0, 23713, 100), processor).unwrap());
    let handle = start(&daemon).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect("127.0.0.1:23713").await.unwrap();

    client.send(b"pin mismatch\r\n").await.unwrap();
    let mut buf = [0u8; 1024];
    let read = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..read], b"Failed to match PIN/shortcut\r\n");

    client.send(b"verysecret .s echo hi\r\n").await.unwrap();
    let read = timeout(Duration::from_secs(5), client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..read], b"hi\r\n");

    daemon.stop();
    let outcome = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(outcome.is_ok(), "{outcome:?}");
}
