use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use espelho::{server, Client, Error, Frame, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn start_server(config: ServerConfig) -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server::run(listener, config, async move {
            let _ = rx.await;
        })
        .await
        .unwrap()
    });
    (addr, tx)
}

#[tokio::test]
async fn ping_pong_raw() {
    let (addr, _shutdown) = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
    let mut response = [0; 7];
    stream.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"+PONG\r\n");
}

#[tokio::test]
async fn unknown_command_is_answered_then_closed() {
    let (addr, _shutdown) = start_server(ServerConfig::default()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream.write_all(b"*1\r\n$7\r\nFOOBARZ\r\n").await.unwrap();
    let mut response = vec![];
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response[0], b'-');
    assert!(String::from_utf8_lossy(&response).contains("foobarz"));
}

#[tokio::test]
async fn set_get_and_expire() {
    let (addr, _shutdown) = start_server(ServerConfig::default()).await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(client.get("hello").await.unwrap(), None);
    client.set("hello", Bytes::from("world")).await.unwrap();
    assert_eq!(
        client.get("hello").await.unwrap(),
        Some(Bytes::from("world"))
    );

    client
        .set_expires("short", Bytes::from("lived"), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(client.get("short").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.get("short").await.unwrap(), None);
}

#[tokio::test]
async fn generic_commands() {
    let (addr, _shutdown) = start_server(ServerConfig::default()).await;
    let mut client = Client::connect(addr).await.unwrap();

    assert_eq!(
        client.ping(Some(Bytes::from("hey"))).await.unwrap(),
        Bytes::from("hey")
    );
    let echoed = client
        .send_command(vec!["echo".into(), "mirror".into()])
        .await
        .unwrap();
    assert_eq!(echoed, Frame::BulkString(Bytes::from("mirror")));

    let err = client
        .send_command(vec!["SET".into(), "k".into(), "v".into(), "KEEPTTL".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Response(msg) if msg.starts_with("ERR")));

    let info = client.info(None).await.unwrap();
    assert!(info.starts_with("# Replication\r\n"));
    assert!(info.contains("role:master\r\n"));
    assert!(info.contains("connected_slaves:0\r\n"));
}

#[tokio::test]
async fn shutdown_completes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let server = tokio::spawn(server::run(listener, ServerConfig::default(), async move {
        let _ = rx.await;
    }));

    let mut client = Client::connect(addr).await.unwrap();
    client.ping(None).await.unwrap();

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}
