//! SOCKS5 clients through both roles running in one process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use store_tunnel::storage::MemoryStore;
use store_tunnel::{CallerService, ListenerService, Shutdown};

mod common;

async fn start_local() -> (SocketAddr, Shutdown) {
    let config = common::fast_config();
    let store = MemoryStore::new();
    let shutdown = Shutdown::new();

    tokio::spawn(ListenerService::new(&config, Arc::new(store.clone())).run(shutdown.clone()));
    let caller = CallerService::bind(&config, Arc::new(store)).await.unwrap();
    let addr = caller.local_addr().unwrap();
    tokio::spawn(caller.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    (addr, shutdown)
}

async fn greet(client: &mut TcpStream) {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);
}

async fn read_reply(client: &mut TcpStream) -> u8 {
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    reply[1]
}

#[tokio::test]
async fn test_connect_and_fetch() {
    let goal = common::start_mock_backend("through the store").await;
    let (proxy, shutdown) = start_local().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    greet(&mut client).await;

    let port = goal.port().to_be_bytes();
    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, port[0], port[1]])
        .await
        .unwrap();
    assert_eq!(read_reply(&mut client).await, 0x00);

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .expect("tunnel closes after the response")
        .unwrap();
    assert_eq!(response, common::http_response("through the store").into_bytes());

    shutdown.trigger();
}

#[tokio::test]
async fn test_domain_target_is_accepted() {
    let goal = common::start_mock_backend("named").await;
    let (proxy, shutdown) = start_local().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    greet(&mut client).await;

    let name = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&goal.port().to_be_bytes());
    client.write_all(&request).await.unwrap();
    assert_eq!(read_reply(&mut client).await, 0x00);

    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.ends_with(b"named"));

    shutdown.trigger();
}

#[tokio::test]
async fn test_rejections_on_the_wire() {
    let (proxy, shutdown) = start_local().await;

    // Only username/password offered.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);

    // BIND is not supported.
    let mut client = TcpStream::connect(proxy).await.unwrap();
    greet(&mut client).await;
    client.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80]).await.unwrap();
    assert_eq!(read_reply(&mut client).await, 0x07);

    // IPv6 targets are refused with "address type not supported".
    let mut client = TcpStream::connect(proxy).await.unwrap();
    greet(&mut client).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x04];
    request.extend_from_slice(&[0u8; 15]);
    request.push(1);
    request.extend_from_slice(&[0, 80]);
    client.write_all(&request).await.unwrap();
    assert_eq!(read_reply(&mut client).await, 0x08);

    shutdown.trigger();
}
