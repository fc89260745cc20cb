use std::{sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Barrier,
};

const CHUNK: usize = 1024;
const N: usize = 1_000;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Echoes everything read back to the peer, one window at a time.
async fn echo(listener: TcpListener, barrier: Arc<Barrier>) {
    barrier.wait().await;
    let (socket, _addr) = listener.accept().await.unwrap();
    let (reader, writer) = socket.into_split();

    // The client shuts down its write half before the last window is echoed
    let (connection, task) = backflow::stream(reader, writer)
        .prefetch(32)
        .half_close(true)
        .build();
    let echoed = connection.send(connection.inbound()).unwrap();
    echoed.await.unwrap();
    task.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn base() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let server = tokio::spawn(echo(listener, barrier.clone()));
    barrier.wait().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();

    let expected = payload(CHUNK * N);
    let receiver = tokio::spawn(async move {
        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        got
    });

    for chunk in expected.chunks(CHUNK) {
        writer.write_all(chunk).await.unwrap();
    }
    // The last partial window is flushed once the echo sequence completes
    writer.shutdown().await.unwrap();

    let got = tokio::time::timeout(Duration::from_secs(10), receiver)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got.len(), expected.len());
    assert!(got == expected, "Echoed bytes differ from the sent ones");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn upload() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut got = Vec::new();
        socket.read_to_end(&mut got).await.unwrap();
        got
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, writer) = stream.into_split();
    let (connection, task) = backflow::stream(reader, writer).build();

    let (mut tx, outgoing) = backflow::outbound::<Vec<u8>>(64);
    let written = connection.send(&outgoing).unwrap();

    let expected = payload(CHUNK * N);
    for chunk in expected.chunks(CHUNK) {
        tx.send(chunk.to_vec()).await.unwrap();
    }
    tx.close();

    tokio::time::timeout(Duration::from_secs(10), written)
        .await
        .unwrap()
        .unwrap();
    task.stop().await;

    let got = tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert!(got == expected, "Uploaded bytes differ from the sent ones");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_pause_without_demand() {
    const TOTAL: usize = 32 * 1024 * 1024;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&payload(TOTAL)).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, _writer) = stream.into_split();
    let (connection, task) = backflow::stream(reader, tokio::io::sink())
        .chunk_size(CHUNK)
        .prefetch(32)
        .build();

    // Nobody consumes: the bridge stops reading at half of its queue
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pending = connection.inbound().pending();
    assert!((16..=32).contains(&pending), "Unexpected backlog of {pending} chunks");
    assert!(!server.is_finished(), "The sender must be held back by the paused reads");

    let mut rx = backflow::inbound(connection.inbound(), 16).unwrap();
    let mut got = Vec::with_capacity(TOTAL);
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        assert!(chunk.len() <= CHUNK);
        got.extend_from_slice(&chunk);
    }
    assert!(got == payload(TOTAL), "Received bytes differ from the sent ones");

    server.await.unwrap();
    task.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn half_close_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let server = tokio::spawn(echo(listener, barrier.clone()));
    barrier.wait().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, writer) = stream.into_split();
    let (connection, task) = backflow::stream(reader, writer).prefetch(64).build();

    let mut rx = backflow::inbound(connection.inbound(), 32).unwrap();
    let receiver = tokio::spawn(async move {
        let mut got = Vec::new();
        while let Some(chunk) = rx.recv().await.unwrap() {
            got.extend_from_slice(&chunk);
        }
        got
    });

    let (mut tx, outgoing) = backflow::outbound::<Vec<u8>>(32);
    let written = connection.send(&outgoing).unwrap();
    let expected = payload(CHUNK * 100 + 17);
    for chunk in expected.chunks(CHUNK) {
        tx.send(chunk.to_vec()).await.unwrap();
    }
    tx.close();
    written.await.unwrap();
    connection.transport().shutdown_write();

    // Reads stay open until the server has echoed everything and hung up
    let got = tokio::time::timeout(Duration::from_secs(10), receiver)
        .await
        .unwrap()
        .unwrap();
    assert!(got == expected, "Echoed bytes differ from the sent ones");

    tokio::time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    task.stop().await;
}
