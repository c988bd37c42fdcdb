//! Hand-rolled HTTP peers for failure modes a mock server can't produce.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// What the upstream does after writing its records.
#[derive(Clone, Copy)]
pub enum AfterRecords {
    /// Closes the socket without the terminating chunk.
    Drop,
    /// Keeps the connection open without sending anything more.
    Stall,
}

/// Serves one chunked NDJSON response and returns its base URL.
pub async fn spawn_chunked_upstream(records: Vec<String>, after: AfterRecords) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: application/x-ndjson\r\n\
                  Transfer-Encoding: chunked\r\n\r\n",
            )
            .await
            .unwrap();
        for record in records {
            let chunk = format!("{:x}\r\n{}\r\n", record.len(), record);
            socket.write_all(chunk.as_bytes()).await.unwrap();
        }
        socket.flush().await.unwrap();

        match after {
            AfterRecords::Drop => drop(socket),
            AfterRecords::Stall => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(socket);
            }
        }
    });

    format!("http://{addr}")
}

async fn read_request(socket: &mut TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a request");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
