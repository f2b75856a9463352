//! `/health` endpoint polled by the naming backend's HTTP check.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fabric_core::error::FabricResult;

const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Serve `/health` on `listen` until `quit` fires.
pub async fn start(listen: &str, quit: CancellationToken) -> FabricResult<SocketAddr> {
    let listener = TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    info!(listen = %addr, "monitor started");
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = quit.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        debug!(error = %e, "monitor accept failed");
                        continue;
                    }
                },
            };
            tokio::spawn(async move {
                if let Err(e) = answer(stream).await {
                    debug!(error = %e, "monitor request failed");
                }
            });
        }
    });
    Ok(addr)
}

async fn answer(stream: TcpStream) -> FabricResult<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut request_line = String::new();
    rd.read_line(&mut request_line).await?;
    let path = request_line.split_whitespace().nth(1).unwrap_or_default();
    let resp = if path == "/health" { OK } else { NOT_FOUND };
    wr.write_all(resp).await?;
    wr.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn health_and_not_found() {
        let quit = CancellationToken::new();
        let addr = start("127.0.0.1:0", quit.clone()).await.unwrap();
        let ok = get(addr, "/health").await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.ends_with("ok"));
        assert!(get(addr, "/metrics").await.starts_with("HTTP/1.1 404"));
        quit.cancel();
    }
}
