//! HTTP impersonation driver

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::router::{BoxFuture, Driver, DriverListener, Routed};
use crate::store::{Artifact, SESSIONS_BUCKET};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: Apache/2.4.41 (Ubuntu)\r\n\
Content-Type: text/html\r\n\
Content-Length: 46\r\n\
Connection: close\r\n\
\r\n\
<html><body><h1>It works!</h1></body></html>\r\n";

/// Answers anything that leads with an HTTP method, captures the request,
/// and returns a stock page.
pub struct HttpDriver;

impl Driver for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    fn patterns(&self) -> Vec<Vec<u8>> {
        [
            b"GET ".as_slice(),
            b"POST ".as_slice(),
            b"HEAD ".as_slice(),
            b"PUT ".as_slice(),
            b"DELETE ".as_slice(),
            b"OPTIONS ".as_slice(),
        ]
        .iter()
        .map(|pattern| pattern.to_vec())
        .collect()
    }

    fn serve(self: Arc<Self>, mut listener: DriverListener) -> BoxFuture<Result<()>> {
        Box::pin(async move {
            while let Some(routed) = listener.accept().await {
                tokio::spawn(handle_request(routed));
            }
            Ok(())
        })
    }
}

async fn handle_request(routed: Routed) {
    let Routed { mut conn, ctx } = routed;

    let mut buf = vec![0u8; 4096];
    let read = tokio::time::timeout(Duration::from_secs(30), conn.read(&mut buf)).await;

    if let Ok(Ok(n)) = read {
        if n > 0 {
            let request_line = String::from_utf8_lossy(&buf[..n]);
            let request_line = request_line.lines().next().unwrap_or("").to_string();
            debug!(
                "http {} from {} on port {}",
                request_line,
                ctx.remote.ip(),
                ctx.local_port
            );

            let _ = ctx.store.send(Artifact {
                filename: format!("{}-{}", ctx.uuid, conn.sequence()),
                bucket: SESSIONS_BUCKET,
                data: buf[..n].to_vec(),
            });

            let _ = conn.write_all(RESPONSE).await;
        }
    }
}
