//! SSH banner-exchange driver
//!
//! The connection manager has already greeted the client with an SSH
//! server banner, so by the time a connection lands here the client's own
//! identification string is the sniffed prefix. The driver captures that
//! exchange and whatever key-exchange material follows, then hangs up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::router::{BoxFuture, Driver, DriverListener, Routed};
use crate::store::{Artifact, SESSIONS_BUCKET};

/// Most clients give up after their banner and one KEXINIT; no point
/// collecting more frames than that.
const MAX_CAPTURES: usize = 4;

pub struct SshDriver;

impl Driver for SshDriver {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn patterns(&self) -> Vec<Vec<u8>> {
        vec![b"SSH-".to_vec()]
    }

    fn serve(self: Arc<Self>, mut listener: DriverListener) -> BoxFuture<Result<()>> {
        Box::pin(async move {
            while let Some(routed) = listener.accept().await {
                tokio::spawn(handle_session(routed));
            }
            Ok(())
        })
    }
}

async fn handle_session(routed: Routed) {
    let Routed { mut conn, ctx } = routed;

    let mut buf = vec![0u8; 4096];
    let mut captures = 0;

    while captures < MAX_CAPTURES {
        let read = tokio::time::timeout(Duration::from_secs(30), conn.read(&mut buf)).await;
        let n = match read {
            Ok(Ok(n)) if n > 0 => n,
            _ => break,
        };

        if captures == 0 {
            let client_banner = String::from_utf8_lossy(&buf[..n]);
            debug!(
                "ssh client {} from {}",
                client_banner.lines().next().unwrap_or("").trim(),
                ctx.remote.ip()
            );
        }

        let _ = ctx.store.send(Artifact {
            filename: format!("{}-{}", ctx.uuid, conn.sequence()),
            bucket: SESSIONS_BUCKET,
            data: buf[..n].to_vec(),
        });
        captures += 1;
    }
}
