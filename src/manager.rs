//! Dynamic listener registry and per-connection dispatch
//!
//! Listeners are created on demand when the SYN observer reports a probed
//! port, each accepted connection is sniffed for its first bytes, TLS is
//! unwrapped when present, and the connection is routed to the driver
//! whose pattern matches what the client sent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use crate::ban::BanTracker;
use crate::config::Config;
use crate::context::ConnContext;
use crate::router::{DriverRegistry, Routed};
use crate::sniff::{SniffStream, MTU};
use crate::store::{Artifact, StoreSender, RAW_BUCKET};
use crate::tls::{TlsIdentity, TLS_HANDSHAKE_BYTE};

/// Result of an [`ConnectionManager::ensure_listener`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    AlreadyPresent,
    /// Port above the configured maximum; no listener was created.
    Rejected,
}

/// Owns the process-wide connection state: the listener registry, ban
/// counters, known-fingerprint set, driver registry, and TLS identity.
pub struct ConnectionManager {
    config: Config,
    bind_addr: std::net::IpAddr,
    listeners: Mutex<HashMap<u16, SocketAddr>>,
    bans: BanTracker,
    known_hashes: DashMap<String, ()>,
    registry: DriverRegistry,
    tls: TlsIdentity,
    store: StoreSender,
}

impl ConnectionManager {
    pub fn new(
        config: Config,
        registry: DriverRegistry,
        tls: TlsIdentity,
        store: StoreSender,
    ) -> Result<Arc<Self>> {
        let bind_addr = config.resolve_bind_addr()?;
        let bans = BanTracker::new(config.manager.ban_threshold);
        Ok(Arc::new(Self {
            config,
            bind_addr,
            listeners: Mutex::new(HashMap::new()),
            bans,
            known_hashes: DashMap::new(),
            registry,
            tls,
            store,
        }))
    }

    /// Open every configured pre-open port. Bind failures are logged and
    /// skipped so one busy port does not take the rest down.
    pub async fn preopen(self: &Arc<Self>) {
        for port in self.config.manager.preopen_ports.clone() {
            if let Err(e) = self.ensure_listener(port).await {
                warn!("cannot preopen port {}: {}", port, e);
            }
        }
    }

    /// Create a listener for `port` if one does not already exist.
    ///
    /// Creation is serialized on the registry lock, so concurrent calls
    /// for the same port produce exactly one listener. Entries are never
    /// removed for the lifetime of the process.
    pub async fn ensure_listener(self: &Arc<Self>, port: u16) -> Result<EnsureOutcome> {
        if port > self.config.manager.max_port {
            return Ok(EnsureOutcome::Rejected);
        }

        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&port) {
            return Ok(EnsureOutcome::AlreadyPresent);
        }

        let listener = TcpListener::bind((self.bind_addr, port)).await?;
        let local_addr = listener.local_addr()?;
        listeners.insert(port, local_addr);
        drop(listeners);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.accept_loop(listener, local_addr).await;
        });

        info!("listener started on {}", local_addr);
        Ok(EnsureOutcome::Created)
    }

    /// Number of listeners currently registered.
    pub async fn listener_count(&self) -> usize {
        self.listeners.lock().await.len()
    }

    /// Address a port's listener is bound to, if one exists.
    pub async fn listener_addr(&self, port: u16) -> Option<SocketAddr> {
        self.listeners.lock().await.get(&port).copied()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, local_addr: SocketAddr) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle_connection(stream, peer, local_addr).await {
                            debug!("connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error on {}: {}", local_addr, e);
                }
            }
        }
    }

    /// The sniff-then-route pipeline for one accepted connection. Steps
    /// are strictly ordered; the accept loop never waits on this.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        local_addr: SocketAddr,
    ) -> Result<()> {
        // Ban hammer first: nothing is read from or written to a banned
        // source.
        if self.bans.tick(peer.ip()) {
            trace!("dropping banned {}", peer.ip());
            return Ok(());
        }

        let sniffer = SniffStream::new(Box::new(stream), peer, local_addr);
        let uuid = sniffer.uuid();
        let idle = Duration::from_millis(self.config.manager.idle_timeout_ms);

        let (mut sniffer, mut buf) = self.sniff_first_bytes(sniffer, local_addr.port()).await?;

        // Try unwrapping TLS so routing and capture see cleartext.
        let mut tls_unwrapped = false;
        if buf.first() == Some(&TLS_HANDSHAKE_BYTE) {
            sniffer.done_sniffing();
            match tokio::time::timeout(idle, self.tls.unwrap_tls(sniffer)).await {
                Ok(Ok((clear, clear_buf))) => {
                    sniffer = clear;
                    buf = clear_buf;
                    tls_unwrapped = true;
                }
                Ok(Err((original, e))) => {
                    trace!("tls unwrap failed for {}: {}", uuid, e);
                    sniffer = original;
                }
                Err(_) => {
                    trace!("tls handshake timeout for {}", uuid);
                    return Ok(());
                }
            }
        }

        // Whoever reads next gets the client's bytes from the top.
        sniffer.reset();

        let hash = fingerprint(&buf);
        debug!(
            "tcp knock from {} on port {} (uuid {}, hash {}, tls {})",
            peer.ip(),
            local_addr.port(),
            uuid,
            hash,
            tls_unwrapped
        );

        // Persist the first bytes once per distinct fingerprint.
        if !buf.is_empty() && self.known_hashes.insert(hash.clone(), ()).is_none() {
            let _ = self.store.send(Artifact {
                filename: hash.clone(),
                bucket: RAW_BUCKET,
                data: buf.clone(),
            });
        }

        match self.registry.route(&buf) {
            Some((name, ingress)) => {
                let ctx = ConnContext {
                    uuid,
                    remote: peer,
                    local_port: local_addr.port(),
                    fingerprint: hash,
                    tls_unwrapped,
                    store: self.store.clone(),
                };
                debug!("routing {} to {} driver", uuid, name);
                if ingress.send(Routed { conn: sniffer, ctx }).is_err() {
                    debug!("{} driver ingress closed, dropping {}", name, uuid);
                }
            }
            None => {
                if !buf.is_empty() {
                    debug!("no driver for {} (hash {})", uuid, hash);
                }
            }
        }

        Ok(())
    }

    /// Single MTU-bounded read of the client's first bytes, racing a
    /// banner task against the client and bounding the wait with the idle
    /// deadline. Both helpers are cancelled before this returns.
    async fn sniff_first_bytes(
        &self,
        sniffer: SniffStream,
        port: u16,
    ) -> Result<(SniffStream, Vec<u8>)> {
        let banner = self.banner_for(port);
        let delay = Duration::from_millis(self.config.manager.banner_delay_ms);
        let idle = Duration::from_millis(self.config.manager.idle_timeout_ms);
        let uuid = sniffer.uuid();

        // The banner task owns the write half while the handler waits on
        // the read half; the oneshot is its cancel handle.
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let (mut rd, mut wr) = tokio::io::split(sniffer);
        let banner_task = tokio::spawn(async move {
            tokio::select! {
                _ = &mut cancel_rx => {}
                _ = async {
                    tokio::time::sleep(delay).await;
                    if let Some(banner) = banner {
                        let _ = wr.write_all(&banner).await;
                        let _ = wr.flush().await;
                    }
                } => {}
            }
            wr
        });

        let mut buf = vec![0u8; MTU];
        let read = tokio::time::timeout(idle, rd.read(&mut buf)).await;

        // Cancel the banner and reunite the halves before anything else.
        let _ = cancel_tx.send(());
        let wr = banner_task
            .await
            .map_err(|e| anyhow::anyhow!("banner task failed: {}", e))?;
        let sniffer = rd.unsplit(wr);

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // Slowloris stall: give up on the first read; the empty
                // buffer falls through to close below.
                trace!("idle timeout waiting for first bytes from {}", uuid);
                0
            }
        };
        buf.truncate(n);

        Ok((sniffer, buf))
    }

    fn banner_for(&self, port: u16) -> Option<Vec<u8>> {
        self.config
            .banner_override(port)
            .or_else(|| default_banner(port).map(|banner| banner.to_vec()))
    }
}

/// Stable identity of an attack flavor: hex SHA-256 of the first bytes.
pub fn fingerprint(buf: &[u8]) -> String {
    hex::encode(Sha256::digest(buf))
}

/// Built-in banners for server-greets-first protocols, overridable per
/// port in the configuration.
fn default_banner(port: u16) -> Option<&'static [u8]> {
    match port {
        21 => Some(b"220 FTP server ready\r\n"),
        22 | 2222 => Some(b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.10\r\n"),
        23 => Some(b"\r\nUbuntu 20.04 LTS\r\nlogin: "),
        25 | 587 => Some(b"220 mail.example.com ESMTP\r\n"),
        110 | 995 => Some(b"+OK POP3 server ready\r\n"),
        143 | 993 => Some(b"* OK IMAP4rev1 Service Ready\r\n"),
        5900 | 5901 => Some(b"RFB 003.008\n"),
        6379 => Some(b"-ERR unknown command\r\n"),
        11211 => Some(b"VERSION 1.6.9\r\n"),
        _ => None,
    }
}
