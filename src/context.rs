//! Per-connection context handed to drivers

use std::net::SocketAddr;
use uuid::Uuid;

use crate::store::StoreSender;

/// Everything a driver needs to know about the connection it was handed:
/// identity, endpoints, the fingerprint of the first bytes, and the channel
/// for persisting session captures. Threaded explicitly, never ambient.
#[derive(Debug, Clone)]
pub struct ConnContext {
    pub uuid: Uuid,
    pub remote: SocketAddr,
    pub local_port: u16,
    pub fingerprint: String,
    pub tls_unwrapped: bool,
    pub store: StoreSender,
}
