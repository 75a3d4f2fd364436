//! Raw socket SYN observer (requires CAP_NET_RAW or root)
//!
//! Reads IPv4 TCP segments from a raw socket and reports the destination
//! port of every inbound SYN, so a user-space listener can be opened
//! before the kernel's RST closes the window. The raw socket accepts
//! nothing itself. Where the socket cannot be opened the observer degrades
//! to a no-op and only preopened ports receive traffic.

use std::sync::Arc;

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::TcpFlags;
use pnet::transport::{self, TransportChannelType, TransportProtocol};
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

use crate::manager::{ConnectionManager, EnsureOutcome};

/// Start the observer: a blocking task reading the raw socket and an async
/// task turning reported ports into listeners.
pub fn start(manager: Arc<ConnectionManager>) {
    let (port_tx, mut port_rx) = mpsc::unbounded_channel::<u16>();

    tokio::task::spawn_blocking(move || observe_loop(port_tx));

    tokio::spawn(async move {
        while let Some(port) = port_rx.recv().await {
            match manager.ensure_listener(port).await {
                Ok(EnsureOutcome::Created) => trace!("started tcp listener on {}", port),
                Ok(_) => {}
                Err(e) => trace!("creating listener on {}: {}", port, e),
            }
        }
    });
}

/// Blocking receive loop over the raw socket. Uses the synchronous pnet
/// receiver, so it lives on the blocking pool.
fn observe_loop(port_tx: mpsc::UnboundedSender<u16>) {
    let protocol = TransportChannelType::Layer4(TransportProtocol::Ipv4(IpNextHeaderProtocols::Tcp));
    let (_tx, mut rx) = match transport::transport_channel(4096, protocol) {
        Ok(channel) => channel,
        Err(e) => {
            warn!(
                "SYN observer disabled: {} (only preopened ports will accept connections)",
                e
            );
            return;
        }
    };

    info!("SYN observer started (raw packet capture enabled)");

    let mut packets = transport::tcp_packet_iter(&mut rx);
    loop {
        match packets.next() {
            Ok((segment, _source)) => {
                let flags = segment.get_flags();
                if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK == 0 {
                    // The async side materializes the listener; the kernel
                    // takes over for future SYNs to the same port.
                    if port_tx.send(segment.get_destination()).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                trace!("reading raw socket: {}", e);
            }
        }
    }
}
