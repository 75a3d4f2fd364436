//! TLS auto-unwrap
//!
//! A process-wide self-signed identity is generated at startup. When a
//! connection's first byte looks like a TLS handshake record, the handler
//! hands the stream here; the handshake replays the already-sniffed client
//! hello, and on success the cleartext side is re-wrapped in a fresh
//! sniffer so routing sees decrypted bytes. Failures hand the original
//! stream back so the handler can continue with the ciphertext.

use std::io;
use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsAcceptor;
use tracing::{info, trace};

use crate::sniff::{SniffStream, MTU};

/// First byte of a TLS handshake record.
pub const TLS_HANDSHAKE_BYTE: u8 = 0x16;

/// Self-signed server identity shared by every unwrap attempt.
pub struct TlsIdentity {
    acceptor: TlsAcceptor,
}

impl TlsIdentity {
    /// Generate a throwaway certificate and build the acceptor around it.
    pub fn generate() -> Result<Self> {
        // Pin the process-default crypto provider; other dependencies may
        // enable a second one and make the builder ambiguous.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
        let cert: CertificateDer<'static> = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;

        info!("generated self-signed TLS identity");
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Terminate TLS over `sniffer` and sniff the first cleartext bytes.
    ///
    /// The caller must have put the sniffer into done-sniffing mode so the
    /// recorded client hello is consumed by the handshake instead of being
    /// replayed to the driver later. On handshake failure the original
    /// stream is returned for the ciphertext fallback path.
    pub async fn unwrap_tls(
        &self,
        sniffer: SniffStream,
    ) -> Result<(SniffStream, Vec<u8>), (SniffStream, io::Error)> {
        let uuid = sniffer.uuid();
        let peer_addr = sniffer.peer_addr();
        let local_addr = sniffer.local_addr();

        let tls = match self.acceptor.accept(sniffer).into_fallible().await {
            Ok(tls) => tls,
            Err((e, sniffer)) => return Err((sniffer, e)),
        };

        let mut clear = SniffStream::with_identity(Box::new(tls), uuid, peer_addr, local_addr);
        let mut buf = vec![0u8; MTU];
        let n = match clear.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                trace!("reading unwrapped stream {}: {}", uuid, e);
                0
            }
        };
        buf.truncate(n);
        Ok((clear, buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    /// Client-side config that skips certificate verification, since the
    /// server identity is self-signed by design.
    fn insecure_client_config() -> rustls::ClientConfig {
        #[derive(Debug)]
        struct NoVerify(rustls::crypto::CryptoProvider);

        impl ServerCertVerifier for NoVerify {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, rustls::Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, rustls::Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                self.0.signature_verification_algorithms.supported_schemes()
            }
        }

        let provider = rustls::crypto::aws_lc_rs::default_provider();
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerify(provider)));
        config
    }

    #[tokio::test]
    async fn unwraps_a_real_client_hello() {
        let identity = TlsIdentity::generate().unwrap();
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let client = tokio::spawn(async move {
            let connector = tokio_rustls::TlsConnector::from(Arc::new(insecure_client_config()));
            let domain = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(domain, client_io).await.unwrap();
            tls.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        // Sniff the handshake record exactly like the connection handler.
        let mut sniffer = SniffStream::new(Box::new(server_io), addr(40000), addr(443));
        let mut buf = vec![0u8; MTU];
        let n = sniffer.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(buf[0], TLS_HANDSHAKE_BYTE);
        sniffer.done_sniffing();

        let (clear, clear_buf) = identity
            .unwrap_tls(sniffer)
            .await
            .map_err(|(_, e)| e)
            .unwrap();
        assert_eq!(&clear_buf, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(clear.peer_addr(), addr(40000));

        drop(clear);
        let _ = client.await;
    }

    #[tokio::test]
    async fn failed_handshake_returns_the_original_stream() {
        let identity = TlsIdentity::generate().unwrap();
        let (client_io, server_io) = tokio::io::duplex(4096);

        // Looks like a handshake record, but the payload is garbage.
        let junk: &[u8] = b"\x16\x03\x01\x00\x05junk-not-tls";
        let mut client_io = client_io;
        client_io.write_all(junk).await.unwrap();
        drop(client_io);

        let mut sniffer = SniffStream::new(Box::new(server_io), addr(40001), addr(443));
        let mut buf = vec![0u8; MTU];
        let n = sniffer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], junk);
        sniffer.done_sniffing();

        let (mut original, _err) = match identity.unwrap_tls(sniffer).await {
            Err(e) => e,
            Ok(_) => panic!("handshake against garbage should fail"),
        };

        // The fallback path replays the untouched ciphertext bytes.
        original.reset();
        let mut replay = vec![0u8; junk.len()];
        original.read_exact(&mut replay).await.unwrap();
        assert_eq!(&replay, junk);
    }
}
