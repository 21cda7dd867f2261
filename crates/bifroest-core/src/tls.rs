//! TLS 1.3 layer under the handshake.
//!
//! Every connection is wrapped in TLS before any protocol byte is exchanged.
//! Both ends use a throwaway self-signed certificate. The peer's identity is
//! established afterwards by the SSH-key handshake, which signs the TLS
//! exporter value ([`ChannelBinding`]) so that a signature only verifies on
//! the very TLS session it was made on. A man in the middle terminating two
//! TLS sessions ends up with two different bindings and fails authentication.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::{ImpError, ImpResult};
use crate::transport::Transport;

/// Name carried in the certificate and in SNI. Never verified.
pub const SERVER_NAME: &str = "bifroest-imp";

const EXPORTER_LABEL: &[u8] = b"EXPORTER-bifroest-imp-v1";

/// Keying material exported from an established TLS session.
pub type ChannelBinding = [u8; 32];

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str, e: impl std::fmt::Display) -> ImpError {
    ImpError::Protocol(format!("{context}: {e}"))
}

/// Generate a self-signed certificate for one side of one connection.
fn ephemeral_certificate() -> ImpResult<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let key_pair = rcgen::KeyPair::generate().map_err(|e| tls_error("cannot generate tls key", e))?;
    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .map_err(|e| tls_error("invalid certificate parameters", e))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, SERVER_NAME);
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| tls_error("cannot create certificate", e))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((cert.der().clone(), key))
}

/// Client side: wrap `transport` and return the encrypted transport plus
/// its channel binding.
pub async fn connect(transport: Transport) -> ImpResult<(Transport, ChannelBinding)> {
    let provider = provider();
    let verifier = Arc::new(AnyCertificate(provider.signature_verification_algorithms));
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("tls client config", e))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();

    let name = ServerName::try_from(SERVER_NAME.to_string())
        .map_err(|e| tls_error("invalid server name", e))?;
    let (local, remote) = (transport.local().to_string(), transport.remote().to_string());
    let stream = TlsConnector::from(Arc::new(config))
        .connect(name, transport)
        .await?;
    let binding = stream
        .get_ref()
        .1
        .export_keying_material([0u8; 32], EXPORTER_LABEL, None)
        .map_err(|e| tls_error("cannot export keying material", e))?;
    Ok((Transport::new(TlsStream::Client(stream), local, remote), binding))
}

/// Server side counterpart of [`connect`].
pub async fn accept(transport: Transport) -> ImpResult<(Transport, ChannelBinding)> {
    let (cert, key) = ephemeral_certificate()?;
    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("tls server config", e))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| tls_error("tls server certificate", e))?;

    let (local, remote) = (transport.local().to_string(), transport.remote().to_string());
    let stream = TlsAcceptor::from(Arc::new(config)).accept(transport).await?;
    let binding = stream
        .get_ref()
        .1
        .export_keying_material([0u8; 32], EXPORTER_LABEL, None)
        .map_err(|e| tls_error("cannot export keying material", e))?;
    Ok((Transport::new(TlsStream::Server(stream), local, remote), binding))
}

/// Accepts any certificate but still checks that the peer owns it.
///
/// Trust comes from the SSH-key signatures over the channel binding.
#[derive(Debug)]
struct AnyCertificate(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AnyCertificate {
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
        Err(rustls::Error::General("tls 1.2 is not offered".into()))
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn both_ends_share_a_binding() {
        let (a, b) = Transport::in_memory_pair(64 * 1024);
        let (client, server) = tokio::join!(connect(a), accept(b));
        let (mut client, client_binding) = client.unwrap();
        let (mut server, server_binding) = server.unwrap();
        assert_eq!(client_binding, server_binding);
        assert_eq!(client.remote(), "memory:b");

        client.write_all(b"over tls").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"over tls");
    }

    #[tokio::test]
    async fn sessions_have_distinct_bindings() {
        let (a, b) = Transport::in_memory_pair(64 * 1024);
        let (first, _) = tokio::join!(connect(a), accept(b));
        let (c, d) = Transport::in_memory_pair(64 * 1024);
        let (second, _) = tokio::join!(connect(c), accept(d));
        assert_ne!(first.unwrap().1, second.unwrap().1);
    }

    #[tokio::test]
    async fn plaintext_never_reaches_the_wire() {
        let (a, mut wire) = tokio::io::duplex(64 * 1024);
        let (b, server_side) = Transport::in_memory_pair(64 * 1024);
        // Relay between `a` and the server while recording what the client sent.
        let client = Transport::new(a, "memory:client", "memory:relay");
        let relay = tokio::spawn(async move {
            let (mut server_r, mut server_w) = tokio::io::split(b);
            let (mut wire_r, mut wire_w) = tokio::io::split(&mut wire);
            let mut seen = Vec::new();
            let up = async {
                let mut buf = [0u8; 4096];
                loop {
                    let n = wire_r.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    seen.extend_from_slice(&buf[..n]);
                    if server_w.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                let _ = server_w.shutdown().await;
            };
            let down = async {
                let _ = tokio::io::copy(&mut server_r, &mut wire_w).await;
            };
            tokio::join!(up, down);
            seen
        });

        let (client, server) = tokio::join!(connect(client), accept(server_side));
        let (mut client, _) = client.unwrap();
        let (mut server, _) = server.unwrap();
        client.write_all(b"thanks for: secret").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 18];
        server.read_exact(&mut buf).await.unwrap();
        drop(client);
        drop(server);

        let seen = relay.await.unwrap();
        assert!(!seen.windows(6).any(|w| w == b"secret"));
    }
}
