//! Mutual TLS for the hook listener.
//!
//! Client certificates are verified against the client CA. A connection that
//! presents one carries its SPIFFE id as [`HookPeer`]; a connection without
//! one is still accepted so that a fresh container can reach the CSR
//! endpoint, and the hook handler refuses it.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use raind::pki::{PkiIssuer, SpiffeId};
use raind_common::{RaindError, RaindResult};
use rcgen::{CertificateParams, SanType};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// Time a client gets to finish the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

const BACKLOG: usize = 64;

/// Peer of a hook listener connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPeer {
    /// Remote address.
    pub addr: SocketAddr,
    /// Identity from a verified client certificate.
    pub spiffe_id: Option<SpiffeId>,
}

impl HookPeer {
    /// A peer that presented no certificate.
    #[must_use]
    pub const fn anonymous(addr: SocketAddr) -> Self {
        Self {
            addr,
            spiffe_id: None,
        }
    }

    /// A peer authenticated as `spiffe_id`.
    #[must_use]
    pub const fn authenticated(addr: SocketAddr, spiffe_id: SpiffeId) -> Self {
        Self {
            addr,
            spiffe_id: Some(spiffe_id),
        }
    }
}

impl Connected<IncomingStream<'_, HookListener>> for HookPeer {
    fn connect_info(stream: IncomingStream<'_, HookListener>) -> Self {
        stream.remote_addr().clone()
    }
}

fn tls_error(context: &str, err: &impl fmt::Display) -> RaindError {
    RaindError::Pki {
        message: format!("{context}: {err}"),
    }
}

/// Names the listener certificate is issued for.
fn listen_hosts(listen: SocketAddr) -> Vec<String> {
    let mut hosts = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let ip = listen.ip().to_string();
    if !hosts.contains(&ip) {
        hosts.push(ip);
    }
    hosts
}

fn parse_certificates(pem: &[u8]) -> RaindResult<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error("parse certificates", &e))
}

/// Server configuration for `listen`: a fresh certificate from the client
/// CA, and client certificates verified against the same CA.
///
/// # Errors
///
/// Returns [`RaindError::Pki`] when the CA or the issued certificate cannot
/// be loaded into rustls.
pub fn server_config(pki: &PkiIssuer, listen: SocketAddr) -> RaindResult<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(pki.ca_pem().as_bytes())? {
        roots
            .add(cert)
            .map_err(|e| tls_error("add client CA", &e))?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .allow_unauthenticated()
        .build()
        .map_err(|e| tls_error("client verifier", &e))?;

    let (cert_pem, key_pem) = pki.server_identity(listen_hosts(listen))?;
    let certs = parse_certificates(cert_pem.as_bytes())?;
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| tls_error("parse server key", &e))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("protocol versions", &e))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("server config", &e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// SPIFFE id in the URI SAN of a verified client certificate.
///
/// # Errors
///
/// Returns a validation error for certificates without a container SPIFFE
/// URI.
pub fn spiffe_id_of(cert: &CertificateDer<'_>) -> RaindResult<SpiffeId> {
    let params = CertificateParams::from_ca_cert_der(cert)
        .map_err(|e| RaindError::validation("client certificate", e.to_string()))?;
    let uri = params
        .subject_alt_names
        .iter()
        .find_map(|san| match san {
            SanType::URI(uri) => Some(uri.as_str().to_string()),
            _ => None,
        })
        .ok_or_else(|| RaindError::validation("client certificate", "no URI SAN"))?;
    SpiffeId::parse(&uri)
}

fn peer_identity(stream: &TlsStream<TcpStream>, addr: SocketAddr) -> HookPeer {
    let (_, connection) = stream.get_ref();
    let Some(cert) = connection.peer_certificates().and_then(<[_]>::first) else {
        return HookPeer::anonymous(addr);
    };
    match spiffe_id_of(cert) {
        Ok(spiffe_id) => HookPeer::authenticated(addr, spiffe_id),
        Err(err) => {
            tracing::warn!(peer = %addr, error = %err, "Client certificate carries no usable identity");
            HookPeer::anonymous(addr)
        }
    }
}

/// TLS listener for [`axum::serve`]. Handshakes run off the accept path so a
/// slow client cannot hold up others.
pub struct HookListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, HookPeer)>,
    local_addr: SocketAddr,
}

impl HookListener {
    /// Accept TLS connections on `listener`.
    ///
    /// # Errors
    ///
    /// Returns the error reading the bound address.
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(BACKLOG);
        tokio::spawn(accept_loop(listener, TlsAcceptor::from(config), tx));
        Ok(Self {
            incoming,
            local_addr,
        })
    }

    /// Bound address.
    #[must_use]
    pub const fn bound_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, HookPeer)>,
) {
    loop {
        let accepted = tokio::select! {
            () = tx.closed() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "Hook listener accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => {
                    let peer = peer_identity(&stream, addr);
                    let _ = tx.send((stream, peer)).await;
                }
                Ok(Err(err)) => tracing::debug!(peer = %addr, error = %err, "TLS handshake failed"),
                Err(_) => tracing::debug!(peer = %addr, "TLS handshake timed out"),
            }
        });
    }
    tracing::debug!("Hook listener stopped accepting");
}

impl Listener for HookListener {
    type Io = TlsStream<TcpStream>;
    type Addr = HookPeer;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(HookPeer::anonymous(self.local_addr))
    }
}
