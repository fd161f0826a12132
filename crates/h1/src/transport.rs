//! What the connection knows about the byte stream it runs on.
//!
//! TLS is terminated outside this crate. A TLS acceptor hands over the decrypted stream together
//! with a [`SecureTransportInfo`] and, when it supports delayed client certificates, a
//! [`Renegotiate`] hook.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::BoxError;

/// Negotiated parameters of a TLS session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureTransportInfo {
    /// e.g. `TLSv1.3`
    pub protocol: String,
    pub cipher: String,
    /// DER encoded client certificate, when the client sent one during the handshake
    pub peer_certificate: Option<Bytes>,
}

/// Asks the TLS layer for a client certificate after the handshake.
#[async_trait]
pub trait Renegotiate: Send + Sync {
    async fn request_client_certificate(&self) -> Result<Option<Bytes>, BoxError>;
}

#[derive(Clone, Default)]
pub struct TransportInfo {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub secure: Option<SecureTransportInfo>,
    pub renegotiate: Option<Arc<dyn Renegotiate>>,
}

impl TransportInfo {
    pub fn new(local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
        Self { local_addr, remote_addr, secure: None, renegotiate: None }
    }

    pub fn with_secure(mut self, secure: SecureTransportInfo) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn with_renegotiate(mut self, renegotiate: Arc<dyn Renegotiate>) -> Self {
        self.renegotiate = Some(renegotiate);
        self
    }

    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }
}

impl fmt::Debug for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportInfo")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("secure", &self.secure)
            .field("renegotiate", &self.renegotiate.is_some())
            .finish()
    }
}
