//! Byte-stream seam between the federation core and the network.
//!
//! Sockets, DNS/SRV resolution and the TLS handshake live behind
//! [`Transport`] and [`Connector`]. The core only sees parsed stream events
//! and writes serialized XML.

mod memory;

pub use memory::MemoryTransport;

use async_trait::async_trait;

use crate::cid::Cid;
use crate::xml::{DecodeError, InboundEvent};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error(transparent)]
    Malformed(#[from] DecodeError),

    #[error("Remote server unreachable: {0}")]
    Unreachable(String),

    #[error("TLS negotiation failed: {0}")]
    Tls(String),
}

/// Which side of the TLS handshake we play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Verdict on the peer certificate after a TLS upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertCheck {
    /// Chain validated; the certificate is valid for these domain names.
    Trusted(Vec<String>),
    /// Self-signed or unknown issuer. Encryption only, identity unproven.
    Untrusted,
    /// Expired, revoked or otherwise broken.
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub cert: CertCheck,
}

impl TlsInfo {
    pub fn is_trusted(&self) -> bool {
        matches!(self.cert, CertCheck::Trusted(_))
    }

    /// True when the certificate is trusted and names `domain` (`*.` wildcards match one label).
    pub fn trusts(&self, domain: &str) -> bool {
        let CertCheck::Trusted(names) = &self.cert else {
            return false;
        };
        let domain = domain.to_lowercase();
        names.iter().any(|name| {
            let name = name.to_lowercase();
            match name.strip_prefix("*.") {
                Some(suffix) => domain
                    .split_once('.')
                    .is_some_and(|(_, rest)| rest == suffix),
                None => name == domain,
            }
        })
    }
}

/// One physical federation connection.
///
/// `read_event` must be cancel-safe: the session driver polls it inside
/// `tokio::select!` alongside its command queue and timers.
#[async_trait]
pub trait Transport: Send {
    /// Next parsed stream event, or `Ok(None)` at end of stream.
    async fn read_event(&mut self) -> Result<Option<InboundEvent>, TransportError>;

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Run the TLS handshake in place; the parser expects a fresh stream afterwards.
    async fn upgrade_tls(&mut self, role: TlsRole) -> Result<TlsInfo, TransportError>;

    /// Switch to zlib; the parser expects a fresh stream afterwards.
    async fn upgrade_compression(&mut self) -> Result<(), TransportError>;

    /// Graceful close after pending writes.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Drop the connection without flushing anything.
    fn force_close(&mut self);
}

/// Opens outbound transports for a CID.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cid: &Cid) -> Result<Box<dyn Transport>, TransportError>;
}
