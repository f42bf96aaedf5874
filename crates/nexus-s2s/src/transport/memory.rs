//! In-process duplex transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CertCheck, TlsInfo, TlsRole, Transport, TransportError};
use crate::xml::{InboundEvent, StreamDecoder};

/// One end of an in-memory connection.
///
/// Bytes written on one end are parsed by the other. Security and
/// compression upgrades are simulated: they only reset the parser and
/// report the certificate verdict the pair was built with.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    decoder: StreamDecoder,
    peer_cert: CertCheck,
    tls: bool,
    compressed: bool,
}

impl MemoryTransport {
    /// Two connected ends that both see an untrusted certificate after StartTLS.
    pub fn pair() -> (Self, Self) {
        Self::pair_with_certs(CertCheck::Untrusted, CertCheck::Untrusted)
    }

    /// `left` sees `left_sees` as the peer certificate, `right` sees `right_sees`.
    pub fn pair_with_certs(left_sees: CertCheck, right_sees: CertCheck) -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (Self::new(left_tx, left_rx, left_sees), Self::new(right_tx, right_rx, right_sees))
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>, peer_cert: CertCheck) -> Self {
        Self { tx: Some(tx), rx, decoder: StreamDecoder::new(), peer_cert, tls: false, compressed: false }
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub async fn write_str(&mut self, data: &str) -> Result<(), TransportError> {
        self.write_raw(data.as_bytes()).await
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn read_event(&mut self) -> Result<Option<InboundEvent>, TransportError> {
        loop {
            if let Some(event) = self.decoder.next_event()? {
                return Ok(Some(event));
            }
            match self.rx.recv().await {
                Some(bytes) => self.decoder.feed(&bytes),
                None => return Ok(None),
            }
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(bytes.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn upgrade_tls(&mut self, _role: TlsRole) -> Result<TlsInfo, TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        self.decoder.reset();
        self.tls = true;
        Ok(TlsInfo { cert: self.peer_cert.clone() })
    }

    async fn upgrade_compression(&mut self) -> Result<(), TransportError> {
        if self.tx.is_none() {
            return Err(TransportError::Closed);
        }
        self.decoder.reset();
        self.compressed = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }

    fn force_close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
