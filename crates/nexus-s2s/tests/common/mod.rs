// ============================================================================
// Test utilities for federation integration tests
// ============================================================================
//
// Wires several routers together through an in-process network built on
// MemoryTransport. Routes can be black-holed (the dial succeeds, nothing is
// ever answered) and domains can present trusted certificates.
//
// ============================================================================

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nexus_s2s::protocol::NS_SERVER;
use nexus_s2s::transport::{CertCheck, Connector, MemoryTransport, TlsInfo, TlsRole, Transport, TransportError};
use nexus_s2s::xml::InboundEvent;
use nexus_s2s::{ChannelSink, Cid, Element, FederationRouter, RouterConfig, RouterEvent};
use tokio::sync::{broadcast, mpsc};

/// Generous upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct MemoryNetwork {
    routers: Mutex<HashMap<String, FederationRouter>>,
    black_holes: Mutex<HashSet<(String, String)>>,
    trusted: Mutex<HashSet<String>>,
    /// Far ends of black-holed connections, kept open so the dialer never sees EOF.
    parked: Mutex<Vec<MemoryTransport>>,
    dials: Mutex<HashMap<(String, String), usize>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Dials from `from` to `to` connect but are never answered.
    pub fn black_hole(&self, from: &str, to: &str) {
        self.black_holes.lock().unwrap().insert((from.to_owned(), to.to_owned()));
    }

    /// `domain` presents a certificate that validates for its name.
    pub fn trust(&self, domain: &str) {
        self.trusted.lock().unwrap().insert(domain.to_owned());
    }

    pub fn dials(&self, from: &str, to: &str) -> usize {
        self.dials.lock().unwrap().get(&(from.to_owned(), to.to_owned())).copied().unwrap_or(0)
    }

    fn cert_of(&self, domain: &str) -> CertCheck {
        if self.trusted.lock().unwrap().contains(domain) {
            CertCheck::Trusted(vec![domain.to_owned()])
        } else {
            CertCheck::Untrusted
        }
    }

    /// Build a router for `config`, attach it to the network under every
    /// hosted domain and collect what it delivers locally.
    pub fn node(self: &Arc<Self>, config: RouterConfig) -> Node {
        let (sink, delivered) = ChannelSink::new();
        let domains: Vec<String> = config.hosted.iter().map(str::to_owned).collect();
        let router = FederationRouter::new(config, Arc::new(NetworkConnector { net: self.clone() }), Arc::new(sink));
        let events = router.subscribe();
        let mut routers = self.routers.lock().unwrap();
        for domain in domains {
            routers.insert(domain, router.clone());
        }
        Node { router, delivered, events }
    }
}

struct NetworkConnector {
    net: Arc<MemoryNetwork>,
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, cid: &Cid) -> Result<Box<dyn Transport>, TransportError> {
        let route = (cid.local().to_owned(), cid.remote().to_owned());
        *self.net.dials.lock().unwrap().entry(route.clone()).or_default() += 1;

        let (near, far) = MemoryTransport::pair_with_certs(self.net.cert_of(cid.remote()), self.net.cert_of(cid.local()));
        if self.net.black_holes.lock().unwrap().contains(&route) {
            self.net.parked.lock().unwrap().push(far);
            return Ok(Box::new(near));
        }
        let remote = self.net.routers.lock().unwrap().get(cid.remote()).cloned();
        let Some(remote) = remote else {
            return Err(TransportError::Unreachable(cid.remote().to_owned()));
        };
        remote.accept(Box::new(far)).map_err(|e| TransportError::Unreachable(e.to_string()))?;
        Ok(Box::new(near))
    }
}

pub struct Node {
    pub router: FederationRouter,
    pub delivered: mpsc::UnboundedReceiver<Element>,
    pub events: broadcast::Receiver<RouterEvent>,
}

impl Node {
    /// Next stanza handed to the local sink.
    pub async fn next_delivered(&mut self) -> Element {
        tokio::time::timeout(WAIT, self.delivered.recv())
            .await
            .expect("timed out waiting for a delivery")
            .expect("sink closed")
    }

    /// Skip events until one matches `pred`.
    pub async fn wait_event(&mut self, mut pred: impl FnMut(&RouterEvent) -> bool) -> RouterEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("router dropped"),
                }
            }
        })
        .await
        .expect("timed out waiting for a router event")
    }

    /// Poll the pool for `cid` until `pred` holds.
    pub async fn wait_pool(&self, cid: &Cid, mut pred: impl FnMut(&nexus_s2s::PoolSnapshot) -> bool) {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(snapshot) = self.router.pool_snapshot(cid).await {
                    if pred(&snapshot) {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for pool state")
    }
}

/// Wraps a transport whose TLS handshake never finishes.
pub struct StalledTls(pub MemoryTransport);

#[async_trait]
impl Transport for StalledTls {
    async fn read_event(&mut self) -> Result<Option<InboundEvent>, TransportError> {
        self.0.read_event().await
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.0.write_raw(bytes).await
    }

    async fn upgrade_tls(&mut self, _role: TlsRole) -> Result<TlsInfo, TransportError> {
        std::future::pending().await
    }

    async fn upgrade_compression(&mut self) -> Result<(), TransportError> {
        self.0.upgrade_compression().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0.close().await
    }

    fn force_close(&mut self) {
        self.0.force_close();
    }
}

pub fn config(domain: &str) -> RouterConfig {
    RouterConfig::new([domain])
}

pub fn message(from: &str, to: &str, body: &str) -> Element {
    Element::new("message", NS_SERVER)
        .with_attr("from", from)
        .with_attr("to", to)
        .with_attr("type", "chat")
        .with_child(Element::new("body", NS_SERVER).with_text(body))
}

pub fn body(stanza: &Element) -> String {
    stanza.get_child("body", NS_SERVER).map(Element::text).unwrap_or_default()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("nexus_s2s=debug").try_init();
}
