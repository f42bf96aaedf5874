//! Federation router: owns the connection pools, spawns one task per
//! physical connection and moves stanzas between them.
//!
//! Each connection is driven by its own task (see `driver`). The router
//! talks to a task only through its [`SessionCommand`] queue; the session
//! state itself never leaves the task.

mod driver;
mod verify;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use nexus_common::Jid;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cid::Cid;
use crate::config::RouterConfig;
use crate::error::{Fault, S2sError};
use crate::key::SecretProvider;
use crate::pipeline::{Pipeline, StageEnv, Verdict};
use crate::pool::{Acquire, ConnectionPool};
use crate::protocol::{self, BounceCondition};
use crate::selector::{ConnectionSelector, HashSelector, Priority, sender_hash};
use crate::session::{Direction, SessionId, StreamSession};
use crate::sink::StanzaSink;
use crate::transport::{Connector, Transport};
use crate::xml::Element;

use driver::SessionDriver;

/// Capacity of the lifecycle event channel.
const EVENT_BUFFER: usize = 1024;

/// Messages a session task accepts from the rest of the router.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write an outbound stanza (outgoing sessions only).
    Send(Element),
    /// Outcome of a dialback verification started by this session.
    Verdict { cid: Cid, verdict: Verdict },
    Close(Fault),
}

/// Lifecycle notifications, mostly for tests and monitoring.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    SessionOpened { session: SessionId, direction: Direction },
    SessionEstablished { session: SessionId, direction: Direction, cid: Cid },
    SessionClosed { session: SessionId, direction: Direction, cid: Option<Cid>, fault: Option<Fault> },
    StanzaBounced { cid: Cid, condition: BounceCondition },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Handed to an established connection.
    Sent,
    /// Waiting for a connection to become ready.
    Queued,
}

/// Point-in-time view of one CID's pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub connections: usize,
    pub ready: usize,
    pub system: Option<SessionId>,
    pub waiting: usize,
    pub incoming: usize,
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// Handle to a running federation router. Cheap to clone.
#[derive(Clone)]
pub struct FederationRouter {
    inner: Arc<RouterInner>,
}

pub(crate) struct RouterInner {
    config: RouterConfig,
    env: StageEnv,
    pipeline: Pipeline,
    selector: Box<dyn ConnectionSelector>,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn StanzaSink>,
    pools: RwLock<HashMap<Cid, ConnectionPool>>,
    events: broadcast::Sender<RouterEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl FederationRouter {
    /// Router with the standard pipeline and hash-based connection selection.
    pub fn new(config: RouterConfig, connector: Arc<dyn Connector>, sink: Arc<dyn StanzaSink>) -> Self {
        RouterBuilder::new(config, connector, sink).build()
    }

    pub fn builder(config: RouterConfig, connector: Arc<dyn Connector>, sink: Arc<dyn StanzaSink>) -> RouterBuilder {
        RouterBuilder::new(config, connector, sink)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.inner.events.subscribe()
    }

    /// Federate `stanza` with normal priority.
    pub async fn send(&self, stanza: Element) -> Result<SendStatus, S2sError> {
        self.inner.route(stanza, Priority::Normal).await
    }

    pub async fn send_with(&self, stanza: Element, priority: Priority) -> Result<SendStatus, S2sError> {
        self.inner.route(stanza, priority).await
    }

    /// Take ownership of a connection opened by a remote server.
    pub fn accept(&self, transport: Box<dyn Transport>) -> Result<SessionId, S2sError> {
        if self.inner.is_shutting_down() {
            return Err(S2sError::ShuttingDown);
        }
        let session = StreamSession::incoming(self.inner.config.auth_timeout);
        let id = session.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = SessionDriver::new(self.inner.clone(), session, transport, tx, rx);
        self.inner.spawn(driver.run());
        Ok(id)
    }

    pub async fn pool_snapshot(&self, cid: &Cid) -> Option<PoolSnapshot> {
        let pools = self.inner.pools.read().await;
        pools.get(cid).map(|pool| PoolSnapshot {
            connections: pool.len(),
            ready: pool.ready().count(),
            system: pool.system_id(),
            waiting: pool.waiting_len(),
            incoming: pool.incoming_count(),
        })
    }

    /// Close every session and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("S2S: router shutting down");
        loop {
            let mut tasks = match self.inner.tasks.lock() {
                Ok(mut guard) => std::mem::take(&mut *guard),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if tasks.is_empty() {
                break;
            }
            while tasks.join_next().await.is_some() {}
        }
        self.inner.pools.write().await.clear();
    }
}

/// Assembles a [`FederationRouter`] with non-default parts.
pub struct RouterBuilder {
    config: RouterConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<dyn StanzaSink>,
    pipeline: Option<Pipeline>,
    selector: Option<Box<dyn ConnectionSelector>>,
    secrets: Option<Arc<dyn SecretProvider>>,
}

impl RouterBuilder {
    fn new(config: RouterConfig, connector: Arc<dyn Connector>, sink: Arc<dyn StanzaSink>) -> Self {
        Self { config, connector, sink, pipeline: None, selector: None, secrets: None }
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn selector(mut self, selector: impl ConnectionSelector + 'static) -> Self {
        self.selector = Some(Box::new(selector));
        self
    }

    pub fn secrets(mut self, secrets: Arc<dyn SecretProvider>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn build(self) -> FederationRouter {
        let secrets = match self.secrets {
            Some(secrets) => secrets,
            None => self.config.secret_provider() as Arc<dyn SecretProvider>,
        };
        let env = self.config.stage_env(secrets);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (shutdown, _) = watch::channel(false);
        let inner = RouterInner {
            env,
            pipeline: self.pipeline.unwrap_or_else(Pipeline::standard),
            selector: self.selector.unwrap_or_else(|| Box::new(HashSelector) as Box<dyn ConnectionSelector>),
            connector: self.connector,
            sink: self.sink,
            pools: RwLock::new(HashMap::new()),
            events,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            config: self.config,
        };
        FederationRouter { inner: Arc::new(inner) }
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

impl RouterInner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, event: RouterEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Run `task` on the router's task set. Finished tasks are reaped on the way.
    fn spawn<F>(&self, task: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task)
    }

    async fn route(self: &Arc<Self>, stanza: Element, priority: Priority) -> Result<SendStatus, S2sError> {
        if self.is_shutting_down() {
            return Err(S2sError::ShuttingDown);
        }
        let from = address(&stanza, "from")?;
        let to = address(&stanza, "to")?;
        if !self.config.hosted.contains(from.domain()) {
            return Err(S2sError::NotLocalHost(from.domain().to_owned()));
        }
        if self.config.hosted.contains(to.domain()) {
            return Err(S2sError::LocalDestination(to.domain().to_owned()));
        }
        let cid = Cid::new(from.domain(), to.domain());
        let sender = from.to_string();

        let mut opened = None;
        let (result, expired) = {
            let mut pools = self.pools.write().await;
            let pool = pools.entry(cid.clone()).or_insert_with(|| {
                ConnectionPool::new(cid.clone(), self.config.max_out_conns, self.config.max_waiting_stanzas)
            });
            let expired = pool.expire_waiting(self.config.max_packet_waiting);
            if pool.acquire_outgoing(sender_hash(&sender)) == Acquire::Open {
                let session = StreamSession::outgoing(cid.clone(), self.config.auth_timeout);
                let (tx, rx) = mpsc::unbounded_channel();
                pool.insert_handshaking(session.id(), tx.clone())?;
                debug!(cid = %cid, session = %session.id(), size = pool.len(), "S2S: growing connection pool");
                opened = Some((session, tx, rx));
            }
            (dispatch(self.selector.as_ref(), pool, stanza, priority), expired)
        };

        if let Some((session, tx, rx)) = opened {
            self.clone().open_outgoing(session, tx, rx);
        }
        for queued in expired {
            self.bounce(&cid, queued.stanza, BounceCondition::RemoteServerTimeout, "Timed out waiting for the remote server")
                .await;
        }
        result
    }

    /// Connect and hand the transport to a fresh driver task.
    fn open_outgoing(
        self: Arc<Self>,
        session: StreamSession,
        tx: mpsc::UnboundedSender<SessionCommand>,
        rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let inner = self.clone();
        self.spawn(async move {
            let Some(cid) = session.cid.clone() else {
                return;
            };
            let mut shutdown = inner.shutdown.subscribe();
            let connected = tokio::select! {
                res = tokio::time::timeout(inner.config.connect_timeout, inner.connector.connect(&cid)) => res,
                _ = shutdown_signal(&mut shutdown) => {
                    inner.session_closed(&session, Some(Fault::shutdown(None, "router shutting down")), Vec::new()).await;
                    return;
                }
            };
            let fault = match connected {
                Ok(Ok(transport)) => {
                    SessionDriver::new(inner, session, transport, tx, rx).run().await;
                    return;
                }
                Ok(Err(e)) => Fault::transport(format!("connect failed: {e}")),
                Err(_) => Fault::transport("connect timed out"),
            };
            warn!(cid = %cid, session = %session.id(), reason = %fault.reason, "S2S: outgoing connection failed");
            let pending = drain_commands(rx).await;
            inner.session_closed(&session, Some(fault), pending).await;
        });
    }

    /// A session finished: update pools, reroute or bounce what it still held.
    async fn session_closed(&self, session: &StreamSession, fault: Option<Fault>, pending: Vec<Element>) {
        let id = session.id();
        let mut bounced = Vec::new();
        {
            let mut pools = self.pools.write().await;
            match session.direction() {
                Direction::Outgoing if session.verify.is_none() => {
                    if let Some(cid) = &session.cid {
                        if let Some(pool) = pools.get_mut(cid) {
                            pool.remove(id);
                            for stanza in pending {
                                if let Err(e) = dispatch(self.selector.as_ref(), pool, stanza.clone(), Priority::Normal) {
                                    debug!(cid = %cid, error = %e, "S2S: could not requeue stanza");
                                    bounced.push((cid.clone(), stanza));
                                }
                            }
                            // Nothing left to carry the queue.
                            if pool.is_empty() {
                                bounced.extend(pool.drain_waiting().into_iter().map(|q| (cid.clone(), q.stanza)));
                            }
                            if pool.is_idle() {
                                pools.remove(cid);
                            }
                        }
                    }
                }
                Direction::Outgoing => {}
                Direction::Incoming => {
                    for cid in session.authenticated() {
                        if let Some(pool) = pools.get_mut(cid) {
                            pool.remove_incoming(id);
                            if pool.is_idle() {
                                pools.remove(cid);
                            }
                        }
                    }
                }
            }
        }
        for (cid, stanza) in bounced {
            self.bounce(&cid, stanza, BounceCondition::RemoteServerNotFound, "Remote server unreachable").await;
        }
        self.emit(RouterEvent::SessionClosed {
            session: id,
            direction: session.direction(),
            cid: session.cid.clone(),
            fault,
        });
    }

    /// An outgoing session authenticated: make it selectable and flush the queue.
    async fn outgoing_ready(&self, cid: &Cid, id: SessionId) {
        let mut pools = self.pools.write().await;
        let Some(pool) = pools.get_mut(cid) else {
            return;
        };
        if !pool.mark_ready(id) {
            return;
        }
        let waiting = pool.drain_waiting();
        if !waiting.is_empty() {
            debug!(cid = %cid, count = waiting.len(), "S2S: flushing waiting stanzas");
        }
        for queued in waiting {
            if let Err(e) = dispatch(self.selector.as_ref(), pool, queued.stanza, queued.priority) {
                warn!(cid = %cid, error = %e, "S2S: dropped waiting stanza");
            }
        }
    }

    /// An incoming session authenticated `cid`. False when over the per-CID cap.
    async fn incoming_ready(&self, cid: &Cid, id: SessionId) -> bool {
        let mut pools = self.pools.write().await;
        let pool = pools.entry(cid.clone()).or_insert_with(|| {
            ConnectionPool::new(cid.clone(), self.config.max_out_conns, self.config.max_waiting_stanzas)
        });
        pool.register_incoming(id, self.config.max_in_conns)
    }

    /// Send an error reply for `stanza` back to its local sender.
    async fn bounce(&self, cid: &Cid, stanza: Element, condition: BounceCondition, text: &str) {
        let Some(reply) = protocol::bounce(&stanza, condition, text) else {
            return;
        };
        debug!(cid = %cid, condition = %condition, "S2S: bouncing stanza");
        if let Err(e) = self.sink.deliver(reply).await {
            warn!(cid = %cid, error = %e, "S2S: could not deliver bounce");
        }
        self.emit(RouterEvent::StanzaBounced { cid: cid.clone(), condition });
    }
}

/// Hand `stanza` to a ready connection, or queue it.
///
/// A sender stays on the connection it was pinned to while the pool grows,
/// so adding connections never reorders what it already sent.
fn dispatch(
    selector: &dyn ConnectionSelector,
    pool: &mut ConnectionPool,
    stanza: Element,
    priority: Priority,
) -> Result<SendStatus, S2sError> {
    let sender = sender_of(&stanza);
    let hash = sender_hash(&sender);
    let pinned = match priority {
        Priority::Normal => pool.pinned(hash),
        Priority::System => None,
    };
    let target = pinned.or_else(|| selector.select(pool, &sender, priority)).map(|c| (c.id, c.commands.clone()));
    let stanza = match target {
        Some((id, commands)) => match commands.send(SessionCommand::Send(stanza)) {
            Ok(()) => {
                if priority == Priority::Normal {
                    pool.pin(hash, id);
                }
                return Ok(SendStatus::Sent);
            }
            // The task is exiting; it will be removed from the pool shortly.
            Err(mpsc::error::SendError(SessionCommand::Send(stanza))) => stanza,
            Err(_) => return Err(S2sError::NoConnection(pool.cid().clone())),
        },
        None => stanza,
    };
    pool.enqueue(stanza, priority)?;
    Ok(SendStatus::Queued)
}

/// Normalized sender identity used for connection selection.
fn sender_of(stanza: &Element) -> String {
    let from = stanza.attr("from").unwrap_or_default();
    from.parse::<Jid>().map_or_else(|_| from.to_owned(), |jid| jid.to_string())
}

fn address(stanza: &Element, attr: &str) -> Result<Jid, S2sError> {
    let value = stanza
        .attr(attr)
        .ok_or_else(|| S2sError::InvalidAddress(format!("missing '{attr}' on <{}/>", stanza.name())))?;
    Ok(value.parse()?)
}

async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    // An error means the router is gone, which is a shutdown too.
    let _ = rx.wait_for(|down| *down).await;
}

/// Stanzas left in a command queue that will never be read.
async fn drain_commands(mut rx: mpsc::UnboundedReceiver<SessionCommand>) -> Vec<Element> {
    rx.close();
    let mut pending = Vec::new();
    while let Some(cmd) = rx.recv().await {
        if let SessionCommand::Send(stanza) = cmd {
            pending.push(stanza);
        }
    }
    pending
}
