//! Task that owns one physical connection.
//!
//! Reads transport events, runs them through the pipeline and executes the
//! resulting actions. Everything the rest of the router wants from the
//! session arrives as a [`SessionCommand`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use super::{RouterEvent, RouterInner, SessionCommand, drain_commands};
use crate::error::{Fault, FaultKind};
use crate::pipeline::{Action, CloseReason, Outcome, Pipeline, StageContext, apply_verdict};
use crate::protocol::{self, STREAM_CLOSE, StreamErrorCondition, StreamHeader};
use crate::session::{AuthMechanism, SessionState, StreamSession};
use crate::transport::{TlsRole, Transport, TransportError};
use crate::xml::{DecodeError, Element};

/// Upper bound on the goodbye write before the socket is dropped anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct SessionDriver {
    inner: Arc<RouterInner>,
    session: StreamSession,
    transport: Box<dyn Transport>,
    /// Handed to verification tasks so their verdict comes back here.
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    /// Set on verification-only sessions.
    verdict: Option<oneshot::Sender<bool>>,
    verifications: Vec<AbortHandle>,
    /// Stanzas taken off the queue but never written.
    unsent: Vec<Element>,
    shutdown: watch::Receiver<bool>,
}

impl SessionDriver {
    pub(crate) fn new(
        inner: Arc<RouterInner>,
        session: StreamSession,
        transport: Box<dyn Transport>,
        commands_tx: mpsc::UnboundedSender<SessionCommand>,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        let shutdown = inner.shutdown.subscribe();
        Self {
            inner,
            session,
            transport,
            commands_tx,
            commands,
            verdict: None,
            verifications: Vec::new(),
            unsent: Vec::new(),
            shutdown,
        }
    }

    pub(crate) fn with_verdict(mut self, tx: oneshot::Sender<bool>) -> Self {
        self.verdict = Some(tx);
        self
    }

    pub(crate) async fn run(mut self) {
        info!(
            session = %self.session.id(),
            direction = ?self.session.direction(),
            cid = %self.cid_label(),
            "S2S: session opened"
        );
        self.inner.emit(RouterEvent::SessionOpened { session: self.session.id(), direction: self.session.direction() });
        let reason = self.drive().await;
        self.finish(reason).await;
    }

    fn cid_label(&self) -> String {
        self.session.cid.as_ref().map_or_else(|| "-".to_owned(), ToString::to_string)
    }

    // ─── Event loop ──────────────────────────────────────────────────────────

    async fn drive(&mut self) -> CloseReason {
        if *self.shutdown.borrow() {
            return shutdown_reason();
        }
        if let Some(reason) = self.step(|pipeline, session, ctx| pipeline.connected(session, ctx)).await {
            return reason;
        }
        let max_idle = self.inner.config.max_inactivity;
        loop {
            let deadline = self.session.deadline();
            let idle_at = Instant::now() + max_idle.saturating_sub(self.session.idle_for());
            tokio::select! {
                event = self.transport.read_event() => {
                    let reason = match event {
                        Ok(Some(event)) => {
                            self.session.touch();
                            self.step(|pipeline, session, ctx| pipeline.handle(session, &event, ctx)).await
                        }
                        Ok(None) => Some(CloseReason::Fault(Fault::transport("connection closed by peer"))),
                        Err(e) => Some(CloseReason::Fault(read_fault(e))),
                    };
                    if let Some(reason) = reason {
                        return reason;
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    if let Some(reason) = self.on_command(cmd).await {
                        return reason;
                    }
                }
                _ = sleep_until(deadline.unwrap_or(idle_at)), if deadline.is_some() => {
                    return CloseReason::Fault(self.auth_timeout());
                }
                _ = sleep_until(idle_at) => {
                    if self.session.idle_for() >= max_idle {
                        return CloseReason::Fault(Fault::shutdown(None, "idle timeout"));
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return shutdown_reason();
                    }
                }
            }
        }
    }

    /// Run one pipeline hook and execute what it asked for.
    async fn step<F>(&mut self, hook: F) -> Option<CloseReason>
    where
        F: FnOnce(&Pipeline, &mut StreamSession, &mut StageContext<'_>) -> Result<Outcome, Fault>,
    {
        let inner = self.inner.clone();
        let actions = collect(&inner, |ctx| hook(&inner.pipeline, &mut self.session, ctx));
        self.execute(actions).await
    }

    async fn on_command(&mut self, cmd: SessionCommand) -> Option<CloseReason> {
        match cmd {
            SessionCommand::Send(stanza) => {
                let (until, on_elapsed) = self.action_bound();
                let shutdown = self.shutdown.clone();
                if let Err(reason) = bounded(self.write(&stanza.to_xml()), until, on_elapsed, shutdown).await {
                    self.unsent.push(stanza);
                    return Some(reason);
                }
                self.session.touch();
                None
            }
            SessionCommand::Verdict { cid, verdict } => {
                debug!(session = %self.session.id(), cid = %cid, verdict = ?verdict, "S2S: dialback verdict");
                let inner = self.inner.clone();
                let actions = collect(&inner, |ctx| {
                    apply_verdict(&mut self.session, &cid, verdict, ctx).map(|()| Outcome::Handled)
                });
                self.execute(actions).await
            }
            SessionCommand::Close(fault) => Some(CloseReason::Fault(fault)),
        }
    }

    // ─── Actions ─────────────────────────────────────────────────────────────

    /// Execute actions in order. Follow-up actions run before the rest.
    async fn execute(&mut self, actions: Vec<Action>) -> Option<CloseReason> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            let (until, on_elapsed) = self.action_bound();
            let shutdown = self.shutdown.clone();
            match bounded(self.perform(action), until, on_elapsed, shutdown).await {
                Ok(followups) => {
                    for action in followups.into_iter().rev() {
                        queue.push_front(action);
                    }
                }
                Err(reason) => return Some(reason),
            }
        }
        None
    }

    async fn perform(&mut self, action: Action) -> Result<Vec<Action>, CloseReason> {
        match action {
            Action::SendHeader(header) => self.write(&header.to_xml()).await?,
            Action::Send(element) => self.write(&element.to_xml()).await?,
            Action::AdvertiseFeatures => {
                let features = self.inner.pipeline.advertised_features(&self.session, &self.inner.env);
                self.write(&protocol::features(features).to_xml()).await?;
            }
            Action::UpgradeTls => {
                let role = if self.session.is_incoming() { TlsRole::Server } else { TlsRole::Client };
                let info = self.transport.upgrade_tls(role).await.map_err(|e| {
                    CloseReason::Fault(Fault::new(FaultKind::Security, None, format!("TLS handshake failed: {e}")))
                })?;
                debug!(session = %self.session.id(), trusted = info.is_trusted(), "S2S: TLS established");
                self.session.tls = Some(info);
                if self.session.state() == SessionState::Authenticating(AuthMechanism::Tls) {
                    self.session.transition(SessionState::AwaitingFeatures).map_err(CloseReason::Fault)?;
                }
            }
            Action::UpgradeCompression => {
                self.transport
                    .upgrade_compression()
                    .await
                    .map_err(|e| CloseReason::Fault(Fault::transport(format!("compression failed: {e}"))))?;
                debug!(session = %self.session.id(), "S2S: stream compression enabled");
                self.session.compressed = true;
            }
            Action::RestartStream => {
                self.session.restart_stream();
                if !self.session.is_incoming() {
                    let inner = self.inner.clone();
                    return Ok(collect(&inner, |ctx| inner.pipeline.connected(&mut self.session, ctx)));
                }
            }
            Action::ReprocessFeatures => {
                if let Some(features) = self.session.peer_features.clone() {
                    let inner = self.inner.clone();
                    return Ok(collect(&inner, |ctx| {
                        inner.pipeline.stream_features(&mut self.session, &features, ctx)
                    }));
                }
            }
            Action::Authenticated(cid) => {
                let id = self.session.id();
                if self.session.is_incoming() {
                    if !self.inner.incoming_ready(&cid, id).await {
                        return Err(CloseReason::Fault(Fault::new(
                            FaultKind::ResourceExhausted,
                            Some(StreamErrorCondition::ResourceConstraint),
                            format!("too many incoming sessions for {cid}"),
                        )));
                    }
                } else if self.session.verify.is_none() {
                    self.inner.outgoing_ready(&cid, id).await;
                }
                info!(session = %id, cid = %cid, direction = ?self.session.direction(), "S2S: session established");
                self.inner.emit(RouterEvent::SessionEstablished { session: id, direction: self.session.direction(), cid });
            }
            Action::Verify { cid, stream_id, key } => {
                if self.inner.is_shutting_down() {
                    return Err(shutdown_reason());
                }
                self.verifications.retain(|h| !h.is_finished());
                let handle = self.inner.clone().spawn_verification(self.commands_tx.clone(), cid, stream_id, key);
                self.verifications.push(handle);
            }
            Action::VerifyVerdict { valid } => {
                if let Some(tx) = self.verdict.take() {
                    // The waiting task may already have timed out.
                    let _ = tx.send(valid);
                }
            }
            Action::Deliver(stanza) => {
                if let Err(e) = self.inner.sink.deliver(stanza).await {
                    warn!(session = %self.session.id(), error = %e, "S2S: local delivery failed");
                }
            }
            Action::Close(reason) => return Err(reason),
        }
        Ok(Vec::new())
    }

    /// Latest instant a single action may still be running: the auth deadline
    /// while authenticating, the inactivity limit otherwise.
    fn action_bound(&self) -> (Instant, Fault) {
        match self.session.deadline() {
            Some(deadline) => (deadline, self.auth_timeout()),
            None => (Instant::now() + self.inner.config.max_inactivity, Fault::transport("connection stalled")),
        }
    }

    fn auth_timeout(&self) -> Fault {
        Fault::new(
            FaultKind::Timeout,
            Some(StreamErrorCondition::ConnectionTimeout),
            format!("not authenticated within {:?}", self.inner.config.auth_timeout),
        )
    }

    async fn write(&mut self, xml: &str) -> Result<(), CloseReason> {
        self.transport
            .write_raw(xml.as_bytes())
            .await
            .map_err(|e| CloseReason::Fault(Fault::transport(format!("write failed: {e}"))))
    }

    // ─── Teardown ────────────────────────────────────────────────────────────

    async fn finish(mut self, reason: CloseReason) {
        for handle in self.verifications.drain(..) {
            handle.abort();
        }
        // Only fails when already closing.
        let _ = self.session.transition(SessionState::Closing);

        let fault = match reason {
            CloseReason::Fault(fault) => Some(fault),
            CloseReason::PeerClosed | CloseReason::Finished => None,
        };
        match &fault {
            Some(f) if !f.kind.flushes_error() => self.transport.force_close(),
            _ => self.close_gracefully(fault.as_ref().and_then(|f| f.condition)).await,
        }
        let _ = self.session.transition(SessionState::Closed);

        match &fault {
            Some(f) => warn!(
                session = %self.session.id(),
                cid = %self.cid_label(),
                kind = ?f.kind,
                condition = ?f.condition,
                reason = %f.reason,
                "S2S: session closed with fault"
            ),
            None => info!(session = %self.session.id(), cid = %self.cid_label(), "S2S: session closed"),
        }

        let SessionDriver { inner, session, commands, mut unsent, verdict, .. } = self;
        drop(verdict);
        unsent.extend(drain_commands(commands).await);
        inner.session_closed(&session, fault, unsent).await;
    }

    /// Best-effort `<stream:error/>` and `</stream:stream>`, then close.
    async fn close_gracefully(&mut self, condition: Option<StreamErrorCondition>) {
        let mut out = String::new();
        if let Some(condition) = condition {
            // Errors must travel inside a stream, even on one we never answered.
            if self.session.is_incoming() && !self.session.header_sent {
                out.push_str(&self.error_header().to_xml());
            }
            out.push_str(&condition.to_element().to_xml());
        }
        out.push_str(STREAM_CLOSE);

        let flushed = tokio::time::timeout(CLOSE_GRACE, async {
            self.transport.write_raw(out.as_bytes()).await?;
            self.transport.close().await
        })
        .await;
        if !matches!(flushed, Ok(Ok(()))) {
            debug!(session = %self.session.id(), "S2S: closing flush failed");
            self.transport.force_close();
        }
    }

    fn error_header(&self) -> StreamHeader {
        let env = &self.inner.env;
        let peer = self.session.peer_header.as_ref();
        let local = peer
            .and_then(|h| h.to.as_deref())
            .map(str::to_lowercase)
            .filter(|to| env.hosted.contains(to))
            .unwrap_or_else(|| env.default_domain.clone());
        StreamHeader::ours(Some(&local), peer.and_then(|h| h.from.as_deref()), None, true)
    }
}

/// Run `hook` with a fresh context. A fault becomes a trailing `Close`.
fn collect<F>(inner: &RouterInner, hook: F) -> Vec<Action>
where
    F: FnOnce(&mut StageContext<'_>) -> Result<Outcome, Fault>,
{
    let mut ctx = StageContext::new(&inner.env);
    let result = hook(&mut ctx);
    let mut actions = ctx.into_actions();
    if let Err(fault) = result {
        actions.push(Action::Close(CloseReason::Fault(fault)));
    }
    actions
}

/// Run `work` unless the deadline passes or the router starts shutting down first.
async fn bounded<T>(
    work: impl Future<Output = Result<T, CloseReason>>,
    until: Instant,
    on_elapsed: Fault,
    mut shutdown: watch::Receiver<bool>,
) -> Result<T, CloseReason> {
    tokio::select! {
        result = work => result,
        _ = sleep_until(until) => Err(CloseReason::Fault(on_elapsed)),
        _ = super::shutdown_signal(&mut shutdown) => Err(shutdown_reason()),
    }
}

fn shutdown_reason() -> CloseReason {
    CloseReason::Fault(Fault::shutdown(Some(StreamErrorCondition::SystemShutdown), "router shutting down"))
}

fn read_fault(err: TransportError) -> Fault {
    match err {
        TransportError::Malformed(DecodeError::TooLarge) => {
            Fault::protocol(StreamErrorCondition::PolicyViolation, DecodeError::TooLarge.to_string())
        }
        TransportError::Malformed(e) => Fault::protocol(StreamErrorCondition::BadFormat, e.to_string()),
        e => Fault::transport(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_input_is_a_policy_violation() {
        let fault = read_fault(TransportError::Malformed(DecodeError::TooLarge));
        assert_eq!(fault.kind, FaultKind::Protocol);
        assert_eq!(fault.condition, Some(StreamErrorCondition::PolicyViolation));

        let fault = read_fault(TransportError::Malformed(DecodeError::Malformed("eof".into())));
        assert_eq!(fault.condition, Some(StreamErrorCondition::BadFormat));
    }

    #[test]
    fn socket_errors_skip_the_error_flush() {
        let fault = read_fault(TransportError::Closed);
        assert_eq!(fault.kind, FaultKind::Transport);
        assert!(!fault.kind.flushes_error());
    }

    #[tokio::test]
    async fn stalled_action_gives_up_at_the_deadline() {
        let (_tx, rx) = watch::channel(false);
        let until = Instant::now() + Duration::from_millis(20);
        let stalled = std::future::pending::<Result<(), CloseReason>>();
        let result = bounded(stalled, until, Fault::timeout(), rx).await;
        let Err(CloseReason::Fault(fault)) = result else { panic!("expected a fault") };
        assert_eq!(fault.kind, FaultKind::Timeout);
    }

    #[tokio::test]
    async fn stalled_action_yields_to_shutdown() {
        let (tx, rx) = watch::channel(false);
        let until = Instant::now() + Duration::from_secs(3600);
        let stalled = std::future::pending::<Result<(), CloseReason>>();
        let task = tokio::spawn(bounded(stalled, until, Fault::timeout(), rx));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        let Err(CloseReason::Fault(fault)) = result else { panic!("expected a fault") };
        assert_eq!(fault.condition, Some(StreamErrorCondition::SystemShutdown));
    }

    #[tokio::test]
    async fn finished_work_wins() {
        let (_tx, rx) = watch::channel(false);
        let until = Instant::now() + Duration::from_secs(3600);
        let result = bounded(async { Ok::<_, CloseReason>(7) }, until, Fault::timeout(), rx).await;
        assert!(matches!(result, Ok(7)));
    }
}
