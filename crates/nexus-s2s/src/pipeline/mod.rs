//! Ordered protocol-stage pipeline.
//!
//! Every inbound stream event is offered to the registered stages in a fixed
//! priority order until one claims it. Stages never perform I/O: they mutate
//! the [`StreamSession`] they are handed and queue [`Action`]s on the
//! [`StageContext`], which the session driver then executes in order.

mod compression;
mod dialback;
mod sasl;
mod stream_error;
mod stream_features;
mod stream_open;
mod tls;

pub use compression::StartCompressionStage;
pub use dialback::{DialbackStage, Verdict, apply_verdict};
pub use sasl::SaslExternalStage;
pub use stream_error::StreamErrorStage;
pub use stream_features::StreamFeaturesStage;
pub use stream_open::StreamOpenStage;
pub use tls::StartTlsStage;

use std::collections::HashSet;
use std::sync::Arc;

use nexus_common::Jid;
use nexus_common::config::TlsMode;

use crate::cid::{Cid, HostedDomains};
use crate::error::{Fault, S2sError};
use crate::key::SecretProvider;
use crate::protocol::{self, NS_CLIENT, NS_SERVER, StreamErrorCondition, StreamHeader};
use crate::session::{SessionState, StreamSession};
use crate::xml::{Element, InboundEvent};

// ─── Stage registry ──────────────────────────────────────────────────────────

/// The closed set of pipeline stages, each with a fixed priority.
///
/// Lower priorities run first for stream lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageKind {
    StreamOpen,
    StreamError,
    StreamFeatures,
    StartTls,
    StartCompression,
    SaslExternal,
    Dialback,
}

impl StageKind {
    pub const CANONICAL: [StageKind; 7] = [
        StageKind::StreamOpen,
        StageKind::StreamError,
        StageKind::StreamFeatures,
        StageKind::StartTls,
        StageKind::StartCompression,
        StageKind::SaslExternal,
        StageKind::Dialback,
    ];

    pub const fn priority(self) -> u16 {
        match self {
            StageKind::StreamOpen => 0,
            StageKind::StreamError => 10,
            StageKind::StreamFeatures => 20,
            StageKind::StartTls => 30,
            StageKind::StartCompression => 40,
            StageKind::SaslExternal => 45,
            StageKind::Dialback => 50,
        }
    }
}

/// What a stage did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fully handled; later stages do not see the event.
    Handled,
    /// Annotated the session; later stages still run.
    Continue,
    /// Not interested.
    Declined,
}

/// How a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer sent `</stream:stream>` or hung up.
    PeerClosed,
    /// Work is done (verification-only connections).
    Finished,
    Fault(Fault),
}

/// Side effects requested by stages, executed by the session driver in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    SendHeader(StreamHeader),
    Send(Element),
    /// Collect every stage's features and send `<stream:features/>`.
    AdvertiseFeatures,
    UpgradeTls,
    UpgradeCompression,
    /// A fresh stream follows a layer change; outgoing sessions reopen it.
    RestartStream,
    /// Run the feature hooks again against the last features received.
    ReprocessFeatures,
    /// A CID finished authentication on this session.
    Authenticated(Cid),
    /// Ask the originating server whether `key` is genuine.
    Verify { cid: Cid, stream_id: String, key: String },
    /// Answer obtained on a verification-only connection.
    VerifyVerdict { valid: bool },
    /// Hand an accepted stanza to the local delivery sink.
    Deliver(Element),
    Close(CloseReason),
}

/// Local policy and secrets every stage may consult.
pub struct StageEnv {
    pub hosted: HostedDomains,
    /// Assumed target of incoming streams that omit `to`.
    pub default_domain: String,
    pub secrets: Arc<dyn SecretProvider>,
    pub tls_mode: TlsMode,
    pub tls_skip_hosts: HashSet<String>,
    pub sasl_skip_domains: HashSet<String>,
    pub compression: bool,
}

impl StageEnv {
    pub fn new(hosted: HostedDomains, default_domain: impl Into<String>, secrets: Arc<dyn SecretProvider>) -> Self {
        Self {
            hosted,
            default_domain: default_domain.into().to_lowercase(),
            secrets,
            tls_mode: TlsMode::Optional,
            tls_skip_hosts: HashSet::new(),
            sasl_skip_domains: HashSet::new(),
            compression: false,
        }
    }

    /// SASL EXTERNAL is off for a link if either end is listed.
    pub fn skips_sasl(&self, local: &str, remote: &str) -> bool {
        self.sasl_skip_domains.contains(&local.to_lowercase()) || self.sasl_skip_domains.contains(&remote.to_lowercase())
    }

    /// StartTLS is never attempted with `host`.
    pub fn skips_tls(&self, host: &str) -> bool {
        self.tls_mode == TlsMode::Disabled || self.tls_skip_hosts.contains(&host.to_lowercase())
    }
}

/// Collects the actions queued by stages for one event.
pub struct StageContext<'a> {
    pub env: &'a StageEnv,
    actions: Vec<Action>,
}

impl<'a> StageContext<'a> {
    pub fn new(env: &'a StageEnv) -> Self {
        Self { env, actions: Vec::new() }
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn send(&mut self, element: Element) {
        self.actions.push(Action::Send(element));
    }

    pub fn close(&mut self, reason: CloseReason) {
        self.actions.push(Action::Close(reason));
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn into_actions(self) -> Vec<Action> {
        self.actions
    }
}

/// One protocol layer. Every hook defaults to [`Outcome::Declined`].
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Transport is up (outgoing) or was accepted (incoming).
    fn on_connected(&self, _session: &mut StreamSession, _ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        Ok(Outcome::Declined)
    }

    fn on_stream_opened(
        &self,
        _session: &mut StreamSession,
        _header: &StreamHeader,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        Ok(Outcome::Declined)
    }

    /// Contribute to the `<stream:features/>` we advertise.
    fn stream_features(&self, _session: &StreamSession, _env: &StageEnv, _features: &mut Vec<Element>) {}

    /// The peer advertised its features (outgoing sessions).
    fn on_stream_features(
        &self,
        _session: &mut StreamSession,
        _features: &Element,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        Ok(Outcome::Declined)
    }

    fn on_stanza(
        &self,
        _session: &mut StreamSession,
        _stanza: &Element,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        Ok(Outcome::Declined)
    }

    fn on_stream_closed(&self, _session: &mut StreamSession, _ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        Ok(Outcome::Declined)
    }
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

/// Stages sorted by priority, fixed at construction.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    /// Indices into `stages` giving the order used for stanzas.
    stanza_order: Vec<usize>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Every built-in stage in canonical order.
    pub fn standard() -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(StreamOpenStage),
            Box::new(StreamErrorStage),
            Box::new(StreamFeaturesStage),
            Box::new(StartTlsStage),
            Box::new(StartCompressionStage),
            Box::new(SaslExternalStage),
            Box::new(DialbackStage),
        ];
        let stanza_order = (0..stages.len()).collect();
        Self { stages, stanza_order }
    }

    /// Lifecycle order of the registered stages.
    pub fn kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub fn stanza_kinds(&self) -> Vec<StageKind> {
        self.stanza_order.iter().map(|&i| self.stages[i].kind()).collect()
    }

    /// Dispatch one transport event.
    pub fn handle(
        &self,
        session: &mut StreamSession,
        event: &InboundEvent,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        match event {
            InboundEvent::StreamOpened(header) => self.stream_opened(session, header, ctx),
            InboundEvent::Element(el) => self.element(session, el, ctx),
            InboundEvent::StreamClosed => self.stream_closed(session, ctx),
        }
    }

    pub fn connected(&self, session: &mut StreamSession, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        run(self.stages.iter(), |stage| stage.on_connected(session, ctx))
    }

    pub fn stream_opened(
        &self,
        session: &mut StreamSession,
        header: &StreamHeader,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        run(self.stages.iter(), |stage| stage.on_stream_opened(session, header, ctx))
    }

    pub fn stream_features(
        &self,
        session: &mut StreamSession,
        features: &Element,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        run(self.stages.iter(), |stage| stage.on_stream_features(session, features, ctx))
    }

    pub fn stream_closed(&self, session: &mut StreamSession, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        run(self.stages.iter(), |stage| stage.on_stream_closed(session, ctx))
    }

    /// Features to advertise on an incoming stream, in stage order.
    pub fn advertised_features(&self, session: &StreamSession, env: &StageEnv) -> Vec<Element> {
        let mut features = Vec::new();
        for stage in &self.stages {
            stage.stream_features(session, env, &mut features);
        }
        features
    }

    /// Top-level element: features go to the feature hooks, everything else
    /// to the stanza hooks. Unclaimed stanzas are delivered if the session
    /// is authenticated for their addresses.
    pub fn element(&self, session: &mut StreamSession, el: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if protocol::is_features(el) {
            return self.stream_features(session, el, ctx);
        }
        let ordered = self.stanza_order.iter().map(|&i| &self.stages[i]);
        match run(ordered, |stage| stage.on_stanza(session, el, ctx))? {
            Outcome::Handled => Ok(Outcome::Handled),
            _ => {
                ctx.push(Action::Deliver(accept_stanza(session, el)?));
                Ok(Outcome::Handled)
            }
        }
    }
}

fn run<'s>(
    stages: impl Iterator<Item = &'s Box<dyn Stage>>,
    mut hook: impl FnMut(&dyn Stage) -> Result<Outcome, Fault>,
) -> Result<Outcome, Fault> {
    let mut result = Outcome::Declined;
    for stage in stages {
        match hook(stage.as_ref())? {
            Outcome::Handled => return Ok(Outcome::Handled),
            Outcome::Continue => result = Outcome::Continue,
            Outcome::Declined => {}
        }
    }
    Ok(result)
}

/// Gate for ordinary stanzas arriving on a federation stream.
fn accept_stanza(session: &StreamSession, el: &Element) -> Result<Element, Fault> {
    if !session.is_incoming() {
        return Err(Fault::protocol(
            StreamErrorCondition::UnsupportedStanzaType,
            format!("<{}/> received on an outgoing stream", el.name()),
        ));
    }
    if session.state() != SessionState::Established {
        return Err(Fault::protocol(
            StreamErrorCondition::NotAuthorized,
            format!("<{}/> received before authentication", el.name()),
        ));
    }
    let is_stanza = matches!(el.name(), "message" | "presence" | "iq") && (el.ns() == NS_SERVER || el.ns() == NS_CLIENT);
    if !is_stanza {
        return Err(Fault::protocol(
            StreamErrorCondition::UnsupportedStanzaType,
            format!("unsupported element <{}/> in {}", el.name(), el.ns()),
        ));
    }

    let address = |attr: &str| -> Result<Jid, Fault> {
        let raw = el
            .attr(attr)
            .ok_or_else(|| Fault::from_error(&S2sError::InvalidAddress(format!("missing '{attr}'"))))?;
        raw.parse::<Jid>().map_err(|e| Fault::from_error(&S2sError::Jid(e)))
    };
    let from = address("from")?;
    let to = address("to")?;

    let cid = Cid::new(to.domain(), from.domain());
    if !session.is_authenticated(&cid) {
        return Err(Fault::protocol(StreamErrorCondition::InvalidFrom, format!("{cid} is not authenticated on this stream")));
    }
    Ok(el.clone())
}

/// Builds a [`Pipeline`], sorting stages into canonical order regardless of
/// registration order.
#[derive(Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn Stage>>,
    stanza_order: Option<Vec<StageKind>>,
}

impl PipelineBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn boxed(mut self, stage: Box<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Order in which stanzas are offered to stages. Must name every registered stage once.
    pub fn stanza_order(mut self, order: impl IntoIterator<Item = StageKind>) -> Self {
        self.stanza_order = Some(order.into_iter().collect());
        self
    }

    pub fn build(mut self) -> Result<Pipeline, S2sError> {
        self.stages.sort_by_key(|s| s.kind().priority());
        let kinds: Vec<StageKind> = self.stages.iter().map(|s| s.kind()).collect();
        if let Some(dup) = kinds.windows(2).find(|w| w[0] == w[1]) {
            return Err(S2sError::Pipeline(format!("stage {:?} registered twice", dup[0])));
        }

        let stanza_order = match self.stanza_order {
            None => (0..self.stages.len()).collect(),
            Some(order) => {
                let mut seen = HashSet::new();
                let mut indices = Vec::with_capacity(order.len());
                for kind in order {
                    let idx = kinds
                        .iter()
                        .position(|k| *k == kind)
                        .ok_or_else(|| S2sError::Pipeline(format!("stanza order names unregistered stage {kind:?}")))?;
                    if !seen.insert(kind) {
                        return Err(S2sError::Pipeline(format!("stanza order names {kind:?} twice")));
                    }
                    indices.push(idx);
                }
                if indices.len() != kinds.len() {
                    return Err(S2sError::Pipeline("stanza order must list every registered stage".into()));
                }
                indices
            }
        };

        Ok(Pipeline { stages: self.stages, stanza_order })
    }
}
