//! Server dialback (XEP-0220).
//!
//! Originating side: send `db:result` carrying a key bound to the stream id
//! the receiving server assigned. Receiving side: never trust that key
//! directly; ask the claimed origin over a separate connection
//! (`db:verify`) and relay its verdict as a typed `db:result`.
//!
//! One incoming stream may carry `db:result` requests for several domain
//! pairs. Each one is verified on its own and stanzas are only accepted for
//! the pairs that verified.

use nexus_common::config::TlsMode;
use tracing::{debug, info, warn};

use super::{Action, CloseReason, Outcome, Stage, StageContext, StageEnv, StageKind};
use crate::cid::Cid;
use crate::error::Fault;
use crate::key;
use crate::protocol::{self, NS_DIALBACK, NS_DIALBACK_FEATURE, StreamErrorCondition, StreamHeader};
use crate::session::{AuthMechanism, SessionState, StreamSession};
use crate::xml::Element;

/// Result of checking a dialback key with its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
    /// No answer before the verification deadline. Treated as invalid.
    TimedOut,
}

/// Verification connections one incoming stream may have in flight.
pub const MAX_PENDING_VERIFICATIONS: usize = 8;

pub struct DialbackStage;

impl DialbackStage {
    /// Send our key (or the key being checked, on verification connections).
    fn start(session: &mut StreamSession, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        let Some(stream_id) = session.stream_id.clone() else {
            return Err(Fault::protocol(StreamErrorCondition::BadFormat, "no stream id to bind the dialback key to"));
        };

        if let Some(req) = &session.verify {
            debug!(session = %session.id(), originating = %req.originating, "S2S: sending db:verify");
            ctx.send(protocol::dialback(
                "verify",
                &req.receiving,
                &req.originating,
                Some(&req.stream_id),
                None,
                Some(&req.key),
            ));
        } else {
            let Some(cid) = session.cid.clone() else {
                return Err(Fault::protocol(StreamErrorCondition::InternalServerError, "outgoing session without a CID"));
            };
            let key = key::compute(&ctx.env.secrets.current(), &stream_id, cid.remote(), cid.local());
            debug!(session = %session.id(), cid = %cid, "S2S: sending db:result");
            ctx.send(protocol::dialback("result", cid.local(), cid.remote(), None, None, Some(&key)));
        }
        session.transition(SessionState::Authenticating(AuthMechanism::Dialback))?;
        Ok(Outcome::Handled)
    }

    /// Incoming `db:result` with a key: queue verification with the claimed origin.
    fn result_request(session: &mut StreamSession, el: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if !session.is_incoming() {
            return Err(Fault::protocol(StreamErrorCondition::PolicyViolation, "db:result request on an outgoing stream"));
        }
        let (from, to) = addresses(el)?;
        let env = ctx.env;
        if env.tls_mode == TlsMode::Required && session.tls.is_none() && !env.tls_skip_hosts.contains(&from) {
            return Err(Fault::security(StreamErrorCondition::PolicyViolation, "dialback attempted before StartTLS"));
        }
        let cid = env.hosted.incoming_cid(&to, &from).map_err(|e| Fault::from_error(&e))?;

        if session.is_authenticated(&cid) {
            ctx.send(protocol::dialback("result", cid.local(), cid.remote(), None, Some("valid"), None));
            return Ok(Outcome::Handled);
        }
        if session.pending_count() >= MAX_PENDING_VERIFICATIONS && !session.is_pending(&cid) {
            return Err(Fault::protocol(
                StreamErrorCondition::PolicyViolation,
                format!("more than {MAX_PENDING_VERIFICATIONS} dialback requests awaiting verification"),
            ));
        }
        if !session.begin_verification(cid.clone()) {
            debug!(session = %session.id(), cid = %cid, "S2S: duplicate db:result ignored");
            return Ok(Outcome::Handled);
        }
        if matches!(session.state(), SessionState::StreamOpenSent | SessionState::AwaitingFeatures) {
            session.transition(SessionState::Authenticating(AuthMechanism::Dialback))?;
        }
        let Some(stream_id) = session.stream_id.clone() else {
            return Err(Fault::protocol(StreamErrorCondition::BadFormat, "db:result before stream header"));
        };
        ctx.push(Action::Verify { cid, stream_id, key: el.text().trim().to_owned() });
        Ok(Outcome::Handled)
    }

    /// Typed `db:result` on our outgoing stream: the peer's verdict on our key.
    fn result_reply(session: &mut StreamSession, el: &Element, kind: &str, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        let Some(cid) = session.cid.clone() else {
            return Err(Fault::protocol(StreamErrorCondition::PolicyViolation, "db:result reply on an incoming stream"));
        };
        if session.is_incoming() || session.verify.is_some() {
            return Err(Fault::protocol(StreamErrorCondition::PolicyViolation, "unexpected db:result reply"));
        }
        let (from, to) = addresses(el)?;
        if from != cid.remote() || to != cid.local() {
            return Err(Fault::protocol(StreamErrorCondition::InvalidFrom, format!("db:result for {to}/{from} on {cid}")));
        }
        if kind != "valid" {
            return Err(Fault::security(StreamErrorCondition::NotAuthorized, format!("{} rejected our dialback key", cid.remote())));
        }
        if session.state() != SessionState::Established {
            session.transition(SessionState::Established)?;
        }
        info!(session = %session.id(), cid = %cid, "S2S: outgoing stream authenticated by dialback");
        session.authenticate(cid.clone());
        ctx.push(Action::Authenticated(cid));
        Ok(Outcome::Handled)
    }

    /// `db:verify` without a type: someone is checking a key we supposedly issued.
    fn verify_request(session: &StreamSession, el: &Element, env: &StageEnv, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        let (receiving, originating) = addresses(el)?;
        let id = el.attr("id").unwrap_or_default();
        let valid = env.hosted.contains(&originating)
            && !id.is_empty()
            && key::verify(env.secrets.as_ref(), id, &receiving, &originating, el.text().trim());
        if valid {
            debug!(session = %session.id(), receiving = %receiving, "S2S: db:verify answered valid");
        } else {
            warn!(session = %session.id(), receiving = %receiving, originating = %originating, "S2S: db:verify answered invalid");
        }
        let verdict = if valid { "valid" } else { "invalid" };
        ctx.send(protocol::dialback("verify", &originating, &receiving, Some(id), Some(verdict), None));
        Ok(Outcome::Handled)
    }

    /// Typed `db:verify` on a verification connection: the origin's answer.
    fn verify_reply(session: &StreamSession, el: &Element, kind: &str, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        let Some(req) = &session.verify else {
            return Err(Fault::protocol(StreamErrorCondition::PolicyViolation, "unsolicited db:verify reply"));
        };
        let valid = kind == "valid" && el.attr("id") == Some(req.stream_id.as_str());
        ctx.push(Action::VerifyVerdict { valid });
        ctx.close(CloseReason::Finished);
        Ok(Outcome::Handled)
    }
}

fn addresses(el: &Element) -> Result<(String, String), Fault> {
    match (el.attr("from"), el.attr("to")) {
        (Some(from), Some(to)) if !from.is_empty() && !to.is_empty() => Ok((from.to_lowercase(), to.to_lowercase())),
        _ => Err(Fault::protocol(StreamErrorCondition::ImproperAddressing, format!("db:{} without from/to", el.name()))),
    }
}

impl Stage for DialbackStage {
    fn kind(&self) -> StageKind {
        StageKind::Dialback
    }

    fn stream_features(&self, session: &StreamSession, _env: &StageEnv, features: &mut Vec<Element>) {
        if !session.is_incoming() {
            return;
        }
        let mut dialback = Element::new("dialback", NS_DIALBACK_FEATURE);
        if !session.tls_trusted() {
            dialback.append_child(Element::new("required", NS_DIALBACK_FEATURE));
        }
        features.push(dialback);
    }

    /// Pre-1.0 peers never send features; dialback starts right after the header.
    fn on_stream_opened(
        &self,
        session: &mut StreamSession,
        header: &StreamHeader,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if session.is_incoming() || header.supports_features() {
            return Ok(Outcome::Declined);
        }
        Self::start(session, ctx)
    }

    fn on_stream_features(
        &self,
        session: &mut StreamSession,
        _features: &Element,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if session.is_incoming() {
            return Ok(Outcome::Declined);
        }
        // Stream reopened after another mechanism already authenticated it.
        if session.state() == SessionState::Established && session.verify.is_none() {
            return Ok(Outcome::Handled);
        }
        Self::start(session, ctx)
    }

    fn on_stanza(&self, session: &mut StreamSession, stanza: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if stanza.ns() != NS_DIALBACK {
            return Ok(Outcome::Declined);
        }
        let kind = stanza.attr("type").map(str::to_owned);
        match (stanza.name(), kind.as_deref()) {
            ("result", None) => Self::result_request(session, stanza, ctx),
            ("result", Some(kind)) => Self::result_reply(session, stanza, kind, ctx),
            ("verify", None) => {
                let env = ctx.env;
                Self::verify_request(session, stanza, env, ctx)
            }
            ("verify", Some(kind)) => Self::verify_reply(session, stanza, kind, ctx),
            _ => Ok(Outcome::Declined),
        }
    }
}

/// Relay the origin's verdict on `cid` to the peer of an incoming session.
///
/// `Invalid` and `TimedOut` are fatal to the session.
pub fn apply_verdict(
    session: &mut StreamSession,
    cid: &Cid,
    verdict: Verdict,
    ctx: &mut StageContext<'_>,
) -> Result<(), Fault> {
    if !session.end_verification(cid) {
        debug!(session = %session.id(), cid = %cid, "S2S: stale dialback verdict ignored");
        return Ok(());
    }
    match verdict {
        Verdict::Valid => {
            ctx.send(protocol::dialback("result", cid.local(), cid.remote(), None, Some("valid"), None));
            if session.state() != SessionState::Established {
                session.transition(SessionState::Established)?;
            }
            info!(session = %session.id(), cid = %cid, "S2S: incoming stream authenticated by dialback");
            session.authenticate(cid.clone());
            ctx.push(Action::Authenticated(cid.clone()));
            Ok(())
        }
        Verdict::Invalid => {
            ctx.send(protocol::dialback("result", cid.local(), cid.remote(), None, Some("invalid"), None));
            Err(Fault::security(StreamErrorCondition::NotAuthorized, format!("dialback key for {cid} did not verify")))
        }
        Verdict::TimedOut => Err(Fault::timeout()),
    }
}
