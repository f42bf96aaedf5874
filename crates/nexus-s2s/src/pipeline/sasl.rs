//! SASL EXTERNAL between servers (XEP-0178).
//!
//! Receiving side: offer EXTERNAL when the certificate presented during
//! StartTLS is trusted and names the domain from the peer's stream header.
//! Initiating side: use it when offered and the receiving server's own
//! certificate checked out. A refusal is not fatal; dialback runs next on
//! the same stream.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, info, warn};

use super::{Action, Outcome, Stage, StageContext, StageEnv, StageKind};
use crate::error::Fault;
use crate::protocol::{self, NS_SASL, SASL_EXTERNAL, StreamErrorCondition};
use crate::session::{AuthMechanism, SessionState, StreamSession};
use crate::xml::Element;

const PENDING: &str = "sasl.pending";
const SUCCEEDED: &str = "sasl.succeeded";
const FAILED: &str = "sasl.failed";

pub struct SaslExternalStage;

impl SaslExternalStage {
    /// `(local, remote)` an incoming peer may authenticate as by certificate.
    fn eligible_link(session: &StreamSession, env: &StageEnv) -> Option<(String, String)> {
        if !session.is_incoming() || session.state() == SessionState::Established {
            return None;
        }
        let header = session.peer_header.as_ref()?;
        let remote = header.from.as_deref()?.to_lowercase();
        let local = header.to.as_deref().map(str::to_lowercase).unwrap_or_else(|| env.default_domain.clone());
        let trusted = session.tls.as_ref().is_some_and(|tls| tls.trusts(&remote));
        (trusted && !env.skips_sasl(&local, &remote)).then_some((local, remote))
    }

    /// Receiving side of `<auth/>`. Refusals leave the stream open for dialback.
    fn accept(session: &mut StreamSession, auth: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        let env = ctx.env;
        if auth.attr("mechanism") != Some(SASL_EXTERNAL) {
            ctx.send(protocol::sasl_failure("invalid-mechanism", None));
            return Ok(Outcome::Handled);
        }
        let Some((local, remote)) = Self::eligible_link(session, env) else {
            warn!(session = %session.id(), "S2S: SASL EXTERNAL attempted without a usable certificate");
            ctx.send(protocol::sasl_failure("not-authorized", Some("No trusted certificate for this stream")));
            return Ok(Outcome::Handled);
        };
        let claimed = match decode_authzid(auth.text().trim()) {
            Ok(claimed) => claimed,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "S2S: undecodable SASL authzid");
                ctx.send(protocol::sasl_failure("incorrect-encoding", None));
                return Ok(Outcome::Handled);
            }
        };
        if let Some(claimed) = claimed.filter(|id| !id.eq_ignore_ascii_case(&remote)) {
            warn!(session = %session.id(), claimed = %claimed, remote = %remote, "S2S: SASL authzid does not match the stream");
            ctx.send(protocol::sasl_failure("invalid-authzid", Some("Authorization identity does not match the stream")));
            return Ok(Outcome::Handled);
        }

        let cid = env.hosted.incoming_cid(&local, &remote).map_err(|e| Fault::from_error(&e))?;
        session.transition(SessionState::Authenticating(AuthMechanism::Sasl))?;
        session.transition(SessionState::Established)?;
        info!(session = %session.id(), cid = %cid, "S2S: peer authenticated by SASL EXTERNAL");
        session.authenticate(cid.clone());
        ctx.send(protocol::sasl_success());
        ctx.push(Action::Authenticated(cid));
        ctx.push(Action::RestartStream);
        Ok(Outcome::Handled)
    }
}

/// Authorization identity from `<auth/>`; `None` when the peer sent none (`=`).
fn decode_authzid(text: &str) -> Result<Option<String>, base64::DecodeError> {
    if text.is_empty() || text == "=" {
        return Ok(None);
    }
    let raw = STANDARD.decode(text)?;
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

impl Stage for SaslExternalStage {
    fn kind(&self) -> StageKind {
        StageKind::SaslExternal
    }

    fn stream_features(&self, session: &StreamSession, env: &StageEnv, features: &mut Vec<Element>) {
        if Self::eligible_link(session, env).is_some() {
            features.push(protocol::sasl_mechanisms(&[SASL_EXTERNAL]));
        }
    }

    fn on_stream_features(
        &self,
        session: &mut StreamSession,
        features: &Element,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if session.is_incoming() || session.verify.is_some() {
            return Ok(Outcome::Declined);
        }
        let Some(cid) = session.cid.clone() else {
            return Ok(Outcome::Declined);
        };
        // Features of the stream reopened after <success/>.
        if session.take_scratch(SUCCEEDED).is_some() {
            session.transition(SessionState::Established)?;
            info!(session = %session.id(), cid = %cid, "S2S: outgoing stream authenticated by SASL EXTERNAL");
            session.authenticate(cid.clone());
            ctx.push(Action::Authenticated(cid));
            return Ok(Outcome::Handled);
        }

        let usable = session.scratch(FAILED).is_none()
            && session.tls.as_ref().is_some_and(|tls| tls.trusts(cid.remote()))
            && !ctx.env.skips_sasl(cid.local(), cid.remote())
            && protocol::offers_mechanism(features, SASL_EXTERNAL);
        if !usable {
            return Ok(Outcome::Continue);
        }
        debug!(session = %session.id(), cid = %cid, "S2S: authenticating with SASL EXTERNAL");
        session.transition(SessionState::Authenticating(AuthMechanism::Sasl))?;
        session.set_scratch(PENDING, SASL_EXTERNAL);
        ctx.send(protocol::sasl_auth(SASL_EXTERNAL, &STANDARD.encode(cid.local())));
        Ok(Outcome::Handled)
    }

    fn on_stanza(&self, session: &mut StreamSession, stanza: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if stanza.ns() != NS_SASL {
            return Ok(Outcome::Declined);
        }
        match (stanza.name(), session.is_incoming()) {
            ("auth", true) => Self::accept(session, stanza, ctx),
            ("success", false) if session.take_scratch(PENDING).is_some() => {
                session.set_scratch(SUCCEEDED, SASL_EXTERNAL);
                ctx.push(Action::RestartStream);
                Ok(Outcome::Handled)
            }
            ("failure", false) if session.take_scratch(PENDING).is_some() => {
                let condition = stanza.children().find(|c| c.name() != "text").map(Element::name).unwrap_or("unknown");
                warn!(session = %session.id(), condition = %condition, "S2S: SASL EXTERNAL refused, falling back to dialback");
                session.set_scratch(FAILED, SASL_EXTERNAL);
                ctx.push(Action::ReprocessFeatures);
                Ok(Outcome::Handled)
            }
            _ => Err(Fault::protocol(
                StreamErrorCondition::PolicyViolation,
                format!("unexpected <{}/> in SASL negotiation", stanza.name()),
            )),
        }
    }
}
