//! StartTLS negotiation. Certificates are checked here; SASL EXTERNAL
//! decides whether they authenticate anyone.

use nexus_common::config::TlsMode;
use tracing::{debug, warn};

use super::{Action, Outcome, Stage, StageContext, StageEnv, StageKind};
use crate::error::{Fault, FaultKind};
use crate::protocol::{self, NS_TLS, StreamErrorCondition};
use crate::session::{AuthMechanism, SessionState, StreamSession};
use crate::xml::Element;

pub struct StartTlsStage;

impl StartTlsStage {
    fn peer_domain(session: &StreamSession) -> Option<String> {
        match (&session.cid, &session.peer_header) {
            (Some(cid), _) if !session.is_incoming() => Some(cid.remote().to_owned()),
            (_, Some(header)) => header.from.as_deref().map(str::to_lowercase),
            _ => None,
        }
    }

    fn refused(reason: &str) -> Fault {
        // The stream is closed without a stream error after <failure/>.
        Fault::new(FaultKind::Security, None, reason)
    }
}

impl Stage for StartTlsStage {
    fn kind(&self) -> StageKind {
        StageKind::StartTls
    }

    fn stream_features(&self, session: &StreamSession, env: &StageEnv, features: &mut Vec<Element>) {
        if !session.is_incoming() || session.tls.is_some() || env.tls_mode == TlsMode::Disabled {
            return;
        }
        if Self::peer_domain(session).is_some_and(|peer| env.skips_tls(&peer)) {
            return;
        }
        let mut starttls = protocol::starttls();
        if env.tls_mode == TlsMode::Required {
            starttls.append_child(Element::new("required", NS_TLS));
        }
        features.push(starttls);
    }

    fn on_stream_features(
        &self,
        session: &mut StreamSession,
        features: &Element,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if session.tls.is_some() {
            return Ok(Outcome::Continue);
        }
        let env = ctx.env;
        let peer = Self::peer_domain(session).unwrap_or_default();
        if env.tls_skip_hosts.contains(&peer) {
            warn!(session = %session.id(), peer = %peer, "S2S: StartTLS skipped for listed peer");
            return Ok(Outcome::Continue);
        }
        let offered = features.has_child("starttls", NS_TLS);
        if offered && env.tls_mode != TlsMode::Disabled {
            debug!(session = %session.id(), peer = %peer, "S2S: requesting StartTLS");
            session.transition(SessionState::Authenticating(AuthMechanism::Tls))?;
            ctx.send(protocol::starttls());
            return Ok(Outcome::Handled);
        }
        if env.tls_mode == TlsMode::Required {
            return Err(Fault::security(StreamErrorCondition::PolicyViolation, format!("{peer} does not offer StartTLS")));
        }
        Ok(Outcome::Continue)
    }

    fn on_stanza(&self, session: &mut StreamSession, stanza: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if stanza.ns() != NS_TLS {
            return Ok(Outcome::Declined);
        }
        match (stanza.name(), session.is_incoming()) {
            ("starttls", true) => {
                if session.tls.is_some() || ctx.env.tls_mode == TlsMode::Disabled {
                    ctx.send(protocol::tls_failure());
                    return Err(Self::refused("StartTLS not available on this stream"));
                }
                session.transition(SessionState::Authenticating(AuthMechanism::Tls))?;
                ctx.send(protocol::proceed());
                ctx.push(Action::UpgradeTls);
                ctx.push(Action::RestartStream);
                Ok(Outcome::Handled)
            }
            ("proceed", false) => {
                if session.state() != SessionState::Authenticating(AuthMechanism::Tls) {
                    return Err(Fault::protocol(StreamErrorCondition::PolicyViolation, "unsolicited <proceed/>"));
                }
                ctx.push(Action::UpgradeTls);
                ctx.push(Action::RestartStream);
                Ok(Outcome::Handled)
            }
            ("failure", false) => Err(Self::refused("peer refused StartTLS")),
            _ => Err(Fault::protocol(
                StreamErrorCondition::PolicyViolation,
                format!("unexpected <{}/> in TLS negotiation", stanza.name()),
            )),
        }
    }
}
