//! Feature advertisement (incoming) and feature intake (outgoing).

use super::{Action, Outcome, Stage, StageContext, StageKind};
use crate::error::Fault;
use crate::protocol::{StreamErrorCondition, StreamHeader};
use crate::session::{SessionState, StreamSession};
use crate::xml::Element;

pub struct StreamFeaturesStage;

impl StreamFeaturesStage {
    fn enter_negotiation(session: &mut StreamSession) -> Result<(), Fault> {
        match session.state() {
            SessionState::StreamOpenSent | SessionState::AwaitingFeatures => {
                session.transition(SessionState::AwaitingFeatures)
            }
            _ => Ok(()),
        }
    }
}

impl Stage for StreamFeaturesStage {
    fn kind(&self) -> StageKind {
        StageKind::StreamFeatures
    }

    fn on_stream_opened(
        &self,
        session: &mut StreamSession,
        header: &StreamHeader,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        // Pre-1.0 peers never exchange features.
        if !header.supports_features() {
            return Ok(Outcome::Declined);
        }
        Self::enter_negotiation(session)?;
        if session.is_incoming() {
            // Later stages may still change what gets advertised.
            ctx.push(Action::AdvertiseFeatures);
            Ok(Outcome::Continue)
        } else {
            Ok(Outcome::Handled)
        }
    }

    fn on_stream_features(
        &self,
        session: &mut StreamSession,
        features: &Element,
        _ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if session.is_incoming() {
            return Err(Fault::protocol(
                StreamErrorCondition::UnsupportedStanzaType,
                "stream features sent by the initiating server",
            ));
        }
        session.peer_features = Some(features.clone());
        Self::enter_negotiation(session)?;
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cid::{Cid, HostedDomains};
    use crate::key::RotatingSecret;
    use crate::pipeline::StageEnv;
    use crate::protocol;

    fn env() -> StageEnv {
        StageEnv::new(HostedDomains::new(["b.example"]), "b.example", Arc::new(RotatingSecret::generate()))
    }

    #[test]
    fn incoming_v1_stream_advertises() {
        let env = env();
        let mut ctx = StageContext::new(&env);
        let mut session = StreamSession::incoming(Duration::from_secs(30));
        session.transition(SessionState::StreamOpenSent).unwrap();
        let header = StreamHeader::ours(Some("a.example"), Some("b.example"), None, true);
        let outcome = StreamFeaturesStage.on_stream_opened(&mut session, &header, &mut ctx).unwrap();
        assert_eq!(outcome, Outcome::Continue);
        assert_eq!(ctx.actions(), &[Action::AdvertiseFeatures]);
        assert_eq!(session.state(), SessionState::AwaitingFeatures);
    }

    #[test]
    fn legacy_stream_skips_features() {
        let env = env();
        let mut ctx = StageContext::new(&env);
        let mut session = StreamSession::incoming(Duration::from_secs(30));
        let header = StreamHeader::ours(Some("a.example"), Some("b.example"), None, false);
        let outcome = StreamFeaturesStage.on_stream_opened(&mut session, &header, &mut ctx).unwrap();
        assert_eq!(outcome, Outcome::Declined);
        assert!(ctx.actions().is_empty());
    }

    #[test]
    fn outgoing_records_peer_features() {
        let env = env();
        let mut ctx = StageContext::new(&env);
        let mut session = StreamSession::outgoing(Cid::new("b.example", "a.example"), Duration::from_secs(30));
        session.transition(SessionState::StreamOpenSent).unwrap();
        let features = protocol::features(vec![protocol::starttls()]);
        StreamFeaturesStage.on_stream_features(&mut session, &features, &mut ctx).unwrap();
        assert_eq!(session.peer_features.as_ref(), Some(&features));
        assert_eq!(session.state(), SessionState::AwaitingFeatures);
    }
}
