//! Stream header exchange and locality checks.

use tracing::debug;

use super::{Action, CloseReason, Outcome, Stage, StageContext, StageKind};
use crate::error::{Fault, S2sError};
use crate::protocol::{NS_SERVER, NS_STREAMS, StreamErrorCondition, StreamHeader};
use crate::session::{SessionState, StreamSession};

pub struct StreamOpenStage;

impl Stage for StreamOpenStage {
    fn kind(&self) -> StageKind {
        StageKind::StreamOpen
    }

    fn on_connected(&self, session: &mut StreamSession, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if session.is_incoming() {
            return Ok(Outcome::Declined);
        }
        let Some(cid) = session.cid.clone() else {
            return Err(Fault::protocol(StreamErrorCondition::InternalServerError, "outgoing session without a CID"));
        };
        ctx.push(Action::SendHeader(StreamHeader::ours(Some(cid.local()), Some(cid.remote()), None, true)));
        session.header_sent = true;
        if session.state() == SessionState::Connecting {
            session.transition(SessionState::StreamOpenSent)?;
        }
        Ok(Outcome::Handled)
    }

    fn on_stream_opened(
        &self,
        session: &mut StreamSession,
        header: &StreamHeader,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if header.stream_ns.as_deref() != Some(NS_STREAMS) {
            return Err(Fault::protocol(StreamErrorCondition::InvalidNamespace, "stream element outside the streams namespace"));
        }
        if header.default_ns.as_deref() != Some(NS_SERVER) {
            return Err(Fault::protocol(
                StreamErrorCondition::InvalidNamespace,
                format!("unsupported content namespace {:?}", header.default_ns),
            ));
        }
        session.peer_header = Some(header.clone());

        if !session.is_incoming() {
            // The receiving server assigns the id that dialback keys are bound to.
            let Some(id) = header.id.clone() else {
                return Err(Fault::protocol(StreamErrorCondition::BadFormat, "stream header without id"));
            };
            session.stream_id = Some(id);
            return Ok(Outcome::Continue);
        }

        let env = ctx.env;
        let local = header.to.as_deref().map(str::to_lowercase).unwrap_or_else(|| env.default_domain.clone());
        if !env.hosted.contains(&local) {
            return Err(Fault::from_error(&S2sError::NotLocalHost(local)));
        }
        if let Some(from) = header.from.as_deref() {
            env.hosted.incoming_cid(&local, from).map_err(|e| Fault::from_error(&e))?;
        }

        let stream_id = uuid::Uuid::new_v4().simple().to_string();
        debug!(session = %session.id(), local = %local, from = ?header.from, "S2S: incoming stream opened");
        ctx.push(Action::SendHeader(StreamHeader::ours(
            Some(&local),
            header.from.as_deref(),
            Some(&stream_id),
            header.supports_features(),
        )));
        session.stream_id = Some(stream_id);
        session.header_sent = true;
        if session.state() == SessionState::Connecting {
            session.transition(SessionState::StreamOpenSent)?;
        }
        Ok(Outcome::Continue)
    }

    fn on_stream_closed(&self, session: &mut StreamSession, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        debug!(session = %session.id(), "S2S: peer closed stream");
        ctx.close(CloseReason::PeerClosed);
        Ok(Outcome::Handled)
    }
}
