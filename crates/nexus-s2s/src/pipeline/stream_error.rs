//! Stream errors reported by the peer.

use tracing::warn;

use super::{CloseReason, Outcome, Stage, StageContext, StageKind};
use crate::error::Fault;
use crate::protocol::{self, StreamErrorCondition};
use crate::session::StreamSession;
use crate::xml::Element;

/// Logs a received `<stream:error/>` and tears the session down without
/// answering with an error of our own.
pub struct StreamErrorStage;

impl Stage for StreamErrorStage {
    fn kind(&self) -> StageKind {
        StageKind::StreamError
    }

    fn on_stanza(&self, session: &mut StreamSession, stanza: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if !protocol::is_stream_error(stanza) {
            return Ok(Outcome::Declined);
        }
        let condition = StreamErrorCondition::from_element(stanza);
        warn!(
            session = %session.id(),
            cid = ?session.cid,
            condition = ?condition,
            "S2S: peer reported stream error"
        );
        ctx.close(CloseReason::Fault(Fault::remote(condition)));
        Ok(Outcome::Handled)
    }
}
