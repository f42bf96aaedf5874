//! Stream compression (XEP-0138, zlib only).

use tracing::debug;

use super::{Action, Outcome, Stage, StageContext, StageEnv, StageKind};
use crate::error::Fault;
use crate::protocol::{self, COMPRESSION_ZLIB, NS_COMPRESS, NS_COMPRESS_FEATURE, StreamErrorCondition};
use crate::session::StreamSession;
use crate::xml::Element;

const PENDING: &str = "compress.pending";
const REFUSED: &str = "compress.refused";

pub struct StartCompressionStage;

fn offers_zlib(features: &Element) -> bool {
    features
        .get_child("compression", NS_COMPRESS_FEATURE)
        .is_some_and(|c| c.children().any(|m| m.name() == "method" && m.text().trim() == COMPRESSION_ZLIB))
}

impl Stage for StartCompressionStage {
    fn kind(&self) -> StageKind {
        StageKind::StartCompression
    }

    fn stream_features(&self, session: &StreamSession, env: &StageEnv, features: &mut Vec<Element>) {
        if !env.compression || !session.is_incoming() || session.compressed {
            return;
        }
        features.push(
            Element::new("compression", NS_COMPRESS_FEATURE)
                .with_child(Element::new("method", NS_COMPRESS_FEATURE).with_text(COMPRESSION_ZLIB)),
        );
    }

    fn on_stream_features(
        &self,
        session: &mut StreamSession,
        features: &Element,
        ctx: &mut StageContext<'_>,
    ) -> Result<Outcome, Fault> {
        if !ctx.env.compression || session.compressed || session.scratch(REFUSED).is_some() || !offers_zlib(features) {
            return Ok(Outcome::Continue);
        }
        debug!(session = %session.id(), "S2S: requesting zlib compression");
        session.set_scratch(PENDING, COMPRESSION_ZLIB);
        ctx.send(protocol::compress(COMPRESSION_ZLIB));
        Ok(Outcome::Handled)
    }

    fn on_stanza(&self, session: &mut StreamSession, stanza: &Element, ctx: &mut StageContext<'_>) -> Result<Outcome, Fault> {
        if stanza.ns() != NS_COMPRESS {
            return Ok(Outcome::Declined);
        }
        match (stanza.name(), session.is_incoming()) {
            ("compress", true) => {
                let method = stanza.get_child("method", NS_COMPRESS).map(Element::text).unwrap_or_default();
                if method.trim() != COMPRESSION_ZLIB {
                    ctx.send(protocol::compress_failure("unsupported-method"));
                } else if !ctx.env.compression || session.compressed {
                    ctx.send(protocol::compress_failure("setup-failed"));
                } else {
                    ctx.send(protocol::compressed());
                    ctx.push(Action::UpgradeCompression);
                    ctx.push(Action::RestartStream);
                }
                Ok(Outcome::Handled)
            }
            ("compressed", false) if session.take_scratch(PENDING).is_some() => {
                ctx.push(Action::UpgradeCompression);
                ctx.push(Action::RestartStream);
                Ok(Outcome::Handled)
            }
            ("failure", false) if session.take_scratch(PENDING).is_some() => {
                debug!(session = %session.id(), "S2S: peer refused compression, continuing uncompressed");
                session.set_scratch(REFUSED, "1");
                ctx.push(Action::ReprocessFeatures);
                Ok(Outcome::Handled)
            }
            _ => Err(Fault::protocol(
                StreamErrorCondition::PolicyViolation,
                format!("unexpected <{}/> in compression negotiation", stanza.name()),
            )),
        }
    }
}
