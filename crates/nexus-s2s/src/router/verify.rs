//! Dialback verification: dial the claimed origin and ask it whether a key
//! it supposedly issued is genuine.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::driver::SessionDriver;
use super::{RouterInner, SessionCommand};
use crate::cid::Cid;
use crate::error::S2sError;
use crate::pipeline::Verdict;
use crate::session::{StreamSession, VerifyRequest};

impl RouterInner {
    /// Check `key` for `cid` (local = receiving, remote = claimed origin) in
    /// the background. The verdict comes back to `reply_to` as
    /// [`SessionCommand::Verdict`]; no answer within the verify timeout is
    /// [`Verdict::TimedOut`].
    ///
    /// Aborting the returned handle drops the verification connection.
    pub(crate) fn spawn_verification(
        self: Arc<Self>,
        reply_to: mpsc::UnboundedSender<SessionCommand>,
        cid: Cid,
        stream_id: String,
        key: String,
    ) -> AbortHandle {
        let inner = self.clone();
        self.spawn(async move {
            let deadline = inner.config.verify_timeout;
            let verdict = match tokio::time::timeout(deadline, inner.verify_key(&cid, stream_id, key)).await {
                Ok(Ok(true)) => Verdict::Valid,
                Ok(Ok(false)) => Verdict::Invalid,
                Ok(Err(e)) => {
                    warn!(cid = %cid, error = %e, "S2S: dialback verification failed");
                    Verdict::Invalid
                }
                Err(_) => {
                    warn!(cid = %cid, timeout = ?deadline, "S2S: dialback verification timed out");
                    Verdict::TimedOut
                }
            };
            // The session may be gone already.
            let _ = reply_to.send(SessionCommand::Verdict { cid, verdict });
        })
    }

    /// Open a verification-only session to the claimed origin and drive it
    /// until the origin answers our `db:verify`.
    async fn verify_key(self: &Arc<Self>, cid: &Cid, stream_id: String, key: String) -> Result<bool, S2sError> {
        debug!(cid = %cid, "S2S: opening verification connection");
        let transport = self.connector.connect(cid).await?;

        let mut session = StreamSession::outgoing(cid.clone(), self.config.auth_timeout);
        session.verify = Some(VerifyRequest {
            stream_id,
            receiving: cid.local().to_owned(),
            originating: cid.remote().to_owned(),
            key,
        });
        let (verdict_tx, verdict_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        SessionDriver::new(self.clone(), session, transport, tx, rx).with_verdict(verdict_tx).run().await;

        // Closed without an answer counts as invalid.
        Ok(verdict_rx.await.unwrap_or(false))
    }
}
