//! Per-connection stream state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cid::Cid;
use crate::error::Fault;
use crate::protocol::{StreamErrorCondition, StreamHeader};
use crate::transport::TlsInfo;
use crate::xml::Element;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s2s-{}", self.0)
    }
}

// ─── State machine ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    Tls,
    /// SASL EXTERNAL over the TLS certificate.
    Sasl,
    Dialback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connecting,
    StreamOpenSent,
    AwaitingFeatures,
    Authenticating(AuthMechanism),
    Established,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use AuthMechanism::*;
        use SessionState::*;

        if matches!(next, Closing | Closed) {
            return !matches!(self, Closed) && !(matches!(self, Closing) && next == Closing);
        }
        match (self, next) {
            (Connecting, StreamOpenSent) => true,
            // Legacy peers go straight to dialback after the header.
            (StreamOpenSent, AwaitingFeatures | Authenticating(Dialback)) => true,
            // A restarted stream re-enters feature negotiation.
            (AwaitingFeatures, AwaitingFeatures | Authenticating(_)) => true,
            (Authenticating(Tls), AwaitingFeatures | Established) => true,
            (Authenticating(Sasl), Established) => true,
            // A refused certificate falls back to dialback on the same stream.
            (Authenticating(Sasl), Authenticating(Dialback)) => true,
            (Authenticating(Dialback), Established) => true,
            _ => false,
        }
    }

    pub fn is_authenticating(&self) -> bool {
        matches!(self, Self::Authenticating(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We initiated the connection.
    Outgoing,
    /// The peer initiated the connection.
    Incoming,
}

/// A `db:verify` to be sent on a verification-only outgoing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyRequest {
    /// Stream id of the incoming session whose key is being checked.
    pub stream_id: String,
    /// Domain that received the `db:result` (us).
    pub receiving: String,
    /// Domain the `db:result` claimed to come from.
    pub originating: String,
    pub key: String,
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Mutable record of one physical federation connection.
///
/// Owned by the task driving the connection; pipeline stages receive it by
/// `&mut` and nothing else touches it.
#[derive(Debug)]
pub struct StreamSession {
    id: SessionId,
    direction: Direction,
    state: SessionState,
    /// Outgoing: the link this connection was opened for. Incoming: the
    /// first CID that authenticated on it.
    pub cid: Option<Cid>,
    authenticated: HashSet<Cid>,
    pending: HashSet<Cid>,
    /// Id of the stream: assigned by us on incoming sessions, by the peer on outgoing ones.
    pub stream_id: Option<String>,
    pub peer_header: Option<StreamHeader>,
    /// Our header has been written for the current stream.
    pub header_sent: bool,
    pub tls: Option<TlsInfo>,
    pub compressed: bool,
    /// Last `<stream:features/>` received (outgoing sessions only).
    pub peer_features: Option<Element>,
    /// Set on connections opened only to check a dialback key.
    pub verify: Option<VerifyRequest>,
    auth_timeout: Duration,
    deadline: Option<Instant>,
    last_activity: Instant,
    scratch: HashMap<String, String>,
}

impl StreamSession {
    pub fn new(direction: Direction, cid: Option<Cid>, auth_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::next(),
            direction,
            state: SessionState::Connecting,
            cid,
            authenticated: HashSet::new(),
            pending: HashSet::new(),
            stream_id: None,
            peer_header: None,
            header_sent: false,
            tls: None,
            compressed: false,
            peer_features: None,
            verify: None,
            auth_timeout,
            deadline: Some(now + auth_timeout),
            last_activity: now,
            scratch: HashMap::new(),
        }
    }

    pub fn outgoing(cid: Cid, auth_timeout: Duration) -> Self {
        Self::new(Direction::Outgoing, Some(cid), auth_timeout)
    }

    pub fn incoming(auth_timeout: Duration) -> Self {
        Self::new(Direction::Incoming, None, auth_timeout)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Direction::Incoming
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, refusing edges the state machine does not allow.
    ///
    /// Entering `Authenticating` arms a fresh deadline; reaching
    /// `Established` disarms it.
    pub fn transition(&mut self, next: SessionState) -> Result<(), Fault> {
        if self.state == next && next == SessionState::AwaitingFeatures {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Fault::protocol(
                StreamErrorCondition::PolicyViolation,
                format!("unexpected {next:?} while {:?}", self.state),
            ));
        }
        debug!(session = %self.id, from = ?self.state, to = ?next, "S2S: state transition");
        self.state = next;
        match next {
            SessionState::Authenticating(_) => self.deadline = Some(Instant::now() + self.auth_timeout),
            SessionState::Established | SessionState::Closed => self.deadline = None,
            _ => {}
        }
        Ok(())
    }

    /// Deadline by which the session must authenticate, if still armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    // ── Authentication ───────────────────────────────────────────────────────

    /// Record `cid` as verified on this connection.
    pub fn authenticate(&mut self, cid: Cid) {
        self.pending.remove(&cid);
        if self.cid.is_none() {
            self.cid = Some(cid.clone());
        }
        self.authenticated.insert(cid);
    }

    pub fn is_authenticated(&self, cid: &Cid) -> bool {
        self.authenticated.contains(cid)
    }

    pub fn authenticated(&self) -> impl Iterator<Item = &Cid> {
        self.authenticated.iter()
    }

    /// Mark a dialback claim as awaiting verification. False if it already is.
    pub fn begin_verification(&mut self, cid: Cid) -> bool {
        self.pending.insert(cid)
    }

    pub fn end_verification(&mut self, cid: &Cid) -> bool {
        self.pending.remove(cid)
    }

    pub fn is_pending(&self, cid: &Cid) -> bool {
        self.pending.contains(cid)
    }

    /// Dialback claims still waiting for a verdict.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Authenticated by a trusted certificate rather than by dialback.
    pub fn tls_trusted(&self) -> bool {
        self.tls.as_ref().is_some_and(TlsInfo::is_trusted)
    }

    // ── Stage-local scratch data ─────────────────────────────────────────────

    pub fn scratch(&self, key: &str) -> Option<&str> {
        self.scratch.get(key).map(String::as_str)
    }

    pub fn set_scratch(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.scratch.insert(key.into(), value.into());
    }

    pub fn take_scratch(&mut self, key: &str) -> Option<String> {
        self.scratch.remove(key)
    }

    /// Clear per-stream negotiation state after a security or compression layer change.
    pub fn restart_stream(&mut self) {
        self.header_sent = false;
        self.peer_header = None;
        self.peer_features = None;
        if self.is_incoming() {
            self.stream_id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> StreamSession {
        StreamSession::outgoing(Cid::new("a.example", "b.example"), Duration::from_secs(30))
    }

    #[test]
    fn happy_path_through_dialback() {
        let mut s = session();
        s.transition(SessionState::StreamOpenSent).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
        s.transition(SessionState::Authenticating(AuthMechanism::Dialback)).unwrap();
        assert!(s.deadline().is_some());
        s.transition(SessionState::Established).unwrap();
        assert_eq!(s.deadline(), None);
    }

    #[test]
    fn tls_returns_to_feature_negotiation() {
        let mut s = session();
        s.transition(SessionState::StreamOpenSent).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
        s.transition(SessionState::Authenticating(AuthMechanism::Tls)).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
    }

    #[test]
    fn refused_sasl_falls_back_to_dialback() {
        let mut s = session();
        s.transition(SessionState::StreamOpenSent).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
        s.transition(SessionState::Authenticating(AuthMechanism::Sasl)).unwrap();
        s.transition(SessionState::Authenticating(AuthMechanism::Dialback)).unwrap();
        assert!(!s.state().can_transition_to(SessionState::Authenticating(AuthMechanism::Sasl)));
        s.transition(SessionState::Established).unwrap();
    }

    #[test]
    fn closed_is_terminal() {
        let mut s = session();
        s.transition(SessionState::Closing).unwrap();
        s.transition(SessionState::Closed).unwrap();
        for next in [
            SessionState::Connecting,
            SessionState::StreamOpenSent,
            SessionState::Established,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert!(s.transition(next).is_err(), "left Closed for {next:?}");
        }
    }

    #[test]
    fn cannot_skip_authentication() {
        let mut s = session();
        s.transition(SessionState::StreamOpenSent).unwrap();
        s.transition(SessionState::AwaitingFeatures).unwrap();
        let err = s.transition(SessionState::Established).unwrap_err();
        assert_eq!(err.condition, Some(StreamErrorCondition::PolicyViolation));
    }

    #[test]
    fn multiplexed_authentication() {
        let mut s = StreamSession::incoming(Duration::from_secs(30));
        let first = Cid::new("b.example", "a.example");
        let second = Cid::new("b.example", "c.example");
        assert!(s.begin_verification(first.clone()));
        assert!(!s.begin_verification(first.clone()));
        s.authenticate(first.clone());
        s.authenticate(second.clone());
        assert_eq!(s.cid.as_ref(), Some(&first));
        assert!(s.is_authenticated(&second));
        assert!(!s.is_pending(&first));
    }
}
