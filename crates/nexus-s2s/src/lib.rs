//! # nexus-s2s
//!
//! XMPP server-to-server federation core for Nexus.
//!
//! ## Architecture
//!
//! ```text
//!  local sender ──► FederationRouter ──► ConnectionPool(a.example@b.example)
//!                        │                     │  selector: hash(sender)
//!                        │                     ▼
//!                        │               session task ──► Transport ──► b.example
//!                        │                     ▲
//!                        │                     │ pipeline: StreamOpen → StreamError →
//!                        │                     │ StreamFeatures → StartTLS →
//!                        │                     │ StartCompression → Dialback
//!                        ▼
//!                   StanzaSink ◄── stanzas accepted on authenticated incoming streams
//! ```
//!
//! ## Key concepts
//!
//! - **CID** (`cid.rs`): the directed `(local, remote)` domain pair a
//!   connection is authorized for. One incoming connection may carry several.
//! - **Pipeline** (`pipeline/`): six protocol stages in fixed priority order.
//!   Stages never touch the network; they mutate the session and queue actions.
//! - **Dialback** (`pipeline/dialback.rs`, `key.rs`): HMAC keys bound to the
//!   stream id, verified by calling the claimed origin back.
//! - **Pool and selector** (`pool.rs`, `selector.rs`): a bounded set of
//!   outgoing connections per CID, with a reserved system connection and
//!   sender-sticky selection so each sender's stanzas stay in order.
//! - **Router** (`router/`): one task per physical connection, driven by the
//!   pipeline and addressed through a command queue.
//!
//! Sockets, DNS and the TLS handshake live behind [`transport::Transport`]
//! and [`transport::Connector`]; [`transport::MemoryTransport`] wires two
//! routers together in-process.

pub mod cid;
pub mod config;
pub mod error;
pub mod key;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod selector;
pub mod session;
pub mod sink;
pub mod transport;
pub mod xml;

pub use cid::{Cid, HostedDomains};
pub use config::RouterConfig;
pub use error::{Fault, FaultKind, S2sError};
pub use router::{FederationRouter, PoolSnapshot, RouterBuilder, RouterEvent, SendStatus, SessionCommand};
pub use selector::{ConnectionSelector, HashSelector, Priority};
pub use sink::{ChannelSink, DeliveryError, StanzaSink};
pub use xml::Element;
