//! # nexus-common
//!
//! Shared configuration and addressing primitives used across the Nexus
//! federation crates. No protocol logic lives here.

pub mod config;
pub mod jid;

pub use jid::{Jid, JidError};
