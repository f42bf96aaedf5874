//! XML element model and the incremental stream decoder.

pub mod decoder;
pub mod element;

pub use decoder::{DecodeError, InboundEvent, StreamDecoder};
pub use element::{Element, Node};
