//! Byte level transport of [Message](crate::messages::Message)s.

mod convert;
mod encoding;
pub mod proto;

use core::fmt::Debug;

pub use convert::ConversionError;
pub use encoding::{decode, encode, ProtoBufEncodingLayer};

use crate::{abiencode::types::Address, engine::messageservice::MessageError};

/// Low-level abstraction over the network: delivers opaque frames to peers.
pub trait BytesBus: Debug + Send {
    fn send_to_peer(&self, to: &Address, frame: &[u8]) -> Result<(), MessageError>;
}
