//! XML-RPC wire format: the value model and `methodCall` / `methodResponse`
//! documents.

pub mod codec;
pub mod value;

pub use codec::{MethodResponse, decode_response, encode_call};
pub use value::Value;

use thiserror::Error;

/// The body could not be encoded or was not a well-formed XML-RPC document.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub(crate) fn new(e: impl std::fmt::Display) -> Self {
        CodecError(e.to_string())
    }
}
