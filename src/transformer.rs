use serde_json::Value;

use crate::errors::RpcError;

/// Data transformer applied to every payload crossing a port.
///
/// The client serializes inputs and deserializes results, the server
/// deserializes inputs and serializes results and stream items. Both sides
/// must be configured with matching transformers.
pub trait Transformer: Send + Sync + 'static {
    /// prepare a value for the wire
    fn serialize(&self, value: Value) -> Result<Value, RpcError>;
    /// restore a value received from the wire
    fn deserialize(&self, value: Value) -> Result<Value, RpcError>;
}

/// Pass values through unchanged, the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Transformer for Identity {
    fn serialize(&self, value: Value) -> Result<Value, RpcError> {
        Ok(value)
    }

    fn deserialize(&self, value: Value) -> Result<Value, RpcError> {
        Ok(value)
    }
}
