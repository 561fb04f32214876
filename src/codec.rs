use crate::error::Result;
use crate::record::{Query, Response};

/// Wire-format boundary of the core.
///
/// The resolver never touches RFC 1035 encoding itself; it hands a [`Query`]
/// to the codec before sending and receives a structured [`Response`] back on
/// the read path. Decode failures cause the datagram to be dropped.
pub trait Codec: Send + Sync {
    fn encode(&self, query: &Query) -> Result<Vec<u8>>;
    fn decode(&self, datagram: &[u8]) -> Result<Response>;
}
