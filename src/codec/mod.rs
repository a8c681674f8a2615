//! C1: pluggable wire framing.
//!
//! Framing and encoding are deliberately separate concerns. Every frame
//! on the wire — the handshake `Option`, every `Header`, every body — is
//! a 4-byte big-endian length prefix followed by that many bytes, full
//! stop; that part never changes. What goes *inside* the bytes is the
//! codec's business, selected per connection by `Option.codec`. The
//! default, and only codec this crate ships, is [`bincode::BincodeCodec`].

mod bincode;

pub use self::bincode::BincodeCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// The maximum frame size this crate will read before giving up and
/// treating the stream as corrupt. Guards against a peer that sends a
/// bogus length prefix and would otherwise make us allocate unbounded
/// memory waiting for bytes that will never arrive.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// One request/response header. `error` is empty on a request and on a
/// successful response; non-empty when the server reports a failure for
/// that `seq`.
#[derive(Debug, Clone, Serialize, serde::Deserialize, Default)]
pub struct Header {
    /// `"<Service>.<Method>"`.
    pub service_method: String,
    /// Echoes the client's per-connection sequence number.
    pub seq: u64,
    /// Empty on success; the error text on failure.
    pub error: String,
}

impl Header {
    pub(crate) fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Header {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }
}

/// A pluggable body encoding. `Header`s and bodies both go through it;
/// only the length-prefix framing around them is fixed.
///
/// This trait intentionally has generic methods, so it is not a trait
/// object — a connection's codec is chosen once, at construction, and
/// threaded through as a concrete type parameter from then on.
pub trait WireCodec: Clone + Send + Sync + 'static {
    /// The name advertised in `Option.codec` and matched against it.
    fn name(&self) -> &'static str;

    /// Serialize `val` to bytes for one frame's payload.
    fn encode<T: Serialize>(&self, val: &T) -> Result<Vec<u8>>;

    /// Deserialize one frame's payload back into `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Read one length-prefixed frame off `reader`.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Decode(format!(
            "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write one length-prefixed frame to `writer`. Does not flush; callers
/// writing a header immediately followed by a body flush once, after
/// both, so the pair reaches the peer as a unit.
pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}
