//! The handshake record sent as the first frame of every connection, and
//! the crate's connection-level configuration surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Magic number every connection's handshake frame must carry. A server
/// that reads anything else hangs up without responding.
pub const MAGIC_NUMBER: u32 = 0x3BEF5C;

/// The name of the codec this crate ships by default: a self-describing
/// binary encoding of serde types, the same role the original tutorial's
/// `application/gob` codec plays.
pub const DEFAULT_CODEC: &str = "bincode";

/// The handshake record sent as the very first frame of every new
/// connection, before any `Header`/body pair. Doubles as this crate's
/// connection-level configuration surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOption {
    /// Must equal [`MAGIC_NUMBER`]; anything else and the peer hangs up.
    pub magic: u32,
    /// Name of the codec the sender will use for every subsequent frame.
    pub codec: String,
    /// How long the client is willing to wait for the connection to be
    /// established (dial-side only; not enforced by the server).
    pub connect_timeout: Duration,
    /// How long the server will let a dispatched call run, end to end,
    /// before abandoning it and returning a timeout error. Zero disables
    /// the limit.
    pub handle_timeout: Duration,
}

impl Default for ConnectOption {
    fn default() -> Self {
        ConnectOption {
            magic: MAGIC_NUMBER,
            codec: DEFAULT_CODEC.to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl ConnectOption {
    /// `true` if `magic` is the value every client in this protocol must
    /// send.
    pub(crate) fn magic_is_valid(&self) -> bool {
        self.magic == MAGIC_NUMBER
    }
}
