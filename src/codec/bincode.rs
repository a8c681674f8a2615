use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::option::DEFAULT_CODEC;

use super::WireCodec;

/// The codec this crate ships: serde's derive machinery plus `bincode`'s
/// compact binary encoding. Plays the role the original tutorial's
/// `application/gob` codec plays — a reflective, self-describing binary
/// format — without requiring a second implementation to exist before
/// the pluggability contract in [`WireCodec`] means anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl WireCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        DEFAULT_CODEC
    }

    fn encode<T: Serialize>(&self, val: &T) -> Result<Vec<u8>> {
        bincode::serialize(val).map_err(Error::encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(Error::decode)
    }
}
