//! Chain tip snapshot shared by nodes and wallets.

use std::fmt;

/// Length of a block hash in bytes.
pub const HASH_LEN: usize = 32;

/// A (height, hash) pair identifying the most recent block of a chain.
///
/// The hash is kept in internal byte order, the order the wallet returns it
/// in. Node RPC reports display-order hex which must go through
/// [`ChainTip::from_display_hex`]. Two tips agree only when both fields match;
/// equal heights alone mean nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainTip {
    /// Block height.
    pub height: u32,
    /// Block hash, internal byte order.
    pub hash: [u8; HASH_LEN],
}

impl ChainTip {
    /// Tip from a height and an internal-order hash.
    pub fn new(height: u32, hash: [u8; HASH_LEN]) -> Self {
        Self { height, hash }
    }

    /// Build a tip from internal-order hash bytes as sent over the wallet RPC.
    pub fn from_internal_bytes(height: u32, bytes: &[u8]) -> Result<Self, String> {
        let hash: [u8; HASH_LEN] = bytes
            .try_into()
            .map_err(|_| format!("block hash must be {HASH_LEN} bytes, got {}", bytes.len()))?;
        Ok(Self { height, hash })
    }

    /// Build a tip from a display-order (byte reversed) hex hash as the node
    /// JSON-RPC reports it.
    pub fn from_display_hex(height: u64, hex_hash: &str) -> Result<Self, String> {
        let height =
            u32::try_from(height).map_err(|_| format!("block height {height} out of range"))?;
        let mut bytes =
            hex::decode(hex_hash).map_err(|e| format!("invalid block hash {hex_hash:?}: {e}"))?;
        bytes.reverse();
        Self::from_internal_bytes(height, &bytes)
    }

    /// Hash rendered in display order, matching block explorers and node logs.
    pub fn display_hex(&self) -> String {
        let mut bytes = self.hash;
        bytes.reverse();
        hex::encode(bytes)
    }
}

impl fmt::Display for ChainTip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.height, self.display_hex())
    }
}
