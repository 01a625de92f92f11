//! Log sequence numbers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque position in the replication stream.
///
/// LSNs compare lexicographically. The zero-length LSN means "from the
/// beginning of the stream".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(Vec<u8>);

impl Lsn {
    /// The empty LSN.
    pub const fn beginning() -> Self {
        Self(Vec::new())
    }

    /// Wraps raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encodes a counter so that byte order matches numeric order.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes().to_vec())
    }

    /// Decodes an LSN produced by [`Lsn::from_u64`].
    pub fn to_u64(&self) -> Option<u64> {
        let bytes: [u8; 8] = self.0.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Returns true for the empty LSN.
    pub fn is_beginning(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<beginning>");
        }
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
