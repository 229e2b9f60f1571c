//! The fixed-width value crossing the host/guest boundary.
//!
//! Every argument and every return value is carried as exactly one
//! [`Word`], whatever the native width on either side. Narrowing to the
//! 32-bit guest representation is always spelled out at the call site:
//! [`Word::to_u32`] is checked, [`Word::as_u32`] truncates.

use crate::error::WordError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size in bytes of a word stored in wasm32 linear memory.
pub const WASM32_WORD_SIZE: usize = 4;

/// A boundary value: a 64-bit container read as an integer or a
/// guest pointer.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Word(u64);

impl Word {
    /// The zero word
    pub const ZERO: Self = Self(0);

    /// Create a word from a raw 64-bit value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Widen a native 32-bit value
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value as u64)
    }

    /// Widen a guest `i32` by its bit pattern (no sign extension)
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        Self(value as u32 as u64)
    }

    /// Reinterpret a guest `i64`
    #[must_use]
    pub const fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn u64(self) -> u64 {
        self.0
    }

    /// Narrow to 32 bits
    ///
    /// # Errors
    ///
    /// Returns error if the value does not fit in 32 bits
    pub fn to_u32(self) -> Result<u32, WordError> {
        u32::try_from(self.0).map_err(|_| WordError::Overflow(self.0))
    }

    /// Narrow to 32 bits, discarding the high half
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0 as u32
    }

    /// Low 32 bits as a guest `i32`
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    /// All 64 bits as a guest `i64`
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    /// Check for zero
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Encode as a wasm32 memory word (little endian)
    ///
    /// # Errors
    ///
    /// Returns error if the value does not fit in 32 bits
    pub fn to_wasm32_bytes(self) -> Result<[u8; WASM32_WORD_SIZE], WordError> {
        Ok(self.to_u32()?.to_le_bytes())
    }

    /// Decode a wasm32 memory word (little endian)
    #[must_use]
    pub const fn from_wasm32_bytes(bytes: [u8; WASM32_WORD_SIZE]) -> Self {
        Self::from_u32(u32::from_le_bytes(bytes))
    }
}

impl From<u32> for Word {
    fn from(value: u32) -> Self {
        Self::from_u32(value)
    }
}

impl From<u64> for Word {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<bool> for Word {
    fn from(value: bool) -> Self {
        Self(u64::from(value))
    }
}

impl From<Word> for u64 {
    fn from(word: Word) -> Self {
        word.0
    }
}

impl TryFrom<Word> for u32 {
    type Error = WordError;

    fn try_from(word: Word) -> Result<Self, Self::Error> {
        word.to_u32()
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
