//! Bounds-checked access to guest linear memory.

use std::ops::Range;
use wasmgate_core::{VmError, VmResult, WASM32_WORD_SIZE, Word};

/// Guest linear memory as seen by the host
pub trait GuestMemory {
    /// Current memory size in bytes
    fn size(&self) -> u64;

    /// Copy `len` bytes starting at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory
    fn read(&self, offset: u64, len: u64) -> VmResult<Vec<u8>>;

    /// Copy `data` into memory at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory
    fn write(&mut self, offset: u64, data: &[u8]) -> VmResult<()>;

    /// Read a wasm32 word at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory
    fn read_word(&self, offset: u64) -> VmResult<Word> {
        read_word_with(offset, |offset, len| self.read(offset, len))
    }

    /// Write a wasm32 word at `offset`
    ///
    /// # Errors
    ///
    /// Returns error if the range is outside linear memory or the word
    /// does not fit in 32 bits
    fn write_word(&mut self, offset: u64, word: Word) -> VmResult<()> {
        write_word_with(offset, word, |offset, bytes| self.write(offset, bytes))
    }
}

const WORD_LEN: u64 = WASM32_WORD_SIZE as u64;

/// Read a wasm32 word through any byte reader
pub(crate) fn read_word_with<F>(offset: u64, read: F) -> VmResult<Word>
where
    F: FnOnce(u64, u64) -> VmResult<Vec<u8>>,
{
    let bytes = read(offset, WORD_LEN)?;
    <[u8; WASM32_WORD_SIZE]>::try_from(bytes.as_slice())
        .map(Word::from_wasm32_bytes)
        .map_err(|_| VmError::MemoryOutOfBounds {
            offset,
            length: WORD_LEN,
        })
}

/// Write a wasm32 word through any byte writer
pub(crate) fn write_word_with<F>(offset: u64, word: Word, write: F) -> VmResult<()>
where
    F: FnOnce(u64, &[u8]) -> VmResult<()>,
{
    write(offset, &word.to_wasm32_bytes()?)
}

/// Linear memory backed by a borrowed byte slice
pub struct LinearMemory<'a> {
    bytes: &'a mut [u8],
}

impl<'a> LinearMemory<'a> {
    /// Wrap an engine's memory bytes
    #[must_use]
    pub fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes }
    }

    /// Memory for a guest without exported linear memory
    #[must_use]
    pub fn empty() -> Self {
        Self { bytes: &mut [] }
    }

    fn range(&self, offset: u64, len: u64) -> VmResult<Range<usize>> {
        let out_of_bounds = || VmError::MemoryOutOfBounds {
            offset,
            length: len,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > self.bytes.len() {
            return Err(out_of_bounds());
        }
        Ok(start..end)
    }
}

impl GuestMemory for LinearMemory<'_> {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&self, offset: u64, len: u64) -> VmResult<Vec<u8>> {
        let range = self.range(offset, len)?;
        Ok(self.bytes[range].to_vec())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> VmResult<()> {
        let range = self.range(offset, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}
