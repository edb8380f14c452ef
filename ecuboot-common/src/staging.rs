// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Staging buffer between the transfer receiver and flash.
//!
//! Ciphertext is accumulated until a whole cipher chunk is available
//! (`Full`). The owner then deciphers the chunk in place, flushes it to
//! flash and resets the stage. A short final chunk is sealed instead:
//! padded up to the flash write alignment.

/// Fill state of a [`ChunkStage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StageState {
    Filling,
    Full,
}

pub struct ChunkStage<'a> {
    buf: &'a mut [u8],
    len: usize,
    pad: u8,
}

impl<'a> ChunkStage<'a> {
    pub fn new(buf: &'a mut [u8], pad: u8) -> Self {
        buf.fill(pad);
        Self { buf, len: 0, pad }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> StageState {
        if self.len == self.buf.len() {
            StageState::Full
        } else {
            StageState::Filling
        }
    }

    /// Append as much of `data` as fits. Returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// The staged bytes.
    pub fn chunk_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }

    /// Pad the staged bytes with the pad byte up to a multiple of `align`
    /// and return the padded block. Aligned content gets no padding.
    pub fn seal(&mut self, align: usize) -> &[u8] {
        let padded = if align == 0 {
            self.len
        } else {
            self.len.next_multiple_of(align).min(self.buf.len())
        };
        self.buf[self.len..padded].fill(self.pad);
        &self.buf[..padded]
    }

    /// Empty the stage and restore the pad pattern.
    pub fn reset(&mut self) {
        self.buf.fill(self.pad);
        self.len = 0;
    }

    /// The whole buffer, for use as scratch space while no chunk is staged.
    /// The stage is emptied.
    pub fn scratch(&mut self) -> &mut [u8] {
        self.len = 0;
        &mut self.buf[..]
    }
}
