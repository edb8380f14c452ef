// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Chunk cipher applied to the firmware binary in transit.
//!
//! The binary is split in chunks of the bootloader's staging size and each
//! chunk is enciphered on its own with Corrected Block TEA (XXTEA). Only
//! whole little-endian 32-bit words take part; a trailing partial word and
//! blocks shorter than two words pass through unchanged.

const DELTA: u32 = 0x9E37_79B9;

/// In-place block cipher over one staging chunk.
pub trait ChunkCipher {
    fn encrypt(&self, block: &mut [u8]);
    fn decrypt(&self, block: &mut [u8]);
}

/// XXTEA keyed by a pre-shared 128-bit key.
#[derive(Clone)]
pub struct Xxtea {
    key: [u32; 4],
}

impl Xxtea {
    pub const fn new(key: [u32; 4]) -> Self {
        Self { key }
    }

    /// Key from 16 bytes, read as four little-endian words.
    pub fn from_bytes(key: &[u8; 16]) -> Self {
        Self::new(core::array::from_fn(|i| word(key, i)))
    }

    fn mx(&self, sum: u32, y: u32, z: u32, p: usize, e: usize) -> u32 {
        (((z >> 5) ^ (y << 2)).wrapping_add((y >> 3) ^ (z << 4)))
            ^ ((sum ^ y).wrapping_add(self.key[(p & 3) ^ e] ^ z))
    }
}

impl ChunkCipher for Xxtea {
    fn encrypt(&self, block: &mut [u8]) {
        let n = block.len() / 4;
        if n < 2 {
            return;
        }
        let mut rounds = 6 + 52 / n;
        let mut sum = 0u32;
        let mut z = word(block, n - 1);
        while rounds > 0 {
            sum = sum.wrapping_add(DELTA);
            let e = ((sum >> 2) & 3) as usize;
            for p in 0..n - 1 {
                let y = word(block, p + 1);
                z = word(block, p).wrapping_add(self.mx(sum, y, z, p, e));
                set_word(block, p, z);
            }
            let y = word(block, 0);
            z = word(block, n - 1).wrapping_add(self.mx(sum, y, z, n - 1, e));
            set_word(block, n - 1, z);
            rounds -= 1;
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        let n = block.len() / 4;
        if n < 2 {
            return;
        }
        let mut rounds = 6 + 52 / n;
        let mut sum = (rounds as u32).wrapping_mul(DELTA);
        let mut y = word(block, 0);
        while rounds > 0 {
            let e = ((sum >> 2) & 3) as usize;
            for p in (1..n).rev() {
                let z = word(block, p - 1);
                y = word(block, p).wrapping_sub(self.mx(sum, y, z, p, e));
                set_word(block, p, y);
            }
            let z = word(block, n - 1);
            y = word(block, 0).wrapping_sub(self.mx(sum, y, z, 0, e));
            set_word(block, 0, y);
            sum = sum.wrapping_sub(DELTA);
            rounds -= 1;
        }
    }
}

/// Encrypt a plaintext binary the way the bootloader will decrypt it:
/// chunk by chunk from the first byte, the last chunk possibly short.
pub fn encrypt_image(cipher: &dyn ChunkCipher, chunk_size: usize, binary: &mut [u8]) {
    if chunk_size == 0 {
        return;
    }
    for chunk in binary.chunks_mut(chunk_size) {
        cipher.encrypt(chunk);
    }
}

/// Inverse of [`encrypt_image`].
pub fn decrypt_image(cipher: &dyn ChunkCipher, chunk_size: usize, binary: &mut [u8]) {
    if chunk_size == 0 {
        return;
    }
    for chunk in binary.chunks_mut(chunk_size) {
        cipher.decrypt(chunk);
    }
}

fn word(buf: &[u8], i: usize) -> u32 {
    let b = &buf[i * 4..i * 4 + 4];
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn set_word(buf: &mut [u8], i: usize, value: u32) {
    buf[i * 4..i * 4 + 4].copy_from_slice(&value.to_le_bytes());
}
