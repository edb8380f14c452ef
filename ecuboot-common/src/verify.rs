// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Firmware authenticity checks.
//!
//! The header is authenticated by an ECDSA signature over the SHA-256 of
//! its unsigned part. The binary is then authenticated against the hash
//! stored in the header, fed in as it is read back from flash.

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::image::{FirmwareHeader, PublicKey, HASH_LEN, SIGNATURE_LEN};

/// Signature primitive used to authenticate headers.
pub trait SignatureVerifier {
    /// Whether `signature` (r then s, big-endian) signs the SHA-256 `digest`.
    fn verify_prehash(&self, key: &PublicKey, digest: &[u8; HASH_LEN], signature: &[u8; SIGNATURE_LEN]) -> bool;
}

/// ECDSA over NIST P-256.
#[cfg(feature = "p256")]
#[derive(Clone, Copy, Debug, Default)]
pub struct P256Verifier;

#[cfg(feature = "p256")]
impl SignatureVerifier for P256Verifier {
    fn verify_prehash(&self, key: &PublicKey, digest: &[u8; HASH_LEN], signature: &[u8; SIGNATURE_LEN]) -> bool {
        use p256::ecdsa::signature::hazmat::PrehashVerifier;
        use p256::ecdsa::{Signature, VerifyingKey};

        // SEC1 uncompressed point: 0x04 || x || y
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(key);
        let Ok(key) = VerifyingKey::from_sec1_bytes(&sec1) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify_prehash(digest, &signature).is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyError {
    #[error("header signature is invalid")]
    InvalidSignature,
    #[error("more data than the declared firmware size")]
    OutOfBounds,
    #[error("firmware hash does not match the header")]
    HashMismatch,
}

impl VerifyError {
    /// Nonzero code reported for the failure.
    pub fn code(self) -> i8 {
        match self {
            VerifyError::InvalidSignature => -1,
            VerifyError::OutOfBounds => -2,
            VerifyError::HashMismatch => -3,
        }
    }
}

/// State of an incremental binary check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Progress {
    Incomplete,
    Complete,
}

/// SHA-256 of the signed part of `header`.
pub fn header_digest(header: &FirmwareHeader) -> [u8; HASH_LEN] {
    Sha256::digest(header.signed_bytes()).into()
}

pub fn verify_header(header: &FirmwareHeader, key: &PublicKey, verifier: &dyn SignatureVerifier) -> Result<(), VerifyError> {
    if verifier.verify_prehash(key, &header_digest(header), &header.signature) {
        Ok(())
    } else {
        warn!("verify: header signature rejected");
        Err(VerifyError::InvalidSignature)
    }
}

/// Running hash of a binary against an authenticated header.
#[derive(Clone)]
pub struct FirmwareVerifier {
    hasher: Sha256,
    processed: u32,
    size: u32,
    expected: [u8; HASH_LEN],
}

impl FirmwareVerifier {
    /// Authenticate `header` and prepare to hash the binary it describes.
    pub fn new(header: &FirmwareHeader, key: &PublicKey, verifier: &dyn SignatureVerifier) -> Result<Self, VerifyError> {
        verify_header(header, key, verifier)?;
        Ok(Self {
            hasher: Sha256::new(),
            processed: 0,
            size: header.info.size(),
            expected: header.hash,
        })
    }

    pub fn processed(&self) -> u32 {
        self.processed
    }

    /// Feed the next bytes of the binary. The hash is compared once the
    /// declared size has been reached.
    pub fn update(&mut self, data: &[u8]) -> Result<Progress, VerifyError> {
        let len = u32::try_from(data.len()).map_err(|_| VerifyError::OutOfBounds)?;
        if self.processed.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(VerifyError::OutOfBounds);
        }
        self.hasher.update(data);
        self.processed += len;
        if self.processed < self.size {
            return Ok(Progress::Incomplete);
        }

        let actual: [u8; HASH_LEN] = self.hasher.clone().finalize().into();
        if actual == self.expected {
            Ok(Progress::Complete)
        } else {
            warn!("verify: firmware hash mismatch after {} bytes", self.processed);
            Err(VerifyError::HashMismatch)
        }
    }
}
