//! Strong-name public key blobs.
//!
//! A strong-name key as stored in the `Assembly` table is a 12-byte header followed by a CSP
//! `PUBLICKEYBLOB`:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | signature algorithm, `CALG_RSA_SIGN` (`0x00002400`) |
//! | 4 | 4 | hash algorithm, `CALG_SHA1` (`0x00008004`) |
//! | 8 | 4 | length `L` of the blob that follows |
//! | 12 | 8 | `BLOBHEADER`: type `0x06`, version `0x02`, reserved, `CALG_RSA_SIGN` |
//! | 20 | 12 | `RSAPUBKEY`: `"RSA1"`, bit length, public exponent |
//! | 32 | bitlen/8 | modulus, little-endian |

use crate::{
    file::io::{read_le_at, write_le_at},
    identity::PublicKeyToken,
    Result,
};

/// `CALG_RSA_SIGN`
pub const CALG_RSA_SIGN: u32 = 0x0000_2400;
/// `CALG_SHA1`
pub const CALG_SHA1: u32 = 0x0000_8004;
/// Size of the strong-name header in front of the key blob
pub const HEADER_SIZE: usize = 12;

const PUBLICKEYBLOB: u8 = 0x06;
const CUR_BLOB_VERSION: u8 = 0x02;
const RSA1: &[u8; 4] = b"RSA1";

/// A strong-name public key: header plus `PUBLICKEYBLOB`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StrongNameKey(Vec<u8>);

impl StrongNameKey {
    /// Builds the key from an RSA modulus (big-endian, as in DER) and public exponent.
    ///
    /// # Errors
    /// Returns [`crate::Error::Certificate`] for an empty modulus
    pub fn from_rsa(modulus: &[u8], exponent: u32) -> Result<Self> {
        let first = modulus.iter().position(|b| *b != 0).unwrap_or(modulus.len());
        let modulus = &modulus[first..];
        if modulus.is_empty() {
            return Err(crate::Error::Certificate("RSA modulus is empty".to_string()));
        }

        let key_bytes = modulus.len().next_multiple_of(8);
        let blob_len = 8 + 12 + key_bytes;
        let mut key = vec![0_u8; HEADER_SIZE + blob_len];

        write_le_at::<u32>(&mut key, 0, CALG_RSA_SIGN)?;
        write_le_at::<u32>(&mut key, 4, CALG_SHA1)?;
        write_le_at::<u32>(&mut key, 8, u32::try_from(blob_len).unwrap_or(u32::MAX))?;

        key[12] = PUBLICKEYBLOB;
        key[13] = CUR_BLOB_VERSION;
        write_le_at::<u32>(&mut key, 16, CALG_RSA_SIGN)?;

        key[20..24].copy_from_slice(RSA1);
        write_le_at::<u32>(&mut key, 24, u32::try_from(key_bytes * 8).unwrap_or(u32::MAX))?;
        write_le_at::<u32>(&mut key, 28, exponent)?;

        for (slot, byte) in key[32..].iter_mut().zip(modulus.iter().rev()) {
            *slot = *byte;
        }
        Ok(StrongNameKey(key))
    }

    /// Wraps an existing key blob after checking its header.
    ///
    /// # Errors
    /// Returns an error if the blob is shorter than its header or the length field disagrees
    pub fn from_blob(blob: Vec<u8>) -> Result<Self> {
        if blob.len() < HEADER_SIZE {
            return Err(out_of_bounds_error!());
        }
        let declared = read_le_at::<u32>(&blob, &mut 8)? as usize;
        if declared != blob.len() - HEADER_SIZE {
            return Err(malformed_error!(
                "Strong-name key declares {} key bytes but carries {}",
                declared,
                blob.len() - HEADER_SIZE
            ));
        }
        Ok(StrongNameKey(blob))
    }

    /// The full blob as stored in metadata
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consumes the key, returning the blob
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// The `PUBLICKEYBLOB` after the header
    #[must_use]
    pub fn key_blob(&self) -> &[u8] {
        &self.0[HEADER_SIZE..]
    }

    /// RSA key size in bits, zero if the blob is not an RSA key
    #[must_use]
    pub fn bit_length(&self) -> u32 {
        if self.0.len() < 32 || &self.0[20..24] != RSA1 {
            return 0;
        }
        read_le_at::<u32>(&self.0, &mut 24).unwrap_or(0)
    }

    /// Size of the strong-name signature this key produces
    #[must_use]
    pub fn signature_size(&self) -> usize {
        match self.bit_length() {
            0 => 128,
            bits => bits as usize / 8,
        }
    }

    /// The public-key token of this key
    #[must_use]
    pub fn public_key_token(&self) -> PublicKeyToken {
        PublicKeyToken::from_public_key(&self.0)
    }
}
