use std::fmt;

use sha1::{Digest, Sha1};

use crate::Result;

/// The 8-byte public-key token that abbreviates a strong-name public key.
///
/// The token is the last eight bytes of the SHA-1 hash of the public key blob, in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyToken(pub [u8; 8]);

impl PublicKeyToken {
    /// Compute the token of a strong-name public key blob
    #[must_use]
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(public_key);
        let hash = hasher.finalize();

        let mut token = [0_u8; 8];
        for (slot, byte) in token.iter_mut().zip(hash[12..20].iter().rev()) {
            *slot = *byte;
        }
        PublicKeyToken(token)
    }

    /// Parse a 16-digit hex token
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the text is not exactly 16 hex digits
    pub fn parse(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 16 || !hex.is_ascii() {
            return Err(malformed_error!("Invalid public key token '{}'", hex));
        }

        let mut token = [0_u8; 8];
        for (i, slot) in token.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| malformed_error!("Invalid public key token '{}'", hex))?;
        }
        Ok(PublicKeyToken(token))
    }

    /// The raw token bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for PublicKeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecma_key_token() {
        // The well-known 16-byte "ECMA" neutral key has the token b77a5c561934e089
        let ecma = [0_u8, 0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0];
        let token = PublicKeyToken::from_public_key(&ecma);
        assert_eq!(token.to_string(), "b77a5c561934e089");
    }

    #[test]
    fn parse_hex() {
        let token = PublicKeyToken::parse("B77A5C561934E089").unwrap();
        assert_eq!(token.to_string(), "b77a5c561934e089");
        assert!(PublicKeyToken::parse("abcd").is_err());
        assert!(PublicKeyToken::parse("zz7a5c561934e089").is_err());
    }
}
