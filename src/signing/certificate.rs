//! Code-signing certificates.
//!
//! A [`Certificate`] is parsed from DER or PEM with `x509-cert`; its RSA public key is decoded
//! from the `SubjectPublicKeyInfo` and turned into a strong-name key on demand. The
//! [`CertificateReference`] it was loaded from travels along so that an external signing tool
//! can be pointed at the same file.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use cms::encrypted_data::EncryptedData;
use der::{
    asn1::{ContextSpecific, OctetString, UintRef},
    Any, Decode, DecodePem, Encode,
};
use log::debug;
use pkcs12::{
    authenticated_safe::AuthenticatedSafe, cert_type::CertBag, pfx::Pfx, safe_bag::SafeContents,
    PKCS_12_CERT_BAG_OID,
};
use pkcs5::EncryptionScheme;

use crate::{signing::strongname::StrongNameKey, Error, Result};

const RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const PKCS7_DATA: &str = "1.2.840.113549.1.7.1";
const PKCS7_ENCRYPTED_DATA: &str = "1.2.840.113549.1.7.6";
const X509_CERTIFICATE_BAG: &str = "1.2.840.113549.1.9.22.1";

fn pkcs12_error(e: der::Error) -> Error {
    Error::Certificate(format!("invalid PKCS#12 container: {e}"))
}

/// The bytes of an `OCTET STRING` carried as `ContentInfo` content
fn octets(content: &Any) -> Result<Vec<u8>> {
    let der = content.to_der().map_err(pkcs12_error)?;
    Ok(OctetString::from_der(&der)
        .map_err(pkcs12_error)?
        .into_bytes())
}

/// Decrypts the safe contents of a PBES2 `EncryptedData` safe.
fn decrypt_safe(content: &Any, password: &str) -> Result<Vec<u8>> {
    let der = content.to_der().map_err(pkcs12_error)?;
    let encrypted = EncryptedData::from_der(&der).map_err(pkcs12_error)?;
    let info = encrypted.enc_content_info;

    let algorithm = info.content_enc_alg.to_der().map_err(pkcs12_error)?;
    let scheme = EncryptionScheme::try_from(algorithm.as_slice()).map_err(pkcs12_error)?;
    let mut buffer = info
        .encrypted_content
        .map(OctetString::into_bytes)
        .unwrap_or_default();
    let plain = scheme
        .decrypt_in_place(password, &mut buffer)
        .map_err(|e| Error::Certificate(format!("can't decrypt PKCS#12 safe: {e}")))?
        .len();
    buffer.truncate(plain);
    Ok(buffer)
}

#[derive(der::Sequence)]
struct RsaPublicKey<'a> {
    modulus: UintRef<'a>,
    public_exponent: UintRef<'a>,
}

/// Where a certificate lives and how to unlock its private key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertificateReference {
    /// Certificate file: PEM (optionally bundled with its key), DER, or a PKCS#12 container
    pub path: PathBuf,
    /// Password for the private key
    pub password: Option<String>,
}

impl CertificateReference {
    /// A reference without a password
    pub fn new(path: impl Into<PathBuf>) -> Self {
        CertificateReference {
            path: path.into(),
            password: None,
        }
    }

    /// Sets the password
    #[must_use]
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// True for `.pfx` / `.p12` containers
    #[must_use]
    pub fn is_pkcs12(&self) -> bool {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pfx") || ext.eq_ignore_ascii_case("p12"))
    }
}

/// An X.509 certificate with an RSA public key.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    modulus: Vec<u8>,
    exponent: u32,
    reference: Option<CertificateReference>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Certificate(subject={}, bits={})",
            self.subject,
            self.modulus.len() * 8
        )
    }
}

impl Certificate {
    /// Parses a DER-encoded certificate.
    ///
    /// # Errors
    /// Returns [`Error::Certificate`] if the bytes are not a certificate or the key is not RSA
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let certificate = x509_cert::Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("invalid DER certificate: {e}")))?;
        Self::from_x509(&certificate, der.to_vec())
    }

    /// Parses the first `CERTIFICATE` block of a PEM document.
    ///
    /// # Errors
    /// Returns [`Error::Certificate`] if no certificate block is found or the key is not RSA
    pub fn from_pem(pem: &str) -> Result<Self> {
        let begin = pem
            .find("-----BEGIN CERTIFICATE-----")
            .ok_or_else(|| Error::Certificate("no CERTIFICATE block".to_string()))?;
        let end_marker = "-----END CERTIFICATE-----";
        let end = pem[begin..]
            .find(end_marker)
            .map(|offset| begin + offset + end_marker.len())
            .ok_or_else(|| Error::Certificate("unterminated CERTIFICATE block".to_string()))?;

        let certificate = x509_cert::Certificate::from_pem(&pem[begin..end])
            .map_err(|e| Error::Certificate(format!("invalid PEM certificate: {e}")))?;
        let der = certificate
            .to_der()
            .map_err(|e| Error::Certificate(format!("failed to re-encode certificate: {e}")))?;
        Self::from_x509(&certificate, der)
    }

    /// Reads the certificate a reference points at.
    ///
    /// PEM and DER files are read directly. A PKCS#12 container is unlocked with the
    /// reference's password and its first certificate bag is used.
    ///
    /// # Errors
    /// Returns an error if no readable certificate is found
    pub fn load(reference: &CertificateReference) -> Result<Self> {
        let mut certificate = if reference.is_pkcs12() {
            let bytes = fs::read(&reference.path)?;
            let password = reference.password.as_deref().unwrap_or_default();
            Self::from_pkcs12(&bytes, password)?
        } else {
            Self::read(&reference.path)?
        };
        certificate.reference = Some(reference.clone());
        Ok(certificate)
    }

    /// Extracts the first certificate of a PKCS#12 container.
    ///
    /// Safe contents may be plain or PBES2-encrypted; the legacy PKCS#12 PBE ciphers are not
    /// supported.
    ///
    /// # Errors
    /// Returns [`Error::Certificate`] if the container is malformed, the password is wrong, or
    /// it holds no certificate
    pub fn from_pkcs12(bytes: &[u8], password: &str) -> Result<Self> {
        let pfx = Pfx::from_der(bytes).map_err(pkcs12_error)?;
        if pfx.auth_safe.content_type.to_string() != PKCS7_DATA {
            return Err(Error::Certificate(format!(
                "unsupported PKCS#12 integrity mode {}",
                pfx.auth_safe.content_type
            )));
        }

        let safes = octets(&pfx.auth_safe.content)?;
        let safes = AuthenticatedSafe::from_der(&safes).map_err(pkcs12_error)?;
        for safe in &safes {
            let contents = match safe.content_type.to_string().as_str() {
                PKCS7_DATA => octets(&safe.content)?,
                PKCS7_ENCRYPTED_DATA => decrypt_safe(&safe.content, password)?,
                other => {
                    debug!("skipping PKCS#12 safe of type {other}");
                    continue;
                }
            };

            let bags = SafeContents::from_der(&contents).map_err(pkcs12_error)?;
            for bag in bags {
                if bag.bag_id != PKCS_12_CERT_BAG_OID {
                    continue;
                }
                let cert_bag = ContextSpecific::<CertBag>::from_der(&bag.bag_value)
                    .map_err(pkcs12_error)?
                    .value;
                if cert_bag.cert_id.to_string() == X509_CERTIFICATE_BAG {
                    return Self::from_der(cert_bag.cert_value.as_bytes());
                }
            }
        }
        Err(Error::Certificate("PKCS#12 container holds no certificate".to_string()))
    }

    fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        match std::str::from_utf8(&bytes) {
            Ok(text) if text.contains("-----BEGIN") => Self::from_pem(text),
            _ => Self::from_der(&bytes),
        }
    }

    fn from_x509(certificate: &x509_cert::Certificate, der: Vec<u8>) -> Result<Self> {
        let spki = &certificate.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid.to_string() != RSA_ENCRYPTION {
            return Err(Error::Certificate(format!(
                "unsupported public key algorithm {}",
                spki.algorithm.oid
            )));
        }

        let key = RsaPublicKey::from_der(spki.subject_public_key.raw_bytes())
            .map_err(|e| Error::Certificate(format!("invalid RSA public key: {e}")))?;

        let exponent = key
            .public_exponent
            .as_bytes()
            .iter()
            .try_fold(0_u32, |acc, byte| {
                acc.checked_mul(256).map(|acc| acc | u32::from(*byte))
            })
            .ok_or_else(|| Error::Certificate("RSA exponent exceeds 32 bits".to_string()))?;

        Ok(Certificate {
            der,
            subject: certificate.tbs_certificate.subject.to_string(),
            modulus: key.modulus.as_bytes().to_vec(),
            exponent,
            reference: None,
        })
    }

    /// The DER encoding
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Subject distinguished name
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// RSA modulus, big-endian without leading zeros
    #[must_use]
    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    /// RSA public exponent
    #[must_use]
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// The file this certificate was loaded from
    #[must_use]
    pub fn reference(&self) -> Option<&CertificateReference> {
        self.reference.as_ref()
    }

    /// The strong-name public key for this certificate's RSA key.
    ///
    /// # Errors
    /// Returns an error if the modulus is empty
    pub fn strong_name_key(&self) -> Result<StrongNameKey> {
        StrongNameKey::from_rsa(&self.modulus, self.exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DER: &[u8] = include_bytes!("../../tests/data/signing.der");
    const PEM: &str = include_str!("../../tests/data/signing.pem");
    const PFX: &[u8] = include_bytes!("../../tests/data/signing.pfx");

    #[test]
    fn der_and_pem_agree() {
        let from_der = Certificate::from_der(DER).unwrap();
        let from_pem = Certificate::from_pem(PEM).unwrap();
        assert_eq!(from_der, from_pem);
        assert_eq!(from_der.exponent(), 65537);
        assert_eq!(from_der.modulus().len(), 128);
        assert!(from_der.subject().contains("pesmith test signing"));
    }

    #[test]
    fn strong_name_key_of_test_certificate() {
        let key = Certificate::from_der(DER).unwrap().strong_name_key().unwrap();
        let prefix: String = key.as_bytes()[..24]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(prefix, "002400000480000094000000060200000024000052534131");
        assert_eq!(key.as_bytes().len(), 160);
        assert_eq!(key.public_key_token().to_string(), "fce483ab0958b723");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            Certificate::from_der(b"not a certificate"),
            Err(Error::Certificate(_))
        ));
        assert!(Certificate::from_pem("hello").is_err());
    }

    #[test]
    fn load_by_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.pem");
        fs::write(&path, PEM).unwrap();

        let reference = CertificateReference::new(&path).with_password("secret");
        let certificate = Certificate::load(&reference).unwrap();
        assert_eq!(certificate.reference(), Some(&reference));
        assert_eq!(certificate.der(), DER);
    }

    #[test]
    fn load_pkcs12_container() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.pfx");
        fs::write(&path, PFX).unwrap();

        let reference = CertificateReference::new(&path).with_password("pw");
        assert!(reference.is_pkcs12());
        let certificate = Certificate::load(&reference).unwrap();
        assert_eq!(certificate.der(), DER);
        assert_eq!(certificate.reference(), Some(&reference));
        assert_eq!(
            certificate.strong_name_key().unwrap().public_key_token().to_string(),
            "fce483ab0958b723"
        );
    }

    #[test]
    fn pkcs12_needs_the_right_password() {
        assert!(matches!(
            Certificate::from_pkcs12(PFX, "wrong"),
            Err(Error::Certificate(_))
        ));
        assert!(matches!(
            Certificate::from_pkcs12(DER, "pw"),
            Err(Error::Certificate(_))
        ));
    }
}
