//! Signing and strong-naming operations.
//!
//! These are stateless building blocks used by the save pipeline and usable on their own:
//!
//! - [`Certificate`] reads an X.509 certificate and exposes its RSA public key
//! - [`StrongNameKey`] builds the strong-name public key blob and its token
//! - [`CodeSigner`] abstracts the Authenticode and strong-name backend, [`ToolSigner`] is the
//!   default command line implementation
//! - [`sign_file`] signs with timestamp-authority rotation, [`strip_signatures`] removes
//!   existing signatures
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use pesmith::signing::{sign_file, Certificate, CertificateReference, ToolSigner, TIMESTAMP_SERVERS};
//!
//! let certificate = Certificate::load(&CertificateReference::new("code.pfx").with_password("secret"))?;
//! let servers: Vec<String> = TIMESTAMP_SERVERS.iter().map(|s| s.to_string()).collect();
//! sign_file(Path::new("tool.exe"), &certificate, &ToolSigner::new(), &servers, 3)?;
//! # Ok::<(), pesmith::Error>(())
//! ```

mod certificate;
mod signer;
mod strongname;

pub use certificate::{Certificate, CertificateReference};
pub use signer::{sign_file, strip_signatures, CodeSigner, SignOutcome, ToolSigner};
pub use strongname::StrongNameKey;

/// Timestamp authorities tried in order when signing.
pub const TIMESTAMP_SERVERS: &[&str] = &[
    "http://timestamp.verisign.com/scripts/timstamp.dll",
    "http://timestamp.comodoca.com/authenticode",
    "http://www.startssl.com/timestamp",
    "http://timestamp.globalsign.com/scripts/timstamp.dll",
    "http://time.certum.pl/",
];
