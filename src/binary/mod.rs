//! Binaries on disk: loading, inspection, editing and saving.
//!
//! A [`BinaryRegistry`] hands out one [`Binary`] per file. Each binary works on a private
//! working copy; its properties are computed lazily by loader passes that run at most once, and
//! its edits are written back by [`Binary::save`], which also strong names and signs the file
//! and, when needed, the unsigned assemblies it depends on first (see [`SigningPlan`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use pesmith::{BinaryLoadOptions, BinaryRegistry};
//! use pesmith::signing::{Certificate, CertificateReference};
//!
//! let registry = BinaryRegistry::with_defaults();
//! let app = registry.load("bin/App.exe", BinaryLoadOptions::ALL)?;
//!
//! let certificate = Certificate::load(&CertificateReference::new("signing.pfx").with_password("secret"))?;
//! app.set_strong_name_key_certificate(certificate.clone())?;
//! app.set_signing_certificate(certificate)?;
//! app.set_product_name("Contoso Suite")?;
//!
//! // Unsigned assemblies App.exe references are strong named and saved first.
//! app.save()?;
//! # Ok::<(), pesmith::Error>(())
//! ```

mod entity;
mod loaders;
mod options;
mod registry;
mod save;

pub use entity::Binary;
pub use options::BinaryLoadOptions;
pub use registry::{BinaryRegistry, LoadHandle};
pub use save::{SaveHandle, SigningPlan};
