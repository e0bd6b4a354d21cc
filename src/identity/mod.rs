//! Value types that identify an assembly: four-part versions, processor architectures and
//! public-key tokens.
//!
//! These types are shared by the manifest model (which stores them as XML attributes), the
//! managed metadata reader (which stores them in binary tables) and the binary entity (which
//! exposes them as properties).

mod architecture;
mod token;
mod version;

pub use architecture::Architecture;
pub use token::PublicKeyToken;
pub use version::FourPartVersion;
