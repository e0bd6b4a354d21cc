use std::{fmt, str::FromStr};

use crate::{Error, Result};

/// Processor architecture of an executable or an assembly reference.
///
/// The textual form is the one used by the `processorArchitecture` attribute of application
/// manifests: lower case, with `*` standing for "any architecture".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Architecture {
    /// Architecture-neutral (`*`)
    Any,
    /// Platform-neutral IL (`msil`)
    MSIL,
    /// 32-bit Intel (`x86`)
    X86,
    /// 64-bit x86 (`amd64`)
    AMD64,
    /// Itanium (`ia64`)
    IA64,
    /// 32-bit ARM (`arm`)
    ARM,
    /// 64-bit ARM (`arm64`)
    ARM64,
}

impl Architecture {
    /// Parse an architecture name; accepts the manifest spellings plus `x64` and `any`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for unknown names
    pub fn parse(arch: &str) -> Result<Self> {
        match arch.trim().to_ascii_lowercase().as_str() {
            "*" | "any" | "anycpu" => Ok(Self::Any),
            "msil" => Ok(Self::MSIL),
            "x86" | "i386" => Ok(Self::X86),
            "amd64" | "x64" => Ok(Self::AMD64),
            "ia64" => Ok(Self::IA64),
            "arm" => Ok(Self::ARM),
            "arm64" => Ok(Self::ARM64),
            _ => Err(malformed_error!(
                "Unknown processor architecture: '{}'",
                arch.trim()
            )),
        }
    }

    /// The manifest attribute value
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "*",
            Self::MSIL => "msil",
            Self::X86 => "x86",
            Self::AMD64 => "amd64",
            Self::IA64 => "ia64",
            Self::ARM => "arm",
            Self::ARM64 => "arm64",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Maps a COFF `Machine` value.
impl TryFrom<u16> for Architecture {
    type Error = Error;

    fn try_from(machine: u16) -> Result<Self> {
        match machine {
            0x014c => Ok(Self::X86),
            0x8664 => Ok(Self::AMD64),
            0x0200 => Ok(Self::IA64),
            0x01c0 => Ok(Self::ARM),
            0xaa64 => Ok(Self::ARM64),
            other => Err(Error::UnknownMachine(other)),
        }
    }
}
