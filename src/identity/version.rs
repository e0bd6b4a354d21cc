use std::{fmt, str::FromStr};

use crate::{Error, Result};

/// A four-part `major.minor.build.revision` version number.
///
/// Ordering compares the parts from most to least significant. A version whose parts are all zero
/// is treated as "unset" by the manifest model and the version resource writer.
///
/// # Examples
///
/// ```rust
/// use pesmith::identity::FourPartVersion;
///
/// let version: FourPartVersion = "2.0.0.1".parse()?;
/// assert_eq!(version, FourPartVersion::new(2, 0, 0, 1));
/// assert!(version > FourPartVersion::new(1, 9, 9, 9));
/// assert_eq!(FourPartVersion::parse_lenient("1, 2, 3, 4 (release)"), FourPartVersion::new(1, 2, 3, 4));
/// # Ok::<(), pesmith::Error>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FourPartVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl FourPartVersion {
    /// The all-zero version, meaning "not set"
    pub const ZERO: Self = Self::new(0, 0, 0, 0);

    /// Create a version from its four parts
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// Returns true if every part is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.build == 0 && self.revision == 0
    }

    /// Build a version from the `MS`/`LS` dword pair used by `VS_FIXEDFILEINFO`
    #[must_use]
    pub const fn from_ms_ls(ms: u32, ls: u32) -> Self {
        Self::new(
            (ms >> 16) as u16,
            (ms & 0xFFFF) as u16,
            (ls >> 16) as u16,
            (ls & 0xFFFF) as u16,
        )
    }

    /// The most significant dword (`major << 16 | minor`)
    #[must_use]
    pub const fn ms(&self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }

    /// The least significant dword (`build << 16 | revision`)
    #[must_use]
    pub const fn ls(&self) -> u32 {
        ((self.build as u32) << 16) | self.revision as u32
    }

    /// Parse a dotted version with one to four numeric parts; missing parts are zero.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] for empty input, more than four parts or a part that is not
    /// a `u16`.
    pub fn parse(version: &str) -> Result<Self> {
        let version = version.trim();
        if version.is_empty() {
            return Err(malformed_error!("Empty version string"));
        }

        let parts: Vec<&str> = version.split('.').collect();
        if parts.len() > 4 {
            return Err(malformed_error!("Too many version parts: '{}'", version));
        }

        let mut numbers = [0_u16; 4];
        for (slot, part) in numbers.iter_mut().zip(parts) {
            *slot = part
                .trim()
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid version part '{}' in '{}'", part, version))?;
        }

        Ok(Self::new(numbers[0], numbers[1], numbers[2], numbers[3]))
    }

    /// Parse the free-form version text found in resources and attributes.
    ///
    /// Accepts `.` or `,` separators, ignores surrounding whitespace, stops at the first
    /// character that can't belong to a version and returns [`FourPartVersion::ZERO`] when no
    /// number is found. Parts that overflow a `u16` are clamped.
    #[must_use]
    pub fn parse_lenient(version: &str) -> Self {
        let mut numbers = [0_u16; 4];
        let mut index = 0;
        let mut current: Option<u32> = None;

        for c in version.trim().chars() {
            match c {
                '0'..='9' => {
                    let digit = c.to_digit(10).unwrap_or(0);
                    current = Some(current.unwrap_or(0).saturating_mul(10).saturating_add(digit));
                }
                '.' | ',' => {
                    numbers[index] = current.map_or(0, clamp_part);
                    current = None;
                    index += 1;
                    if index == 4 {
                        break;
                    }
                }
                ' ' if current.is_none() => {}
                _ => break,
            }
        }

        if index < 4 {
            if let Some(value) = current {
                numbers[index] = clamp_part(value);
            }
        }

        Self::new(numbers[0], numbers[1], numbers[2], numbers[3])
    }
}

fn clamp_part(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

impl fmt::Display for FourPartVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for FourPartVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<FourPartVersion> for u64 {
    fn from(version: FourPartVersion) -> u64 {
        (u64::from(version.ms()) << 32) | u64::from(version.ls())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_parse() {
        assert_eq!(
            FourPartVersion::parse("1.2.3.4").unwrap(),
            FourPartVersion::new(1, 2, 3, 4)
        );
        assert_eq!(
            FourPartVersion::parse("7").unwrap(),
            FourPartVersion::new(7, 0, 0, 0)
        );
        assert!(FourPartVersion::parse("").is_err());
        assert!(FourPartVersion::parse("1.2.3.4.5").is_err());
        assert!(FourPartVersion::parse("1.x").is_err());
        assert!(FourPartVersion::parse("70000").is_err());
    }

    #[test]
    fn lenient_parse() {
        assert_eq!(
            FourPartVersion::parse_lenient("1, 0, 2, 3"),
            FourPartVersion::new(1, 0, 2, 3)
        );
        assert_eq!(
            FourPartVersion::parse_lenient("6.1.7601.17514 (win7sp1_rtm.101119-1850)"),
            FourPartVersion::new(6, 1, 7601, 17514)
        );
        assert_eq!(
            FourPartVersion::parse_lenient("3.5"),
            FourPartVersion::new(3, 5, 0, 0)
        );
        assert_eq!(FourPartVersion::parse_lenient("garbage"), FourPartVersion::ZERO);
        assert_eq!(
            FourPartVersion::parse_lenient("99999.1"),
            FourPartVersion::new(u16::MAX, 1, 0, 0)
        );
    }

    #[test]
    fn dword_pairs() {
        let version = FourPartVersion::new(2, 0, 0, 1);
        assert_eq!(version.ms(), 0x0002_0000);
        assert_eq!(version.ls(), 0x0000_0001);
        assert_eq!(FourPartVersion::from_ms_ls(version.ms(), version.ls()), version);
        assert_eq!(u64::from(version), 0x0002_0000_0000_0001);
        assert_eq!(version.to_string(), "2.0.0.1");
    }
}
