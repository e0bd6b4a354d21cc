//! Classification of a probed image: PE or not, managed or native, bitness, architecture.

use bitflags::bitflags;

use crate::{
    identity::Architecture,
    pe::{
        cor20::Cor20Header,
        headers::{PeHeaders, PeProbe},
    },
    Error, Result,
};

bitflags! {
    /// Architecture × managed/native tag of an executable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutableInfo: u32 {
        /// Native code
        const NATIVE = 0x0001;
        /// Managed code
        const MANAGED = 0x0002;
        /// Architecture-neutral managed image
        const ANY = 0x0004;
        /// x86
        const X86 = 0x0008;
        /// x64
        const X64 = 0x0010;
        /// ARM
        const ARM = 0x0020;
        /// Itanium
        const IA64 = 0x0040;
        /// ARM64
        const ARM64 = 0x0080;
    }
}

/// The structural flags of one file, computed in a single pass by the PE-info loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeInfo {
    /// DOS and PE signatures matched
    pub is_pe_file: bool,
    /// PE32 optional header
    pub is_32bit_pe: bool,
    /// PE32+ optional header
    pub is_64bit_pe: bool,
    /// Has a CLR runtime header
    pub is_managed: bool,
    /// PE image without a CLR runtime header
    pub is_native: bool,
    /// Runs as a 32-bit process
    pub is_32bit: bool,
    /// Managed PE32 image without the 32-bit-required flag
    pub is_any_cpu: bool,
    /// Console subsystem
    pub is_console_app: bool,
    /// IL-only managed image
    pub il_only: bool,
    /// COFF machine value
    pub machine: u16,
    /// Runtime header flags, zero for native images
    pub cor_flags: u32,
}

impl PeInfo {
    /// Classifies a probed file.
    #[must_use]
    pub fn from_probe(probe: &PeProbe) -> PeInfo {
        match probe {
            PeProbe::NotPe => PeInfo::default(),
            PeProbe::Pe(headers) => Self::from_headers(headers),
        }
    }

    /// Classifies a PE image.
    #[must_use]
    pub fn from_headers(headers: &PeHeaders) -> PeInfo {
        let is_32bit_pe = headers.is_pe32();
        let is_64bit_pe = headers.is_pe32_plus();
        let cor_flags = headers.cor20.as_ref().map_or(0, |cor| cor.flags);
        let is_managed = headers.cor20.is_some();

        PeInfo {
            is_pe_file: true,
            is_32bit_pe,
            is_64bit_pe,
            is_managed,
            is_native: !is_managed,
            is_32bit: if is_managed {
                cor_flags & Cor20Header::FLAG_32BIT_REQUIRED != 0
            } else {
                is_32bit_pe
            },
            is_any_cpu: is_32bit_pe
                && is_managed
                && cor_flags & Cor20Header::FLAG_32BIT_REQUIRED == 0,
            is_console_app: headers.optional.subsystem & 1 == 1,
            il_only: cor_flags & Cor20Header::FLAG_IL_ONLY != 0,
            machine: headers.coff.machine,
            cor_flags,
        }
    }

    /// The architecture × managed/native tag.
    ///
    /// Files that are not PE images have no tag and yield an empty set.
    ///
    /// # Errors
    /// Returns [`Error::UnknownMachine`] if the machine value is not one of x86, x64, ARM,
    /// ARM64 or IA64 and the image is not architecture-neutral.
    pub fn executable_info(&self) -> Result<ExecutableInfo> {
        if !self.is_pe_file {
            return Ok(ExecutableInfo::empty());
        }

        let mut result = if self.is_managed {
            ExecutableInfo::MANAGED
        } else {
            ExecutableInfo::NATIVE
        };

        if self.is_any_cpu {
            return Ok(result | ExecutableInfo::ANY);
        }

        result |= match Architecture::try_from(self.machine)? {
            Architecture::X86 => ExecutableInfo::X86,
            Architecture::AMD64 => ExecutableInfo::X64,
            Architecture::ARM => ExecutableInfo::ARM,
            Architecture::ARM64 => ExecutableInfo::ARM64,
            Architecture::IA64 => ExecutableInfo::IA64,
            Architecture::Any | Architecture::MSIL => {
                return Err(Error::UnknownMachine(self.machine))
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::ImageBuilder;

    fn classify(image: &[u8]) -> PeInfo {
        PeInfo::from_probe(&PeHeaders::parse(image).unwrap())
    }

    #[test]
    fn pe32_without_runtime_header_is_native_32bit() {
        let info = classify(&ImageBuilder::new().build().unwrap());
        assert!(info.is_pe_file);
        assert!(!info.is_managed);
        assert!(info.is_native);
        assert!(info.is_32bit);
        assert!(!info.is_any_cpu);
        assert_eq!(
            info.executable_info().unwrap(),
            ExecutableInfo::NATIVE | ExecutableInfo::X86
        );
    }

    #[test]
    fn pe32_plus_managed_with_32bit_required() {
        let image = ImageBuilder::new()
            .pe32_plus()
            .machine(0x8664)
            .managed("Tool", "1.0.0.0")
            .cor_flags(Cor20Header::FLAG_IL_ONLY | Cor20Header::FLAG_32BIT_REQUIRED)
            .build()
            .unwrap();
        let info = classify(&image);

        assert!(info.is_pe_file);
        assert!(info.is_64bit_pe);
        assert!(info.is_managed);
        assert!(info.is_32bit);
        assert!(!info.is_any_cpu);
        assert!(info.il_only);
        assert_eq!(
            info.executable_info().unwrap(),
            ExecutableInfo::MANAGED | ExecutableInfo::X64
        );
    }

    #[test]
    fn managed_pe32_is_any_cpu() {
        let image = ImageBuilder::new()
            .managed("Lib", "1.0.0.0")
            .cor_flags(Cor20Header::FLAG_IL_ONLY)
            .build()
            .unwrap();
        let info = classify(&image);
        assert!(info.is_any_cpu);
        assert!(!info.is_32bit);
        assert_eq!(
            info.executable_info().unwrap(),
            ExecutableInfo::MANAGED | ExecutableInfo::ANY
        );
    }

    #[test]
    fn unknown_machine() {
        let image = ImageBuilder::new().machine(0x0166).build().unwrap();
        let info = classify(&image);
        assert!(matches!(
            info.executable_info(),
            Err(Error::UnknownMachine(0x0166))
        ));
    }

    #[test]
    fn console_subsystem() {
        let image = ImageBuilder::new().subsystem(3).build().unwrap();
        assert!(classify(&image).is_console_app);
        let image = ImageBuilder::new().subsystem(2).build().unwrap();
        assert!(!classify(&image).is_console_app);
    }

    #[test]
    fn not_a_pe_has_no_tag() {
        let info = PeInfo::from_probe(&PeProbe::NotPe);
        assert!(!info.is_pe_file);
        assert_eq!(info.executable_info().unwrap(), ExecutableInfo::empty());
    }
}
