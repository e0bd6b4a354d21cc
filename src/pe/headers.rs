//! Structural reader for the PE/COFF headers.
//!
//! [`PeHeaders::parse`] reads, in strict sequence, the DOS signature, the PE signature at the
//! offset stored at `0x3C`, the COFF header, the optional header with its data directories, the
//! section table and, for managed images, the CLR runtime header.
//!
//! A missing `MZ` or `PE\0\0` signature is not an error: the input is simply not a PE image and
//! [`PeProbe::NotPe`] is returned. Anything that is structurally wrong after the signatures have
//! matched (truncation, an unknown optional-header magic, a runtime header that can't be
//! located) is reported as an error.
//!
//! # Example
//!
//! ```rust
//! use pesmith::pe::{ImageBuilder, PeHeaders, PeProbe, DataDirectoryType};
//!
//! let image = ImageBuilder::new().build()?;
//! match PeHeaders::parse(&image)? {
//!     PeProbe::Pe(headers) => {
//!         assert!(headers.is_pe32());
//!         assert_eq!(headers.directory(DataDirectoryType::ClrRuntimeHeader).size, 0);
//!     }
//!     PeProbe::NotPe => unreachable!(),
//! }
//! # Ok::<(), pesmith::Error>(())
//! ```

use strum::{Display, EnumCount, EnumIter, FromRepr};

use crate::{
    file::{io::read_le_at, parser::Parser},
    pe::cor20::Cor20Header,
    Error, Result,
};

/// `MZ`
pub const DOS_SIGNATURE: u16 = 0x5A4D;
/// `PE\0\0`
pub const PE_SIGNATURE: u32 = 0x0000_4550;
/// Optional header magic of 32-bit images
pub const PE32_MAGIC: u16 = 0x10B;
/// Optional header magic of 64-bit images
pub const PE32_PLUS_MAGIC: u16 = 0x20B;
/// Size of one section table entry
pub const SECTION_HEADER_SIZE: usize = 40;
/// Number of data directories in a complete optional header
pub const DATA_DIRECTORY_COUNT: usize = 16;

/// The data directories, in the fixed order they appear in the optional header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumCount, FromRepr)]
#[repr(usize)]
pub enum DataDirectoryType {
    /// Export table
    Export = 0,
    /// Import table
    Import,
    /// Win32 resources
    Resource,
    /// Exception table
    Exception,
    /// Attribute certificates (Authenticode); the RVA is a file offset
    Certificate,
    /// Base relocations
    BaseRelocation,
    /// Debug data
    Debug,
    /// Architecture-specific data, reserved
    Copyright,
    /// Global pointer register value
    GlobalPtr,
    /// Thread local storage
    Tls,
    /// Load configuration
    LoadConfig,
    /// Bound imports
    BoundImport,
    /// Import address table
    Iat,
    /// Delay-load import descriptors
    DelayImport,
    /// CLR runtime header
    ClrRuntimeHeader,
    /// Reserved, must be zero
    Reserved,
}

/// An `(RVA, size)` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DataDirectory {
    /// Relative virtual address (a file offset for the certificate table)
    pub rva: u32,
    /// Size in bytes
    pub size: u32,
}

impl DataDirectory {
    /// Reads a directory entry at the parser's position
    ///
    /// # Errors
    /// Returns an error if fewer than 8 bytes remain
    pub fn read(parser: &mut Parser<'_>) -> Result<DataDirectory> {
        Ok(DataDirectory {
            rva: parser.read_le::<u32>()?,
            size: parser.read_le::<u32>()?,
        })
    }

    /// Returns true if the directory is absent
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// The COFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoffHeader {
    /// Target machine
    pub machine: u16,
    /// Number of entries in the section table
    pub number_of_sections: u16,
    /// Link time
    pub time_date_stamp: u32,
    /// File offset of the COFF symbol table
    pub pointer_to_symbol_table: u32,
    /// Number of COFF symbols
    pub number_of_symbols: u32,
    /// Size of the optional header that follows
    pub size_of_optional_header: u16,
    /// `IMAGE_FILE_*` flags
    pub characteristics: u16,
}

/// The fields of the optional header this crate depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionalHeader {
    /// `0x10B` (PE32) or `0x20B` (PE32+)
    pub magic: u16,
    /// Total size of initialized data sections
    pub size_of_initialized_data: u32,
    /// Entry point RVA
    pub address_of_entry_point: u32,
    /// Preferred load address
    pub image_base: u64,
    /// Alignment of sections in memory
    pub section_alignment: u32,
    /// Alignment of section data in the file
    pub file_alignment: u32,
    /// Size of the image in memory
    pub size_of_image: u32,
    /// Size of all headers, rounded to the file alignment
    pub size_of_headers: u32,
    /// Image checksum
    pub checksum: u32,
    /// Windows subsystem
    pub subsystem: u16,
    /// `IMAGE_DLLCHARACTERISTICS_*`
    pub dll_characteristics: u16,
    /// Declared number of data directories
    pub number_of_rva_and_sizes: u32,
}

/// A section table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Name, NUL padded
    pub name: [u8; 8],
    /// Size in memory
    pub virtual_size: u32,
    /// RVA of the section
    pub virtual_address: u32,
    /// Size of the data in the file
    pub size_of_raw_data: u32,
    /// File offset of the data
    pub pointer_to_raw_data: u32,
    /// `IMAGE_SCN_*` flags
    pub characteristics: u32,
}

impl SectionHeader {
    /// The section name without padding
    #[must_use]
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Returns true if `rva` falls into the file-backed part of this section
    #[must_use]
    pub fn contains_rva(&self, rva: u32) -> bool {
        let extent = self.size_of_raw_data.max(self.virtual_size);
        rva >= self.virtual_address && u64::from(rva) < u64::from(self.virtual_address) + u64::from(extent)
    }

    fn read(parser: &mut Parser<'_>) -> Result<SectionHeader> {
        let mut name = [0_u8; 8];
        name.copy_from_slice(parser.read_bytes(8)?);
        let virtual_size = parser.read_le::<u32>()?;
        let virtual_address = parser.read_le::<u32>()?;
        let size_of_raw_data = parser.read_le::<u32>()?;
        let pointer_to_raw_data = parser.read_le::<u32>()?;
        // relocations, line numbers and their counts
        parser.advance_by(12)?;
        let characteristics = parser.read_le::<u32>()?;

        Ok(SectionHeader {
            name,
            virtual_size,
            virtual_address,
            size_of_raw_data,
            pointer_to_raw_data,
            characteristics,
        })
    }
}

/// File offsets of header fields that rewriting code patches in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderOffsets {
    /// Start of the `PE\0\0` signature
    pub pe_signature: usize,
    /// Start of the COFF header
    pub coff_header: usize,
    /// Start of the optional header
    pub optional_header: usize,
    /// Start of the data directory table
    pub data_directories: usize,
    /// Start of the section table
    pub section_table: usize,
    /// File offset of the CLR runtime header, for managed images
    pub cor20_header: Option<usize>,
}

impl HeaderOffsets {
    /// The `NumberOfSections` field
    #[must_use]
    pub fn number_of_sections(&self) -> usize {
        self.coff_header + 2
    }

    /// The `SizeOfInitializedData` field
    #[must_use]
    pub fn size_of_initialized_data(&self) -> usize {
        self.optional_header + 8
    }

    /// The `SizeOfImage` field
    #[must_use]
    pub fn size_of_image(&self) -> usize {
        self.optional_header + 56
    }

    /// The `CheckSum` field
    #[must_use]
    pub fn checksum(&self) -> usize {
        self.optional_header + 64
    }

    /// The entry for `directory` in the data directory table
    #[must_use]
    pub fn data_directory(&self, directory: DataDirectoryType) -> usize {
        self.data_directories + directory as usize * 8
    }
}

/// Everything the structural reader extracts from a PE image.
#[derive(Debug, Clone)]
pub struct PeHeaders {
    /// COFF header
    pub coff: CoffHeader,
    /// Optional header
    pub optional: OptionalHeader,
    /// The data directories that are present, at most 16
    pub directories: Vec<DataDirectory>,
    /// The section table
    pub sections: Vec<SectionHeader>,
    /// The CLR runtime header, if the image is managed
    pub cor20: Option<Cor20Header>,
    /// Locations of patchable fields
    pub offsets: HeaderOffsets,
}

/// Outcome of probing a file for PE structure.
#[derive(Debug, Clone)]
pub enum PeProbe {
    /// The DOS or PE signature did not match
    NotPe,
    /// A PE image
    Pe(Box<PeHeaders>),
}

impl PeProbe {
    /// The headers, if this is a PE image
    #[must_use]
    pub fn headers(&self) -> Option<&PeHeaders> {
        match self {
            PeProbe::NotPe => None,
            PeProbe::Pe(headers) => Some(headers),
        }
    }
}

impl PeHeaders {
    /// Probes `data` for PE structure and reads all headers.
    ///
    /// # Errors
    /// Returns an error for truncated or malformed headers found after the signatures matched.
    pub fn parse(data: &[u8]) -> Result<PeProbe> {
        if data.len() < 2 || read_le_at::<u16>(data, &mut 0)? != DOS_SIGNATURE {
            return Ok(PeProbe::NotPe);
        }

        let pe_offset = read_le_at::<u32>(data, &mut 0x3C)? as usize;
        let mut parser = Parser::at(data, pe_offset)?;
        match parser.read_le::<u32>() {
            Ok(PE_SIGNATURE) => {}
            Ok(_) => return Ok(PeProbe::NotPe),
            Err(e) => return Err(e),
        }

        let coff_offset = parser.pos();
        let coff = CoffHeader {
            machine: parser.read_le::<u16>()?,
            number_of_sections: parser.read_le::<u16>()?,
            time_date_stamp: parser.read_le::<u32>()?,
            pointer_to_symbol_table: parser.read_le::<u32>()?,
            number_of_symbols: parser.read_le::<u32>()?,
            size_of_optional_header: parser.read_le::<u16>()?,
            characteristics: parser.read_le::<u16>()?,
        };

        let optional_offset = parser.pos();
        let section_table = optional_offset + coff.size_of_optional_header as usize;
        let optional = Self::read_optional_header(&mut parser)?;

        let data_directories = parser.pos();
        let present = (optional.number_of_rva_and_sizes as usize).min(DATA_DIRECTORY_COUNT);
        if data_directories + present * 8 > section_table {
            return Err(malformed_error!(
                "{} data directories don't fit an optional header of {} bytes",
                present,
                coff.size_of_optional_header
            ));
        }

        let mut directories = Vec::with_capacity(present);
        for _ in 0..present {
            directories.push(DataDirectory::read(&mut parser)?);
        }

        parser.seek(section_table)?;
        let mut sections = Vec::with_capacity(coff.number_of_sections as usize);
        for _ in 0..coff.number_of_sections {
            sections.push(SectionHeader::read(&mut parser)?);
        }

        let mut headers = PeHeaders {
            coff,
            optional,
            directories,
            sections,
            cor20: None,
            offsets: HeaderOffsets {
                pe_signature: pe_offset,
                coff_header: coff_offset,
                optional_header: optional_offset,
                data_directories,
                section_table,
                cor20_header: None,
            },
        };

        // Images declaring fewer than 16 directories are treated as native.
        let runtime = headers.directory(DataDirectoryType::ClrRuntimeHeader);
        if headers.directories.len() < DATA_DIRECTORY_COUNT || runtime.is_empty() {
            return Ok(PeProbe::Pe(Box::new(headers)));
        }

        let cor20_offset = headers.rva_to_offset(runtime.rva)?;
        let cor20_data = data.get(cor20_offset..).ok_or(out_of_bounds_error!())?;
        headers.cor20 = Some(Cor20Header::read(cor20_data)?);
        headers.offsets.cor20_header = Some(cor20_offset);

        Ok(PeProbe::Pe(Box::new(headers)))
    }

    fn read_optional_header(parser: &mut Parser<'_>) -> Result<OptionalHeader> {
        let magic = parser.read_le::<u16>()?;
        if magic != PE32_MAGIC && magic != PE32_PLUS_MAGIC {
            return Err(malformed_error!("Unknown optional header magic 0x{:x}", magic));
        }
        let wide = magic == PE32_PLUS_MAGIC;

        // linker version, size of code
        parser.advance_by(6)?;
        let size_of_initialized_data = parser.read_le::<u32>()?;
        // size of uninitialized data
        parser.advance_by(4)?;
        let address_of_entry_point = parser.read_le::<u32>()?;
        // base of code
        parser.advance_by(4)?;

        let image_base = if wide {
            parser.read_le::<u64>()?
        } else {
            // base of data
            parser.advance_by(4)?;
            u64::from(parser.read_le::<u32>()?)
        };

        let section_alignment = parser.read_le::<u32>()?;
        let file_alignment = parser.read_le::<u32>()?;
        // os, image and subsystem versions, win32 version value
        parser.advance_by(16)?;
        let size_of_image = parser.read_le::<u32>()?;
        let size_of_headers = parser.read_le::<u32>()?;
        let checksum = parser.read_le::<u32>()?;
        let subsystem = parser.read_le::<u16>()?;
        let dll_characteristics = parser.read_le::<u16>()?;
        // stack and heap reserve/commit
        parser.advance_by(if wide { 32 } else { 16 })?;
        // loader flags
        parser.advance_by(4)?;
        let number_of_rva_and_sizes = parser.read_le::<u32>()?;

        Ok(OptionalHeader {
            magic,
            size_of_initialized_data,
            address_of_entry_point,
            image_base,
            section_alignment,
            file_alignment,
            size_of_image,
            size_of_headers,
            checksum,
            subsystem,
            dll_characteristics,
            number_of_rva_and_sizes,
        })
    }

    /// Returns true for a PE32 (`0x10B`) image
    #[must_use]
    pub fn is_pe32(&self) -> bool {
        self.optional.magic == PE32_MAGIC
    }

    /// Returns true for a PE32+ (`0x20B`) image
    #[must_use]
    pub fn is_pe32_plus(&self) -> bool {
        self.optional.magic == PE32_PLUS_MAGIC
    }

    /// The directory entry of `kind`, or an empty entry if the image doesn't declare it
    #[must_use]
    pub fn directory(&self, kind: DataDirectoryType) -> DataDirectory {
        self.directories
            .get(kind as usize)
            .copied()
            .unwrap_or_default()
    }

    /// The section containing `rva`
    #[must_use]
    pub fn section_for_rva(&self, rva: u32) -> Option<&SectionHeader> {
        self.sections.iter().find(|s| s.contains_rva(rva))
    }

    /// Translates an RVA to a file offset using the section table.
    ///
    /// RVAs below `SizeOfHeaders` map to themselves.
    ///
    /// # Errors
    /// Returns [`Error::InvalidRva`] if no section backs `rva`
    pub fn rva_to_offset(&self, rva: u32) -> Result<usize> {
        if let Some(section) = self.section_for_rva(rva) {
            let delta = rva - section.virtual_address;
            if delta >= section.size_of_raw_data {
                return Err(Error::InvalidRva(rva));
            }
            return Ok(section.pointer_to_raw_data as usize + delta as usize);
        }

        if rva < self.optional.size_of_headers {
            return Ok(rva as usize);
        }

        Err(Error::InvalidRva(rva))
    }

    /// Returns the bytes of a directory entry
    ///
    /// # Errors
    /// Returns an error if the directory is not backed by file data
    pub fn directory_data<'a>(&self, data: &'a [u8], directory: DataDirectory) -> Result<&'a [u8]> {
        let start = self.rva_to_offset(directory.rva)?;
        let end = start
            .checked_add(directory.size as usize)
            .ok_or(out_of_bounds_error!())?;
        data.get(start..end).ok_or(out_of_bounds_error!())
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;
    use crate::pe::ImageBuilder;

    #[test]
    fn not_pe() {
        assert!(matches!(PeHeaders::parse(b"").unwrap(), PeProbe::NotPe));
        assert!(matches!(
            PeHeaders::parse(b"#!/bin/sh\necho hello\n").unwrap(),
            PeProbe::NotPe
        ));

        let mut image = ImageBuilder::new().build().unwrap();
        let pe_offset = read_le_at::<u32>(&image, &mut 0x3C).unwrap() as usize;
        image[pe_offset] = b'X';
        assert!(matches!(PeHeaders::parse(&image).unwrap(), PeProbe::NotPe));
    }

    #[test]
    fn truncated_after_signature() {
        let image = ImageBuilder::new().build().unwrap();
        let pe_offset = read_le_at::<u32>(&image, &mut 0x3C).unwrap() as usize;
        assert!(PeHeaders::parse(&image[..pe_offset + 10]).is_err());
    }

    #[test]
    fn native_pe32() {
        let image = ImageBuilder::new().build().unwrap();
        let probe = PeHeaders::parse(&image).unwrap();
        let headers = probe.headers().unwrap();

        assert!(headers.is_pe32());
        assert_eq!(headers.coff.machine, 0x014c);
        assert_eq!(headers.directories.len(), 16);
        assert!(headers.cor20.is_none());
        assert_eq!(headers.sections.len(), 1);
        assert_eq!(headers.sections[0].name(), ".text");
        assert_eq!(headers.offsets.checksum(), headers.offsets.optional_header + 64);
    }

    #[test]
    fn rva_translation() {
        let image = ImageBuilder::new().build().unwrap();
        let probe = PeHeaders::parse(&image).unwrap();
        let headers = probe.headers().unwrap();
        let text = headers.sections[0];

        assert_eq!(
            headers.rva_to_offset(text.virtual_address + 4).unwrap(),
            text.pointer_to_raw_data as usize + 4
        );
        assert_eq!(headers.rva_to_offset(0x40).unwrap(), 0x40);
        assert!(matches!(
            headers.rva_to_offset(0x00FF_0000),
            Err(Error::InvalidRva(0x00FF_0000))
        ));
    }

    #[test]
    fn directory_order() {
        let names: Vec<String> = DataDirectoryType::iter().map(|d| d.to_string()).collect();
        assert_eq!(names.len(), DATA_DIRECTORY_COUNT);
        assert_eq!(names[2], "Resource");
        assert_eq!(names[4], "Certificate");
        assert_eq!(names[14], "ClrRuntimeHeader");
        assert_eq!(DataDirectoryType::from_repr(14), Some(DataDirectoryType::ClrRuntimeHeader));
    }
}
