//! Synthetic PE images for tests, benchmarks and fuzz seeds.
//!
//! The images are small but structurally complete: a DOS header, PE32 or PE32+ headers with
//! `SizeOfHeaders` of `0x400` (room for several additional section headers), a `.text` section
//! holding an import table and, for managed images, the CLR header and metadata, an optional
//! `.rsrc` section and an optional attribute certificate at the end of the file.
//!
//! # Example
//!
//! ```rust
//! use pesmith::pe::{ImageBuilder, PeHeaders};
//! use pesmith::resources::VersionField;
//!
//! let image = ImageBuilder::new()
//!     .pe32_plus()
//!     .machine(0x8664)
//!     .managed("Contoso.Tool", "1.0.0.0")
//!     .version_field(VersionField::ProductVersion, "1.0.0.0")
//!     .manifest("<assembly xmlns=\"urn:schemas-microsoft-com:asm.v1\" manifestVersion=\"1.0\"/>")
//!     .build()?;
//!
//! let probe = PeHeaders::parse(&image)?;
//! let headers = probe.headers().unwrap();
//! assert!(headers.is_pe32_plus());
//! assert!(headers.cor20.is_some());
//! # Ok::<(), pesmith::Error>(())
//! ```

use crate::{
    file::io::write_le_at,
    identity::{FourPartVersion, PublicKeyToken},
    managed::MetadataBuilder,
    pe::{
        cor20::Cor20Header,
        headers::{DataDirectoryType, DATA_DIRECTORY_COUNT, PE32_MAGIC, PE32_PLUS_MAGIC},
        image::{align_up, calculate_checksum},
    },
    resources::{ResourceTable, VersionField, VersionResource},
    Result,
};

const PE_OFFSET: usize = 0x80;
const SIZE_OF_HEADERS: u32 = 0x400;
const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const TEXT_RVA: u32 = 0x1000;
const CODE_SECTION: u32 = 0x6000_0020;
const RESOURCE_SECTION: u32 = 0x4000_0040;
const STRONG_NAME_SLOT: usize = 128;

/// Builder for minimal PE images.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pe32_plus: bool,
    machine: u16,
    subsystem: u16,
    data_directories: u32,
    imports: Vec<String>,
    assembly: Option<(String, FourPartVersion)>,
    cor_flags: u32,
    references: Vec<(String, FourPartVersion, Option<PublicKeyToken>)>,
    attributes: Vec<(String, String)>,
    public_key: Vec<u8>,
    version: Option<VersionResource>,
    manifest: Option<String>,
    certificate: Option<Vec<u8>>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    /// A native PE32 x86 GUI DLL with sixteen data directories
    #[must_use]
    pub fn new() -> Self {
        ImageBuilder {
            pe32_plus: false,
            machine: 0x014c,
            subsystem: 2,
            data_directories: 16,
            imports: Vec::new(),
            assembly: None,
            cor_flags: Cor20Header::FLAG_IL_ONLY,
            references: Vec::new(),
            attributes: Vec::new(),
            public_key: Vec::new(),
            version: None,
            manifest: None,
            certificate: None,
        }
    }

    /// Uses the PE32+ optional header
    #[must_use]
    pub fn pe32_plus(mut self) -> Self {
        self.pe32_plus = true;
        self
    }

    /// Sets the COFF machine value
    #[must_use]
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Sets the subsystem
    #[must_use]
    pub fn subsystem(mut self, subsystem: u16) -> Self {
        self.subsystem = subsystem;
        self
    }

    /// Declares `count` data directories instead of sixteen
    #[must_use]
    pub fn data_directory_count(mut self, count: u32) -> Self {
        self.data_directories = count;
        self
    }

    /// Adds an imported DLL
    #[must_use]
    pub fn import(mut self, dll: &str) -> Self {
        self.imports.push(dll.to_string());
        self
    }

    /// Makes the image a managed assembly
    #[must_use]
    pub fn managed(mut self, name: &str, version: &str) -> Self {
        self.assembly = Some((name.to_string(), FourPartVersion::parse_lenient(version)));
        self
    }

    /// Sets the CLR header flags
    #[must_use]
    pub fn cor_flags(mut self, flags: u32) -> Self {
        self.cor_flags = flags;
        self
    }

    /// Adds an assembly reference without a token
    #[must_use]
    pub fn assembly_ref(mut self, name: &str, version: &str) -> Self {
        self.references
            .push((name.to_string(), FourPartVersion::parse_lenient(version), None));
        self
    }

    /// Adds an assembly reference with a public key token
    #[must_use]
    pub fn assembly_ref_with_token(mut self, name: &str, version: &str, token: [u8; 8]) -> Self {
        self.references.push((
            name.to_string(),
            FourPartVersion::parse_lenient(version),
            Some(PublicKeyToken(token)),
        ));
        self
    }

    /// Adds an assembly attribute with one string argument
    #[must_use]
    pub fn assembly_attribute(mut self, type_name: &str, value: &str) -> Self {
        self.attributes.push((type_name.to_string(), value.to_string()));
        self
    }

    /// Strong names the assembly with `public_key` and reserves a signature slot
    #[must_use]
    pub fn public_key(mut self, public_key: &[u8]) -> Self {
        self.public_key = public_key.to_vec();
        self
    }

    /// Embeds a version resource
    #[must_use]
    pub fn version_info(mut self, version: VersionResource) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets one string of the version resource, creating it if needed
    #[must_use]
    pub fn version_field(mut self, field: VersionField, value: &str) -> Self {
        self.version
            .get_or_insert_with(VersionResource::new)
            .set(field, Some(value));
        self
    }

    /// Embeds a manifest resource
    #[must_use]
    pub fn manifest(mut self, manifest: &str) -> Self {
        self.manifest = Some(manifest.to_string());
        self
    }

    /// Appends an attribute certificate carrying `content`
    #[must_use]
    pub fn certificate(mut self, content: Vec<u8>) -> Self {
        self.certificate = Some(content);
        self
    }

    /// Lays out the image.
    ///
    /// # Errors
    /// Returns an error if the metadata or resources can't be encoded
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut directories = [(0_u32, 0_u32); DATA_DIRECTORY_COUNT];

        // .text: entry stub, imports, CLR header, metadata, strong-name slot
        let mut text = vec![0xC3_u8];
        if !self.imports.is_empty() {
            pad(&mut text, 4);
            let descriptors = text.len();
            let thunk = descriptors + (self.imports.len() + 1) * 20;
            text.resize(thunk + 8, 0);
            for (index, dll) in self.imports.iter().enumerate() {
                let name = text.len();
                text.extend_from_slice(dll.as_bytes());
                text.push(0);
                let slot = descriptors + index * 20;
                write_le_at::<u32>(&mut text, slot, rva(thunk))?;
                write_le_at::<u32>(&mut text, slot + 12, rva(name))?;
                write_le_at::<u32>(&mut text, slot + 16, rva(thunk))?;
            }
            directories[DataDirectoryType::Import as usize] =
                (rva(descriptors), len32((self.imports.len() + 1) * 20));
        }

        if let Some((name, version)) = &self.assembly {
            let mut metadata = MetadataBuilder::new(name, *version).public_key(&self.public_key);
            for (reference, version, token) in &self.references {
                metadata = metadata.reference(reference, *version, *token);
            }
            for (type_name, value) in &self.attributes {
                metadata = metadata.attribute(type_name, value);
            }
            let metadata = metadata.build()?;

            pad(&mut text, 4);
            let cor20 = text.len();
            text.resize(cor20 + Cor20Header::SIZE, 0);
            pad(&mut text, 4);
            let metadata_offset = text.len();
            text.extend_from_slice(&metadata);

            let mut header = [0_u8; Cor20Header::SIZE];
            write_le_at::<u32>(&mut header, 0, len32(Cor20Header::SIZE))?;
            write_le_at::<u16>(&mut header, 4, 2)?;
            write_le_at::<u16>(&mut header, 6, 5)?;
            write_le_at::<u32>(&mut header, 8, rva(metadata_offset))?;
            write_le_at::<u32>(&mut header, 12, len32(metadata.len()))?;
            write_le_at::<u32>(&mut header, 16, self.cor_flags)?;
            if !self.public_key.is_empty() {
                pad(&mut text, 4);
                let slot = text.len();
                text.resize(slot + STRONG_NAME_SLOT, 0);
                write_le_at::<u32>(&mut header, 32, rva(slot))?;
                write_le_at::<u32>(&mut header, 36, len32(STRONG_NAME_SLOT))?;
            }
            text[cor20..cor20 + Cor20Header::SIZE].copy_from_slice(&header);

            directories[DataDirectoryType::ClrRuntimeHeader as usize] =
                (rva(cor20), len32(Cor20Header::SIZE));
        }

        let mut sections = vec![(".text", CODE_SECTION, TEXT_RVA, text)];

        if self.version.is_some() || self.manifest.is_some() {
            let mut table = ResourceTable::new();
            if let Some(version) = &self.version {
                table.set_version(version)?;
            }
            if let Some(manifest) = &self.manifest {
                table.set_manifest(manifest);
            }
            let rsrc_rva = TEXT_RVA + align_up(len32(sections[0].3.len()), SECTION_ALIGNMENT);
            let content = table.to_section(rsrc_rva)?;
            directories[DataDirectoryType::Resource as usize] = (rsrc_rva, len32(content.len()));
            sections.push((".rsrc", RESOURCE_SECTION, rsrc_rva, content));
        }

        self.layout(&sections, &mut directories)
    }

    fn layout(
        &self,
        sections: &[(&str, u32, u32, Vec<u8>)],
        directories: &mut [(u32, u32); DATA_DIRECTORY_COUNT],
    ) -> Result<Vec<u8>> {
        let optional_size = if self.pe32_plus { 112 } else { 96 } + 8 * self.data_directories as usize;
        let coff = PE_OFFSET + 4;
        let optional = coff + 20;
        let section_table = optional + optional_size;

        let mut out = vec![0_u8; SIZE_OF_HEADERS as usize];
        out[0] = b'M';
        out[1] = b'Z';
        write_le_at::<u32>(&mut out, 0x3C, len32(PE_OFFSET))?;
        out[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let mut raw = SIZE_OF_HEADERS;
        let mut size_of_code = 0;
        let mut size_of_data = 0;
        let mut image_end = TEXT_RVA;
        for (index, (name, characteristics, virtual_address, content)) in sections.iter().enumerate() {
            let raw_size = align_up(len32(content.len()), FILE_ALIGNMENT);
            let header = section_table + index * 40;
            out[header..header + name.len()].copy_from_slice(name.as_bytes());
            write_le_at::<u32>(&mut out, header + 8, len32(content.len()))?;
            write_le_at::<u32>(&mut out, header + 12, *virtual_address)?;
            write_le_at::<u32>(&mut out, header + 16, raw_size)?;
            write_le_at::<u32>(&mut out, header + 20, raw)?;
            write_le_at::<u32>(&mut out, header + 36, *characteristics)?;

            out.resize(raw as usize, 0);
            out.extend_from_slice(content);
            out.resize((raw + raw_size) as usize, 0);

            raw += raw_size;
            if *characteristics == CODE_SECTION {
                size_of_code += raw_size;
            } else {
                size_of_data += raw_size;
            }
            image_end = align_up(virtual_address + len32(content.len()), SECTION_ALIGNMENT);
        }

        if let Some(content) = &self.certificate {
            let start = out.len();
            let length = 8 + content.len();
            out.extend_from_slice(&len32(length).to_le_bytes());
            out.extend_from_slice(&0x0200_u16.to_le_bytes());
            out.extend_from_slice(&0x0002_u16.to_le_bytes());
            out.extend_from_slice(content);
            pad(&mut out, 8);
            directories[DataDirectoryType::Certificate as usize] =
                (len32(start), len32(out.len() - start));
        }

        // COFF header
        write_le_at::<u16>(&mut out, coff, self.machine)?;
        write_le_at::<u16>(&mut out, coff + 2, u16::try_from(sections.len()).unwrap_or(0))?;
        write_le_at::<u16>(&mut out, coff + 16, u16::try_from(optional_size).unwrap_or(0))?;
        let characteristics: u16 = if self.pe32_plus { 0x2022 } else { 0x2102 };
        write_le_at::<u16>(&mut out, coff + 18, characteristics)?;

        // Optional header
        let (magic, wide) = if self.pe32_plus {
            (PE32_PLUS_MAGIC, 16)
        } else {
            (PE32_MAGIC, 0)
        };
        write_le_at::<u16>(&mut out, optional, magic)?;
        out[optional + 2] = 0x0B;
        write_le_at::<u32>(&mut out, optional + 4, size_of_code)?;
        write_le_at::<u32>(&mut out, optional + 8, size_of_data)?;
        write_le_at::<u32>(&mut out, optional + 16, TEXT_RVA)?;
        write_le_at::<u32>(&mut out, optional + 20, TEXT_RVA)?;
        if self.pe32_plus {
            write_le_at::<u64>(&mut out, optional + 24, 0x1_8000_0000)?;
        } else {
            write_le_at::<u32>(&mut out, optional + 28, 0x1000_0000)?;
        }
        write_le_at::<u32>(&mut out, optional + 32, SECTION_ALIGNMENT)?;
        write_le_at::<u32>(&mut out, optional + 36, FILE_ALIGNMENT)?;
        write_le_at::<u16>(&mut out, optional + 40, 4)?;
        write_le_at::<u16>(&mut out, optional + 48, 4)?;
        write_le_at::<u32>(&mut out, optional + 56, image_end)?;
        write_le_at::<u32>(&mut out, optional + 60, SIZE_OF_HEADERS)?;
        write_le_at::<u16>(&mut out, optional + 68, self.subsystem)?;
        write_le_at::<u16>(&mut out, optional + 70, 0x8540)?;

        // stack and heap reserve/commit
        let reserve_commit = [0x10_0000_u64, 0x1000, 0x10_0000, 0x1000];
        for (index, value) in reserve_commit.iter().enumerate() {
            if self.pe32_plus {
                write_le_at::<u64>(&mut out, optional + 72 + index * 8, *value)?;
            } else {
                #[allow(clippy::cast_possible_truncation)]
                let value = *value as u32;
                write_le_at::<u32>(&mut out, optional + 72 + index * 4, value)?;
            }
        }
        write_le_at::<u32>(&mut out, optional + 92 + wide, self.data_directories)?;

        let table = optional + 96 + wide;
        for (index, (rva, size)) in directories
            .iter()
            .enumerate()
            .take(self.data_directories as usize)
        {
            write_le_at::<u32>(&mut out, table + index * 8, *rva)?;
            write_le_at::<u32>(&mut out, table + index * 8 + 4, *size)?;
        }

        let checksum_offset = optional + 64;
        let checksum = calculate_checksum(&out, checksum_offset);
        write_le_at::<u32>(&mut out, checksum_offset, checksum)?;
        Ok(out)
    }
}

fn pad(data: &mut Vec<u8>, alignment: usize) {
    while data.len() % alignment != 0 {
        data.push(0);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn len32(value: usize) -> u32 {
    value as u32
}

fn rva(text_offset: usize) -> u32 {
    TEXT_RVA + len32(text_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::headers::{PeHeaders, PeProbe};

    fn headers(image: &[u8]) -> PeHeaders {
        match PeHeaders::parse(image).unwrap() {
            PeProbe::Pe(headers) => *headers,
            PeProbe::NotPe => panic!("not a PE image"),
        }
    }

    #[test]
    fn pe32_plus_layout() {
        let image = ImageBuilder::new().pe32_plus().machine(0x8664).build().unwrap();
        let headers = headers(&image);
        assert!(headers.is_pe32_plus());
        assert_eq!(headers.optional.image_base, 0x1_8000_0000);
        assert_eq!(headers.optional.size_of_headers, SIZE_OF_HEADERS);
        assert_eq!(headers.coff.size_of_optional_header, 112 + 16 * 8);
        assert_eq!(headers.offsets.checksum(), headers.offsets.optional_header + 64);
        assert_eq!(
            headers.optional.checksum,
            calculate_checksum(&image, headers.offsets.checksum())
        );
    }

    #[test]
    fn managed_with_resources() {
        let image = ImageBuilder::new()
            .managed("Lib", "1.0.0.0")
            .public_key(&[1; 160])
            .version_field(VersionField::CompanyName, "Contoso")
            .manifest("<assembly/>")
            .build()
            .unwrap();
        let headers = headers(&image);
        assert_eq!(headers.sections.len(), 2);
        assert_eq!(headers.sections[1].name(), ".rsrc");
        let cor20 = headers.cor20.unwrap();
        assert_eq!(cor20.strong_name_signature.size as usize, STRONG_NAME_SLOT);
        assert!(headers.directory(DataDirectoryType::Resource).size > 0);

        let table = ResourceTable::read(&image, &headers).unwrap();
        assert_eq!(table.manifest_text().unwrap().as_deref(), Some("<assembly/>"));
    }

    #[test]
    fn certificate_is_last() {
        let image = ImageBuilder::new().certificate(vec![0xAA; 13]).build().unwrap();
        let headers = headers(&image);
        let directory = headers.directory(DataDirectoryType::Certificate);
        assert_eq!((directory.rva + directory.size) as usize, image.len());
        assert_eq!(directory.size % 8, 0);
    }

    #[test]
    fn truncated_directory_table() {
        let image = ImageBuilder::new()
            .managed("Lib", "1.0.0.0")
            .data_directory_count(10)
            .build()
            .unwrap();
        let headers = headers(&image);
        assert_eq!(headers.directories.len(), 10);
        assert!(headers.cor20.is_none());
    }
}
