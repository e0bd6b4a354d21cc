//! In-memory PE image editing.
//!
//! [`PeImage`] owns the bytes of one image together with its parsed headers and performs the
//! layout changes the save pipeline needs: pointing a data directory at freshly serialized data
//! in a dedicated trailing section, dropping the attribute certificate table, and keeping
//! `SizeOfImage`, `SizeOfInitializedData`, `NumberOfSections` and the checksum consistent.
//!
//! Sections are only ever appended or rewritten when they are the last one in the file, so the
//! RVAs of existing code and data never move.

use std::{fs, path::Path};

use crate::{
    file::io::write_le_at,
    pe::headers::{
        DataDirectory, DataDirectoryType, PeHeaders, PeProbe, SectionHeader, SECTION_HEADER_SIZE,
    },
    Error, Result,
};

/// `IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ`
pub const READONLY_DATA: u32 = 0x4000_0040;

const DEFAULT_FILE_ALIGNMENT: u32 = 0x200;
const DEFAULT_SECTION_ALIGNMENT: u32 = 0x1000;

/// Rounds `value` up to a multiple of `alignment`
#[must_use]
pub fn align_up(value: u32, alignment: u32) -> u32 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// The PE checksum of `data`, treating the 4 bytes at `checksum_offset` as zero.
///
/// Little-endian 16-bit words are summed with end-around carry folding; a trailing odd byte
/// counts as a word padded with zero; the file length is added at the end.
#[must_use]
pub fn calculate_checksum(data: &[u8], checksum_offset: usize) -> u32 {
    let mut sum: u64 = 0;
    let mut offset = 0;

    while offset < data.len() {
        let word = if offset + 1 < data.len() {
            u16::from_le_bytes([data[offset], data[offset + 1]])
        } else {
            u16::from(data[offset])
        };

        if offset != checksum_offset && offset != checksum_offset + 2 {
            sum += u64::from(word);
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        offset += 2;
    }

    sum = (sum & 0xFFFF) + (sum >> 16);
    #[allow(clippy::cast_possible_truncation)]
    let checksum = (sum as u32).wrapping_add(data.len() as u32);
    checksum
}

/// An editable PE image.
#[derive(Debug, Clone)]
pub struct PeImage {
    data: Vec<u8>,
    headers: PeHeaders,
}

impl PeImage {
    /// Parses `data` as a PE image.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if `data` is not a PE image, or a parse error
    pub fn new(data: Vec<u8>) -> Result<PeImage> {
        match PeHeaders::parse(&data)? {
            PeProbe::Pe(headers) => Ok(PeImage {
                data,
                headers: *headers,
            }),
            PeProbe::NotPe => Err(Error::NotSupported("not a PE image".to_string())),
        }
    }

    /// Reads and parses the image at `path`
    ///
    /// # Errors
    /// Returns an error if the file can't be read or is not a PE image
    pub fn read(path: impl AsRef<Path>) -> Result<PeImage> {
        PeImage::new(fs::read(path)?)
    }

    /// Writes the image to `path`
    ///
    /// # Errors
    /// Returns an error if the file can't be written
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, &self.data)?;
        Ok(())
    }

    /// The parsed headers, current with every edit
    #[must_use]
    pub fn headers(&self) -> &PeHeaders {
        &self.headers
    }

    /// The raw bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the image, returning its bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Overwrites bytes at a file offset and re-reads the headers
    ///
    /// # Errors
    /// Returns an error if the range is outside the file or the headers no longer parse
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(out_of_bounds_error!())?;
        let target = self
            .data
            .get_mut(offset..end)
            .ok_or(out_of_bounds_error!())?;
        target.copy_from_slice(bytes);
        self.reparse()
    }

    /// Points the data directory `kind` at `directory`.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if the optional header doesn't declare that directory
    pub fn set_directory(&mut self, kind: DataDirectoryType, directory: DataDirectory) -> Result<()> {
        if kind as usize >= self.headers.directories.len() {
            return Err(Error::NotSupported(format!(
                "image declares only {} data directories, {} is missing",
                self.headers.directories.len(),
                kind
            )));
        }

        let offset = self.headers.offsets.data_directory(kind);
        write_le_at::<u32>(&mut self.data, offset, directory.rva)?;
        write_le_at::<u32>(&mut self.data, offset + 4, directory.size)?;
        self.headers.directories[kind as usize] = directory;
        Ok(())
    }

    /// Places data into the section called `name` and returns the section's RVA.
    ///
    /// If the last section already has this name and its data ends the file, it is rewritten
    /// in place; otherwise a new section is appended after all existing data. `build` receives
    /// the RVA the content will live at, so it can emit absolute RVAs.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] if a new section header does not fit before the first
    /// section's data, or any error returned by `build`
    pub fn place_section<F>(&mut self, name: &str, characteristics: u32, build: F) -> Result<u32>
    where
        F: FnOnce(u32) -> Result<Vec<u8>>,
    {
        let section_name = section_name(name)?;
        let file_alignment = match self.headers.optional.file_alignment {
            0 => DEFAULT_FILE_ALIGNMENT,
            alignment => alignment,
        };
        let section_alignment = match self.headers.optional.section_alignment {
            0 => DEFAULT_SECTION_ALIGNMENT,
            alignment => alignment,
        };

        let data_len = u32::try_from(self.data.len())
            .map_err(|_| Error::NotSupported("image larger than 4GB".to_string()))?;
        let reusable = self.headers.sections.last().filter(|last| {
            last.name == section_name
                && last.pointer_to_raw_data.saturating_add(last.size_of_raw_data) >= data_len
        });

        let (index, virtual_address, pointer_to_raw_data, previous_raw_size) = match reusable {
            Some(last) => (
                self.headers.sections.len() - 1,
                last.virtual_address,
                last.pointer_to_raw_data,
                last.size_of_raw_data,
            ),
            None => {
                self.ensure_section_header_room()?;
                let virtual_address = self.headers.sections.last().map_or(
                    align_up(self.headers.optional.size_of_headers, section_alignment),
                    |last| {
                        align_up(
                            last.virtual_address
                                + last.virtual_size.max(last.size_of_raw_data),
                            section_alignment,
                        )
                    },
                );
                (
                    self.headers.sections.len(),
                    virtual_address,
                    align_up(data_len, file_alignment),
                    0,
                )
            }
        };

        let content = build(virtual_address)?;
        let virtual_size = u32::try_from(content.len())
            .map_err(|_| Error::NotSupported("section larger than 4GB".to_string()))?;
        let raw_size = align_up(virtual_size, file_alignment);

        self.data.resize(pointer_to_raw_data as usize, 0);
        self.data.extend_from_slice(&content);
        self.data
            .resize(pointer_to_raw_data as usize + raw_size as usize, 0);

        let header = SectionHeader {
            name: section_name,
            virtual_size,
            virtual_address,
            size_of_raw_data: raw_size,
            pointer_to_raw_data,
            characteristics,
        };
        self.write_section_header(index, &header)?;

        let offsets = self.headers.offsets;
        if index == self.headers.sections.len() {
            let count = self.headers.coff.number_of_sections + 1;
            write_le_at::<u16>(&mut self.data, offsets.number_of_sections(), count)?;
        }

        let initialized = self
            .headers
            .optional
            .size_of_initialized_data
            .saturating_sub(previous_raw_size)
            .saturating_add(raw_size);
        write_le_at::<u32>(&mut self.data, offsets.size_of_initialized_data(), initialized)?;

        let size_of_image = align_up(virtual_address + virtual_size, section_alignment);
        write_le_at::<u32>(&mut self.data, offsets.size_of_image(), size_of_image)?;

        self.reparse()?;
        Ok(virtual_address)
    }

    /// Removes the attribute certificate table. Returns false if the image had none.
    ///
    /// A table at the end of the file is truncated away; the directory entry is always cleared.
    ///
    /// # Errors
    /// Returns an error if the directory points outside the file
    pub fn strip_certificates(&mut self) -> Result<bool> {
        let directory = self.headers.directory(DataDirectoryType::Certificate);
        if directory.is_empty() {
            return Ok(false);
        }

        let start = directory.rva as usize;
        let end = start
            .checked_add(directory.size as usize)
            .ok_or(out_of_bounds_error!())?;
        if end > self.data.len() || start < self.headers.optional.size_of_headers as usize {
            return Err(malformed_error!(
                "Certificate table {}..{} lies outside the file",
                start,
                end
            ));
        }

        // Trailing zero padding after the table belongs to it.
        if self.data[end..].iter().all(|b| *b == 0) {
            self.data.truncate(start);
        }
        self.set_directory(DataDirectoryType::Certificate, DataDirectory::default())?;
        self.update_checksum()?;
        Ok(true)
    }

    /// Recomputes and stores the PE checksum
    ///
    /// # Errors
    /// Returns an error if the checksum field is outside the file
    pub fn update_checksum(&mut self) -> Result<()> {
        let offset = self.headers.offsets.checksum();
        let checksum = calculate_checksum(&self.data, offset);
        write_le_at::<u32>(&mut self.data, offset, checksum)?;
        self.headers.optional.checksum = checksum;
        Ok(())
    }

    fn ensure_section_header_room(&self) -> Result<()> {
        let table_end = self.headers.offsets.section_table
            + (self.headers.sections.len() + 1) * SECTION_HEADER_SIZE;
        let first_data = self
            .headers
            .sections
            .iter()
            .filter(|s| s.size_of_raw_data > 0)
            .map(|s| s.pointer_to_raw_data as usize)
            .min()
            .unwrap_or(usize::MAX);
        let limit = first_data.min(self.headers.optional.size_of_headers as usize);

        if table_end > limit {
            return Err(Error::NotSupported(
                "no room for an additional section header".to_string(),
            ));
        }
        Ok(())
    }

    fn write_section_header(&mut self, index: usize, header: &SectionHeader) -> Result<()> {
        let offset = self.headers.offsets.section_table + index * SECTION_HEADER_SIZE;
        let slot = self
            .data
            .get_mut(offset..offset + SECTION_HEADER_SIZE)
            .ok_or(out_of_bounds_error!())?;
        slot.fill(0);
        slot[..8].copy_from_slice(&header.name);
        write_le_at::<u32>(slot, 8, header.virtual_size)?;
        write_le_at::<u32>(slot, 12, header.virtual_address)?;
        write_le_at::<u32>(slot, 16, header.size_of_raw_data)?;
        write_le_at::<u32>(slot, 20, header.pointer_to_raw_data)?;
        write_le_at::<u32>(slot, 36, header.characteristics)?;
        Ok(())
    }

    fn reparse(&mut self) -> Result<()> {
        match PeHeaders::parse(&self.data)? {
            PeProbe::Pe(headers) => {
                self.headers = *headers;
                Ok(())
            }
            PeProbe::NotPe => Err(malformed_error!("Edit destroyed the PE signature")),
        }
    }
}

fn section_name(name: &str) -> Result<[u8; 8]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::NotSupported(format!("invalid section name '{name}'")));
    }
    let mut section_name = [0_u8; 8];
    section_name[..bytes.len()].copy_from_slice(bytes);
    Ok(section_name)
}
