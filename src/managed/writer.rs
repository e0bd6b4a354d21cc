//! In-place rewrite of the assembly-level metadata.
//!
//! Table cells keep their width: new values only ever change heap indexes, flags and version
//! numbers. New blobs are appended to `#Blob`, the whole metadata block is copied into a
//! trailing `.cormeta` section with the streams re-laid out, and the CLR header is pointed at
//! the copy. The old metadata stays behind unreferenced.

use log::debug;

use crate::{
    file::io::{write_index_at, write_le_at},
    identity::{FourPartVersion, PublicKeyToken},
    managed::{
        encode_string_argument,
        heaps::BlobHeapBuilder,
        reader::{MetadataRoot, TablesStream},
        tables::{TableId, HEAP_LARGE_BLOB},
        ASSEMBLY_FLAG_PUBLIC_KEY,
    },
    pe::{
        cor20::Cor20Header,
        image::{PeImage, READONLY_DATA},
    },
    Error, Result,
};

const SECTION_NAME: &str = ".cormeta";

/// A set of edits to apply to a managed image's assembly metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedRewrite {
    /// Public key to store on the `Assembly` row
    pub public_key: Option<Vec<u8>>,
    /// Bytes to reserve for the strong-name signature when the image has no slot yet
    pub signature_size: usize,
    /// New assembly version
    pub version: Option<FourPartVersion>,
    /// Public key tokens for `AssemblyRef` rows, by 1-based row
    pub reference_tokens: Vec<(u32, PublicKeyToken)>,
    /// New single-string values for `CustomAttribute` rows, by 1-based row
    pub attributes: Vec<(u32, String)>,
}

struct Patch {
    offset: usize,
    width: usize,
    value: u32,
}

impl ManagedRewrite {
    /// Returns true if there is nothing to change
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.public_key.is_none()
            && self.version.is_none()
            && self.reference_tokens.is_empty()
            && self.attributes.is_empty()
    }

    /// Applies the edits to `image`.
    ///
    /// # Errors
    /// Returns [`Error::NotSupported`] for images without metadata or when the grown `#Blob`
    /// heap no longer fits 2-byte indexes; metadata parse errors otherwise
    pub fn apply(&self, image: &mut PeImage) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        let headers = image.headers().clone();
        let (Some(cor20), Some(cor20_offset)) = (&headers.cor20, headers.offsets.cor20_header)
        else {
            return Err(Error::NotSupported("image has no CLR header".to_string()));
        };

        let metadata = headers.directory_data(image.data(), cor20.metadata)?.to_vec();
        let root = MetadataRoot::read(&metadata)?;
        let tables_header = root
            .stream("#~")
            .or_else(|| root.stream("#-"))
            .ok_or_else(|| malformed_error!("Metadata has no table stream"))?;
        let tables_start = tables_header.offset as usize;
        let tables_data = &metadata[tables_start..tables_start + tables_header.size as usize];
        let tables = TablesStream::read(tables_data)?;

        let mut blobs = BlobHeapBuilder::extending(root.stream_data(&metadata, "#Blob"));
        let mut patches = Vec::new();
        let mut patch = |table: TableId, row: u32, column: usize, value: u32| -> Result<()> {
            let (offset, width) = tables.cell_location(table, row, column)?;
            patches.push(Patch {
                offset: tables_start + offset,
                width,
                value,
            });
            Ok(())
        };

        if let Some(public_key) = &self.public_key {
            let flags = tables.cell(TableId::Assembly, 1, 5)?;
            patch(TableId::Assembly, 1, 5, flags | ASSEMBLY_FLAG_PUBLIC_KEY)?;
            patch(TableId::Assembly, 1, 6, blobs.add(public_key)?)?;
        }

        if let Some(version) = self.version {
            for (column, part) in [version.major, version.minor, version.build, version.revision]
                .into_iter()
                .enumerate()
            {
                patch(TableId::Assembly, 1, column + 1, u32::from(part))?;
            }
        }

        for (row, token) in &self.reference_tokens {
            let flags = tables.cell(TableId::AssemblyRef, *row, 4)?;
            patch(TableId::AssemblyRef, *row, 4, flags & !ASSEMBLY_FLAG_PUBLIC_KEY)?;
            patch(TableId::AssemblyRef, *row, 5, blobs.add(token.as_bytes())?)?;
        }

        for (row, value) in &self.attributes {
            patch(TableId::CustomAttribute, *row, 2, blobs.add(&encode_string_argument(value)?)?)?;
        }

        if tables.info().heap_sizes() & HEAP_LARGE_BLOB == 0 && blobs.len() > 0xFFFF {
            return Err(Error::NotSupported(
                "#Blob heap outgrows 2-byte indexes".to_string(),
            ));
        }

        let mut patched = metadata.clone();
        for Patch {
            offset,
            width,
            value,
        } in patches
        {
            write_index_at(&mut patched, offset, width, value)?;
        }
        let mut content = relayout(&root, &patched, blobs.finish())?;
        let metadata_size = u32::try_from(content.len())
            .map_err(|_| malformed_error!("Metadata exceeds 4GB"))?;

        // A slot inside the section being replaced must be laid out again.
        let slot_in_section = headers.sections.last().is_some_and(|last| {
            last.name() == SECTION_NAME
                && !cor20.strong_name_signature.is_empty()
                && last.contains_rva(cor20.strong_name_signature.rva)
        });
        let slot_size = if slot_in_section {
            cor20.strong_name_signature.size as usize
        } else if cor20.strong_name_signature.is_empty() && self.public_key.is_some() {
            self.signature_size
        } else {
            0
        };
        let slot_offset = content.len();
        content.resize(slot_offset + slot_size, 0);

        let rva = image.place_section(SECTION_NAME, READONLY_DATA, move |_| Ok(content))?;
        debug!("metadata relocated to {SECTION_NAME} at 0x{rva:08x}, {metadata_size} bytes");

        let mut directory = [0_u8; 8];
        write_le_at::<u32>(&mut directory, 0, rva)?;
        write_le_at::<u32>(&mut directory, 4, metadata_size)?;
        image.write_at(cor20_offset + Cor20Header::METADATA_OFFSET, &directory)?;

        if slot_size > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let slot_rva = rva + slot_offset as u32;
            write_le_at::<u32>(&mut directory, 0, slot_rva)?;
            write_le_at::<u32>(&mut directory, 4, u32::try_from(slot_size).unwrap_or(0))?;
            image.write_at(cor20_offset + Cor20Header::STRONG_NAME_OFFSET, &directory)?;
        }

        image.update_checksum()
    }
}

/// Copies the root and lays the streams out back to back, substituting `#Blob`
fn relayout(root: &MetadataRoot, metadata: &[u8], blob_heap: Vec<u8>) -> Result<Vec<u8>> {
    let data_start = root
        .streams
        .iter()
        .map(|s| s.offset as usize)
        .min()
        .unwrap_or(metadata.len());
    let mut out = metadata[..data_start].to_vec();

    let mut order: Vec<_> = root.streams.iter().collect();
    order.sort_by_key(|s| s.offset);

    for stream in order {
        while out.len() % 4 != 0 {
            out.push(0);
        }
        let offset = u32::try_from(out.len()).map_err(|_| malformed_error!("Metadata exceeds 4GB"))?;
        if stream.name == "#Blob" {
            out.extend_from_slice(&blob_heap);
        } else {
            let start = stream.offset as usize;
            out.extend_from_slice(&metadata[start..start + stream.size as usize]);
        }
        let size = u32::try_from(out.len() - offset as usize)
            .map_err(|_| malformed_error!("Stream exceeds 4GB"))?;

        write_le_at::<u32>(&mut out, stream.header_offset, offset)?;
        write_le_at::<u32>(&mut out, stream.header_offset + 4, size)?;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        managed::ManagedAssembly,
        pe::{headers::PeHeaders, ImageBuilder},
    };

    fn assembly(image: &PeImage) -> ManagedAssembly {
        ManagedAssembly::read(image.data(), image.headers())
            .unwrap()
            .unwrap()
    }

    fn sample() -> PeImage {
        PeImage::new(
            ImageBuilder::new()
                .managed("Contoso.Core", "1.0.0.0")
                .assembly_ref("Contoso.Util", "1.0.0.0")
                .assembly_attribute("System.Reflection.AssemblyCompanyAttribute", "Old Co")
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn public_key_token_and_attribute() {
        let mut image = sample();
        let key = vec![0x5A; 160];
        let token = PublicKeyToken([1, 2, 3, 4, 5, 6, 7, 8]);
        let company = assembly(&image).attributes[0].row;

        ManagedRewrite {
            public_key: Some(key.clone()),
            signature_size: 128,
            version: Some(FourPartVersion::new(2, 0, 0, 1)),
            reference_tokens: vec![(1, token)],
            attributes: vec![(company, "New Co".to_string())],
        }
        .apply(&mut image)
        .unwrap();

        let rewritten = assembly(&image);
        assert_eq!(rewritten.public_key, key);
        assert_eq!(rewritten.flags & ASSEMBLY_FLAG_PUBLIC_KEY, ASSEMBLY_FLAG_PUBLIC_KEY);
        assert_eq!(rewritten.version, FourPartVersion::new(2, 0, 0, 1));
        assert_eq!(rewritten.references[0].public_key_token(), Some(token));
        assert_eq!(
            rewritten.attribute("System.Reflection.AssemblyCompanyAttribute"),
            Some("New Co")
        );
        assert_eq!(rewritten.name, "Contoso.Core");

        let cor20 = image.headers().cor20.unwrap();
        assert_eq!(cor20.strong_name_signature.size, 128);
        assert_eq!(image.headers().sections.last().unwrap().name(), SECTION_NAME);
    }

    #[test]
    fn second_rewrite_keeps_the_slot() {
        let mut image = sample();
        ManagedRewrite {
            public_key: Some(vec![0x11; 160]),
            signature_size: 128,
            ..ManagedRewrite::default()
        }
        .apply(&mut image)
        .unwrap();
        let sections = image.headers().sections.len();

        ManagedRewrite {
            version: Some(FourPartVersion::new(3, 0, 0, 0)),
            ..ManagedRewrite::default()
        }
        .apply(&mut image)
        .unwrap();

        assert_eq!(image.headers().sections.len(), sections);
        let cor20 = image.headers().cor20.unwrap();
        assert_eq!(cor20.strong_name_signature.size, 128);
        assert!(image
            .headers()
            .sections
            .last()
            .unwrap()
            .contains_rva(cor20.strong_name_signature.rva));
        assert_eq!(assembly(&image).public_key, vec![0x11; 160]);
    }

    #[test]
    fn native_image_is_rejected() {
        let mut image = PeImage::new(ImageBuilder::new().build().unwrap()).unwrap();
        let rewrite = ManagedRewrite {
            version: Some(FourPartVersion::new(1, 0, 0, 0)),
            ..ManagedRewrite::default()
        };
        assert!(matches!(rewrite.apply(&mut image), Err(Error::NotSupported(_))));
        assert!(matches!(
            PeHeaders::parse(image.data()).unwrap(),
            crate::pe::PeProbe::Pe(_)
        ));
    }

    #[test]
    fn empty_rewrite_is_a_no_op() {
        let mut image = sample();
        let before = image.data().to_vec();
        ManagedRewrite::default().apply(&mut image).unwrap();
        assert_eq!(image.data(), before.as_slice());
    }
}
