//! Reader and writer for the three-level `IMAGE_RESOURCE_DIRECTORY` tree.
//!
//! Level one is keyed by resource type, level two by resource name and level three by
//! language; the leaves are `IMAGE_RESOURCE_DATA_ENTRY` records holding the RVA of the data.
//! All directory and string offsets are relative to the start of the tree, data RVAs are
//! image-relative.

use std::collections::BTreeMap;

use widestring::U16String;

use crate::{
    file::{io::write_le_at, parser::Parser},
    pe::headers::PeHeaders,
    resources::{ResourceEntry, ResourceName},
    Result,
};

const DIRECTORY_SIZE: usize = 16;
const DIRECTORY_ENTRY_SIZE: usize = 8;
const DATA_ENTRY_SIZE: usize = 16;
const HIGH_BIT: u32 = 0x8000_0000;

pub(crate) type Tree = BTreeMap<ResourceName, BTreeMap<ResourceName, Vec<ResourceEntry>>>;

struct RawEntry {
    name: ResourceName,
    offset: u32,
    is_directory: bool,
}

fn read_directory(tree: &[u8], offset: usize) -> Result<Vec<RawEntry>> {
    let mut parser = Parser::at(tree, offset)?;
    // characteristics, timestamp, major and minor version
    parser.advance_by(12)?;
    let named = parser.read_le::<u16>()? as usize;
    let ids = parser.read_le::<u16>()? as usize;

    let mut entries = Vec::with_capacity(named + ids);
    for _ in 0..named + ids {
        let name = parser.read_le::<u32>()?;
        let offset = parser.read_le::<u32>()?;

        let name = if name & HIGH_BIT != 0 {
            let mut string = Parser::at(tree, (name & !HIGH_BIT) as usize)?;
            let length = string.read_le::<u16>()? as usize;
            ResourceName::Name(string.read_utf16(length)?)
        } else {
            ResourceName::Id((name & 0xFFFF) as u16)
        };

        entries.push(RawEntry {
            name,
            offset: offset & !HIGH_BIT,
            is_directory: offset & HIGH_BIT != 0,
        });
    }
    Ok(entries)
}

/// Decodes the tree starting at `tree[0]`; `image` and `headers` resolve the data RVAs.
pub(crate) fn read_tree(tree: &[u8], image: &[u8], headers: &PeHeaders) -> Result<Tree> {
    let mut result = Tree::new();

    for kind in read_directory(tree, 0)? {
        if !kind.is_directory {
            return Err(malformed_error!("Resource type {} is not a directory", kind.name));
        }

        let names = result.entry(kind.name.clone()).or_default();
        for name in read_directory(tree, kind.offset as usize)? {
            if !name.is_directory {
                return Err(malformed_error!("Resource {} is not a directory", name.name));
            }

            let languages = names.entry(name.name.clone()).or_default();
            for language in read_directory(tree, name.offset as usize)? {
                if language.is_directory {
                    return Err(malformed_error!(
                        "Resource {}/{} nests deeper than three levels",
                        kind.name,
                        name.name
                    ));
                }
                let ResourceName::Id(language_id) = language.name else {
                    return Err(malformed_error!("Resource language must be numeric"));
                };

                let mut parser = Parser::at(tree, language.offset as usize)?;
                let rva = parser.read_le::<u32>()?;
                let size = parser.read_le::<u32>()? as usize;
                let code_page = parser.read_le::<u32>()?;

                let start = headers.rva_to_offset(rva)?;
                let end = start.checked_add(size).ok_or(out_of_bounds_error!())?;
                let data = image.get(start..end).ok_or(out_of_bounds_error!())?;

                languages.push(ResourceEntry {
                    language: language_id,
                    code_page,
                    data: data.to_vec(),
                });
            }
        }
    }

    Ok(result)
}

fn directory_header(out: &mut [u8], offset: usize, named: usize, ids: usize) -> Result<()> {
    let named = u16::try_from(named).map_err(|_| malformed_error!("Too many named resources"))?;
    let ids = u16::try_from(ids).map_err(|_| malformed_error!("Too many resource ids"))?;
    write_le_at::<u16>(out, offset + 12, named)?;
    write_le_at::<u16>(out, offset + 14, ids)?;
    Ok(())
}

fn count_names<'a>(names: impl Iterator<Item = &'a ResourceName>) -> (usize, usize) {
    names.fold((0, 0), |(named, ids), name| match name {
        ResourceName::Name(_) => (named + 1, ids),
        ResourceName::Id(_) => (named, ids + 1),
    })
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Resource section exceeds 4GB"))
}

/// Serializes `tree` as the content of a section placed at `base_rva`.
pub(crate) fn write_tree(tree: &Tree, base_rva: u32) -> Result<Vec<u8>> {
    // Offsets of every directory, then the data entries, strings and data.
    let mut next = DIRECTORY_SIZE + tree.len() * DIRECTORY_ENTRY_SIZE;
    let mut type_offsets = Vec::with_capacity(tree.len());
    for names in tree.values() {
        type_offsets.push(next);
        next += DIRECTORY_SIZE + names.len() * DIRECTORY_ENTRY_SIZE;
    }

    let mut name_offsets = Vec::new();
    for names in tree.values() {
        for languages in names.values() {
            name_offsets.push(next);
            next += DIRECTORY_SIZE + languages.len() * DIRECTORY_ENTRY_SIZE;
        }
    }

    let data_entries = next;
    let leaf_count: usize = tree
        .values()
        .flat_map(BTreeMap::values)
        .map(Vec::len)
        .sum();
    next += leaf_count * DATA_ENTRY_SIZE;

    let mut strings = Vec::new();
    let mut string_offsets = BTreeMap::new();
    for (kind, names) in tree {
        for name in std::iter::once(kind).chain(names.keys()) {
            if let ResourceName::Name(text) = name {
                if string_offsets.contains_key(text.as_str()) {
                    continue;
                }
                string_offsets.insert(text.as_str(), next + strings.len());
                let units = U16String::from_str(text);
                let length = u16::try_from(units.len())
                    .map_err(|_| malformed_error!("Resource name '{}' is too long", text))?;
                strings.extend_from_slice(&length.to_le_bytes());
                for unit in units.as_slice() {
                    strings.extend_from_slice(&unit.to_le_bytes());
                }
            }
        }
    }
    next += strings.len();

    let mut out = vec![0_u8; next];
    out[next - strings.len()..].copy_from_slice(&strings);

    let name_field = |name: &ResourceName| -> Result<u32> {
        match name {
            ResourceName::Id(id) => Ok(u32::from(*id)),
            ResourceName::Name(text) => {
                let offset = string_offsets
                    .get(text.as_str())
                    .ok_or_else(|| malformed_error!("Resource name '{}' was not laid out", text))?;
                Ok(to_u32(*offset)? | HIGH_BIT)
            }
        }
    };

    let (named, ids) = count_names(tree.keys());
    directory_header(&mut out, 0, named, ids)?;

    let mut name_index = 0;
    let mut leaf_index = 0;
    for (type_index, (kind, names)) in tree.iter().enumerate() {
        let slot = DIRECTORY_SIZE + type_index * DIRECTORY_ENTRY_SIZE;
        write_le_at::<u32>(&mut out, slot, name_field(kind)?)?;
        write_le_at::<u32>(&mut out, slot + 4, to_u32(type_offsets[type_index])? | HIGH_BIT)?;

        let type_offset = type_offsets[type_index];
        let (named, ids) = count_names(names.keys());
        directory_header(&mut out, type_offset, named, ids)?;

        for (index, (name, languages)) in names.iter().enumerate() {
            let slot = type_offset + DIRECTORY_SIZE + index * DIRECTORY_ENTRY_SIZE;
            let name_offset = name_offsets[name_index];
            name_index += 1;
            write_le_at::<u32>(&mut out, slot, name_field(name)?)?;
            write_le_at::<u32>(&mut out, slot + 4, to_u32(name_offset)? | HIGH_BIT)?;

            directory_header(&mut out, name_offset, 0, languages.len())?;
            for (index, entry) in languages.iter().enumerate() {
                let slot = name_offset + DIRECTORY_SIZE + index * DIRECTORY_ENTRY_SIZE;
                let leaf = data_entries + leaf_index * DATA_ENTRY_SIZE;
                leaf_index += 1;
                write_le_at::<u32>(&mut out, slot, u32::from(entry.language))?;
                write_le_at::<u32>(&mut out, slot + 4, to_u32(leaf)?)?;
            }
        }
    }

    // Data blobs, each 8-aligned, referenced by the leaves in order.
    let mut leaf = data_entries;
    for entry in tree.values().flat_map(BTreeMap::values).flatten() {
        while out.len() % 8 != 0 {
            out.push(0);
        }
        let rva = base_rva
            .checked_add(to_u32(out.len())?)
            .ok_or_else(|| malformed_error!("Resource section exceeds 4GB"))?;
        write_le_at::<u32>(&mut out, leaf, rva)?;
        write_le_at::<u32>(&mut out, leaf + 4, to_u32(entry.data.len())?)?;
        write_le_at::<u32>(&mut out, leaf + 8, entry.code_page)?;
        out.extend_from_slice(&entry.data);
        leaf += DATA_ENTRY_SIZE;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::io::read_le_at;

    fn sample() -> Tree {
        let mut tree = Tree::new();
        tree.entry(ResourceName::Id(16)).or_default().insert(
            ResourceName::Id(1),
            vec![ResourceEntry {
                language: 1033,
                code_page: 0,
                data: vec![1, 2, 3],
            }],
        );
        let custom = tree.entry(ResourceName::Name("CUSTOM".into())).or_default();
        custom.insert(
            ResourceName::Name("BLOB".into()),
            vec![
                ResourceEntry {
                    language: 0,
                    code_page: 1252,
                    data: vec![9; 5],
                },
                ResourceEntry {
                    language: 1031,
                    code_page: 0,
                    data: vec![7; 2],
                },
            ],
        );
        tree
    }

    #[test]
    fn root_counts_named_before_ids() {
        let bytes = write_tree(&sample(), 0x3000).unwrap();
        assert_eq!(read_le_at::<u16>(&bytes, &mut 12).unwrap(), 1);
        assert_eq!(read_le_at::<u16>(&bytes, &mut 14).unwrap(), 1);
        // first root entry is the named type
        assert_ne!(read_le_at::<u32>(&bytes, &mut 16).unwrap() & HIGH_BIT, 0);
        assert_eq!(read_le_at::<u32>(&bytes, &mut 24).unwrap(), 16);
    }

    #[test]
    fn tree_reads_back_through_an_image() {
        use crate::pe::{PeImage, ImageBuilder, DataDirectoryType, image::READONLY_DATA};
        use crate::pe::headers::DataDirectory;

        let tree = sample();
        let mut image = PeImage::new(ImageBuilder::new().build().unwrap()).unwrap();
        let mut size = 0;
        let rva = image
            .place_section(".rsrc", READONLY_DATA, |rva| {
                let bytes = write_tree(&tree, rva)?;
                size = bytes.len();
                Ok(bytes)
            })
            .unwrap();
        image
            .set_directory(
                DataDirectoryType::Resource,
                DataDirectory {
                    rva,
                    size: size as u32,
                },
            )
            .unwrap();

        let offset = image.headers().rva_to_offset(rva).unwrap();
        let decoded = read_tree(
            &image.data()[offset..offset + size],
            image.data(),
            image.headers(),
        )
        .unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn truncated_tree() {
        let bytes = write_tree(&sample(), 0x3000).unwrap();
        let image = crate::pe::ImageBuilder::new().build().unwrap();
        let probe = PeHeaders::parse(&image).unwrap();
        assert!(read_tree(&bytes[..20], &image, probe.headers().unwrap()).is_err());
    }
}
