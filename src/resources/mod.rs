//! Win32 resources: the resource directory tree, version information and manifests.
//!
//! [`ResourceTable`] holds the complete resource tree of an image in memory. The save pipeline
//! edits it (replacing the version resource, replacing the manifest) and writes it back once as
//! a fresh `.rsrc` section at the end of the image, pointing the resource data directory there.
//!
//! # Example
//!
//! ```rust
//! use pesmith::pe::{ImageBuilder, PeImage};
//! use pesmith::resources::{ResourceTable, VersionField, VersionResource};
//!
//! let mut image = PeImage::new(ImageBuilder::new().build()?)?;
//! let mut table = ResourceTable::read(image.data(), image.headers())?;
//! assert!(table.is_empty());
//!
//! let mut version = VersionResource::new();
//! version.set(VersionField::CompanyName, Some("Contoso"));
//! table.set_version(&version)?;
//! table.set_manifest("<assembly/>");
//! table.write_into(&mut image)?;
//!
//! let table = ResourceTable::read(image.data(), image.headers())?;
//! let version = table.version()?.unwrap();
//! assert_eq!(version.get(VersionField::CompanyName), Some("Contoso"));
//! assert_eq!(table.manifest_text()?.as_deref(), Some("<assembly/>"));
//! # Ok::<(), pesmith::Error>(())
//! ```

mod directory;
mod version;

use std::fmt;

pub use version::{
    FixedFileInfo, StringTable, VersionField, VersionResource, DEFAULT_STRING_TABLE,
    DEFAULT_TRANSLATION,
};

use crate::{
    pe::{
        headers::{DataDirectory, DataDirectoryType, PeHeaders},
        image::{PeImage, READONLY_DATA},
    },
    Result,
};

/// Language used for resources this crate creates: en-US
pub const LANGUAGE_EN_US: u16 = 1033;

/// A resource type, name or language key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceName {
    /// Named entry; sorts before numeric ones as the format requires
    Name(String),
    /// Numeric entry
    Id(u16),
}

impl ResourceName {
    /// `RT_VERSION`
    pub const VERSION: ResourceName = ResourceName::Id(16);
    /// `RT_MANIFEST`
    pub const MANIFEST: ResourceName = ResourceName::Id(24);
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceName::Name(name) => write!(f, "\"{name}\""),
            ResourceName::Id(id) => write!(f, "#{id}"),
        }
    }
}

/// One leaf of the tree: the data of a resource in one language
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    /// Language id
    pub language: u16,
    /// Code page recorded in the data entry
    pub code_page: u32,
    /// Raw resource bytes
    pub data: Vec<u8>,
}

/// The resource tree of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTable {
    tree: directory::Tree,
}

impl ResourceTable {
    /// An empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the resource tree of an image; images without resources give an empty table.
    ///
    /// # Errors
    /// Returns an error if the tree or any data entry lies outside the image
    pub fn read(image: &[u8], headers: &PeHeaders) -> Result<ResourceTable> {
        let directory = headers.directory(DataDirectoryType::Resource);
        if directory.is_empty() {
            return Ok(ResourceTable::new());
        }

        let start = headers.rva_to_offset(directory.rva)?;
        let tree = image.get(start..).ok_or(out_of_bounds_error!())?;
        Ok(ResourceTable {
            tree: directory::read_tree(tree, image, headers)?,
        })
    }

    /// Returns true if the table holds no resources
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.values().all(|names| names.values().all(Vec::is_empty))
    }

    /// All resources of `kind` as (name, entry) pairs, in tree order
    pub fn entries<'a>(
        &'a self,
        kind: &ResourceName,
    ) -> impl Iterator<Item = (&'a ResourceName, &'a ResourceEntry)> + 'a {
        self.tree
            .get(kind)
            .into_iter()
            .flat_map(|names| {
                names
                    .iter()
                    .flat_map(|(name, entries)| entries.iter().map(move |entry| (name, entry)))
            })
    }

    /// The first resource of `kind`
    #[must_use]
    pub fn first(&self, kind: &ResourceName) -> Option<(&ResourceName, &ResourceEntry)> {
        self.entries(kind).next()
    }

    /// Inserts a resource, replacing an existing one with the same name and language
    pub fn insert(&mut self, kind: ResourceName, name: ResourceName, entry: ResourceEntry) {
        let entries = self.tree.entry(kind).or_default().entry(name).or_default();
        match entries.iter_mut().find(|e| e.language == entry.language) {
            Some(existing) => *existing = entry,
            None => {
                entries.push(entry);
                entries.sort_by_key(|e| e.language);
            }
        }
    }

    /// Removes every resource of `kind`; returns true if any existed
    pub fn remove_kind(&mut self, kind: &ResourceName) -> bool {
        self.tree.remove(kind).is_some()
    }

    /// Decodes the first version resource
    ///
    /// # Errors
    /// Returns an error if the version resource is malformed
    pub fn version(&self) -> Result<Option<VersionResource>> {
        self.first(&ResourceName::VERSION)
            .map(|(_, entry)| VersionResource::parse(&entry.data))
            .transpose()
    }

    /// Replaces the first version resource, keeping its name and language, or adds one as
    /// `#1` in en-US
    ///
    /// # Errors
    /// Returns an error if the resource can't be encoded
    pub fn set_version(&mut self, version: &VersionResource) -> Result<()> {
        let (name, language, code_page) = match self.first(&ResourceName::VERSION) {
            Some((name, entry)) => (name.clone(), entry.language, entry.code_page),
            None => (ResourceName::Id(1), LANGUAGE_EN_US, 0),
        };

        self.insert(
            ResourceName::VERSION,
            name,
            ResourceEntry {
                language,
                code_page,
                data: version.to_bytes()?,
            },
        );
        Ok(())
    }

    /// The text of the first manifest resource
    ///
    /// # Errors
    /// Returns an error if the manifest is not valid UTF-8
    pub fn manifest_text(&self) -> Result<Option<String>> {
        let Some((_, entry)) = self.first(&ResourceName::MANIFEST) else {
            return Ok(None);
        };

        let data = entry
            .data
            .strip_prefix(&[0xEF, 0xBB, 0xBF])
            .unwrap_or(&entry.data);
        let text = std::str::from_utf8(data)
            .map_err(|e| malformed_error!("Manifest resource is not UTF-8 - {}", e))?;
        Ok(Some(text.trim_end_matches('\0').to_string()))
    }

    /// Removes all manifest resources and adds `text` as manifest `#1` in en-US
    pub fn set_manifest(&mut self, text: &str) {
        self.remove_kind(&ResourceName::MANIFEST);
        self.insert(
            ResourceName::MANIFEST,
            ResourceName::Id(1),
            ResourceEntry {
                language: LANGUAGE_EN_US,
                code_page: 0,
                data: text.as_bytes().to_vec(),
            },
        );
    }

    /// Serializes the tree as section content placed at `base_rva`
    ///
    /// # Errors
    /// Returns an error if a count or size exceeds the format's limits
    pub fn to_section(&self, base_rva: u32) -> Result<Vec<u8>> {
        directory::write_tree(&self.tree, base_rva)
    }

    /// Writes the tree into `image` as its `.rsrc` section and updates the resource directory
    /// and the checksum
    ///
    /// # Errors
    /// Returns an error if the image has no room for a new section or no resource directory slot
    pub fn write_into(&self, image: &mut PeImage) -> Result<()> {
        let mut size = 0;
        let rva = image.place_section(".rsrc", READONLY_DATA, |rva| {
            let content = self.to_section(rva)?;
            size = content.len();
            Ok(content)
        })?;

        let size = u32::try_from(size)
            .map_err(|_| malformed_error!("Resource section exceeds 4GB"))?;
        image.set_directory(DataDirectoryType::Resource, DataDirectory { rva, size })?;
        image.update_checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::ImageBuilder;

    #[test]
    fn insert_replaces_same_language() {
        let mut table = ResourceTable::new();
        let entry = |language, byte| ResourceEntry {
            language,
            code_page: 0,
            data: vec![byte],
        };
        table.insert(ResourceName::VERSION, ResourceName::Id(1), entry(1033, 1));
        table.insert(ResourceName::VERSION, ResourceName::Id(1), entry(1031, 2));
        table.insert(ResourceName::VERSION, ResourceName::Id(1), entry(1033, 3));

        let data: Vec<u8> = table
            .entries(&ResourceName::VERSION)
            .map(|(_, e)| e.data[0])
            .collect();
        assert_eq!(data, vec![2, 3]);
    }

    #[test]
    fn manifest_replaces_all_entries() {
        let mut table = ResourceTable::new();
        for id in [1, 2] {
            table.insert(
                ResourceName::MANIFEST,
                ResourceName::Id(id),
                ResourceEntry {
                    language: 0,
                    code_page: 0,
                    data: b"old".to_vec(),
                },
            );
        }
        table.set_manifest("<assembly/>");

        let entries: Vec<_> = table.entries(&ResourceName::MANIFEST).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, &ResourceName::Id(1));
        assert_eq!(entries[0].1.language, LANGUAGE_EN_US);
    }

    #[test]
    fn manifest_bom_is_skipped() {
        let mut table = ResourceTable::new();
        table.insert(
            ResourceName::MANIFEST,
            ResourceName::Id(1),
            ResourceEntry {
                language: LANGUAGE_EN_US,
                code_page: 0,
                data: b"\xEF\xBB\xBF<assembly/>".to_vec(),
            },
        );
        assert_eq!(table.manifest_text().unwrap().as_deref(), Some("<assembly/>"));
    }

    #[test]
    fn set_version_keeps_existing_slot() {
        let mut table = ResourceTable::new();
        table.insert(
            ResourceName::VERSION,
            ResourceName::Name("VERSION".into()),
            ResourceEntry {
                language: 1031,
                code_page: 1252,
                data: VersionResource::new().to_bytes().unwrap(),
            },
        );

        let mut version = VersionResource::new();
        version.set(VersionField::ProductName, Some("Tool"));
        table.set_version(&version).unwrap();

        let (name, entry) = table.first(&ResourceName::VERSION).unwrap();
        assert_eq!(name, &ResourceName::Name("VERSION".into()));
        assert_eq!(entry.language, 1031);
        assert_eq!(entry.code_page, 1252);
        assert_eq!(
            table.version().unwrap().unwrap().get(VersionField::ProductName),
            Some("Tool")
        );
    }

    #[test]
    fn rewriting_twice_reuses_the_section() {
        let mut image = PeImage::new(ImageBuilder::new().build().unwrap()).unwrap();
        let mut table = ResourceTable::new();
        table.set_manifest("<a/>");
        table.write_into(&mut image).unwrap();
        let sections = image.headers().sections.len();

        table.set_manifest("<assembly>longer</assembly>");
        table.write_into(&mut image).unwrap();
        assert_eq!(image.headers().sections.len(), sections);

        let reread = ResourceTable::read(image.data(), image.headers()).unwrap();
        assert_eq!(reread, table);
    }
}
