//! CLI metadata support for the managed save pass.
//!
//! Only the slice of ECMA-335 the engine needs is modeled: the assembly definition, its
//! assembly references and the single-string custom attributes attached to the assembly
//! (title, company, product, versions, copyright, ...). [`ManagedAssembly::read`] extracts that
//! view from an image, [`ManagedRewrite`] patches it back, and [`MetadataBuilder`] emits fresh
//! metadata for synthetic test images.
//!
//! # Example
//!
//! ```rust
//! use pesmith::managed::ManagedAssembly;
//! use pesmith::pe::{ImageBuilder, PeHeaders};
//!
//! let image = ImageBuilder::new()
//!     .managed("Contoso.Core", "1.2.0.0")
//!     .assembly_ref("mscorlib", "4.0.0.0")
//!     .assembly_attribute("System.Reflection.AssemblyCompanyAttribute", "Contoso")
//!     .build()?;
//! let probe = PeHeaders::parse(&image)?;
//! let assembly = ManagedAssembly::read(&image, probe.headers().unwrap())?.unwrap();
//!
//! assert_eq!(assembly.name, "Contoso.Core");
//! assert_eq!(assembly.references[0].name, "mscorlib");
//! assert_eq!(
//!     assembly.attribute("System.Reflection.AssemblyCompanyAttribute"),
//!     Some("Contoso")
//! );
//! # Ok::<(), pesmith::Error>(())
//! ```

mod emit;
pub mod heaps;
pub mod reader;
pub mod tables;
mod writer;

pub use emit::MetadataBuilder;
pub use writer::ManagedRewrite;

use crate::{
    file::parser::Parser,
    identity::{FourPartVersion, PublicKeyToken},
    managed::{
        reader::{metadata_bytes, Metadata},
        tables::{CodedIndexType, TableId},
    },
    pe::headers::PeHeaders,
    resources::VersionField,
    Result,
};

/// `AssemblyFlags.PublicKey`: the blob holds a full public key rather than a token
pub const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;

/// Signature of an instance constructor taking one string: `HASTHIS`, 1 parameter, `void`,
/// `string`
pub(crate) const STRING_CTOR_SIGNATURE: [u8; 4] = [0x20, 0x01, 0x01, 0x0E];

/// Assembly-level attributes and the version-resource fields they feed.
///
/// `AssemblyFileVersionAttribute` feeds both the file and the product version.
pub const ATTRIBUTE_FIELDS: &[(&str, VersionField)] = &[
    ("System.Reflection.AssemblyTitleAttribute", VersionField::FileDescription),
    ("System.Reflection.AssemblyCompanyAttribute", VersionField::CompanyName),
    ("System.Reflection.AssemblyProductAttribute", VersionField::ProductName),
    ("System.Reflection.AssemblyVersionAttribute", VersionField::AssemblyVersion),
    ("System.Reflection.AssemblyFileVersionAttribute", VersionField::FileVersion),
    ("System.Reflection.AssemblyCopyrightAttribute", VersionField::LegalCopyright),
    ("System.Reflection.AssemblyTrademarkAttribute", VersionField::LegalTrademarks),
    ("System.Reflection.AssemblyDescriptionAttribute", VersionField::Comments),
    ("BugTrackerAttribute", VersionField::BugTracker),
];

/// The version-resource field an attribute type maps to
#[must_use]
pub fn attribute_field(type_name: &str) -> Option<VersionField> {
    ATTRIBUTE_FIELDS
        .iter()
        .find(|(name, _)| *name == type_name)
        .map(|(_, field)| *field)
}

/// One `AssemblyRef` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedReference {
    /// 1-based row in the `AssemblyRef` table
    pub row: u32,
    /// Simple name
    pub name: String,
    /// Referenced version
    pub version: FourPartVersion,
    /// Culture, empty for neutral
    pub culture: String,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Full public key or 8-byte token, empty when the reference is not strong named
    pub public_key_or_token: Vec<u8>,
}

impl ManagedReference {
    /// Returns true if the reference carries a key or token
    #[must_use]
    pub fn is_strong_named(&self) -> bool {
        !self.public_key_or_token.is_empty()
    }

    /// The public key token of the referenced assembly
    #[must_use]
    pub fn public_key_token(&self) -> Option<PublicKeyToken> {
        if self.flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0 {
            return (!self.public_key_or_token.is_empty())
                .then(|| PublicKeyToken::from_public_key(&self.public_key_or_token));
        }
        <[u8; 8]>::try_from(self.public_key_or_token.as_slice())
            .ok()
            .map(PublicKeyToken)
    }
}

/// One custom attribute attached to the assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyAttribute {
    /// 1-based row in the `CustomAttribute` table
    pub row: u32,
    /// Namespace-qualified attribute type name
    pub type_name: String,
    /// The argument, when the constructor takes exactly one string
    pub value: Option<String>,
}

/// The managed view of an assembly.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagedAssembly {
    /// Simple name
    pub name: String,
    /// Assembly version from the `Assembly` row
    pub version: FourPartVersion,
    /// Culture, empty for neutral
    pub culture: String,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Public key blob, empty when not strong named
    pub public_key: Vec<u8>,
    /// Referenced assemblies in table order
    pub references: Vec<ManagedReference>,
    /// Assembly-level custom attributes in table order
    pub attributes: Vec<AssemblyAttribute>,
}

impl ManagedAssembly {
    /// Extracts the assembly view of a managed image.
    ///
    /// Returns `None` for native images and for modules without an `Assembly` row.
    ///
    /// # Errors
    /// Returns an error if the metadata is malformed
    pub fn read(image: &[u8], headers: &PeHeaders) -> Result<Option<ManagedAssembly>> {
        match metadata_bytes(image, headers)? {
            Some(metadata) => Self::from_metadata(metadata),
            None => Ok(None),
        }
    }

    /// Extracts the assembly view from a metadata block
    ///
    /// # Errors
    /// Returns an error if the metadata is malformed
    pub fn from_metadata(data: &[u8]) -> Result<Option<ManagedAssembly>> {
        let metadata = Metadata::parse(data)?;
        if metadata.tables.rows(TableId::Assembly) == 0 {
            return Ok(None);
        }

        let version = |table, row| -> Result<FourPartVersion> {
            let part = |column| -> Result<u16> {
                let value = metadata.tables.cell(table, row, column)?;
                u16::try_from(value).map_err(|_| malformed_error!("Version part {} too large", value))
            };
            let offset = if table == TableId::Assembly { 1 } else { 0 };
            Ok(FourPartVersion::new(
                part(offset)?,
                part(offset + 1)?,
                part(offset + 2)?,
                part(offset + 3)?,
            ))
        };

        let mut assembly = ManagedAssembly {
            name: metadata.string(TableId::Assembly, 1, 7)?.to_string(),
            version: version(TableId::Assembly, 1)?,
            culture: metadata.string(TableId::Assembly, 1, 8)?.to_string(),
            flags: metadata.tables.cell(TableId::Assembly, 1, 5)?,
            public_key: metadata.blob(TableId::Assembly, 1, 6)?.to_vec(),
            references: Vec::new(),
            attributes: Vec::new(),
        };

        for row in 1..=metadata.tables.rows(TableId::AssemblyRef) {
            assembly.references.push(ManagedReference {
                row,
                name: metadata.string(TableId::AssemblyRef, row, 6)?.to_string(),
                version: version(TableId::AssemblyRef, row)?,
                culture: metadata.string(TableId::AssemblyRef, row, 7)?.to_string(),
                flags: metadata.tables.cell(TableId::AssemblyRef, row, 4)?,
                public_key_or_token: metadata.blob(TableId::AssemblyRef, row, 5)?.to_vec(),
            });
        }

        for row in 1..=metadata.tables.rows(TableId::CustomAttribute) {
            let parent = CodedIndexType::HasCustomAttribute
                .decode(metadata.tables.cell(TableId::CustomAttribute, row, 0)?)?;
            if parent != (TableId::Assembly, 1) {
                continue;
            }

            let constructor = CodedIndexType::CustomAttributeType
                .decode(metadata.tables.cell(TableId::CustomAttribute, row, 1)?)?;
            let (type_name, signature) = constructor_type(&metadata, constructor)?;
            let value = if signature == STRING_CTOR_SIGNATURE {
                single_string_argument(metadata.blob(TableId::CustomAttribute, row, 2)?)
            } else {
                None
            };

            assembly.attributes.push(AssemblyAttribute {
                row,
                type_name,
                value,
            });
        }

        Ok(Some(assembly))
    }

    /// Returns true if the assembly carries a public key
    #[must_use]
    pub fn is_strong_named(&self) -> bool {
        !self.public_key.is_empty()
    }

    /// The public key token, if strong named
    #[must_use]
    pub fn public_key_token(&self) -> Option<PublicKeyToken> {
        self.is_strong_named()
            .then(|| PublicKeyToken::from_public_key(&self.public_key))
    }

    /// The non-empty value of the first attribute of type `type_name`
    #[must_use]
    pub fn attribute(&self, type_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .filter(|a| a.type_name == type_name)
            .find_map(|a| a.value.as_deref())
            .filter(|value| !value.is_empty())
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Resolves a constructor to its declaring type name and signature blob
fn constructor_type(metadata: &Metadata<'_>, constructor: (TableId, u32)) -> Result<(String, Vec<u8>)> {
    match constructor {
        (TableId::MemberRef, row) => {
            let signature = metadata.blob(TableId::MemberRef, row, 2)?.to_vec();
            let parent = CodedIndexType::MemberRefParent
                .decode(metadata.tables.cell(TableId::MemberRef, row, 0)?)?;
            let type_name = match parent {
                (TableId::TypeRef, row) => qualified(
                    metadata.string(TableId::TypeRef, row, 2)?,
                    metadata.string(TableId::TypeRef, row, 1)?,
                ),
                (TableId::TypeDef, row) => qualified(
                    metadata.string(TableId::TypeDef, row, 2)?,
                    metadata.string(TableId::TypeDef, row, 1)?,
                ),
                _ => String::new(),
            };
            Ok((type_name, signature))
        }
        (TableId::MethodDef, row) => {
            let signature = metadata.blob(TableId::MethodDef, row, 4)?.to_vec();
            // The owning type is the last TypeDef whose method list starts at or before the row.
            let mut owner = None;
            for type_row in 1..=metadata.tables.rows(TableId::TypeDef) {
                if metadata.tables.cell(TableId::TypeDef, type_row, 5)? <= row {
                    owner = Some(type_row);
                }
            }
            let type_name = match owner {
                Some(type_row) => qualified(
                    metadata.string(TableId::TypeDef, type_row, 2)?,
                    metadata.string(TableId::TypeDef, type_row, 1)?,
                ),
                None => String::new(),
            };
            Ok((type_name, signature))
        }
        (table, _) => Err(malformed_error!("Custom attribute constructor in {:?}", table)),
    }
}

/// Decodes `01 00 <SerString> 00 00`; anything else gives `None`
fn single_string_argument(blob: &[u8]) -> Option<String> {
    let mut parser = Parser::new(blob);
    if parser.read_le::<u16>().ok()? != 0x0001 {
        return None;
    }

    let value = if parser.peek_le::<u8>().ok()? == 0xFF {
        parser.advance_by(1).ok()?;
        String::new()
    } else {
        let length = parser.read_compressed_uint().ok()? as usize;
        String::from_utf8(parser.read_bytes(length).ok()?.to_vec()).ok()?
    };

    if parser.read_le::<u16>().ok()? != 0 || parser.has_more_data() {
        return None;
    }
    Some(value)
}

/// Encodes a single-string attribute argument blob
///
/// # Errors
/// Returns an error if the string is too long to encode
pub fn encode_string_argument(value: &str) -> Result<Vec<u8>> {
    let mut blob = vec![0x01, 0x00];
    let length = u32::try_from(value.len())
        .map_err(|_| malformed_error!("Attribute value too long"))?;
    heaps::write_compressed_uint(&mut blob, length)?;
    blob.extend_from_slice(value.as_bytes());
    blob.extend_from_slice(&[0x00, 0x00]);
    Ok(blob)
}
