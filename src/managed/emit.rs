//! Emits a small but well-formed metadata block: one module, one assembly, its references and
//! its single-string assembly attributes.

use strum::IntoEnumIterator;

use crate::{
    file::io::{write_index_at, write_le_at},
    identity::{FourPartVersion, PublicKeyToken},
    managed::{
        encode_string_argument,
        heaps::{BlobHeapBuilder, StringHeapBuilder},
        reader::METADATA_SIGNATURE,
        tables::{CodedIndexType, TableId, TableInfo},
        ASSEMBLY_FLAG_PUBLIC_KEY, STRING_CTOR_SIGNATURE,
    },
    Result,
};

const RUNTIME_VERSION: &str = "v4.0.30319";
/// `CALG_SHA1`
const HASH_ALGORITHM_SHA1: u32 = 0x8004;
const SORTED_TABLES: u64 = 0x0000_1600_3301_FA00;

/// Builder for the metadata of a synthetic assembly.
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    name: String,
    version: FourPartVersion,
    public_key: Vec<u8>,
    references: Vec<(String, FourPartVersion, Option<PublicKeyToken>)>,
    attributes: Vec<(String, String)>,
}

impl MetadataBuilder {
    /// An assembly called `name`
    #[must_use]
    pub fn new(name: &str, version: FourPartVersion) -> Self {
        MetadataBuilder {
            name: name.to_string(),
            version,
            public_key: Vec::new(),
            references: Vec::new(),
            attributes: Vec::new(),
        }
    }

    /// Makes the assembly strong named with `public_key`
    #[must_use]
    pub fn public_key(mut self, public_key: &[u8]) -> Self {
        self.public_key = public_key.to_vec();
        self
    }

    /// Adds an assembly reference
    #[must_use]
    pub fn reference(
        mut self,
        name: &str,
        version: FourPartVersion,
        token: Option<PublicKeyToken>,
    ) -> Self {
        self.references.push((name.to_string(), version, token));
        self
    }

    /// Adds an assembly attribute with one string argument; `type_name` is namespace-qualified
    #[must_use]
    pub fn attribute(mut self, type_name: &str, value: &str) -> Self {
        self.attributes.push((type_name.to_string(), value.to_string()));
        self
    }

    /// Serializes the metadata root and its streams.
    ///
    /// # Errors
    /// Returns an error if a value can't be encoded
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut strings = StringHeapBuilder::default();
        let mut blobs = BlobHeapBuilder::extending(&[]);
        let mut rows: Vec<Vec<Vec<u32>>> = vec![Vec::new(); TableId::iter().count()];

        let module_name = format!("{}.dll", self.name);
        rows[TableId::Module as usize].push(vec![0, strings.add(&module_name)?, 1, 0, 0]);
        rows[TableId::TypeDef as usize].push(vec![0, strings.add("<Module>")?, 0, 0, 1, 1]);

        let module_scope = CodedIndexType::ResolutionScope.encode(TableId::Module, 1)?;
        let ctor = strings.add(".ctor")?;
        let ctor_signature = blobs.add(&STRING_CTOR_SIGNATURE)?;
        let mut attribute_types: Vec<&str> = Vec::new();
        for (type_name, value) in &self.attributes {
            let position = match attribute_types.iter().position(|t| t == type_name) {
                Some(position) => position,
                None => {
                    let (namespace, name) = type_name.rsplit_once('.').unwrap_or(("", type_name.as_str()));
                    rows[TableId::TypeRef as usize].push(vec![
                        module_scope,
                        strings.add(name)?,
                        strings.add(namespace)?,
                    ]);
                    let type_ref = u32::try_from(rows[TableId::TypeRef as usize].len())
                        .map_err(|_| malformed_error!("Too many attribute types"))?;
                    rows[TableId::MemberRef as usize].push(vec![
                        CodedIndexType::MemberRefParent.encode(TableId::TypeRef, type_ref)?,
                        ctor,
                        ctor_signature,
                    ]);
                    attribute_types.push(type_name);
                    attribute_types.len() - 1
                }
            };

            let member_ref = u32::try_from(position + 1)
                .map_err(|_| malformed_error!("Too many attribute types"))?;
            rows[TableId::CustomAttribute as usize].push(vec![
                CodedIndexType::HasCustomAttribute.encode(TableId::Assembly, 1)?,
                CodedIndexType::CustomAttributeType.encode(TableId::MemberRef, member_ref)?,
                blobs.add(&encode_string_argument(value)?)?,
            ]);
        }

        let flags = if self.public_key.is_empty() {
            0
        } else {
            ASSEMBLY_FLAG_PUBLIC_KEY
        };
        rows[TableId::Assembly as usize].push(vec![
            HASH_ALGORITHM_SHA1,
            u32::from(self.version.major),
            u32::from(self.version.minor),
            u32::from(self.version.build),
            u32::from(self.version.revision),
            flags,
            blobs.add(&self.public_key)?,
            strings.add(&self.name)?,
            0,
        ]);

        for (name, version, token) in &self.references {
            let token = match token {
                Some(token) => blobs.add(token.as_bytes())?,
                None => 0,
            };
            rows[TableId::AssemblyRef as usize].push(vec![
                u32::from(version.major),
                u32::from(version.minor),
                u32::from(version.build),
                u32::from(version.revision),
                0,
                token,
                strings.add(name)?,
                0,
                0,
            ]);
        }

        let tables = tables_stream(&rows)?;
        let mut guid = vec![0_u8; 16];
        guid[..self.name.len().min(16)].copy_from_slice(&self.name.as_bytes()[..self.name.len().min(16)]);

        let streams: [(&str, Vec<u8>); 5] = [
            ("#~", tables),
            ("#Strings", strings.finish()),
            ("#US", vec![0, 0, 0, 0]),
            ("#GUID", guid),
            ("#Blob", blobs.finish()),
        ];
        root(&streams)
    }
}

fn tables_stream(rows: &[Vec<Vec<u32>>]) -> Result<Vec<u8>> {
    let counts: Vec<u32> = rows
        .iter()
        .map(|r| u32::try_from(r.len()).unwrap_or(u32::MAX))
        .collect();
    let info = TableInfo::new(&counts, 0);

    let mut valid = 0_u64;
    for table in TableId::iter() {
        if counts[table as usize] > 0 {
            valid |= 1 << table as u8;
        }
    }

    let mut out = vec![0_u8; 24];
    out[4] = 2;
    out[7] = 1;
    write_le_at::<u64>(&mut out, 8, valid)?;
    write_le_at::<u64>(&mut out, 16, SORTED_TABLES)?;
    for count in counts.iter().filter(|c| **c > 0) {
        out.extend_from_slice(&count.to_le_bytes());
    }

    for table in TableId::iter() {
        for row in &rows[table as usize] {
            for (value, column) in row.iter().zip(table.columns()) {
                let width = info.column_size(*column);
                let offset = out.len();
                out.resize(offset + width, 0);
                write_index_at(&mut out, offset, width, *value)?;
            }
        }
    }

    while out.len() % 4 != 0 {
        out.push(0);
    }
    Ok(out)
}

fn root(streams: &[(&str, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut version = RUNTIME_VERSION.as_bytes().to_vec();
    version.push(0);
    while version.len() % 4 != 0 {
        version.push(0);
    }

    let header_size: usize = streams
        .iter()
        .map(|(name, _)| 8 + (name.len() + 1).next_multiple_of(4))
        .sum();
    let mut offset = 16 + version.len() + 4 + header_size;

    let mut out = Vec::new();
    out.extend_from_slice(&METADATA_SIGNATURE.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&1_u16.to_le_bytes());
    out.extend_from_slice(&0_u32.to_le_bytes());
    let version_length =
        u32::try_from(version.len()).map_err(|_| malformed_error!("Version too long"))?;
    out.extend_from_slice(&version_length.to_le_bytes());
    out.extend_from_slice(&version);
    out.extend_from_slice(&0_u16.to_le_bytes());
    let count = u16::try_from(streams.len()).map_err(|_| malformed_error!("Too many streams"))?;
    out.extend_from_slice(&count.to_le_bytes());

    for (name, data) in streams {
        let stream_offset =
            u32::try_from(offset).map_err(|_| malformed_error!("Metadata exceeds 4GB"))?;
        let size = u32::try_from(data.len()).map_err(|_| malformed_error!("Stream exceeds 4GB"))?;
        out.extend_from_slice(&stream_offset.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        offset += data.len();
    }

    for (_, data) in streams {
        out.extend_from_slice(data);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::{reader::Metadata, ManagedAssembly};

    #[test]
    fn emitted_metadata_parses() {
        let data = MetadataBuilder::new("Lib", FourPartVersion::new(1, 0, 0, 0))
            .reference("mscorlib", FourPartVersion::new(4, 0, 0, 0), None)
            .attribute("System.Reflection.AssemblyProductAttribute", "Lib")
            .attribute("System.Reflection.AssemblyCompanyAttribute", "Contoso")
            .attribute("System.Reflection.AssemblyProductAttribute", "Again")
            .build()
            .unwrap();

        let metadata = Metadata::parse(&data).unwrap();
        assert_eq!(metadata.root.version, RUNTIME_VERSION);
        assert_eq!(metadata.root.streams.len(), 5);
        assert_eq!(metadata.tables.rows(TableId::TypeRef), 2);
        assert_eq!(metadata.tables.rows(TableId::MemberRef), 2);
        assert_eq!(metadata.tables.rows(TableId::CustomAttribute), 3);

        let assembly = ManagedAssembly::from_metadata(&data).unwrap().unwrap();
        assert_eq!(assembly.name, "Lib");
        assert_eq!(
            assembly.attribute("System.Reflection.AssemblyProductAttribute"),
            Some("Lib")
        );
        assert_eq!(assembly.attributes.len(), 3);
    }

    #[test]
    fn strong_named_assembly() {
        let key = vec![0x07; 160];
        let data = MetadataBuilder::new("Signed", FourPartVersion::new(1, 0, 0, 0))
            .public_key(&key)
            .build()
            .unwrap();
        let assembly = ManagedAssembly::from_metadata(&data).unwrap().unwrap();
        assert!(assembly.is_strong_named());
        assert_eq!(assembly.public_key, key);
        assert_eq!(assembly.flags, ASSEMBLY_FLAG_PUBLIC_KEY);
    }
}
