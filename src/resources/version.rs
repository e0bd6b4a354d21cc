//! `VS_VERSIONINFO` codec.
//!
//! A version resource is a tree of length-prefixed blocks. Every block starts on a 32-bit
//! boundary and consists of `wLength`, `wValueLength`, `wType` (1 for text), a NUL-terminated
//! UTF-16 key, padding, the value and then the child blocks:
//!
//! ```text
//! VS_VERSION_INFO            value: VS_FIXEDFILEINFO
//! ├── StringFileInfo
//! │   └── 040904b0           one string table per language/code page
//! │       ├── CompanyName    value: UTF-16 text
//! │       └── ...
//! └── VarFileInfo
//!     └── Translation        value: (language, code page) u16 pairs
//! ```

use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use widestring::U16String;

use crate::{
    file::{io::write_le_at, parser::Parser},
    identity::FourPartVersion,
    Result,
};

const VERSION_INFO_KEY: &str = "VS_VERSION_INFO";
const STRING_FILE_INFO_KEY: &str = "StringFileInfo";
const VAR_FILE_INFO_KEY: &str = "VarFileInfo";
const TRANSLATION_KEY: &str = "Translation";
const FIXED_FILE_INFO_SIGNATURE: u32 = 0xFEEF_04BD;
const FIXED_FILE_INFO_SIZE: usize = 52;

/// String table key used for new version resources: US English, Unicode.
pub const DEFAULT_STRING_TABLE: &str = "040904b0";
/// Translation entry used for new version resources.
pub const DEFAULT_TRANSLATION: (u16, u16) = (0x0409, 0x04b0);

/// The string-table fields this crate reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, IntoStaticStr)]
pub enum VersionField {
    /// `ProductName`
    ProductName,
    /// `CompanyName`
    CompanyName,
    /// `FileDescription`
    FileDescription,
    /// `Comments`
    Comments,
    /// `Assembly Version`
    #[strum(serialize = "Assembly Version")]
    AssemblyVersion,
    /// `FileVersion`
    FileVersion,
    /// `ProductVersion`
    ProductVersion,
    /// `InternalName`
    InternalName,
    /// `OriginalFilename`
    OriginalFilename,
    /// `LegalCopyright`
    LegalCopyright,
    /// `LegalTrademarks`
    LegalTrademarks,
    /// `BugTracker`
    BugTracker,
}

impl VersionField {
    /// The key as stored in the string table
    #[must_use]
    pub fn key(&self) -> &'static str {
        self.into()
    }
}

/// `VS_FIXEDFILEINFO`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFileInfo {
    /// Binary file version
    pub file_version: FourPartVersion,
    /// Binary product version
    pub product_version: FourPartVersion,
    /// Valid bits of `file_flags`
    pub file_flags_mask: u32,
    /// `VS_FF_*`
    pub file_flags: u32,
    /// `VOS_*`
    pub file_os: u32,
    /// `VFT_*`
    pub file_type: u32,
    /// `VFT2_*`
    pub file_subtype: u32,
    /// File date, usually zero
    pub file_date: u64,
}

impl Default for FixedFileInfo {
    fn default() -> Self {
        FixedFileInfo {
            file_version: FourPartVersion::ZERO,
            product_version: FourPartVersion::ZERO,
            file_flags_mask: 0x3F,
            file_flags: 0,
            // VOS_NT_WINDOWS32
            file_os: 0x0004_0004,
            // VFT_APP
            file_type: 1,
            file_subtype: 0,
            file_date: 0,
        }
    }
}

impl FixedFileInfo {
    fn read(data: &[u8]) -> Result<FixedFileInfo> {
        let mut parser = Parser::new(data);
        let signature = parser.read_le::<u32>()?;
        if signature != FIXED_FILE_INFO_SIGNATURE {
            return Err(malformed_error!(
                "VS_FIXEDFILEINFO signature mismatch - 0x{:08x}",
                signature
            ));
        }
        let _struct_version = parser.read_le::<u32>()?;
        let file_ms = parser.read_le::<u32>()?;
        let file_ls = parser.read_le::<u32>()?;
        let product_ms = parser.read_le::<u32>()?;
        let product_ls = parser.read_le::<u32>()?;

        Ok(FixedFileInfo {
            file_version: FourPartVersion::from_ms_ls(file_ms, file_ls),
            product_version: FourPartVersion::from_ms_ls(product_ms, product_ls),
            file_flags_mask: parser.read_le::<u32>()?,
            file_flags: parser.read_le::<u32>()?,
            file_os: parser.read_le::<u32>()?,
            file_type: parser.read_le::<u32>()?,
            file_subtype: parser.read_le::<u32>()?,
            file_date: (u64::from(parser.read_le::<u32>()?) << 32)
                | u64::from(parser.read_le::<u32>()?),
        })
    }

    fn to_bytes(self) -> Result<Vec<u8>> {
        let mut out = vec![0_u8; FIXED_FILE_INFO_SIZE];
        #[allow(clippy::cast_possible_truncation)]
        let fields = [
            FIXED_FILE_INFO_SIGNATURE,
            0x0001_0000,
            self.file_version.ms(),
            self.file_version.ls(),
            self.product_version.ms(),
            self.product_version.ls(),
            self.file_flags_mask,
            self.file_flags,
            self.file_os,
            self.file_type,
            self.file_subtype,
            (self.file_date >> 32) as u32,
            self.file_date as u32,
        ];
        for (i, field) in fields.iter().enumerate() {
            write_le_at::<u32>(&mut out, i * 4, *field)?;
        }
        Ok(out)
    }
}

/// One `StringTable` block: a language/code-page key and its ordered key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    /// Eight hex digits, language then code page
    pub key: String,
    /// Entries in file order
    pub strings: Vec<(String, String)>,
}

impl StringTable {
    /// An empty table
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        StringTable {
            key: key.into(),
            strings: Vec::new(),
        }
    }

    /// Looks up a value by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.strings
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets a value, keeping the position of an existing key; `None` removes the key
    pub fn set(&mut self, key: &str, value: Option<&str>) {
        match (self.strings.iter_mut().find(|(k, _)| k == key), value) {
            (Some(entry), Some(value)) => entry.1 = value.to_string(),
            (None, Some(value)) => self.strings.push((key.to_string(), value.to_string())),
            (Some(_), None) => self.strings.retain(|(k, _)| k != key),
            (None, None) => {}
        }
    }
}

/// A decoded version resource.
///
/// # Example
///
/// ```rust
/// use pesmith::resources::{VersionField, VersionResource};
///
/// let mut resource = VersionResource::new();
/// resource.set(VersionField::ProductVersion, Some("2.0.0.1"));
/// let bytes = resource.to_bytes()?;
///
/// let decoded = VersionResource::parse(&bytes)?;
/// assert_eq!(decoded.get(VersionField::ProductVersion), Some("2.0.0.1"));
/// # Ok::<(), pesmith::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionResource {
    /// Binary version information
    pub fixed: FixedFileInfo,
    /// `StringFileInfo` tables in file order
    pub string_tables: Vec<StringTable>,
    /// `VarFileInfo\Translation` pairs
    pub translations: Vec<(u16, u16)>,
}

impl Default for VersionResource {
    fn default() -> Self {
        Self::new()
    }
}

struct Block {
    key: String,
    text: bool,
    value: Vec<u8>,
    children: Vec<Block>,
}

impl Block {
    fn read(data: &[u8], start: usize) -> Result<(Block, usize)> {
        let mut parser = Parser::at(data, start)?;
        let length = parser.read_le::<u16>()? as usize;
        let value_length = parser.read_le::<u16>()? as usize;
        let value_type = parser.read_le::<u16>()?;
        if length < 6 {
            return Err(malformed_error!("Version block at {} has length {}", start, length));
        }

        let end = (start + length).min(data.len());
        let data = &data[..end];
        let mut parser = Parser::at(data, parser.pos())?;

        let key = parser.read_utf16z()?;
        parser.align(4);

        let text = value_type == 1;
        let value_bytes = if text { value_length * 2 } else { value_length };
        let value = parser
            .read_bytes(value_bytes.min(parser.remaining()))?
            .to_vec();

        let mut children = Vec::new();
        loop {
            parser.align(4);
            if !parser.has_more_data() {
                break;
            }
            let (child, child_end) = Block::read(data, parser.pos())?;
            children.push(child);
            parser.seek(child_end)?;
        }

        Ok((
            Block {
                key,
                text,
                value,
                children,
            },
            end,
        ))
    }

    fn text_value(&self) -> Result<String> {
        let mut parser = Parser::new(&self.value);
        let value = parser.read_utf16(self.value.len() / 2)?;
        Ok(value.trim_end_matches('\0').to_string())
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        pad4(out);
        let start = out.len();
        out.extend_from_slice(&[0; 6]);
        push_utf16z(out, &self.key);
        pad4(out);

        let value_length = if self.text {
            self.value.len() / 2
        } else {
            self.value.len()
        };
        out.extend_from_slice(&self.value);

        for child in &self.children {
            child.write(out)?;
        }

        let length = u16::try_from(out.len() - start)
            .map_err(|_| malformed_error!("Version block '{}' exceeds 64KB", self.key))?;
        let value_length = u16::try_from(value_length)
            .map_err(|_| malformed_error!("Version value '{}' exceeds 64KB", self.key))?;
        write_le_at::<u16>(out, start, length)?;
        write_le_at::<u16>(out, start + 2, value_length)?;
        write_le_at::<u16>(out, start + 4, u16::from(self.text))?;
        Ok(())
    }

    fn text(key: &str, value: &str) -> Block {
        let mut encoded = Vec::new();
        push_utf16z(&mut encoded, value);
        Block {
            key: key.to_string(),
            text: true,
            value: encoded,
            children: Vec::new(),
        }
    }

    fn container(key: &str, children: Vec<Block>) -> Block {
        Block {
            key: key.to_string(),
            text: true,
            value: Vec::new(),
            children,
        }
    }
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn push_utf16z(out: &mut Vec<u8>, text: &str) {
    for unit in U16String::from_str(text).as_slice() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&[0, 0]);
}

impl VersionResource {
    /// A fresh resource with one `040904b0` string table and a `0x0409/0x04b0` translation
    #[must_use]
    pub fn new() -> Self {
        VersionResource {
            fixed: FixedFileInfo::default(),
            string_tables: vec![StringTable::new(DEFAULT_STRING_TABLE)],
            translations: vec![DEFAULT_TRANSLATION],
        }
    }

    /// Decodes a version resource.
    ///
    /// # Errors
    /// Returns an error if the root block is not `VS_VERSION_INFO`, the fixed info is missing or
    /// a block is truncated
    pub fn parse(data: &[u8]) -> Result<VersionResource> {
        let (root, _) = Block::read(data, 0)?;
        if root.key != VERSION_INFO_KEY {
            return Err(malformed_error!("Unexpected version root key '{}'", root.key));
        }
        if root.value.len() < FIXED_FILE_INFO_SIZE {
            return Err(malformed_error!("Version resource has no VS_FIXEDFILEINFO"));
        }

        let mut resource = VersionResource {
            fixed: FixedFileInfo::read(&root.value)?,
            string_tables: Vec::new(),
            translations: Vec::new(),
        };

        for child in &root.children {
            match child.key.as_str() {
                STRING_FILE_INFO_KEY => {
                    for table in &child.children {
                        let mut string_table = StringTable::new(table.key.clone());
                        for entry in &table.children {
                            string_table
                                .strings
                                .push((entry.key.clone(), entry.text_value()?));
                        }
                        resource.string_tables.push(string_table);
                    }
                }
                VAR_FILE_INFO_KEY => {
                    for var in child.children.iter().filter(|v| v.key == TRANSLATION_KEY) {
                        for pair in var.value.chunks_exact(4) {
                            resource.translations.push((
                                u16::from_le_bytes([pair[0], pair[1]]),
                                u16::from_le_bytes([pair[2], pair[3]]),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(resource)
    }

    /// Encodes the resource.
    ///
    /// # Errors
    /// Returns an error if a block would exceed the 64KB block size limit
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let tables = self
            .string_tables
            .iter()
            .map(|table| {
                Block::container(
                    &table.key,
                    table
                        .strings
                        .iter()
                        .map(|(key, value)| Block::text(key, value))
                        .collect(),
                )
            })
            .collect();

        let mut children = vec![Block::container(STRING_FILE_INFO_KEY, tables)];
        if !self.translations.is_empty() {
            let mut value = Vec::with_capacity(self.translations.len() * 4);
            for (language, code_page) in &self.translations {
                value.extend_from_slice(&language.to_le_bytes());
                value.extend_from_slice(&code_page.to_le_bytes());
            }
            children.push(Block::container(
                VAR_FILE_INFO_KEY,
                vec![Block {
                    key: TRANSLATION_KEY.to_string(),
                    text: false,
                    value,
                    children: Vec::new(),
                }],
            ));
        }

        let root = Block {
            key: VERSION_INFO_KEY.to_string(),
            text: false,
            value: self.fixed.to_bytes()?,
            children,
        };

        let mut out = Vec::new();
        root.write(&mut out)?;
        Ok(out)
    }

    /// The value of `field` in the first string table
    #[must_use]
    pub fn get(&self, field: VersionField) -> Option<&str> {
        self.string_tables
            .first()
            .and_then(|table| table.get(field.key()))
            .filter(|value| !value.is_empty())
    }

    /// Sets `field` in the first string table, creating the default table if there is none;
    /// `None` removes the field
    pub fn set(&mut self, field: VersionField, value: Option<&str>) {
        if self.string_tables.is_empty() {
            self.string_tables.push(StringTable::new(DEFAULT_STRING_TABLE));
        }
        if let Some(table) = self.string_tables.first_mut() {
            table.set(field.key(), value);
        }
    }
}
