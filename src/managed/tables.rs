//! Table schema of the `#~` stream: table ids, column kinds, coded indexes and the per-image
//! index widths derived from row counts and heap-size flags.

use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator};

use crate::{Error, Result};

/// Metadata table identifiers (ECMA-335 II.22)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount, FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TableId {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    FieldPtr = 0x03,
    Field = 0x04,
    MethodPtr = 0x05,
    MethodDef = 0x06,
    ParamPtr = 0x07,
    Param = 0x08,
    InterfaceImpl = 0x09,
    MemberRef = 0x0A,
    Constant = 0x0B,
    CustomAttribute = 0x0C,
    FieldMarshal = 0x0D,
    DeclSecurity = 0x0E,
    ClassLayout = 0x0F,
    FieldLayout = 0x10,
    StandAloneSig = 0x11,
    EventMap = 0x12,
    EventPtr = 0x13,
    Event = 0x14,
    PropertyMap = 0x15,
    PropertyPtr = 0x16,
    Property = 0x17,
    MethodSemantics = 0x18,
    MethodImpl = 0x19,
    ModuleRef = 0x1A,
    TypeSpec = 0x1B,
    ImplMap = 0x1C,
    FieldRVA = 0x1D,
    EncLog = 0x1E,
    EncMap = 0x1F,
    Assembly = 0x20,
    AssemblyProcessor = 0x21,
    AssemblyOS = 0x22,
    AssemblyRef = 0x23,
    AssemblyRefProcessor = 0x24,
    AssemblyRefOS = 0x25,
    File = 0x26,
    ExportedType = 0x27,
    ManifestResource = 0x28,
    NestedClass = 0x29,
    GenericParam = 0x2A,
    MethodSpec = 0x2B,
    GenericParamConstraint = 0x2C,
}

/// Coded index kinds (ECMA-335 II.24.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum CodedIndexType {
    TypeDefOrRef,
    HasConstant,
    HasCustomAttribute,
    HasFieldMarshal,
    HasDeclSecurity,
    MemberRefParent,
    HasSemantics,
    MethodDefOrRef,
    MemberForwarded,
    Implementation,
    CustomAttributeType,
    ResolutionScope,
    TypeOrMethodDef,
}

impl CodedIndexType {
    /// The tables addressed by each tag value; `None` marks an unused tag
    #[must_use]
    pub fn tables(&self) -> &'static [Option<TableId>] {
        use TableId as T;
        match self {
            CodedIndexType::TypeDefOrRef => &[Some(T::TypeDef), Some(T::TypeRef), Some(T::TypeSpec)],
            CodedIndexType::HasConstant => &[Some(T::Field), Some(T::Param), Some(T::Property)],
            CodedIndexType::HasCustomAttribute => &[
                Some(T::MethodDef),
                Some(T::Field),
                Some(T::TypeRef),
                Some(T::TypeDef),
                Some(T::Param),
                Some(T::InterfaceImpl),
                Some(T::MemberRef),
                Some(T::Module),
                Some(T::DeclSecurity),
                Some(T::Property),
                Some(T::Event),
                Some(T::StandAloneSig),
                Some(T::ModuleRef),
                Some(T::TypeSpec),
                Some(T::Assembly),
                Some(T::AssemblyRef),
                Some(T::File),
                Some(T::ExportedType),
                Some(T::ManifestResource),
                Some(T::GenericParam),
                Some(T::GenericParamConstraint),
                Some(T::MethodSpec),
            ],
            CodedIndexType::HasFieldMarshal => &[Some(T::Field), Some(T::Param)],
            CodedIndexType::HasDeclSecurity => &[Some(T::TypeDef), Some(T::MethodDef), Some(T::Assembly)],
            CodedIndexType::MemberRefParent => &[
                Some(T::TypeDef),
                Some(T::TypeRef),
                Some(T::ModuleRef),
                Some(T::MethodDef),
                Some(T::TypeSpec),
            ],
            CodedIndexType::HasSemantics => &[Some(T::Event), Some(T::Property)],
            CodedIndexType::MethodDefOrRef => &[Some(T::MethodDef), Some(T::MemberRef)],
            CodedIndexType::MemberForwarded => &[Some(T::Field), Some(T::MethodDef)],
            CodedIndexType::Implementation => &[Some(T::File), Some(T::AssemblyRef), Some(T::ExportedType)],
            CodedIndexType::CustomAttributeType => &[None, None, Some(T::MethodDef), Some(T::MemberRef), None],
            CodedIndexType::ResolutionScope => &[
                Some(T::Module),
                Some(T::ModuleRef),
                Some(T::AssemblyRef),
                Some(T::TypeRef),
            ],
            CodedIndexType::TypeOrMethodDef => &[Some(T::TypeDef), Some(T::MethodDef)],
        }
    }

    /// Number of low bits holding the tag
    #[must_use]
    pub fn tag_bits(&self) -> u8 {
        let count = self.tables().len();
        #[allow(clippy::cast_possible_truncation)]
        let bits = usize::BITS - (count - 1).leading_zeros();
        bits as u8
    }

    /// Splits a coded index value into table and 1-based row
    ///
    /// # Errors
    /// Returns an error if the tag is unused or out of range
    pub fn decode(&self, value: u32) -> Result<(TableId, u32)> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        match self.tables().get(tag) {
            Some(Some(table)) => Ok((*table, value >> bits)),
            _ => Err(malformed_error!("Invalid {:?} tag {}", self, tag)),
        }
    }

    /// Combines table and 1-based row into a coded index value
    ///
    /// # Errors
    /// Returns an error if `table` is not addressable by this coded index
    pub fn encode(&self, table: TableId, row: u32) -> Result<u32> {
        let tag = self
            .tables()
            .iter()
            .position(|t| *t == Some(table))
            .ok_or_else(|| malformed_error!("{:?} can't address {:?}", self, table))?;
        #[allow(clippy::cast_possible_truncation)]
        let tag = tag as u32;
        Ok((row << self.tag_bits()) | tag)
    }
}

/// Kind of one table column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// Two-byte constant
    U16,
    /// Four-byte constant
    U32,
    /// Index into `#Strings`
    String,
    /// Index into `#GUID`
    Guid,
    /// Index into `#Blob`
    Blob,
    /// Index into another table
    Table(TableId),
    /// Coded index
    Coded(CodedIndexType),
}

impl TableId {
    /// Column layout of the table
    #[must_use]
    pub fn columns(&self) -> &'static [Column] {
        use CodedIndexType as C;
        use Column::{Blob, Coded, Guid, String, Table, U16, U32};
        use TableId as T;

        match self {
            T::Module => &[U16, String, Guid, Guid, Guid],
            T::TypeRef => &[Coded(C::ResolutionScope), String, String],
            T::TypeDef => &[
                U32,
                String,
                String,
                Coded(C::TypeDefOrRef),
                Table(T::Field),
                Table(T::MethodDef),
            ],
            T::FieldPtr => &[Table(T::Field)],
            T::Field => &[U16, String, Blob],
            T::MethodPtr => &[Table(T::MethodDef)],
            T::MethodDef => &[U32, U16, U16, String, Blob, Table(T::Param)],
            T::ParamPtr => &[Table(T::Param)],
            T::Param => &[U16, U16, String],
            T::InterfaceImpl => &[Table(T::TypeDef), Coded(C::TypeDefOrRef)],
            T::MemberRef => &[Coded(C::MemberRefParent), String, Blob],
            T::Constant => &[U16, Coded(C::HasConstant), Blob],
            T::CustomAttribute => &[
                Coded(C::HasCustomAttribute),
                Coded(C::CustomAttributeType),
                Blob,
            ],
            T::FieldMarshal => &[Coded(C::HasFieldMarshal), Blob],
            T::DeclSecurity => &[U16, Coded(C::HasDeclSecurity), Blob],
            T::ClassLayout => &[U16, U32, Table(T::TypeDef)],
            T::FieldLayout => &[U32, Table(T::Field)],
            T::StandAloneSig => &[Blob],
            T::EventMap => &[Table(T::TypeDef), Table(T::Event)],
            T::EventPtr => &[Table(T::Event)],
            T::Event => &[U16, String, Coded(C::TypeDefOrRef)],
            T::PropertyMap => &[Table(T::TypeDef), Table(T::Property)],
            T::PropertyPtr => &[Table(T::Property)],
            T::Property => &[U16, String, Blob],
            T::MethodSemantics => &[U16, Table(T::MethodDef), Coded(C::HasSemantics)],
            T::MethodImpl => &[
                Table(T::TypeDef),
                Coded(C::MethodDefOrRef),
                Coded(C::MethodDefOrRef),
            ],
            T::ModuleRef => &[String],
            T::TypeSpec => &[Blob],
            T::ImplMap => &[
                U16,
                Coded(C::MemberForwarded),
                String,
                Table(T::ModuleRef),
            ],
            T::FieldRVA => &[U32, Table(T::Field)],
            T::EncLog => &[U32, U32],
            T::EncMap => &[U32],
            T::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, String, String],
            T::AssemblyProcessor => &[U32],
            T::AssemblyOS => &[U32, U32, U32],
            T::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, String, String, Blob],
            T::AssemblyRefProcessor => &[U32, Table(T::AssemblyRef)],
            T::AssemblyRefOS => &[U32, U32, U32, Table(T::AssemblyRef)],
            T::File => &[U32, String, Blob],
            T::ExportedType => &[U32, U32, String, String, Coded(C::Implementation)],
            T::ManifestResource => &[U32, U32, String, Coded(C::Implementation)],
            T::NestedClass => &[Table(T::TypeDef), Table(T::TypeDef)],
            T::GenericParam => &[U16, U16, Coded(C::TypeOrMethodDef), String],
            T::MethodSpec => &[Coded(C::MethodDefOrRef), Blob],
            T::GenericParamConstraint => &[Table(T::GenericParam), Coded(C::TypeDefOrRef)],
        }
    }
}

/// Heap-size flag: `#Strings` indexes are 4 bytes
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// Heap-size flag: `#GUID` indexes are 4 bytes
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// Heap-size flag: `#Blob` indexes are 4 bytes
pub const HEAP_LARGE_BLOB: u8 = 0x04;
/// Heap-size flag: an extra 4 bytes follow the row counts
pub const HEAP_EXTRA_DATA: u8 = 0x40;

/// Row count and index width of one table
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct TableRowInfo {
    /// Number of rows
    pub rows: u32,
    /// Bits needed to address every row
    pub bits: u8,
}

impl TableRowInfo {
    /// Computes the index width for `rows`
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(rows: u32) -> Self {
        let bits = if rows == 0 {
            1
        } else {
            (32 - rows.leading_zeros()) as u8
        };
        Self { rows, bits }
    }
}

/// Index widths for one `#~` stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    rows: Vec<TableRowInfo>,
    coded_indexes: Vec<u8>,
    heap_sizes: u8,
}

impl TableInfo {
    /// Builds the widths from per-table row counts (indexed by [`TableId`]) and heap-size flags
    #[must_use]
    pub fn new(row_counts: &[u32], heap_sizes: u8) -> Self {
        let rows = TableId::iter()
            .map(|id| TableRowInfo::new(row_counts.get(id as usize).copied().unwrap_or(0)))
            .collect();

        let mut table_info = TableInfo {
            rows,
            coded_indexes: vec![0; CodedIndexType::COUNT],
            heap_sizes,
        };
        for coded_index in CodedIndexType::iter() {
            table_info.coded_indexes[coded_index as usize] = table_info.coded_index_bits(coded_index);
        }
        table_info
    }

    fn coded_index_bits(&self, coded_index: CodedIndexType) -> u8 {
        let max_bits = coded_index
            .tables()
            .iter()
            .flatten()
            .map(|table| self.rows[*table as usize].bits)
            .max()
            .unwrap_or(1);
        max_bits + coded_index.tag_bits()
    }

    /// Number of rows in `table`
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows[table as usize].rows
    }

    /// The heap-size flags
    #[must_use]
    pub fn heap_sizes(&self) -> u8 {
        self.heap_sizes
    }

    /// Width in bytes of one column
    #[must_use]
    pub fn column_size(&self, column: Column) -> usize {
        let wide = |flag: u8| if self.heap_sizes & flag != 0 { 4 } else { 2 };
        match column {
            Column::U16 => 2,
            Column::U32 => 4,
            Column::String => wide(HEAP_LARGE_STRINGS),
            Column::Guid => wide(HEAP_LARGE_GUID),
            Column::Blob => wide(HEAP_LARGE_BLOB),
            Column::Table(table) => {
                if self.rows[table as usize].bits > 16 {
                    4
                } else {
                    2
                }
            }
            Column::Coded(coded_index) => {
                if self.coded_indexes[coded_index as usize] > 16 {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// Width in bytes of one row of `table`
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        table
            .columns()
            .iter()
            .map(|column| self.column_size(*column))
            .sum()
    }

    /// Byte offset of column `index` inside a row of `table`
    ///
    /// # Errors
    /// Returns an error if the table has fewer columns
    pub fn column_offset(&self, table: TableId, index: usize) -> Result<usize> {
        let columns = table.columns();
        if index >= columns.len() {
            return Err(Error::Error(format!("{table:?} has no column {index}")));
        }
        Ok(columns[..index]
            .iter()
            .map(|column| self.column_size(*column))
            .sum())
    }
}
