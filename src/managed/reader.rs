//! Metadata root, stream headers and the `#~` table stream.

use strum::IntoEnumIterator;

use crate::{
    file::{io::read_index_at, parser::Parser},
    managed::{
        heaps::{Blobs, Strings},
        tables::{TableId, TableInfo, HEAP_EXTRA_DATA},
    },
    pe::headers::PeHeaders,
    Result,
};

/// `BSJB`
pub const METADATA_SIGNATURE: u32 = 0x424A_5342;

/// One entry of the metadata root's stream table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset from the metadata root
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// `#~`, `#Strings`, `#Blob`, ...
    pub name: String,
    /// Position of this header inside the metadata root
    pub header_offset: usize,
}

/// The metadata root (ECMA-335 II.24.2.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRoot {
    /// Major version, 1
    pub major_version: u16,
    /// Minor version, 1
    pub minor_version: u16,
    /// Runtime version string, e.g. `v4.0.30319`
    pub version: String,
    /// Reserved flags
    pub flags: u16,
    /// Stream headers in file order
    pub streams: Vec<StreamHeader>,
    /// Offset of the stream count field
    pub stream_count_offset: usize,
}

impl MetadataRoot {
    /// Reads the root and its stream headers.
    ///
    /// # Errors
    /// Returns an error for a bad signature or streams outside the metadata
    pub fn read(data: &[u8]) -> Result<MetadataRoot> {
        let mut parser = Parser::new(data);
        let signature = parser.read_le::<u32>()?;
        if signature != METADATA_SIGNATURE {
            return Err(malformed_error!("Metadata signature mismatch - 0x{:08x}", signature));
        }

        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        let _reserved = parser.read_le::<u32>()?;
        let length = parser.read_le::<u32>()? as usize;
        let raw_version = parser.read_bytes(length)?;
        let end = raw_version.iter().position(|b| *b == 0).unwrap_or(length);
        let version = String::from_utf8_lossy(&raw_version[..end]).into_owned();

        let flags = parser.read_le::<u16>()?;
        let stream_count_offset = parser.pos();
        let count = parser.read_le::<u16>()?;

        let mut streams = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let header_offset = parser.pos();
            let offset = parser.read_le::<u32>()?;
            let size = parser.read_le::<u32>()?;
            let name = parser.read_string_utf8()?;
            parser.align(4);

            let end = offset as usize + size as usize;
            if end > data.len() || name.len() > 32 {
                return Err(malformed_error!(
                    "Stream '{}' at {}+{} exceeds the metadata",
                    name,
                    offset,
                    size
                ));
            }
            streams.push(StreamHeader {
                offset,
                size,
                name,
                header_offset,
            });
        }

        Ok(MetadataRoot {
            major_version,
            minor_version,
            version,
            flags,
            streams,
            stream_count_offset,
        })
    }

    /// The header of the stream called `name`
    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamHeader> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// The bytes of the stream called `name`, empty if it is absent
    #[must_use]
    pub fn stream_data<'a>(&self, data: &'a [u8], name: &str) -> &'a [u8] {
        self.stream(name)
            .and_then(|s| data.get(s.offset as usize..(s.offset + s.size) as usize))
            .unwrap_or(&[])
    }
}

/// The `#~` (or uncompressed `#-`) table stream.
pub struct TablesStream<'a> {
    data: &'a [u8],
    info: TableInfo,
    table_offsets: Vec<usize>,
    /// Bit vector of present tables
    pub valid: u64,
    /// Bit vector of sorted tables
    pub sorted: u64,
}

impl<'a> TablesStream<'a> {
    /// Reads the table header and locates every table.
    ///
    /// # Errors
    /// Returns an error for tables this reader has no schema for or a truncated stream
    pub fn read(data: &'a [u8]) -> Result<TablesStream<'a>> {
        let mut parser = Parser::new(data);
        let _reserved = parser.read_le::<u32>()?;
        let _major = parser.read_le::<u8>()?;
        let _minor = parser.read_le::<u8>()?;
        let heap_sizes = parser.read_le::<u8>()?;
        let _reserved = parser.read_le::<u8>()?;
        let valid = parser.read_le::<u64>()?;
        let sorted = parser.read_le::<u64>()?;

        let known = (1_u64 << (TableId::GenericParamConstraint as u8 + 1)) - 1;
        if valid & !known != 0 {
            return Err(malformed_error!(
                "Unsupported metadata tables present - 0x{:016x}",
                valid & !known
            ));
        }

        let mut row_counts = vec![0_u32; TableId::iter().count()];
        for table in TableId::iter() {
            if valid & (1 << table as u8) != 0 {
                row_counts[table as usize] = parser.read_le::<u32>()?;
            }
        }
        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            parser.advance_by(4)?;
        }

        let info = TableInfo::new(&row_counts, heap_sizes);
        let mut table_offsets = vec![0; row_counts.len()];
        let mut offset = parser.pos();
        for table in TableId::iter() {
            table_offsets[table as usize] = offset;
            offset += info.rows(table) as usize * info.row_size(table);
        }
        if offset > data.len() {
            return Err(malformed_error!(
                "Tables need {} bytes, the stream has {}",
                offset,
                data.len()
            ));
        }

        Ok(TablesStream {
            data,
            info,
            table_offsets,
            valid,
            sorted,
        })
    }

    /// Index widths of this stream
    #[must_use]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Number of rows in `table`
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.info.rows(table)
    }

    /// Offset inside the stream and width of one cell; `row` is 1-based
    ///
    /// # Errors
    /// Returns an error if the row or column does not exist
    pub fn cell_location(&self, table: TableId, row: u32, column: usize) -> Result<(usize, usize)> {
        if row == 0 || row > self.rows(table) {
            return Err(malformed_error!("{:?} has no row {}", table, row));
        }
        let offset = self.table_offsets[table as usize]
            + (row as usize - 1) * self.info.row_size(table)
            + self.info.column_offset(table, column)?;
        Ok((offset, self.info.column_size(table.columns()[column])))
    }

    /// Reads one cell; `row` is 1-based
    ///
    /// # Errors
    /// Returns an error if the row or column does not exist
    pub fn cell(&self, table: TableId, row: u32, column: usize) -> Result<u32> {
        let (mut offset, width) = self.cell_location(table, row, column)?;
        read_index_at(self.data, &mut offset, width)
    }
}

/// Parsed view over one image's metadata
pub struct Metadata<'a> {
    /// The root
    pub root: MetadataRoot,
    /// `#~`
    pub tables: TablesStream<'a>,
    /// `#Strings`
    pub strings: Strings<'a>,
    /// `#Blob`
    pub blobs: Blobs<'a>,
}

impl<'a> Metadata<'a> {
    /// Parses the metadata block.
    ///
    /// # Errors
    /// Returns an error if the root, the table stream or a heap is malformed
    pub fn parse(data: &'a [u8]) -> Result<Metadata<'a>> {
        let root = MetadataRoot::read(data)?;
        let tables_data = match root.stream("#~").or_else(|| root.stream("#-")) {
            Some(stream) => &data[stream.offset as usize..(stream.offset + stream.size) as usize],
            None => return Err(malformed_error!("Metadata has no table stream")),
        };

        Ok(Metadata {
            tables: TablesStream::read(tables_data)?,
            strings: Strings::new(root.stream_data(data, "#Strings")),
            blobs: Blobs::new(root.stream_data(data, "#Blob")),
            root,
        })
    }

    /// A string cell
    ///
    /// # Errors
    /// Returns an error if the cell or string can't be read
    pub fn string(&self, table: TableId, row: u32, column: usize) -> Result<&'a str> {
        self.strings.get(self.tables.cell(table, row, column)?)
    }

    /// A blob cell
    ///
    /// # Errors
    /// Returns an error if the cell or blob can't be read
    pub fn blob(&self, table: TableId, row: u32, column: usize) -> Result<&'a [u8]> {
        self.blobs.get(self.tables.cell(table, row, column)?)
    }
}

/// Locates the metadata block of a managed image
///
/// # Errors
/// Returns an error if the metadata directory lies outside the image
pub fn metadata_bytes<'a>(image: &'a [u8], headers: &PeHeaders) -> Result<Option<&'a [u8]>> {
    match &headers.cor20 {
        Some(cor20) if !cor20.metadata.is_empty() => {
            Ok(Some(headers.directory_data(image, cor20.metadata)?))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted_root() {
        #[rustfmt::skip]
        let data = [
            0x42, 0x53, 0x4A, 0x42,
            0x01, 0x00, 0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            b'v', b'4', 0x00, 0x00,
            0x00, 0x00,
            0x01, 0x00,
            0x24, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            b'#', b'~', 0x00, 0x00,
            0x01, 0x02, 0x03, 0x04,
        ];

        let root = MetadataRoot::read(&data).unwrap();
        assert_eq!(root.version, "v4");
        assert_eq!(root.streams.len(), 1);
        assert_eq!(root.streams[0].name, "#~");
        assert_eq!(root.stream_data(&data, "#~"), &[1, 2, 3, 4]);
        assert!(root.stream_data(&data, "#Blob").is_empty());
    }

    #[test]
    fn stream_past_end() {
        #[rustfmt::skip]
        let data = [
            0x42, 0x53, 0x4A, 0x42,
            0x01, 0x00, 0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            b'v', b'4', 0x00, 0x00,
            0x00, 0x00,
            0x01, 0x00,
            0x20, 0x00, 0x00, 0x00,
            0x40, 0x00, 0x00, 0x00,
            b'#', b'~', 0x00, 0x00,
        ];
        assert!(MetadataRoot::read(&data).is_err());
        assert!(MetadataRoot::read(&data[4..]).is_err());
    }
}
