//! `#Strings`, `#Blob` and `#GUID` heap access, plus the append-only builders used when
//! emitting or extending heaps.

use std::collections::HashMap;

use crate::{file::parser::Parser, Result};

/// The `#Strings` heap: NUL-terminated UTF-8 strings addressed by byte offset
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Wraps the heap bytes
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Strings { data }
    }

    /// The string starting at `index`
    ///
    /// # Errors
    /// Returns an error if `index` is outside the heap or the string is not UTF-8
    pub fn get(&self, index: u32) -> Result<&'a str> {
        let start = index as usize;
        let tail = self.data.get(start..).ok_or(out_of_bounds_error!())?;
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end])
            .map_err(|_| malformed_error!("Invalid UTF-8 in #Strings at {}", index))
    }
}

/// The `#Blob` heap: length-prefixed byte runs addressed by byte offset
pub struct Blobs<'a> {
    data: &'a [u8],
}

impl<'a> Blobs<'a> {
    /// Wraps the heap bytes
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Blobs { data }
    }

    /// The blob starting at `index`; index 0 and an empty heap give an empty blob
    ///
    /// # Errors
    /// Returns an error if the length prefix or the data lie outside the heap
    pub fn get(&self, index: u32) -> Result<&'a [u8]> {
        if index == 0 && self.data.len() <= 1 {
            return Ok(&[]);
        }

        let mut parser = Parser::at(self.data, index as usize)?;
        let length = parser.read_compressed_uint()? as usize;
        parser.read_bytes(length)
    }
}

/// Encodes `value` as an ECMA-335 compressed unsigned integer
///
/// # Errors
/// Returns an error for values above `0x1FFF_FFFF`
#[allow(clippy::cast_possible_truncation)]
pub fn write_compressed_uint(out: &mut Vec<u8>, value: u32) -> Result<()> {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => {
            out.push(0x80 | (value >> 8) as u8);
            out.push(value as u8);
        }
        0x4000..=0x1FFF_FFFF => {
            out.push(0xC0 | (value >> 24) as u8);
            out.push((value >> 16) as u8);
            out.push((value >> 8) as u8);
            out.push(value as u8);
        }
        _ => return Err(malformed_error!("Value {} can't be compressed", value)),
    }
    Ok(())
}

/// Appends blobs to a heap, reusing identical ones
pub struct BlobHeapBuilder {
    data: Vec<u8>,
    known: HashMap<Vec<u8>, u32>,
}

impl BlobHeapBuilder {
    /// A builder extending `existing`; an empty heap gets its leading zero byte
    #[must_use]
    pub fn extending(existing: &[u8]) -> Self {
        let mut data = existing.to_vec();
        if data.is_empty() {
            data.push(0);
        }
        BlobHeapBuilder {
            data,
            known: HashMap::new(),
        }
    }

    /// Adds `blob` and returns its index; the empty blob is index 0
    ///
    /// # Errors
    /// Returns an error if the blob or heap are too large to address
    pub fn add(&mut self, blob: &[u8]) -> Result<u32> {
        if blob.is_empty() {
            return Ok(0);
        }
        if let Some(index) = self.known.get(blob) {
            return Ok(*index);
        }

        let index = u32::try_from(self.data.len())
            .map_err(|_| malformed_error!("#Blob heap exceeds 4GB"))?;
        let length =
            u32::try_from(blob.len()).map_err(|_| malformed_error!("Blob exceeds 4GB"))?;
        write_compressed_uint(&mut self.data, length)?;
        self.data.extend_from_slice(blob);
        self.known.insert(blob.to_vec(), index);
        Ok(index)
    }

    /// Current heap size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if only the leading zero byte is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.len() <= 1
    }

    /// The heap padded to four bytes
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        self.data
    }
}

/// Appends NUL-terminated strings to a `#Strings` heap, reusing identical ones
pub struct StringHeapBuilder {
    data: Vec<u8>,
    known: HashMap<String, u32>,
}

impl Default for StringHeapBuilder {
    fn default() -> Self {
        StringHeapBuilder {
            data: vec![0],
            known: HashMap::new(),
        }
    }
}

impl StringHeapBuilder {
    /// Adds `value` and returns its index; the empty string is index 0
    ///
    /// # Errors
    /// Returns an error if the heap grows beyond 4GB
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(index) = self.known.get(value) {
            return Ok(*index);
        }

        let index = u32::try_from(self.data.len())
            .map_err(|_| malformed_error!("#Strings heap exceeds 4GB"))?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.known.insert(value.to_string(), index);
        Ok(index)
    }

    /// The heap padded to four bytes
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_uint_encoding() {
        for (value, expected) in [
            (0x03, vec![0x03]),
            (0x7F, vec![0x7F]),
            (0x80, vec![0x80, 0x80]),
            (0x3FFF, vec![0xBF, 0xFF]),
            (0x4000, vec![0xC0, 0x00, 0x40, 0x00]),
        ] {
            let mut out = Vec::new();
            write_compressed_uint(&mut out, value).unwrap();
            assert_eq!(out, expected);
            assert_eq!(Parser::new(&out).read_compressed_uint().unwrap(), value);
        }
        assert!(write_compressed_uint(&mut Vec::new(), 0x2000_0000).is_err());
    }

    #[test]
    fn blob_builder_dedups_and_reads_back() {
        let mut builder = BlobHeapBuilder::extending(&[]);
        let first = builder.add(&[1, 2, 3]).unwrap();
        let second = builder.add(&[4; 200]).unwrap();
        assert_eq!(builder.add(&[1, 2, 3]).unwrap(), first);
        assert_eq!(builder.add(&[]).unwrap(), 0);
        assert_eq!(first, 1);

        let heap = builder.finish();
        assert_eq!(heap.len() % 4, 0);
        let blobs = Blobs::new(&heap);
        assert_eq!(blobs.get(first).unwrap(), &[1, 2, 3]);
        assert_eq!(blobs.get(second).unwrap(), &[4; 200][..]);
        assert!(blobs.get(0).unwrap().is_empty());
    }

    #[test]
    fn strings_read_back() {
        let mut builder = StringHeapBuilder::default();
        let mscorlib = builder.add("mscorlib").unwrap();
        let system = builder.add("System").unwrap();
        assert_eq!(builder.add("mscorlib").unwrap(), mscorlib);

        let heap = builder.finish();
        let strings = Strings::new(&heap);
        assert_eq!(strings.get(mscorlib).unwrap(), "mscorlib");
        assert_eq!(strings.get(system).unwrap(), "System");
        assert_eq!(strings.get(0).unwrap(), "");
        assert!(strings.get(1000).is_err());
    }
}
