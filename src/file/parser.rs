//! Cursor-based parser over a borrowed byte slice.
//!
//! [`Parser`] is the workhorse behind the header, resource and metadata readers: it tracks a
//! position, bounds-checks every read, and offers the handful of encodings those formats use
//! (little-endian integers, ECMA-335 compressed integers, NUL-terminated UTF-8 and UTF-16
//! strings).

use widestring::U16Str;

use crate::{
    file::io::{read_le_at, ByteIO},
    Result,
};

/// A generic parser for a byte slice, with bounds-checked positional reads.
///
/// # Example
///
/// ```rust
/// use pesmith::Parser;
///
/// let data = [0x4D, 0x5A, 0x03, b'a', b'b', b'c'];
/// let mut parser = Parser::new(&data);
/// assert_eq!(parser.read_le::<u16>()?, 0x5A4D);
/// assert_eq!(parser.read_compressed_uint()?, 3);
/// assert_eq!(parser.read_bytes(3)?, b"abc");
/// # Ok::<(), pesmith::Error>(())
/// ```
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new Parser from a slice
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Create a Parser positioned at `offset`
    ///
    /// # Errors
    /// Returns an error if `offset` lies beyond the end of `data`
    pub fn at(data: &'a [u8], offset: usize) -> Result<Self> {
        let mut parser = Parser::new(data);
        parser.seek(offset)?;
        Ok(parser)
    }

    /// Returns the length of the underlying data
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the underlying data is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check if there is more data to parse
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Move the position to a specific offset. Seeking to the very end is allowed.
    ///
    /// # Errors
    /// Returns an error if `pos` lies beyond the end of the data
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Move the position forward by `step` bytes
    ///
    /// # Errors
    /// Returns an error if the new position would exceed the data length
    pub fn advance_by(&mut self, step: usize) -> Result<()> {
        let end = self
            .position
            .checked_add(step)
            .ok_or(out_of_bounds_error!())?;
        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = end;
        Ok(())
    }

    /// Get the current position of the parser
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Get access to the underlying data
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of bytes left after the current position
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Read a value without advancing
    ///
    /// # Errors
    /// Returns an error if there is not enough data left
    pub fn peek_le<T: ByteIO>(&self) -> Result<T> {
        let mut temp_position = self.position;
        read_le_at::<T>(self.data, &mut temp_position)
    }

    /// Align the position to the next multiple of `alignment`, never moving past the end
    pub fn align(&mut self, alignment: usize) {
        let padding = (alignment - (self.position % alignment)) % alignment;
        self.position = (self.position + padding).min(self.data.len());
    }

    /// Read a little-endian value and advance
    ///
    /// # Errors
    /// Returns an error if there is not enough data left
    pub fn read_le<T: ByteIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Read `length` raw bytes and advance
    ///
    /// # Errors
    /// Returns an error if there is not enough data left
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .ok_or(out_of_bounds_error!())?;
        if end > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a compressed unsigned integer (ECMA-335 II.23.2)
    ///
    /// # Errors
    /// Returns an error for an invalid lead byte or truncated data
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        // 1-byte encoding: 0xxxxxxx
        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        // 2-byte encoding: 10xxxxxx xxxxxxxx
        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte));
        }

        // 4-byte encoding: 110xxxxx xxxxxxxx xxxxxxxx xxxxxxxx
        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            return Ok(((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Read a NUL-terminated UTF-8 string; a missing terminator ends the string at the data end
    ///
    /// # Errors
    /// Returns an error if the bytes are not valid UTF-8
    pub fn read_string_utf8(&mut self) -> Result<String> {
        let start = self.position;
        let end = self.data[start..]
            .iter()
            .position(|b| *b == 0)
            .map_or(self.data.len(), |rel| start + rel);

        self.position = (end + 1).min(self.data.len());
        String::from_utf8(self.data[start..end].to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                end,
                e.utf8_error()
            )
        })
    }

    /// Read a NUL-terminated UTF-16LE string and advance past the terminator
    ///
    /// # Errors
    /// Returns an error if no terminator is found or the text is not valid UTF-16
    pub fn read_utf16z(&mut self) -> Result<String> {
        let start = self.position;
        let mut units = Vec::new();
        loop {
            let unit = self.read_le::<u16>()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }

        U16Str::from_slice(&units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 string at offset {}", start))
    }

    /// Read exactly `count` UTF-16LE code units
    ///
    /// # Errors
    /// Returns an error if not enough data is left or the text is not valid UTF-16
    pub fn read_utf16(&mut self, count: usize) -> Result<String> {
        let start = self.position;
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(self.read_le::<u16>()?);
        }

        U16Str::from_slice(&units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid UTF-16 string at offset {}", start))
    }
}
