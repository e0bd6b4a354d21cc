//! Little-endian primitive reads and writes over byte slices.
//!
//! Every PE, resource and metadata structure this crate touches is little-endian. The helpers here
//! bounds-check every access and report [`crate::Error::OutOfBounds`] instead of panicking, which
//! lets the parsers treat truncated input as an ordinary error.
//!
//! ```rust
//! use pesmith::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 8];
//! write_le_at::<u32>(&mut data, 2, 0xDEAD_BEEF)?;
//! let mut offset = 2;
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0xDEAD_BEEF);
//! assert_eq!(offset, 6);
//! # Ok::<(), pesmith::Error>(())
//! ```

use crate::Result;

/// Fixed-width integers that can be decoded from and encoded to raw bytes.
pub trait ByteIO: Sized + Copy {
    /// The byte array type of this integer
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes the value from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Decodes the value from big-endian bytes
    fn from_be_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes the value as little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_byte_io {
    ($($ty:ty => $n:literal),* $(,)?) => {
        $(
            impl ByteIO for $ty {
                type Bytes = [u8; $n];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn from_be_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_be_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_byte_io!(u8 => 1, i8 => 1, u16 => 2, i16 => 2, u32 => 4, i32 => 4, u64 => 8, i64 => 8);

/// Reads a value at the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: ByteIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn read_le_at<T: ByteIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(bytes) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(bytes))
}

/// Reads a big-endian value at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn read_be_at<T: ByteIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let size = std::mem::size_of::<T>();
    let end = offset.checked_add(size).ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(bytes) = T::Bytes::try_from(&data[*offset..end]) else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_be_bytes(bytes))
}

/// Overwrites the bytes at `offset` with the little-endian encoding of `value`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the value does not fit in `data`.
pub fn write_le_at<T: ByteIO>(data: &mut [u8], offset: usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset
        .checked_add(bytes.len())
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[offset..end].copy_from_slice(bytes);
    Ok(())
}

/// Writes an index of `width` bytes (2 or 4), as used by metadata heap and table references.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the slot does not fit, or
/// [`crate::Error::Malformed`] if the value does not fit into a 2-byte slot.
pub fn write_index_at(data: &mut [u8], offset: usize, width: usize, value: u32) -> Result<()> {
    if width == 2 {
        let narrow = u16::try_from(value)
            .map_err(|_| malformed_error!("Index {} does not fit a 2-byte column", value))?;
        write_le_at::<u16>(data, offset, narrow)
    } else {
        write_le_at::<u32>(data, offset, value)
    }
}

/// Reads an index of `width` bytes (2 or 4) and advances `offset`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the slot does not fit.
pub fn read_index_at(data: &[u8], offset: &mut usize, width: usize) -> Result<u32> {
    if width == 2 {
        Ok(u32::from(read_le_at::<u16>(data, offset)?))
    } else {
        read_le_at::<u32>(data, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn read_sequence() {
        let data = [0x4D, 0x5A, 0x90, 0x00, 0x03, 0x00, 0x00, 0x00, 0xFF];
        let mut offset = 0;
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x5A4D);
        assert_eq!(read_le_at::<u16>(&data, &mut offset).unwrap(), 0x0090);
        assert_eq!(read_le_at::<u32>(&data, &mut offset).unwrap(), 3);
        assert_eq!(read_le_at::<i8>(&data, &mut offset).unwrap(), -1);
        assert_eq!(offset, data.len());
    }

    #[test]
    fn read_past_end() {
        let data = [0x01, 0x02, 0x03];
        let mut offset = 0;
        assert!(matches!(
            read_le_at::<u32>(&data, &mut offset),
            Err(Error::OutOfBounds { .. })
        ));
        assert_eq!(offset, 0);

        let mut offset = usize::MAX;
        assert!(read_le_at::<u8>(&data, &mut offset).is_err());
    }

    #[test]
    fn big_endian() {
        let data = [0x12, 0x34];
        let mut offset = 0;
        assert_eq!(read_be_at::<u16>(&data, &mut offset).unwrap(), 0x1234);
    }

    #[test]
    fn index_widths() {
        let mut data = [0u8; 6];
        write_index_at(&mut data, 0, 2, 0x1234).unwrap();
        write_index_at(&mut data, 2, 4, 0x0001_0000).unwrap();
        assert_eq!(data, [0x34, 0x12, 0x00, 0x00, 0x01, 0x00]);
        assert!(write_index_at(&mut data, 0, 2, 0x1_0000).is_err());

        let mut offset = 0;
        assert_eq!(read_index_at(&data, &mut offset, 2).unwrap(), 0x1234);
        assert_eq!(read_index_at(&data, &mut offset, 4).unwrap(), 0x0001_0000);
        assert!(write_le_at::<u32>(&mut data, 4, 1).is_err());
    }
}
