//! Read-only memory mapping of a binary's working copy.

use memmap2::Mmap;
use std::{fs, path::Path};

use crate::{Error::FileError, Result};

/// A file on disk, mapped into memory for the duration of one loader pass.
///
/// Working copies are private to their [`crate::Binary`], so nothing else writes to the file
/// while a loader holds the mapping.
#[derive(Debug)]
pub struct Physical {
    data: Option<Mmap>,
}

impl Physical {
    /// Maps the file at `path`. Empty files are valid and yield an empty slice.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file can't be opened or mapped
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let file = fs::File::open(path).map_err(FileError)?;
        if file.metadata().map_err(FileError)?.len() == 0 {
            return Ok(Physical { data: None });
        }

        // The working copy is owned by this process and not truncated while mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(FileError)?;
        Ok(Physical { data: Some(mmap) })
    }

    /// Returns the mapped bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Returns the size of the mapped file
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns true if the file is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn physical() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MZ\x90\x00").unwrap();
        file.flush().unwrap();

        let physical = Physical::new(file.path()).unwrap();
        assert_eq!(physical.len(), 4);
        assert_eq!(&physical.data()[..2], b"MZ");
    }

    #[test]
    fn empty_and_missing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let physical = Physical::new(file.path()).unwrap();
        assert!(physical.is_empty());

        assert!(matches!(
            Physical::new("/definitely/not/here.dll"),
            Err(crate::Error::FileError(_))
        ));
    }
}
