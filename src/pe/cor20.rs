//! CLR 2.0 (COR20) runtime header.
//!
//! The runtime header is what makes a PE image "managed": it is located through the
//! CLR-runtime-header data directory and points at the metadata, the managed resources and the
//! strong-name signature slot.
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{file::parser::Parser, pe::headers::DataDirectory, Result};

/// The runtime header of a managed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cor20Header {
    /// Size of the header in bytes, 72
    pub cb: u32,
    /// The minimum major version of the runtime required
    pub major_runtime_version: u16,
    /// The minor portion of the version
    pub minor_runtime_version: u16,
    /// Physical metadata
    pub metadata: DataDirectory,
    /// `COMIMAGE_FLAGS_*`
    pub flags: u32,
    /// Token of the entry point method, or RVA of a native entry point
    pub entry_point_token: u32,
    /// Managed resources
    pub resources: DataDirectory,
    /// Space reserved for the strong-name signature hash
    pub strong_name_signature: DataDirectory,
    /// Always zero
    pub code_manager_table: DataDirectory,
    /// Fixups for mixed-mode images
    pub vtable_fixups: DataDirectory,
    /// Always zero
    pub export_address_table_jumps: DataDirectory,
    /// Always zero for IL images
    pub managed_native_header: DataDirectory,
}

impl Cor20Header {
    /// Image contains only IL
    pub const FLAG_IL_ONLY: u32 = 0x0000_0001;
    /// Image must run in a 32-bit process
    pub const FLAG_32BIT_REQUIRED: u32 = 0x0000_0002;
    /// Image carries a strong-name signature
    pub const FLAG_STRONG_NAME_SIGNED: u32 = 0x0000_0008;
    /// Entry point is native code
    pub const FLAG_NATIVE_ENTRYPOINT: u32 = 0x0000_0010;
    /// Image prefers to run in a 32-bit process
    pub const FLAG_32BIT_PREFERRED: u32 = 0x0002_0000;

    /// Size of the encoded header
    pub const SIZE: usize = 72;
    /// Offset of the metadata directory within the header
    pub const METADATA_OFFSET: usize = 8;
    /// Offset of the flags field within the header
    pub const FLAGS_OFFSET: usize = 16;
    /// Offset of the strong-name signature directory within the header
    pub const STRONG_NAME_OFFSET: usize = 32;

    /// Reads a runtime header from the start of `data`.
    ///
    /// # Errors
    /// Returns an error if `data` is shorter than 72 bytes, the declared size is wrong, or the
    /// metadata directory is empty.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        if data.len() < Self::SIZE {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(data);

        let cb = parser.read_le::<u32>()?;
        if cb as usize != Self::SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected 72, got {}",
                cb
            ));
        }

        let major_runtime_version = parser.read_le::<u16>()?;
        let minor_runtime_version = parser.read_le::<u16>()?;

        let metadata = DataDirectory::read(&mut parser)?;
        if metadata.rva == 0 || metadata.size == 0 {
            return Err(malformed_error!("CLR header has no metadata directory"));
        }

        let flags = parser.read_le::<u32>()?;
        let entry_point_token = parser.read_le::<u32>()?;
        let resources = DataDirectory::read(&mut parser)?;
        let strong_name_signature = DataDirectory::read(&mut parser)?;
        let code_manager_table = DataDirectory::read(&mut parser)?;
        let vtable_fixups = DataDirectory::read(&mut parser)?;
        let export_address_table_jumps = DataDirectory::read(&mut parser)?;
        let managed_native_header = DataDirectory::read(&mut parser)?;

        Ok(Cor20Header {
            cb,
            major_runtime_version,
            minor_runtime_version,
            metadata,
            flags,
            entry_point_token,
            resources,
            strong_name_signature,
            code_manager_table,
            vtable_fixups,
            export_address_table_jumps,
            managed_native_header,
        })
    }

    /// Returns true if the 32-bit-required flag is set
    #[must_use]
    pub fn requires_32bit(&self) -> bool {
        self.flags & Self::FLAG_32BIT_REQUIRED != 0
    }

    /// Returns true if the image contains only IL
    #[must_use]
    pub fn is_il_only(&self) -> bool {
        self.flags & Self::FLAG_IL_ONLY != 0
    }

    /// Returns true if the strong-name-signed flag is set
    #[must_use]
    pub fn is_strong_name_signed(&self) -> bool {
        self.flags & Self::FLAG_STRONG_NAME_SIGNED != 0
    }
}
