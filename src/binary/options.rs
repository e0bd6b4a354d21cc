//! Load options of a binary.

use bitflags::bitflags;

bitflags! {
    /// Selects which loaders run eagerly on load and which rewrite passes a save may perform.
    ///
    /// Loaders not selected still run on first access of a property that needs them. The `NO_*`
    /// options suppress the corresponding loader and rewrite pass regardless of pending edits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BinaryLoadOptions: u32 {
        /// Structural PE information
        const PE_INFO = 1;
        /// The version resource as found in the file
        const VERSION_INFO = 2;
        /// Imported DLL names
        const DEPENDENCY_DATA = 4;
        /// Managed metadata
        const MANAGED = 8;
        /// Native resources
        const RESOURCES = 16;
        /// The application manifest
        const MANIFEST = 32;
        /// MD5 of the working copy
        const MD5 = 64;
        /// Never read or rewrite managed metadata
        const NO_MANAGED = 128;
        /// Never read or rewrite native resources
        const NO_RESOURCES = 256;
        /// Never read or rewrite the manifest
        const NO_MANIFEST = 512;
        /// Never sign on save
        const NO_SIGNATURE = 1024;
        /// Verify the Authenticode signature
        const VALIDATE_SIGNATURE = 2048;
        /// Look up unsigned managed dependencies while loading managed data
        const UNSIGNED_MANAGED_DEPENDENCIES = 32768;
        /// Refuse to strong name unsigned managed dependencies on save
        const NO_UNSIGNED_MANAGED_DEPENDENCIES = 65536;

        /// The common preload set
        const ALL = Self::PE_INFO.bits()
            | Self::VERSION_INFO.bits()
            | Self::MANAGED.bits()
            | Self::RESOURCES.bits()
            | Self::MANIFEST.bits()
            | Self::UNSIGNED_MANAGED_DEPENDENCIES.bits();
    }
}

impl BinaryLoadOptions {
    /// Nothing preloaded; every property loads on first access
    pub const DELAY_LOAD: Self = Self::empty();
}

impl Default for BinaryLoadOptions {
    fn default() -> Self {
        Self::DELAY_LOAD
    }
}
