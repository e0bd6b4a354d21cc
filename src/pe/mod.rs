//! PE/COFF structure: header parsing, image classification, imports and in-place rewriting.
//!
//! [`PeHeaders`] is the read side, [`PeImage`] the write side. Every rewrite in this crate
//! goes through [`PeImage`], which keeps the parsed headers in sync with the bytes and appends
//! new sections instead of moving existing ones.

mod builder;
pub mod cor20;
pub mod headers;
pub mod image;
pub mod imports;
pub mod info;

pub use builder::ImageBuilder;
pub use cor20::Cor20Header;
pub use headers::{DataDirectory, DataDirectoryType, PeHeaders, PeProbe, SectionHeader};
pub use image::PeImage;
pub use imports::imported_dlls;
pub use info::{ExecutableInfo, PeInfo};
