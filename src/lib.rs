// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// - 'file/physical.rs' uses mmap to map a working copy into memory

//! # pesmith
//!
//! Load, inspect, rewrite and re-sign Windows PE binaries, native and managed alike.
//!
//! `pesmith` is the binary-handling engine of a packaging pipeline. It reads the structural
//! facts of an executable (PE or not, 32/64 bit, managed or native, architecture, imported
//! DLLs), the version information shown in Explorer, the assembly identity of .NET images and
//! the embedded application manifest. It lets a caller change any of these and writes them back
//! consistently: the assembly attributes, the version resource and the manifest resource are
//! regenerated together, old signatures are stripped, and the result is strong named and
//! Authenticode signed with timestamp-authority rotation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pesmith::manifest::ExecutionLevel;
//! use pesmith::{BinaryLoadOptions, BinaryRegistry, FourPartVersion};
//!
//! let registry = BinaryRegistry::with_defaults();
//! let binary = registry.load("bin/Tool.exe", BinaryLoadOptions::ALL)?;
//!
//! println!("managed: {}", binary.is_managed()?);
//! println!("company: {:?}", binary.company_name()?);
//!
//! binary.set_file_version(FourPartVersion::new(2, 1, 0, 0))?;
//! binary.with_manifest(|manifest| manifest.set_requested_execution_level(ExecutionLevel::AsInvoker))?;
//! binary.save()?;
//! # Ok::<(), pesmith::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`binary`] - the [`Binary`] entity, its [`BinaryRegistry`] and the save pipeline
//! - [`pe`] - PE/COFF headers, classification, imports and in-place image rewriting
//! - [`resources`] - the resource directory tree and `VS_VERSIONINFO`
//! - [`manifest`] - the application manifest model
//! - [`managed`] - the assembly-level slice of CLI metadata
//! - [`signing`] - certificates, strong-name keys, Authenticode signing and stripping
//! - [`prerequisite`] - lazily computed properties backed by memoized loaders
//! - [`Error`] and [`Result`] - error handling
//!
//! ## Concurrency
//!
//! Loaders run at most once per working copy no matter how many threads ask; concurrent loads
//! of one path resolve to the same [`Binary`]; concurrent saves of one binary share a single
//! run. [`BinaryRegistry::save_all`] flushes every modified binary in parallel.
//!
//! ## Logging
//!
//! Progress and recoverable problems are reported through the [`log`](https://docs.rs/log)
//! facade: loads and saves at `info`, skipped timestamp authorities and cascaded strong naming
//! at `warn`, tool invocations at `debug`. Install any logger to see them.
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub mod file;
pub mod identity;
pub mod pe;
pub mod resources;
pub mod manifest;
pub mod managed;
pub mod signing;
pub mod prerequisite;
pub mod config;
pub mod binary;
pub mod utils;

/// `pesmith` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `pesmith` Error type
///
/// # Examples
///
/// ```rust,no_run
/// use pesmith::{BinaryLoadOptions, BinaryRegistry, Error};
///
/// let registry = BinaryRegistry::with_defaults();
/// if let Err(e) = registry.load("missing.dll", BinaryLoadOptions::DELAY_LOAD) {
///     match e.root() {
///         Error::FileError(io) => println!("cannot read: {io}"),
///         other => println!("{other}"),
///     }
/// }
/// ```
pub use error::Error;

pub use binary::{Binary, BinaryLoadOptions, BinaryRegistry, LoadHandle, SaveHandle, SigningPlan};
pub use config::EngineConfig;
pub use file::Parser;
pub use identity::{Architecture, FourPartVersion, PublicKeyToken};
pub use manifest::NativeManifest;
pub use pe::{ExecutableInfo, PeInfo};
pub use resources::VersionField;
pub use signing::{Certificate, CertificateReference, CodeSigner, ToolSigner};
