use std::{path::PathBuf, sync::Arc};

use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// # Error Categories
///
/// ## Format Errors
/// - [`Error::Malformed`] - Corrupted or truncated PE, resource or metadata structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond the end of a buffer
/// - [`Error::UnknownMachine`] - The COFF machine value is not one this library classifies
/// - [`Error::InvalidRva`] - An RVA does not map into any section
/// - [`Error::NotSupported`] - A rewrite would require a layout change this library does not do
///
/// A missing `MZ` or `PE\0\0` signature is *not* an error: such files load as non-PE binaries.
///
/// ## Manifest Errors
/// - [`Error::Manifest`], [`Error::InvalidManifestElement`], [`Error::UnknownManifestElement`]
/// - [`Error::Xml`] - The manifest text is not well-formed XML
///
/// ## Dependency Errors
/// - [`Error::DependencyNotFound`] - A referenced assembly could not be located for strong naming
/// - [`Error::DependencyNotStrongNamed`] - A referenced assembly is unsigned and cascading is disabled
/// - [`Error::DependencyCycle`] - Unsigned assemblies reference each other in a cycle
///
/// ## Signing Errors
/// - [`Error::Signing`] - The signing backend failed
/// - [`Error::FailedTimestamp`] - Every timestamp authority failed
/// - [`Error::Certificate`] - The certificate could not be read or has no RSA key
///
/// ## State Errors
/// - [`Error::Unloaded`] - The binary was unloaded and can no longer be used
/// - [`Error::Loader`] - A memoized loader failed earlier; the original cause is kept as source
/// - [`Error::Timeout`] - A bounded wait on a save expired
///
/// # Examples
///
/// ```rust,no_run
/// use pesmith::{BinaryLoadOptions, BinaryRegistry, Error};
///
/// let registry = BinaryRegistry::with_defaults();
/// match registry.load("tool.exe", BinaryLoadOptions::ALL) {
///     Ok(binary) => println!("managed: {:?}", binary.is_managed()),
///     Err(Error::InBinary { path, source }) => eprintln!("{}: {source}", path.display()),
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing.
    #[error("Out of Bound read would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The COFF header names a machine type that can't be classified.
    #[error("Unrecognized Executable Machine Type - 0x{0:04x}")]
    UnknownMachine(u16),

    /// An RVA could not be translated to a file offset.
    #[error("RVA 0x{0:08x} is not backed by any section")]
    InvalidRva(u32),

    /// The requested operation is not supported for this file.
    #[error("Not supported - {0}")]
    NotSupported(String),

    /// Generic manifest failure.
    #[error("Manifest error - {0}")]
    Manifest(String),

    /// A manifest element exists but has an unusable shape.
    #[error("Invalid manifest element - {0}")]
    InvalidManifestElement(String),

    /// A manifest element has an unknown name or namespace.
    #[error("Unknown manifest element - {0}")]
    UnknownManifestElement(String),

    /// The manifest text could not be parsed or written.
    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    /// A dependent assembly needed for strong naming is not available.
    #[error("{}: dependent assembly '{name}-{version}' not available for strong naming", .path.display())]
    DependencyNotFound {
        /// The binary being saved
        path: PathBuf,
        /// Name of the missing assembly
        name: String,
        /// Version of the missing assembly
        version: String,
    },

    /// A dependent assembly is unsigned and may not be signed automatically.
    #[error("{}: dependent assembly '{name}-{version}' not strong named", .path.display())]
    DependencyNotStrongNamed {
        /// The binary being saved
        path: PathBuf,
        /// Name of the unsigned assembly
        name: String,
        /// Version of the unsigned assembly
        version: String,
    },

    /// Unsigned dependencies form a cycle and can't be signed in order.
    #[error("Cyclic dependency between unsigned assemblies - {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    /// The signing backend reported a failure.
    #[error("{}: signing failed - {message}", .path.display())]
    Signing {
        /// The file being signed
        path: PathBuf,
        /// Backend output
        message: String,
    },

    /// No timestamp authority could be reached.
    #[error("{}: failed to timestamp using {url}", .path.display())]
    FailedTimestamp {
        /// The file being signed
        path: PathBuf,
        /// The authority that failed last, or a summary
        url: String,
    },

    /// The certificate could not be used.
    #[error("Certificate error - {0}")]
    Certificate(String),

    /// The binary was unloaded.
    #[error("{} has been unloaded", .0.display())]
    Unloaded(PathBuf),

    /// A loader failed the first time it ran; the failure is memoized.
    #[error("{loader} loader failed")]
    Loader {
        /// Name of the loader
        loader: &'static str,
        /// The original failure
        #[source]
        source: Arc<Error>,
    },

    /// An error raised while processing a specific file.
    #[error("{}: {source}", .path.display())]
    InBinary {
        /// The file that was being processed
        path: PathBuf,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A bounded wait expired.
    #[error("{}: timed out waiting for save", .0.display())]
    Timeout(PathBuf),

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),
}

impl Error {
    /// Attaches the path of the file being processed, unless the error already names one.
    #[must_use]
    pub fn in_binary(self, path: impl Into<PathBuf>) -> Error {
        match self {
            Error::InBinary { .. }
            | Error::DependencyNotFound { .. }
            | Error::DependencyNotStrongNamed { .. }
            | Error::Signing { .. }
            | Error::FailedTimestamp { .. }
            | Error::Unloaded(_)
            | Error::Timeout(_) => self,
            other => Error::InBinary {
                path: path.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through file context and memoized loader failures.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::InBinary { source, .. } => source.root(),
            Error::Loader { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` for the timestamp-authority failure that signing retries on.
    #[must_use]
    pub fn is_timestamp_failure(&self) -> bool {
        match self {
            Error::FailedTimestamp { .. } => true,
            Error::InBinary { source, .. } => source.is_timestamp_failure(),
            Error::Loader { source, .. } => source.is_timestamp_failure(),
            _ => false,
        }
    }
}
