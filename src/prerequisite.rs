//! Lazily computed values backed by memoized loaders.
//!
//! A [`Prerequisite`] holds one derived property of an owner (typically a
//! [`Binary`](crate::Binary)). The first read runs the loaders the property depends on, then the
//! optional initializer, and caches the result. Loaders are [`OnceTask`]s shared between several
//! prerequisites: one pass over the file fills every sibling value it knows about through
//! [`Prerequisite::fill`].
//!
//! A value assigned with [`Prerequisite::set`] wins over anything a loader produces, before or
//! after the loader ran, and the loader is never started on its behalf.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use pesmith::prerequisite::Prerequisite;
//! use pesmith::utils::synchronization::OnceTask;
//!
//! struct Header {
//!     task: Arc<OnceTask>,
//!     magic: Prerequisite<Header, u16>,
//!     is_64bit: Prerequisite<Header, bool>,
//! }
//!
//! fn read_header(header: &Header) -> pesmith::Result<()> {
//!     header.magic.fill(0x20B);
//!     Ok(())
//! }
//!
//! let task = Arc::new(OnceTask::new("header"));
//! let header = Header {
//!     magic: Prerequisite::new().loaded_by(&task, read_header),
//!     is_64bit: Prerequisite::new()
//!         .loaded_by(&task, read_header)
//!         .initialized_by(|h: &Header| Ok(h.magic.get(h)? == 0x20B)),
//!     task,
//! };
//!
//! assert!(header.is_64bit.get(&header)?);
//! # Ok::<(), pesmith::Error>(())
//! ```

use std::{fmt, sync::Arc, sync::RwLock};

use crate::{utils::synchronization::OnceTask, Result};

/// A loader: a side-effecting pass that fills one or more prerequisites of its owner
pub type Loader<O> = fn(&O) -> Result<()>;

/// Computes a value from the owner once its loaders have run
pub type Initializer<O, T> = fn(&O) -> Result<T>;

/// A memoized, on-demand value of an owner `O`.
pub struct Prerequisite<O, T> {
    value: RwLock<Option<T>>,
    loaders: Vec<(Arc<OnceTask>, Loader<O>)>,
    initializer: Option<Initializer<O, T>>,
}

impl<O, T: fmt::Debug> fmt::Debug for Prerequisite<O, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.try_read() {
            Ok(value) => write!(f, "Prerequisite({:?})", *value),
            Err(_) => write!(f, "Prerequisite(<locked>)"),
        }
    }
}

impl<O, T> Default for Prerequisite<O, T> {
    fn default() -> Self {
        Prerequisite {
            value: RwLock::new(None),
            loaders: Vec::new(),
            initializer: None,
        }
    }
}

impl<O, T: Clone + Default> Prerequisite<O, T> {
    /// A value without loaders; reads yield `T::default()` until one is set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loader that must have run before the value is available
    #[must_use]
    pub fn loaded_by(mut self, task: &Arc<OnceTask>, loader: Loader<O>) -> Self {
        self.loaders.push((Arc::clone(task), loader));
        self
    }

    /// Derives the value from the owner after the loaders ran
    #[must_use]
    pub fn initialized_by(mut self, initializer: Initializer<O, T>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    /// Returns the value, running the loaders and the initializer on first access.
    ///
    /// # Errors
    /// Returns [`Error::Loader`](crate::Error::Loader) if a loader failed, or the initializer's
    /// error
    pub fn get(&self, owner: &O) -> Result<T> {
        if let Some(value) = read_lock!(self.value).as_ref() {
            return Ok(value.clone());
        }

        for (task, loader) in &self.loaders {
            task.run(|| loader(owner))?;
        }

        let computed = match self.initializer {
            Some(initializer) => Some(initializer(owner)?),
            None => None,
        };

        let mut value = write_lock!(self.value);
        if value.is_none() {
            *value = Some(computed.unwrap_or_default());
        }
        Ok(value.clone().unwrap_or_default())
    }

    /// Assigns the value, overriding any loader result
    pub fn set(&self, value: T) {
        *write_lock!(self.value) = Some(value);
    }

    /// Stores a loader result unless a value is already present
    pub fn fill(&self, value: T) {
        let mut slot = write_lock!(self.value);
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    /// The cached value, without running anything
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        read_lock!(self.value).clone()
    }

    /// Returns true once a value is cached
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        read_lock!(self.value).is_some()
    }

    /// Forgets the cached value; the next read consults the loaders again
    pub fn reset(&self) {
        *write_lock!(self.value) = None;
    }
}
