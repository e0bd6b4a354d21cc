//! The registry: one [`Binary`] per path, and lookups between binaries.

use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, Weak},
    thread,
};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::{
    binary::{Binary, BinaryLoadOptions},
    config::EngineConfig,
    identity::FourPartVersion,
    signing::{CodeSigner, ToolSigner},
    utils::synchronization::Completion,
    Error, Result,
};

type LoadOutcome = std::result::Result<Arc<Binary>, Arc<Error>>;

enum Entry {
    Loading(Arc<Completion<LoadOutcome>>),
    Loaded(Arc<Binary>),
}

enum Claim {
    Existing(Arc<Binary>),
    Wait(Arc<Completion<LoadOutcome>>),
    Owner(Arc<Completion<LoadOutcome>>),
}

/// Removes a `Loading` entry whose owner unwinds before completing it.
struct LoadGuard<'a> {
    registry: &'a BinaryRegistry,
    path: &'a Path,
    completion: &'a Arc<Completion<LoadOutcome>>,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock!(self.registry.entries).remove(self.path);
        self.completion.complete(Err(Arc::new(Error::Error(format!(
            "loading {} was interrupted",
            self.path.display()
        )))));
    }
}

/// Pending result of [`BinaryRegistry::spawn_load`].
#[derive(Debug, Clone)]
pub struct LoadHandle {
    completion: Arc<Completion<LoadOutcome>>,
}

impl LoadHandle {
    /// Blocks until the load finished.
    ///
    /// # Errors
    /// Returns [`Error::Loader`] carrying the load failure
    pub fn wait(&self) -> Result<Arc<Binary>> {
        self.completion
            .wait()
            .map_err(|source| Error::Loader { loader: "load", source })
    }

    /// Returns true once the load finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }
}

/// Maps normalized paths to binaries that are loading or loaded.
///
/// Every load goes through the registry, which keeps at most one [`Binary`] per path: a second
/// `load` of the same file, even a concurrent one, gets the same instance and no second working
/// copy is made. Binaries find each other through [`BinaryRegistry::find_assembly`] when a save
/// needs to strong name an unsigned dependency.
///
/// Construct one per process, or one per test.
pub struct BinaryRegistry {
    config: EngineConfig,
    signer: Arc<dyn CodeSigner>,
    entries: Mutex<HashMap<PathBuf, Entry>>,
    me: Weak<BinaryRegistry>,
}

impl std::fmt::Debug for BinaryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryRegistry")
            .field("config", &self.config)
            .field("signer", &self.signer)
            .field("entries", &lock!(self.entries).len())
            .finish()
    }
}

fn normalize(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).map_err(|e| Error::from(e).in_binary(path))
}

impl BinaryRegistry {
    /// Creates a registry.
    #[must_use]
    pub fn new(config: EngineConfig, signer: Arc<dyn CodeSigner>) -> Arc<BinaryRegistry> {
        Arc::new_cyclic(|me| BinaryRegistry {
            config,
            signer,
            entries: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// A registry with the default configuration and the external signing tools.
    #[must_use]
    pub fn with_defaults() -> Arc<BinaryRegistry> {
        Self::new(EngineConfig::default(), Arc::new(ToolSigner::new()))
    }

    /// The engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The signing backend
    #[must_use]
    pub fn signer(&self) -> &dyn CodeSigner {
        self.signer.as_ref()
    }

    /// Loads `path`, or returns the binary already loaded for it.
    ///
    /// `options` only apply when this call performs the load: they select the loaders run
    /// before returning and restrict what saves may do.
    ///
    /// # Errors
    /// Returns an error if the file does not exist, can't be copied, or a selected loader fails
    pub fn load(&self, path: impl AsRef<Path>, options: BinaryLoadOptions) -> Result<Arc<Binary>> {
        let path = normalize(path.as_ref())?;
        let me = self.me.clone();
        self.load_with(path.clone(), || Arc::new(Binary::new(path, options, me)))
    }

    /// Loads `path` with [`EngineConfig::default_options`].
    ///
    /// # Errors
    /// See [`BinaryRegistry::load`]
    pub fn load_default(&self, path: impl AsRef<Path>) -> Result<Arc<Binary>> {
        self.load(path, self.config.default_options)
    }

    /// Starts [`BinaryRegistry::load`] on a worker thread.
    #[must_use]
    pub fn spawn_load(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        options: BinaryLoadOptions,
    ) -> LoadHandle {
        let completion = Arc::new(Completion::new());
        let path = path.into();
        let registry = Arc::clone(self);
        let worker = Arc::clone(&completion);

        let spawned = thread::Builder::new()
            .name("pesmith-load".to_string())
            .spawn(move || worker.complete(registry.load(path, options).map_err(Arc::new)));
        if let Err(e) = spawned {
            completion.complete(Err(Arc::new(Error::from(e))));
        }
        LoadHandle { completion }
    }

    /// Loads the original file again into a binary that was unloaded.
    ///
    /// Returns the binary now registered for the path, which is `binary` itself unless another
    /// load claimed the path in the meantime.
    pub(super) fn reload(&self, binary: &Arc<Binary>) -> Result<Arc<Binary>> {
        info!("Reverting {}", binary.path.display());
        self.load_with(binary.path.clone(), || Arc::clone(binary))
    }

    fn load_with(
        &self,
        path: PathBuf,
        create: impl FnOnce() -> Arc<Binary>,
    ) -> Result<Arc<Binary>> {
        let claim = {
            let mut entries = lock!(self.entries);
            match entries.get(&path) {
                Some(Entry::Loaded(binary)) => Claim::Existing(Arc::clone(binary)),
                Some(Entry::Loading(completion)) => Claim::Wait(Arc::clone(completion)),
                None => {
                    let completion = Arc::new(Completion::new());
                    entries.insert(path.clone(), Entry::Loading(Arc::clone(&completion)));
                    Claim::Owner(completion)
                }
            }
        };

        let completion = match claim {
            Claim::Existing(binary) => return Ok(binary),
            Claim::Wait(completion) => {
                debug!("Waiting for {} to finish loading", path.display());
                return completion
                    .wait()
                    .map_err(|source| Error::Loader { loader: "load", source });
            }
            Claim::Owner(completion) => completion,
        };

        let mut guard = LoadGuard {
            registry: self,
            path: &path,
            completion: &completion,
            armed: true,
        };

        let binary = create();
        let result = binary
            .attach_working_copy(&self.config)
            .and_then(|()| binary.preload());

        let outcome = {
            let mut entries = lock!(self.entries);
            match result {
                Ok(()) => {
                    entries.insert(path.clone(), Entry::Loaded(Arc::clone(&binary)));
                    Ok(Arc::clone(&binary))
                }
                Err(e) => {
                    entries.remove(&path);
                    Err(Arc::new(e))
                }
            }
        };
        guard.armed = false;

        match &outcome {
            Ok(_) => info!("Loaded {}", path.display()),
            Err(e) => {
                warn!("Failed to load {} - {e}", path.display());
                binary.discard();
            }
        }
        completion.complete(outcome.clone());
        outcome.map_err(|source| Error::Loader { loader: "load", source })
    }

    /// Snapshot of all loaded binaries
    #[must_use]
    pub fn files(&self) -> Vec<Arc<Binary>> {
        let mut files: Vec<Arc<Binary>> = lock!(self.entries)
            .values()
            .filter_map(|entry| match entry {
                Entry::Loaded(binary) => Some(Arc::clone(binary)),
                Entry::Loading(_) => None,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files
    }

    /// The binary loaded for `path`
    #[must_use]
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Binary>> {
        let path = path.as_ref();
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        match lock!(self.entries).get(&path) {
            Some(Entry::Loaded(binary)) => Some(Arc::clone(binary)),
            _ => None,
        }
    }

    /// Returns true if a load or a loader pass is in progress anywhere
    #[must_use]
    pub fn is_anything_still_loading(&self) -> bool {
        lock!(self.entries).values().any(|entry| match entry {
            Entry::Loading(_) => true,
            Entry::Loaded(binary) => binary.tasks.is_any_running(),
        })
    }

    /// Unloads every binary, discarding unsaved edits.
    pub fn unload_and_reset_all(&self) {
        let drained: Vec<Entry> = lock!(self.entries).drain().map(|(_, entry)| entry).collect();
        for entry in drained {
            if let Entry::Loaded(binary) = entry {
                binary.discard();
            }
        }
    }

    /// Removes `binary` from the registry if it is the one registered for its path.
    pub(super) fn forget(&self, binary: &Arc<Binary>) {
        let mut entries = lock!(self.entries);
        if let Some(Entry::Loaded(registered)) = entries.get(&binary.path) {
            if Arc::ptr_eq(registered, binary) {
                entries.remove(&binary.path);
            }
        }
    }

    /// Finds the managed assembly `name` at `version`.
    ///
    /// Loaded binaries are searched first. After that, every directory holding a loaded or
    /// loading binary is probed for `name.dll`, which is loaded with `options` if it exists.
    /// Binaries that are still loading, or whose managed loader is running, are skipped.
    ///
    /// # Errors
    /// Returns an error only if the registry lock is poisoned
    pub fn find_assembly(
        &self,
        name: &str,
        version: FourPartVersion,
        options: BinaryLoadOptions,
    ) -> Result<Option<Arc<Binary>>> {
        let matches = |binary: &Binary| -> bool {
            if binary.tasks.managed.is_running() {
                return false;
            }
            matches!(
                binary.managed_assembly(),
                Ok(Some(assembly))
                    if assembly.name.eq_ignore_ascii_case(name) && assembly.version == version
            )
        };

        let loaded = self.files();
        if let Some(found) = loaded.iter().find(|binary| matches(binary)) {
            return Ok(Some(Arc::clone(found)));
        }

        let directories: BTreeSet<PathBuf> = lock!(self.entries)
            .keys()
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();

        for directory in directories {
            let candidate = directory.join(format!("{name}.dll"));
            let Ok(candidate) = fs::canonicalize(&candidate) else {
                continue;
            };
            if lock!(self.entries).contains_key(&candidate) {
                continue;
            }

            match self.load(&candidate, options) {
                Ok(binary) if matches(&binary) => {
                    debug!("Resolved {name}-{version} to {}", candidate.display());
                    return Ok(Some(binary));
                }
                Ok(_) => {}
                Err(e) => warn!("Probing {} failed - {e}", candidate.display()),
            }
        }

        Ok(None)
    }

    /// Saves every modified binary, repeating until none is left modified.
    ///
    /// Saves run concurrently; each is bounded by [`EngineConfig::save_timeout`] when set.
    ///
    /// # Errors
    /// Returns the first save failure, or [`Error::Timeout`]
    pub fn save_all(&self) -> Result<()> {
        loop {
            let modified: Vec<Arc<Binary>> = self
                .files()
                .into_iter()
                .filter(|binary| binary.is_modified().unwrap_or(false))
                .collect();
            if modified.is_empty() {
                return Ok(());
            }
            info!("Saving {} modified binaries", modified.len());

            modified
                .par_iter()
                .map(|binary| {
                    let handle = binary.begin_save();
                    match self.config.save_timeout {
                        Some(timeout) => handle.wait_timeout(timeout),
                        None => handle.wait(),
                    }
                })
                .collect::<Result<Vec<()>>>()?;
        }
    }
}
