//! The save pipeline.
//!
//! A save rewrites the working copy in passes and then replaces the original file:
//!
//! 1. unsigned managed dependencies are strong named first, in dependency order
//!    ([`SigningPlan`]);
//! 2. existing Authenticode signatures are stripped, since every rewrite invalidates them;
//! 3. the assembly metadata is patched: public key, version, reference tokens and the
//!    single-string attributes;
//! 4. the manifest and version resources are regenerated and the resource section rewritten;
//! 5. when a signing certificate was set, the file is strong-name signed, then Authenticode
//!    signed with timestamp rotation;
//! 6. the working copy replaces the original and the modification flags are cleared.
//!
//! [`BinaryLoadOptions::NO_MANAGED`] skips steps 1 and 3 and the strong-name signature.
//!
//! Saves run on a worker thread. Concurrent requests for the same binary share one run. A run
//! takes over the modification flags set when it starts; edits made while it runs stay pending
//! for the next save.

use std::{
    collections::HashMap,
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use log::{debug, info, warn};
use strum::IntoEnumIterator;
use tempfile::NamedTempFile;

use crate::{
    binary::{entity::DirtySnapshot, registry::BinaryRegistry, Binary, BinaryLoadOptions},
    identity::{FourPartVersion, PublicKeyToken},
    managed::{attribute_field, ManagedRewrite},
    pe::PeImage,
    resources::{ResourceTable, VersionField, VersionResource, DEFAULT_TRANSLATION},
    signing::sign_file,
    utils::{graph::IndexedGraph, synchronization::Completion},
    Error, Result,
};

/// Shared result of one save run
pub(crate) type SaveOutcome = std::result::Result<(), Arc<Error>>;

/// Fields a strong-naming cascade copies to the dependencies it signs.
const CASCADED_FIELDS: [VersionField; 3] = [
    VersionField::LegalCopyright,
    VersionField::CompanyName,
    VersionField::ProductName,
];

/// Pending result of [`Binary::begin_save`].
#[derive(Debug, Clone)]
pub struct SaveHandle {
    path: PathBuf,
    completion: Arc<Completion<SaveOutcome>>,
}

impl SaveHandle {
    fn finished(path: PathBuf, outcome: SaveOutcome) -> SaveHandle {
        let completion = Arc::new(Completion::new());
        completion.complete(outcome);
        SaveHandle { path, completion }
    }

    fn convert(outcome: SaveOutcome) -> Result<()> {
        outcome.map_err(|source| Error::Loader {
            loader: "save",
            source,
        })
    }

    /// Blocks until the save finished.
    ///
    /// # Errors
    /// Returns [`Error::Loader`] carrying the save failure
    pub fn wait(&self) -> Result<()> {
        Self::convert(self.completion.wait())
    }

    /// Blocks until the save finished or `timeout` expired.
    ///
    /// A save that timed out keeps running; the binary is in an unknown state until it ends.
    ///
    /// # Errors
    /// Returns [`Error::Timeout`] when the wait expired, or the save failure
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        match self.completion.wait_timeout(timeout) {
            Some(outcome) => Self::convert(outcome),
            None => Err(Error::Timeout(self.path.clone())),
        }
    }

    /// Returns true once the save finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completion.is_complete()
    }
}

/// The unsigned managed dependencies a binary needs strong named before it can be, in the
/// order they must be saved.
///
/// Edges point from a dependency to the assembly referencing it, so a topological order
/// saves every dependency before anything that references it.
#[derive(Debug)]
pub struct SigningPlan {
    order: Vec<Arc<Binary>>,
}

impl SigningPlan {
    /// Resolves the unsigned references of `root`, transitively.
    ///
    /// # Errors
    /// - [`Error::DependencyNotFound`] if a reference can't be resolved
    /// - [`Error::DependencyNotStrongNamed`] if a referencing binary was loaded with
    ///   [`BinaryLoadOptions::NO_UNSIGNED_MANAGED_DEPENDENCIES`]
    /// - [`Error::DependencyCycle`] if unsigned assemblies reference each other
    pub fn build(root: &Arc<Binary>) -> Result<SigningPlan> {
        let registry = root.registry()?;
        let mut graph = IndexedGraph::new();
        let mut binaries: HashMap<PathBuf, Arc<Binary>> = HashMap::new();
        let mut pending = vec![Arc::clone(root)];

        graph.add_node(root.path.clone());
        binaries.insert(root.path.clone(), Arc::clone(root));

        while let Some(binary) = pending.pop() {
            for dependency in unsigned_dependencies(&binary, &registry)? {
                if !graph.contains(&dependency.path) {
                    binaries.insert(dependency.path.clone(), Arc::clone(&dependency));
                    pending.push(Arc::clone(&dependency));
                }
                graph.add_edge(dependency.path.clone(), binary.path.clone());
            }
        }

        if let Some(cycle) = graph.find_any_cycle() {
            let names = cycle
                .iter()
                .map(|path| assembly_name(&binaries[path]))
                .collect();
            return Err(Error::DependencyCycle(names));
        }

        let order = graph
            .topological_sort()
            .ok_or_else(|| Error::DependencyCycle(Vec::new()))?
            .into_iter()
            .filter(|path| *path != root.path)
            .map(|path| Arc::clone(&binaries[&path]))
            .collect();
        Ok(SigningPlan { order })
    }

    /// Dependencies in save order
    #[must_use]
    pub fn order(&self) -> &[Arc<Binary>] {
        &self.order
    }

    /// Returns true if nothing needs signing first
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn assembly_name(binary: &Binary) -> String {
    binary
        .managed_assembly()
        .ok()
        .flatten()
        .map_or_else(|| binary.path.display().to_string(), |assembly| assembly.name)
}

/// The dependencies of `binary` that are referenced without a token and are not strong named.
fn unsigned_dependencies(binary: &Binary, registry: &BinaryRegistry) -> Result<Vec<Arc<Binary>>> {
    let mut dependencies = Vec::new();
    for reference in binary.assembly_references()? {
        if reference.is_strong_named() {
            continue;
        }

        let Some(dependency) =
            registry.find_assembly(&reference.name, reference.version, binary.options)?
        else {
            return Err(Error::DependencyNotFound {
                path: binary.path.clone(),
                name: reference.name,
                version: reference.version.to_string(),
            });
        };

        if dependency.is_strong_named()? {
            continue;
        }
        if binary
            .options
            .contains(BinaryLoadOptions::NO_UNSIGNED_MANAGED_DEPENDENCIES)
        {
            return Err(Error::DependencyNotStrongNamed {
                path: binary.path.clone(),
                name: reference.name,
                version: reference.version.to_string(),
            });
        }
        dependencies.push(dependency);
    }
    Ok(dependencies)
}

impl Binary {
    /// Starts saving on a worker thread.
    ///
    /// A save already in progress is joined instead of starting another. An unmodified binary
    /// yields a handle that has already finished.
    #[must_use]
    pub fn begin_save(self: &Arc<Self>) -> SaveHandle {
        let mut saving = lock!(self.saving);
        if let Some(completion) = saving.as_ref() {
            if !completion.is_complete() {
                return SaveHandle {
                    path: self.path.clone(),
                    completion: Arc::clone(completion),
                };
            }
        }

        match self.is_modified() {
            Err(e) => return SaveHandle::finished(self.path.clone(), Err(Arc::new(e))),
            Ok(false) => {
                debug!("{} is not modified, nothing to save", self.path.display());
                return SaveHandle::finished(self.path.clone(), Ok(()));
            }
            Ok(true) => {}
        }

        let completion = Arc::new(Completion::new());
        *saving = Some(Arc::clone(&completion));
        drop(saving);

        let binary = Arc::clone(self);
        let worker = Arc::clone(&completion);
        let spawned = thread::Builder::new()
            .name("pesmith-save".to_string())
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| binary.run_save()))
                    .unwrap_or_else(|_| Err(Error::Error("save panicked".to_string())));
                if let Err(e) = &outcome {
                    warn!("Saving {} failed - {e}", binary.path.display());
                }
                worker.complete(outcome.map_err(Arc::new));
            });
        if let Err(e) = spawned {
            completion.complete(Err(Arc::new(Error::from(e))));
        }

        SaveHandle {
            path: self.path.clone(),
            completion,
        }
    }

    /// Saves and waits for the save to finish.
    ///
    /// # Errors
    /// Returns the save failure; see [`Binary::begin_save`]
    pub fn save(self: &Arc<Self>) -> Result<Arc<Self>> {
        self.begin_save().wait()?;
        Ok(Arc::clone(self))
    }

    /// Waits for a save that is already running, whatever its outcome.
    fn finish_running_save(&self) {
        let running = lock!(self.saving)
            .as_ref()
            .filter(|completion| !completion.is_complete())
            .cloned();
        if let Some(completion) = running {
            if let Err(e) = completion.wait() {
                debug!("{}: earlier save failed - {e}", self.path.display());
            }
        }
    }

    /// Saves until no edit is left pending.
    ///
    /// A save that was already running when the edits were made only covers what it read at
    /// its start, so the binary is saved again while it still reports modifications.
    fn save_pending_edits(self: &Arc<Self>) -> Result<()> {
        loop {
            self.begin_save().wait()?;
            if !self.is_modified()? {
                return Ok(());
            }
        }
    }

    fn run_save(self: &Arc<Self>) -> Result<()> {
        self.ensure_loaded()?;
        let taken = self.dirty.take();
        let explicit = read_lock!(self.fields).explicit.clone();

        let outcome = self.rewrite_and_replace(taken, &explicit);
        if outcome.is_err() {
            self.dirty.restore(taken);
        }
        outcome
    }

    fn rewrite_and_replace(
        self: &Arc<Self>,
        taken: DirtySnapshot,
        explicit: &HashMap<VersionField, Option<String>>,
    ) -> Result<()> {
        let registry = self.registry()?;
        let working = self.working_copy()?;
        let info = self.pe_info()?;
        let managed_pass = info.is_managed
            && !self.options.contains(BinaryLoadOptions::NO_MANAGED)
            && (taken.managed || taken.resources);

        if info.is_pe_file {
            self.wait_for_resource_and_managed_loaders()?;
            let reference_tokens = if managed_pass {
                self.strong_name_dependencies()?
            } else {
                Vec::new()
            };

            let mut image = PeImage::read(&working)?;
            if image.strip_certificates()? {
                debug!("{}: stripped signatures", self.path.display());
            }

            if managed_pass {
                let rewrite = self.managed_rewrite(reference_tokens, explicit)?;
                if !rewrite.is_empty() {
                    rewrite.apply(&mut image)?;
                }
            }

            if let Some(table) = self.rewritten_resources(taken)? {
                table.write_into(&mut image)?;
            }
            image.write(&working)?;
            if taken.signature {
                self.apply_signatures(info.is_managed, &working, &registry)?;
            }
        }

        self.refresh();
        write_lock!(self.fields)
            .explicit
            .retain(|field, value| explicit.get(field) != Some(&*value));

        let parent = self
            .path
            .parent()
            .ok_or_else(|| Error::Error(format!("{} has no parent", self.path.display())))?;
        let staged = NamedTempFile::new_in(parent)?;
        fs::copy(&working, staged.path())?;
        staged
            .persist(&self.path)
            .map_err(|e| Error::from(e.error))?;

        info!("Saved {} (md5 {})", self.path.display(), self.md5()?);
        Ok(())
    }

    /// Strong names unsigned dependencies when this binary will be strong named, returning
    /// the tokens to patch into its references.
    fn strong_name_dependencies(self: &Arc<Self>) -> Result<Vec<(u32, PublicKeyToken)>> {
        let Some(strong_name) = self.strong_name_key_certificate()? else {
            return Ok(Vec::new());
        };

        let plan = SigningPlan::build(self)?;
        let signing = self.signing_certificate()?;
        for dependency in plan.order() {
            warn!(
                "{}: strong naming unsigned dependency {}",
                self.path.display(),
                dependency.path.display()
            );
            dependency.finish_running_save();
            dependency.set_strong_name_key_certificate(strong_name.clone())?;
            if let Some(signing) = &signing {
                dependency.set_signing_certificate(signing.clone())?;
            }
            for field in CASCADED_FIELDS {
                if let Some(value) = self.field(field)? {
                    dependency.set_field(field, Some(&value))?;
                }
            }
            dependency.save_pending_edits()?;
        }

        let registry = self.registry()?;
        let mut tokens = Vec::new();
        for reference in self.assembly_references()? {
            if reference.is_strong_named() {
                continue;
            }
            let token = registry
                .find_assembly(&reference.name, reference.version, self.options)?
                .map(|dependency| dependency.public_key_token())
                .transpose()?
                .flatten();
            if let Some(token) = token {
                tokens.push((reference.row, token));
            }
        }
        Ok(tokens)
    }

    fn managed_rewrite(
        &self,
        reference_tokens: Vec<(u32, PublicKeyToken)>,
        explicit: &HashMap<VersionField, Option<String>>,
    ) -> Result<ManagedRewrite> {
        let Some(assembly) = read_lock!(self.assembly).clone() else {
            return Ok(ManagedRewrite::default());
        };
        let mut rewrite = ManagedRewrite {
            reference_tokens,
            ..ManagedRewrite::default()
        };

        if let Some(key) = read_lock!(self.certificates).strong_name_key.clone() {
            if key.as_bytes() != assembly.public_key.as_slice() {
                rewrite.signature_size = key.signature_size();
                rewrite.public_key = Some(key.into_bytes());
            }
        }

        if let Some(Some(version)) = explicit.get(&VersionField::AssemblyVersion) {
            let version = FourPartVersion::parse_lenient(version);
            if version != assembly.version {
                rewrite.version = Some(version);
            }
        }

        for attribute in &assembly.attributes {
            let (Some(current), Some(field)) =
                (&attribute.value, attribute_field(&attribute.type_name))
            else {
                continue;
            };
            let Some(value) = explicit.get(&field) else {
                continue;
            };
            let value = value.clone().unwrap_or_default();
            if value != *current {
                rewrite.attributes.push((attribute.row, value));
            }
        }
        Ok(rewrite)
    }

    /// The resource table with the manifest and version passes applied, if either changed it.
    fn rewritten_resources(&self, taken: DirtySnapshot) -> Result<Option<ResourceTable>> {
        let Some(mut table) = read_lock!(self.resources).clone() else {
            return Ok(None);
        };
        let mut changed = false;

        if !self.options.contains(BinaryLoadOptions::NO_MANIFEST) {
            let manifest = read_lock!(self.manifest)
                .as_ref()
                .filter(|manifest| manifest.is_modified())
                .map(|manifest| manifest.to_xml())
                .transpose()?;
            if let Some(text) = manifest {
                table.set_manifest(&text);
                changed = true;
            }
        }

        if taken.resources {
            let mut version = match table.version() {
                Ok(Some(version)) => version,
                Ok(None) => VersionResource::new(),
                Err(e) => {
                    warn!("{}: replacing unreadable version resource - {e}", self.path.display());
                    VersionResource::new()
                }
            };
            if version.translations.is_empty() {
                version.translations.push(DEFAULT_TRANSLATION);
            }

            version.fixed.file_version = self.file_version()?;
            version.fixed.product_version = self.product_version()?;
            for field in VersionField::iter() {
                version.set(field, self.field(field)?.as_deref());
            }
            table.set_version(&version)?;
            changed = true;
        }

        Ok(changed.then_some(table))
    }

    fn apply_signatures(
        &self,
        is_managed: bool,
        working: &std::path::Path,
        registry: &BinaryRegistry,
    ) -> Result<()> {
        if self.options.contains(BinaryLoadOptions::NO_SIGNATURE) {
            return Ok(());
        }
        let Some(signing) = self.signing_certificate()? else {
            return Ok(());
        };

        if is_managed && !self.options.contains(BinaryLoadOptions::NO_MANAGED) {
            if let Some(strong_name) = self.strong_name_key_certificate()? {
                registry.signer().apply_strong_name(working, &strong_name)?;
            }
        }

        let config = registry.config();
        sign_file(
            working,
            &signing,
            registry.signer(),
            &config.timestamp_servers,
            config.timestamp_rounds,
        )
    }
}
