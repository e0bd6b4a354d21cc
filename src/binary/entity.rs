//! The binary entity: one file on disk, its working copy, and everything derived from it.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
};

use log::{debug, info};
use tempfile::TempPath;

use crate::{
    binary::{registry::BinaryRegistry, save::SaveOutcome, BinaryLoadOptions},
    config::EngineConfig,
    identity::{FourPartVersion, PublicKeyToken},
    managed::{ManagedAssembly, ManagedReference},
    manifest::NativeManifest,
    pe::{ExecutableInfo, PeInfo},
    prerequisite::Prerequisite,
    resources::{ResourceTable, VersionField, VersionResource},
    signing::{Certificate, StrongNameKey},
    utils::synchronization::{Completion, OnceTask},
    Error, Result,
};

/// The memoized loader passes of one binary.
#[derive(Debug)]
pub(super) struct LoaderTasks {
    pub(super) pe_info: Arc<OnceTask>,
    pub(super) version_info: Arc<OnceTask>,
    pub(super) dependency_data: Arc<OnceTask>,
    pub(super) managed: Arc<OnceTask>,
    pub(super) resources: Arc<OnceTask>,
    pub(super) manifest: Arc<OnceTask>,
    pub(super) md5: Arc<OnceTask>,
    pub(super) signature: Arc<OnceTask>,
}

impl LoaderTasks {
    fn new() -> Self {
        LoaderTasks {
            pe_info: Arc::new(OnceTask::new("pe-info")),
            version_info: Arc::new(OnceTask::new("version-info")),
            dependency_data: Arc::new(OnceTask::new("dependency-data")),
            managed: Arc::new(OnceTask::new("managed")),
            resources: Arc::new(OnceTask::new("resources")),
            manifest: Arc::new(OnceTask::new("manifest")),
            md5: Arc::new(OnceTask::new("md5")),
            signature: Arc::new(OnceTask::new("signature")),
        }
    }

    fn all(&self) -> [&Arc<OnceTask>; 8] {
        [
            &self.pe_info,
            &self.version_info,
            &self.dependency_data,
            &self.managed,
            &self.resources,
            &self.manifest,
            &self.md5,
            &self.signature,
        ]
    }

    pub(super) fn is_any_running(&self) -> bool {
        self.all().iter().any(|task| task.is_running())
    }
}

/// Version-resource field values by origin.
#[derive(Debug, Default)]
pub(super) struct FieldLayers {
    /// Values assigned through setters; `None` clears a field
    pub(super) explicit: HashMap<VersionField, Option<String>>,
    /// Values read from assembly attributes
    pub(super) managed: HashMap<VersionField, String>,
    /// Values read from the version resource
    pub(super) resource: HashMap<VersionField, String>,
}

#[derive(Debug, Default)]
pub(super) struct Certificates {
    pub(super) signing: Option<Certificate>,
    pub(super) strong_name: Option<Certificate>,
    pub(super) strong_name_key: Option<StrongNameKey>,
}

/// The four independent modification categories.
#[derive(Debug, Default)]
pub(super) struct DirtyFlags {
    pub(super) generic: AtomicBool,
    pub(super) managed: AtomicBool,
    pub(super) resources: AtomicBool,
    pub(super) signature: AtomicBool,
}

/// The dirty bits one save run took over.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(super) struct DirtySnapshot {
    pub(super) generic: bool,
    pub(super) managed: bool,
    pub(super) resources: bool,
    pub(super) signature: bool,
}

impl DirtyFlags {
    pub(super) fn any(&self) -> bool {
        self.generic.load(Ordering::SeqCst)
            || self.managed.load(Ordering::SeqCst)
            || self.resources.load(Ordering::SeqCst)
            || self.signature.load(Ordering::SeqCst)
    }

    /// Clears every bit, returning what was set. Bits set afterwards belong to the next save.
    pub(super) fn take(&self) -> DirtySnapshot {
        DirtySnapshot {
            generic: self.generic.swap(false, Ordering::SeqCst),
            managed: self.managed.swap(false, Ordering::SeqCst),
            resources: self.resources.swap(false, Ordering::SeqCst),
            signature: self.signature.swap(false, Ordering::SeqCst),
        }
    }

    /// Sets the bits of a snapshot again after a failed save.
    pub(super) fn restore(&self, taken: DirtySnapshot) {
        self.generic.fetch_or(taken.generic, Ordering::SeqCst);
        self.managed.fetch_or(taken.managed, Ordering::SeqCst);
        self.resources.fetch_or(taken.resources, Ordering::SeqCst);
        self.signature.fetch_or(taken.signature, Ordering::SeqCst);
    }

    pub(super) fn clear(&self) {
        self.take();
    }
}

/// One executable or library, loaded through a [`BinaryRegistry`].
///
/// All reads and edits go to a private working copy; the original file is only touched by the
/// final replace step of [`Binary::save`]. Properties are computed on first access by loader
/// passes that run at most once (see [`BinaryLoadOptions`] for preloading them), and edits set
/// one of four modification flags that decide which rewrite passes a save performs.
///
/// After [`Binary::unload`] every accessor fails with [`Error::Unloaded`].
///
/// # Examples
///
/// ```rust,no_run
/// use pesmith::{BinaryLoadOptions, BinaryRegistry};
///
/// let registry = BinaryRegistry::with_defaults();
/// let binary = registry.load("tool.exe", BinaryLoadOptions::ALL)?;
/// if binary.is_managed()? {
///     println!("{:?}", binary.assembly_version()?);
/// }
/// binary.set_company_name("Contoso")?;
/// binary.save()?;
/// # Ok::<(), pesmith::Error>(())
/// ```
pub struct Binary {
    pub(super) path: PathBuf,
    pub(super) options: BinaryLoadOptions,
    pub(super) registry: Weak<BinaryRegistry>,
    pub(super) working: RwLock<Option<TempPath>>,
    pub(super) tasks: LoaderTasks,

    pub(super) pe: Prerequisite<Binary, PeInfo>,
    pub(super) version_info: Prerequisite<Binary, Option<VersionResource>>,
    pub(super) native_dependencies: Prerequisite<Binary, Vec<String>>,
    pub(super) il_only: Prerequisite<Binary, bool>,
    pub(super) strong_named: Prerequisite<Binary, bool>,
    pub(super) delay_signed: Prerequisite<Binary, bool>,
    pub(super) md5: Prerequisite<Binary, String>,
    pub(super) signed: Prerequisite<Binary, bool>,
    pub(super) valid_signed: Prerequisite<Binary, bool>,

    pub(super) assembly: RwLock<Option<ManagedAssembly>>,
    pub(super) resources: RwLock<Option<ResourceTable>>,
    pub(super) manifest: RwLock<Option<NativeManifest>>,
    pub(super) fields: RwLock<FieldLayers>,
    pub(super) certificates: RwLock<Certificates>,
    pub(super) dirty: DirtyFlags,
    pub(super) saving: Mutex<Option<Arc<Completion<SaveOutcome>>>>,
}

impl std::fmt::Debug for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binary")
            .field("path", &self.path)
            .field("options", &self.options)
            .field("unloaded", &self.is_unloaded())
            .finish_non_exhaustive()
    }
}

macro_rules! string_fields {
    ($($getter:ident, $setter:ident => $field:ident;)*) => {
        impl Binary {
            $(
                #[doc = concat!("The `", stringify!($field), "` value: set, from assembly attributes, or from the version resource")]
                ///
                /// # Errors
                /// Returns an error if the binary was unloaded or a loader failed
                pub fn $getter(&self) -> Result<Option<String>> {
                    self.field(VersionField::$field)
                }

                #[doc = concat!("Sets `", stringify!($field), "`")]
                ///
                /// # Errors
                /// Returns [`Error::Unloaded`] if the binary was unloaded
                pub fn $setter(&self, value: &str) -> Result<()> {
                    self.set_field(VersionField::$field, Some(value))
                }
            )*
        }
    };
}

macro_rules! version_fields {
    ($($getter:ident, $setter:ident => $field:ident;)*) => {
        impl Binary {
            $(
                #[doc = concat!("The `", stringify!($field), "`, zero when unknown")]
                ///
                /// # Errors
                /// Returns an error if the binary was unloaded or a loader failed
                pub fn $getter(&self) -> Result<FourPartVersion> {
                    self.version_field(VersionField::$field)
                }

                #[doc = concat!("Sets `", stringify!($field), "`")]
                ///
                /// # Errors
                /// Returns [`Error::Unloaded`] if the binary was unloaded
                pub fn $setter(&self, version: FourPartVersion) -> Result<()> {
                    self.set_field(VersionField::$field, Some(&version.to_string()))
                }
            )*
        }
    };
}

string_fields! {
    company_name, set_company_name => CompanyName;
    product_name, set_product_name => ProductName;
    file_description, set_file_description => FileDescription;
    comments, set_comments => Comments;
    legal_copyright, set_legal_copyright => LegalCopyright;
    legal_trademarks, set_legal_trademarks => LegalTrademarks;
    bug_tracker, set_bug_tracker => BugTracker;
    internal_name, set_internal_name => InternalName;
    original_filename, set_original_filename => OriginalFilename;
}

version_fields! {
    assembly_version, set_assembly_version => AssemblyVersion;
    file_version, set_file_version => FileVersion;
    product_version, set_product_version => ProductVersion;
}

impl Binary {
    pub(super) fn new(
        path: PathBuf,
        options: BinaryLoadOptions,
        registry: Weak<BinaryRegistry>,
    ) -> Binary {
        let tasks = LoaderTasks::new();
        Binary {
            pe: Prerequisite::new().loaded_by(&tasks.pe_info, Binary::load_pe_info),
            version_info: Prerequisite::new()
                .loaded_by(&tasks.version_info, Binary::load_version_info),
            native_dependencies: Prerequisite::new()
                .loaded_by(&tasks.dependency_data, Binary::load_dependency_data),
            il_only: Prerequisite::new().loaded_by(&tasks.managed, Binary::load_managed_data),
            strong_named: Prerequisite::new()
                .loaded_by(&tasks.managed, Binary::load_managed_data),
            delay_signed: Prerequisite::new()
                .loaded_by(&tasks.managed, Binary::load_managed_data),
            md5: Prerequisite::new().loaded_by(&tasks.md5, Binary::load_md5),
            signed: Prerequisite::new().loaded_by(&tasks.signature, Binary::load_signature),
            valid_signed: Prerequisite::new()
                .loaded_by(&tasks.signature, Binary::load_signature)
                .initialized_by(Binary::validate_signature),
            path,
            options,
            registry,
            working: RwLock::new(None),
            tasks,
            assembly: RwLock::new(None),
            resources: RwLock::new(None),
            manifest: RwLock::new(None),
            fields: RwLock::new(FieldLayers::default()),
            certificates: RwLock::new(Certificates::default()),
            dirty: DirtyFlags::default(),
            saving: Mutex::new(None),
        }
    }

    /// Copies the original into a fresh working copy.
    pub(super) fn attach_working_copy(&self, config: &EngineConfig) -> Result<()> {
        let stem = self
            .path
            .file_name()
            .map_or_else(|| "binary".to_string(), |name| name.to_string_lossy().into_owned());
        let working = tempfile::Builder::new()
            .prefix(&format!("{stem}-"))
            .tempfile_in(&config.working_directory)?
            .into_temp_path();
        fs::copy(&self.path, &working)?;
        debug!("{} -> working copy {}", self.path.display(), working.display());
        *write_lock!(self.working) = Some(working);
        Ok(())
    }

    /// Runs the loaders selected by the load options, concurrently.
    pub(super) fn preload(&self) -> Result<()> {
        let selected: [(BinaryLoadOptions, fn(&Binary) -> Result<()>); 8] = [
            (BinaryLoadOptions::PE_INFO, |b| b.pe_info().map(|_| ())),
            (BinaryLoadOptions::VERSION_INFO, |b| b.file_version_info().map(|_| ())),
            (BinaryLoadOptions::DEPENDENCY_DATA, |b| b.native_dependencies().map(|_| ())),
            (BinaryLoadOptions::MANAGED, |b| b.tasks.managed.run(|| b.load_managed_data())),
            (BinaryLoadOptions::RESOURCES, |b| b.tasks.resources.run(|| b.load_resource_data())),
            (BinaryLoadOptions::MANIFEST, |b| b.manifest().map(|_| ())),
            (BinaryLoadOptions::MD5, |b| b.md5().map(|_| ())),
            (BinaryLoadOptions::VALIDATE_SIGNATURE, |b| b.is_valid_signed().map(|_| ())),
        ];

        let failure: Mutex<Option<Error>> = Mutex::new(None);
        rayon::scope(|scope| {
            for (option, load) in selected {
                if !self.options.contains(option) {
                    continue;
                }
                let failure = &failure;
                scope.spawn(move |_| {
                    if let Err(e) = load(self) {
                        lock!(failure).get_or_insert(e);
                    }
                });
            }
        });

        match failure.into_inner().map_err(|_| Error::LockError)? {
            Some(e) => Err(e.in_binary(&self.path)),
            None => Ok(()),
        }
    }

    /// Forgets everything derived from the working copy, keeping edits and certificates.
    pub(super) fn refresh(&self) {
        for task in self.tasks.all() {
            task.reset();
        }
        self.pe.reset();
        self.version_info.reset();
        self.native_dependencies.reset();
        self.il_only.reset();
        self.strong_named.reset();
        self.delay_signed.reset();
        self.md5.reset();
        self.signed.reset();
        self.valid_signed.reset();

        *write_lock!(self.assembly) = None;
        *write_lock!(self.resources) = None;
        *write_lock!(self.manifest) = None;
        let mut fields = write_lock!(self.fields);
        fields.managed.clear();
        fields.resource.clear();
    }

    /// Forgets everything derived from the working copy and every pending edit.
    pub(super) fn reset_state(&self) {
        self.refresh();
        *write_lock!(self.fields) = FieldLayers::default();
        *write_lock!(self.certificates) = Certificates::default();
        self.dirty.clear();
    }

    pub(super) fn is_unloaded(&self) -> bool {
        read_lock!(self.working).is_none()
    }

    pub(super) fn ensure_loaded(&self) -> Result<()> {
        if self.is_unloaded() {
            return Err(Error::Unloaded(self.path.clone()));
        }
        Ok(())
    }

    pub(super) fn registry(&self) -> Result<Arc<BinaryRegistry>> {
        self.registry
            .upgrade()
            .ok_or_else(|| Error::Unloaded(self.path.clone()))
    }

    /// The original file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The options this binary was loaded with
    #[must_use]
    pub fn options(&self) -> BinaryLoadOptions {
        self.options
    }

    /// The private working copy all reads and edits go to
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn working_copy(&self) -> Result<PathBuf> {
        read_lock!(self.working)
            .as_ref()
            .map(|working| working.to_path_buf())
            .ok_or_else(|| Error::Unloaded(self.path.clone()))
    }

    fn get<T: Clone + Default>(&self, prerequisite: &Prerequisite<Binary, T>) -> Result<T> {
        self.ensure_loaded()?;
        prerequisite
            .get(self)
            .map_err(|e| e.in_binary(&self.path))
    }

    /// The structural flags of the file
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn pe_info(&self) -> Result<PeInfo> {
        self.get(&self.pe)
    }

    /// DOS and PE signatures are present
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_pe_file(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_pe_file)
    }

    /// PE32 optional header
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_32bit_pe(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_32bit_pe)
    }

    /// PE32+ optional header
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_64bit_pe(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_64bit_pe)
    }

    /// Has a CLR runtime header
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_managed(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_managed)
    }

    /// A PE image without a CLR runtime header
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_native(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_native)
    }

    /// Runs as a 32-bit process: PE32 for native images, the 32-bit-required flag for managed
    /// ones
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_32bit(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_32bit)
    }

    /// PE32+ optional header
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_64bit(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_64bit_pe)
    }

    /// Managed PE32 image that runs in either bitness
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_any_cpu(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_any_cpu)
    }

    /// Console subsystem
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or its headers are malformed
    pub fn is_console_app(&self) -> Result<bool> {
        Ok(self.pe_info()?.is_console_app)
    }

    /// Architecture × managed/native tag
    ///
    /// # Errors
    /// Returns [`Error::UnknownMachine`] for machines outside x86, x64, ARM, ARM64 and IA64
    pub fn executable_info(&self) -> Result<ExecutableInfo> {
        self.pe_info()?
            .executable_info()
            .map_err(|e| e.in_binary(&self.path))
    }

    /// IL-only managed image
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the metadata is malformed
    pub fn il_only(&self) -> Result<bool> {
        self.get(&self.il_only)
    }

    /// The assembly carries a public key
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the metadata is malformed
    pub fn is_strong_named(&self) -> Result<bool> {
        self.get(&self.strong_named)
    }

    /// The assembly carries a public key but its strong-name signature was not applied
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the metadata is malformed
    pub fn is_delay_signed(&self) -> Result<bool> {
        self.get(&self.delay_signed)
    }

    /// Lower-case hex MD5 of the working copy
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the working copy can't be read
    pub fn md5(&self) -> Result<String> {
        self.get(&self.md5)
    }

    /// The image carries an Authenticode certificate table
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the working copy can't be read
    pub fn is_signed(&self) -> Result<bool> {
        self.get(&self.signed)
    }

    /// The Authenticode signature verifies
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the verifier can't be run
    pub fn is_valid_signed(&self) -> Result<bool> {
        self.get(&self.valid_signed)
    }

    /// DLLs named in the import directory
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the import directory is malformed
    pub fn native_dependencies(&self) -> Result<Vec<String>> {
        self.get(&self.native_dependencies)
    }

    /// The version resource as found in the file, ignoring pending edits
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the working copy can't be read
    pub fn file_version_info(&self) -> Result<Option<VersionResource>> {
        self.get(&self.version_info)
    }

    /// The managed view of the assembly; `None` for native binaries
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the metadata is malformed
    pub fn managed_assembly(&self) -> Result<Option<ManagedAssembly>> {
        self.ensure_loaded()?;
        self.tasks
            .managed
            .run(|| self.load_managed_data())
            .map_err(|e| e.in_binary(&self.path))?;
        Ok(read_lock!(self.assembly).clone())
    }

    /// The assembly references of a managed binary
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the metadata is malformed
    pub fn assembly_references(&self) -> Result<Vec<ManagedReference>> {
        Ok(self
            .managed_assembly()?
            .map(|assembly| assembly.references)
            .unwrap_or_default())
    }

    /// The native resources; `None` with [`BinaryLoadOptions::NO_RESOURCES`]
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded
    pub fn native_resources(&self) -> Result<Option<ResourceTable>> {
        self.ensure_loaded()?;
        self.tasks
            .resources
            .run(|| self.load_resource_data())
            .map_err(|e| e.in_binary(&self.path))?;
        Ok(read_lock!(self.resources).clone())
    }

    /// A copy of the application manifest; `None` for files that are not PE images or with
    /// [`BinaryLoadOptions::NO_MANIFEST`]
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the embedded manifest is malformed
    pub fn manifest(&self) -> Result<Option<NativeManifest>> {
        self.ensure_manifest()?;
        Ok(read_lock!(self.manifest).clone())
    }

    /// Edits the application manifest in place; the edit is written on the next save.
    ///
    /// Returns `None` without calling `edit` when the binary has no manifest model.
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the embedded manifest is malformed
    pub fn with_manifest<R>(&self, edit: impl FnOnce(&mut NativeManifest) -> R) -> Result<Option<R>> {
        self.ensure_manifest()?;
        Ok(write_lock!(self.manifest).as_mut().map(edit))
    }

    fn ensure_manifest(&self) -> Result<()> {
        self.ensure_loaded()?;
        self.tasks
            .manifest
            .run(|| self.load_manifest_data())
            .map_err(|e| e.in_binary(&self.path))
    }

    /// Blocks until the resource and managed loaders have run.
    pub(super) fn wait_for_resource_and_managed_loaders(&self) -> Result<()> {
        self.tasks
            .resources
            .run(|| self.load_resource_data())
            .and_then(|()| self.tasks.managed.run(|| self.load_managed_data()))
            .map_err(|e| e.in_binary(&self.path))
    }

    /// A version-resource field: the value set on this binary, else the assembly attribute,
    /// else the version resource.
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or a loader failed
    pub fn field(&self, field: VersionField) -> Result<Option<String>> {
        self.ensure_loaded()?;
        if let Some(value) = read_lock!(self.fields).explicit.get(&field) {
            return Ok(value.clone());
        }

        self.wait_for_resource_and_managed_loaders()?;
        let fields = read_lock!(self.fields);
        Ok(fields
            .managed
            .get(&field)
            .or_else(|| fields.resource.get(&field))
            .cloned())
    }

    /// Sets a version-resource field; `None` clears it.
    ///
    /// Marks the managed and resource passes of the next save.
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn set_field(&self, field: VersionField, value: Option<&str>) -> Result<()> {
        self.ensure_loaded()?;
        write_lock!(self.fields)
            .explicit
            .insert(field, value.map(ToString::to_string));
        self.dirty.managed.store(true, Ordering::SeqCst);
        self.dirty.resources.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn version_field(&self, field: VersionField) -> Result<FourPartVersion> {
        Ok(self
            .field(field)?
            .map_or(FourPartVersion::ZERO, |value| {
                FourPartVersion::parse_lenient(&value)
            }))
    }

    /// The certificate used for Authenticode signing on save
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn signing_certificate(&self) -> Result<Option<Certificate>> {
        self.ensure_loaded()?;
        Ok(read_lock!(self.certificates).signing.clone())
    }

    /// Sets the certificate used for Authenticode signing; the next save signs the file.
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn set_signing_certificate(&self, certificate: Certificate) -> Result<()> {
        self.ensure_loaded()?;
        write_lock!(self.certificates).signing = Some(certificate);
        self.dirty.signature.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The certificate whose key strong names the assembly
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn strong_name_key_certificate(&self) -> Result<Option<Certificate>> {
        self.ensure_loaded()?;
        Ok(read_lock!(self.certificates).strong_name.clone())
    }

    /// Strong names the assembly with the RSA key of `certificate` on the next save.
    ///
    /// # Errors
    /// Returns [`Error::Certificate`] if the certificate has no usable RSA key
    pub fn set_strong_name_key_certificate(&self, certificate: Certificate) -> Result<()> {
        let key = certificate.strong_name_key()?;
        self.set_strong_name_key(key)?;
        write_lock!(self.certificates).strong_name = Some(certificate);
        Ok(())
    }

    /// The strong-name public key: the one set on this binary, else the assembly's own
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the stored key is malformed
    pub fn strong_name_key(&self) -> Result<Option<StrongNameKey>> {
        if let Some(key) = read_lock!(self.certificates).strong_name_key.clone() {
            return Ok(Some(key));
        }
        match self.managed_assembly()? {
            Some(assembly) if assembly.is_strong_named() => {
                StrongNameKey::from_blob(assembly.public_key).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Sets the strong-name public key written on the next save.
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or a loader failed
    pub fn set_strong_name_key(&self, key: StrongNameKey) -> Result<()> {
        self.ensure_loaded()?;
        self.wait_for_resource_and_managed_loaders()?;
        write_lock!(self.certificates).strong_name_key = Some(key);
        self.dirty.managed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Token of [`Binary::strong_name_key`]
    ///
    /// # Errors
    /// Returns an error if the binary was unloaded or the stored key is malformed
    pub fn public_key_token(&self) -> Result<Option<PublicKeyToken>> {
        Ok(self
            .strong_name_key()?
            .map(|key| key.public_key_token()))
    }

    /// Flags the binary as modified without a specific edit; the next save replaces the
    /// original with the working copy.
    pub fn mark_modified(&self) {
        self.dirty.generic.store(true, Ordering::SeqCst);
    }

    /// Returns true if a save has anything to do
    ///
    /// # Errors
    /// Returns [`Error::Unloaded`] if the binary was unloaded
    pub fn is_modified(&self) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.dirty.any()
            || read_lock!(self.manifest)
                .as_ref()
                .is_some_and(NativeManifest::is_modified))
    }

    /// Removes the binary from its registry and deletes the working copy.
    ///
    /// Pending edits are discarded; afterwards every accessor fails with [`Error::Unloaded`].
    pub fn unload(self: &Arc<Self>) {
        if let Some(registry) = self.registry.upgrade() {
            registry.forget(self);
        }
        self.discard();
    }

    /// Drops the working copy and all state, without touching the registry.
    pub(super) fn discard(&self) {
        // Dropping the TempPath deletes the working copy.
        let working = write_lock!(self.working).take();
        if let Some(working) = working {
            info!("Unloading {}", self.path.display());
            drop(working);
        }
        self.reset_state();
    }

    /// Discards all edits and loads the original file again.
    ///
    /// Returns the binary now registered for the path: this one, unless the path was loaded
    /// again by someone else after an earlier [`Binary::unload`].
    ///
    /// # Errors
    /// Returns an error if the file can no longer be loaded
    pub fn revert(self: &Arc<Self>) -> Result<Arc<Self>> {
        let registry = self.registry()?;
        if !self.is_unloaded() {
            self.unload();
        }
        registry.reload(self)
    }
}
