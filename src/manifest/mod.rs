//! The Win32 application manifest model.
//!
//! [`NativeManifest`] wraps one manifest document and exposes the parts this crate edits as
//! typed properties: the assembly identity, the `noInherit` marker, the requested UAC execution
//! level, DPI awareness, OS compatibility declarations, dependent assemblies (with binding
//! redirects) and the file list.
//!
//! Parsing normalizes the structure the same way every time: duplicate `trustInfo`,
//! `application` and `compatibility` blocks beyond the first are dropped, and `noInherit` /
//! `assemblyIdentity` are moved to the front when they appear elsewhere. Every setter marks the
//! manifest modified so the owning binary knows to rewrite its manifest resource.
//!
//! # Example
//!
//! ```rust
//! use pesmith::manifest::{ExecutionLevel, NativeManifest, SupportedOs};
//!
//! let mut manifest = NativeManifest::new();
//! manifest.set_requested_execution_level(ExecutionLevel::RequireAdministrator);
//! manifest.set_supported_os(SupportedOs::Win7, true);
//! assert!(manifest.is_modified());
//!
//! let xml = manifest.to_xml()?;
//! assert!(xml.contains(r#"level="requireAdministrator""#));
//!
//! let reparsed = NativeManifest::parse(&xml)?;
//! assert_eq!(reparsed.requested_execution_level(), ExecutionLevel::RequireAdministrator);
//! assert!(!reparsed.is_modified());
//! # Ok::<(), pesmith::Error>(())
//! ```

mod application;
mod compatibility;
mod dependencies;
mod files;
mod identity;
mod trust;
pub mod xml;

pub use compatibility::SupportedOs;
pub use dependencies::AssemblyReference;
pub use files::AssemblyFile;
pub use identity::{AssemblyType, BindingRedirect};
pub use trust::ExecutionLevel;

use crate::{
    identity::{Architecture, FourPartVersion},
    Result,
};
use xml::{Document, Element};

/// The document used when a binary has no manifest
pub const DEFAULT_MANIFEST: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
</assembly>"#;

/// An application manifest with typed accessors and a modification flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeManifest {
    document: Document,
    modified: bool,
}

impl Default for NativeManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeManifest {
    /// An empty `assembly` document
    #[must_use]
    pub fn new() -> Self {
        let mut root = Element::new(xml::ASM_V1, "assembly");
        root.set_attribute("xmlns", Some(xml::ASM_V1));
        root.set_attribute("manifestVersion", Some("1.0"));
        NativeManifest {
            document: Document::new(root),
            modified: false,
        }
    }

    /// Parses and normalizes manifest text; blank text yields [`NativeManifest::new`].
    ///
    /// # Errors
    /// Returns an error if the text is not well-formed XML
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim_start_matches('\u{feff}').trim_end_matches('\0');
        if text.trim().is_empty() {
            return Ok(Self::new());
        }

        let mut document = Document::parse(text)?;
        let root = document.root_mut();
        identity::validate_no_inherit(root);
        identity::validate(root);
        trust::validate(root);
        application::validate(root);
        compatibility::validate(root);

        Ok(NativeManifest {
            document,
            modified: false,
        })
    }

    /// Serializes as indented UTF-8 XML with a declaration.
    ///
    /// # Errors
    /// Returns an error if the XML writer fails
    pub fn to_xml(&self) -> Result<String> {
        self.document.to_xml()
    }

    /// The underlying document
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// True if a setter ran since parsing or the last [`NativeManifest::set_modified`]
    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Overrides the modification flag
    pub fn set_modified(&mut self, modified: bool) {
        self.modified = modified;
    }

    fn edit<T>(&mut self, change: impl FnOnce(&mut Element) -> T) -> T {
        self.modified = true;
        change(self.document.root_mut())
    }

    fn root(&self) -> &Element {
        self.document.root()
    }

    /// Requested UAC execution level
    #[must_use]
    pub fn requested_execution_level(&self) -> ExecutionLevel {
        trust::level(self.root())
    }

    /// Sets the UAC execution level; [`ExecutionLevel::None`] removes the `trustInfo` block
    /// unless `uiAccess` is set
    pub fn set_requested_execution_level(&mut self, level: ExecutionLevel) {
        self.edit(|root| trust::set_level(root, level));
    }

    /// The `uiAccess` bit
    #[must_use]
    pub fn ui_access(&self) -> bool {
        trust::ui_access(self.root())
    }

    /// Sets `uiAccess`
    pub fn set_ui_access(&mut self, value: bool) {
        self.edit(|root| trust::set_ui_access(root, value));
    }

    /// True if `noInherit` is present
    #[must_use]
    pub fn no_inherit(&self) -> bool {
        identity::no_inherit(self.root())
    }

    /// Adds or removes `noInherit`
    pub fn set_no_inherit(&mut self, value: bool) {
        self.edit(|root| identity::set_no_inherit(root, value));
    }

    /// DPI awareness
    #[must_use]
    pub fn dpi_aware(&self) -> bool {
        application::dpi_aware(self.root())
    }

    /// Sets DPI awareness
    pub fn set_dpi_aware(&mut self, value: bool) {
        self.edit(|root| application::set_dpi_aware(root, value));
    }

    /// True if the manifest declares compatibility with `os`
    #[must_use]
    pub fn supported_os(&self, os: SupportedOs) -> bool {
        compatibility::is_supported(self.root(), os)
    }

    /// Declares or withdraws compatibility with `os`
    pub fn set_supported_os(&mut self, os: SupportedOs, value: bool) {
        self.edit(|root| compatibility::set_supported(root, os, value));
    }

    /// Dependent assemblies, in document order
    #[must_use]
    pub fn dependencies(&self) -> Vec<AssemblyReference> {
        dependencies::dependencies(self.root())
    }

    /// Adds a dependency unless the same one is already listed
    pub fn add_dependency(&mut self, reference: &AssemblyReference) {
        self.edit(|root| dependencies::add_dependency(root, reference));
    }

    /// Removes a dependency
    pub fn remove_dependency(&mut self, reference: &AssemblyReference) {
        self.edit(|root| dependencies::remove_dependency(root, reference));
    }

    /// Removes several dependencies
    pub fn remove_dependencies<'a>(&mut self, references: impl IntoIterator<Item = &'a AssemblyReference>) {
        for reference in references {
            self.remove_dependency(reference);
        }
    }

    /// Name of the manifest's own assembly identity
    #[must_use]
    pub fn assembly_name(&self) -> Option<String> {
        identity::name(self.root())
    }

    /// Sets the identity name
    pub fn set_assembly_name(&mut self, name: Option<&str>) {
        self.edit(|root| identity::set_name(root, name));
    }

    /// Identity version, zero if missing
    #[must_use]
    pub fn assembly_version(&self) -> FourPartVersion {
        identity::version(self.root())
    }

    /// Sets the identity version; zero removes the attribute
    pub fn set_assembly_version(&mut self, version: FourPartVersion) {
        self.edit(|root| identity::set_version(root, version));
    }

    /// Identity architecture
    #[must_use]
    pub fn assembly_architecture(&self) -> Option<Architecture> {
        identity::architecture(self.root())
    }

    /// Sets the identity architecture
    pub fn set_assembly_architecture(&mut self, architecture: Option<Architecture>) {
        self.edit(|root| identity::set_architecture(root, architecture));
    }

    /// Identity public-key token
    #[must_use]
    pub fn assembly_public_key_token(&self) -> Option<String> {
        identity::public_key_token(self.root())
    }

    /// Sets the identity public-key token
    pub fn set_assembly_public_key_token(&mut self, token: Option<&str>) {
        self.edit(|root| identity::set_public_key_token(root, token));
    }

    /// Identity language, `None` without an identity
    #[must_use]
    pub fn assembly_language(&self) -> Option<String> {
        identity::is_active(self.root()).then(|| identity::language(self.root()))
    }

    /// Sets the identity language; `*` or empty removes the attribute
    pub fn set_assembly_language(&mut self, language: Option<&str>) {
        self.edit(|root| identity::set_language(root, language));
    }

    /// Identity type
    #[must_use]
    pub fn assembly_type(&self) -> AssemblyType {
        identity::assembly_type(self.root())
    }

    /// Sets the identity type
    pub fn set_assembly_type(&mut self, assembly_type: AssemblyType) {
        self.edit(|root| identity::set_assembly_type(root, assembly_type));
    }

    /// The `file` entries
    #[must_use]
    pub fn files(&self) -> Vec<AssemblyFile> {
        files::files(self.root())
    }

    /// Adds a file, replacing an entry of the same name
    pub fn add_file(&mut self, name: &str, sha1: Option<&str>) {
        self.edit(|root| files::add_file(root, name, sha1));
    }

    /// Removes a file by name, ignoring case
    pub fn remove_file(&mut self, name: &str) {
        self.edit(|root| files::remove_file(root, name));
    }
}

impl std::str::FromStr for NativeManifest {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_document() {
        let manifest = NativeManifest::parse("").unwrap();
        assert_eq!(manifest, NativeManifest::new());
        assert_eq!(
            NativeManifest::parse(DEFAULT_MANIFEST).unwrap().to_xml().unwrap(),
            manifest.to_xml().unwrap()
        );
        assert_eq!(manifest.requested_execution_level(), ExecutionLevel::None);
        assert!(manifest.assembly_name().is_none());
        assert!(manifest.assembly_language().is_none());
    }

    #[test]
    fn duplicates_are_pruned_on_parse() {
        let manifest = NativeManifest::parse(
            r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1" manifestVersion="1.0">
                 <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3"><security><requestedPrivileges>
                   <requestedExecutionLevel level="asInvoker" uiAccess="false"/>
                 </requestedPrivileges></security></trustInfo>
                 <trustInfo xmlns="urn:schemas-microsoft-com:asm.v3"/>
                 <assemblyIdentity name="Contoso.App" version="1.0.0.0" type="win32"/>
               </assembly>"#,
        )
        .unwrap();

        let root = manifest.document().root();
        assert_eq!(root.children(xml::ASM_V3, "trustInfo").count(), 1);
        assert_eq!(root.elements().next().map(Element::name), Some("assemblyIdentity"));
        assert_eq!(manifest.requested_execution_level(), ExecutionLevel::AsInvoker);
        assert_eq!(manifest.assembly_name().as_deref(), Some("Contoso.App"));
        assert!(!manifest.is_modified());
    }

    #[test]
    fn serialization_is_stable() {
        let mut manifest = NativeManifest::new();
        manifest.set_assembly_name(Some("Contoso.App"));
        manifest.set_assembly_version(FourPartVersion::new(1, 0, 0, 0));
        manifest.set_dpi_aware(true);
        manifest.set_no_inherit(true);
        manifest.add_file("Contoso.dll", None);

        let first = manifest.to_xml().unwrap();
        let second = NativeManifest::parse(&first).unwrap().to_xml().unwrap();
        assert_eq!(first, second);

        let reparsed = NativeManifest::parse(&first).unwrap();
        assert!(reparsed.no_inherit());
        assert!(reparsed.dpi_aware());
        let names: Vec<&str> = reparsed.document().root().elements().map(Element::name).collect();
        assert_eq!(&names[..2], &["noInherit", "assemblyIdentity"]);
    }

    #[test]
    fn administrator_manifest_for_win7_and_win8() {
        let mut manifest = NativeManifest::new();
        manifest.set_requested_execution_level(ExecutionLevel::RequireAdministrator);
        manifest.set_supported_os(SupportedOs::Win7, true);
        manifest.set_supported_os(SupportedOs::Win8, true);
        let text = manifest.to_xml().unwrap();

        assert_eq!(text.matches("<trustInfo").count(), 1);
        assert_eq!(text.matches(r#"level="requireAdministrator""#).count(), 1);
        assert_eq!(text.matches("<supportedOS").count(), 2);
        assert!(text.contains(r#"Id="{35138b9a-5d96-4fbd-8e2d-a2440225f93a}""#));
        assert!(text.contains(r#"Id="{4a2f28e3-53b9-4441-ba9c-d69d4a4a6e38}""#));

        let reparsed = NativeManifest::parse(&text).unwrap();
        assert!(reparsed.supported_os(SupportedOs::Win7));
        assert!(reparsed.supported_os(SupportedOs::Win8));
        assert!(!reparsed.supported_os(SupportedOs::Vista));
    }

    fn foo_reference() -> AssemblyReference {
        AssemblyReference::new(
            "Foo",
            FourPartVersion::new(1, 2, 3, 4),
            Some(Architecture::AMD64),
            Some("abcd1234"),
        )
        .with_language("*")
    }

    #[test]
    fn added_dependency_survives_a_round_trip() {
        let mut manifest = NativeManifest::parse(DEFAULT_MANIFEST).unwrap();
        manifest.add_dependency(&foo_reference());
        manifest.add_dependency(&foo_reference());
        assert!(manifest.is_modified());

        let reparsed = NativeManifest::parse(&manifest.to_xml().unwrap()).unwrap();
        let dependencies = reparsed.dependencies();
        assert_eq!(dependencies.len(), 1);
        assert!(dependencies[0].same_dependency(&foo_reference()));
        assert_eq!(dependencies[0].public_key_token.as_deref(), Some("abcd1234"));
        assert_eq!(dependencies[0].architecture, Some(Architecture::AMD64));

        let mut again = reparsed.clone();
        again.add_dependency(&foo_reference());
        assert_eq!(again.dependencies().len(), 1);
        again.remove_dependency(&foo_reference());
        assert!(again.dependencies().is_empty());
    }

    #[test]
    fn invalid_redirects_are_not_written() {
        let low = FourPartVersion::new(1, 0, 0, 0);
        let target = FourPartVersion::new(2, 0, 0, 0);
        let cases = [
            (BindingRedirect::new(low, FourPartVersion::ZERO, target), false),
            (BindingRedirect::new(low, target, FourPartVersion::ZERO), false),
            (BindingRedirect::new(FourPartVersion::ZERO, target, target), true),
        ];

        for (redirect, written) in cases {
            let mut manifest = NativeManifest::new();
            manifest.add_dependency(
                &foo_reference()
                    .with_type(AssemblyType::Win32Policy)
                    .with_binding_redirect(redirect),
            );
            let text = manifest.to_xml().unwrap();
            assert_eq!(text.contains("bindingRedirect"), written, "{redirect:?}");

            let reparsed = NativeManifest::parse(&text).unwrap();
            let expected = written.then_some(redirect);
            assert_eq!(reparsed.dependencies()[0].binding_redirect, expected);
        }
    }
}
