//! The loader passes of [`Binary`]. Each runs at most once per working copy, behind its
//! [`crate::utils::synchronization::OnceTask`].

use std::collections::HashMap;

use log::{debug, warn};
use md5::{Digest, Md5};
use strum::IntoEnumIterator;

use crate::{
    binary::{Binary, BinaryLoadOptions},
    file::Physical,
    managed::{attribute_field, ManagedAssembly},
    manifest::{NativeManifest, DEFAULT_MANIFEST},
    pe::{imported_dlls, Cor20Header, DataDirectoryType, PeHeaders, PeInfo, PeProbe},
    resources::{ResourceTable, VersionField, VersionResource},
    Result,
};

fn clean(value: &str) -> Option<String> {
    let value = value.trim_end_matches('\0');
    (!value.is_empty()).then(|| value.to_string())
}

fn resource_layer(version: &VersionResource) -> HashMap<VersionField, String> {
    VersionField::iter()
        .filter_map(|field| Some((field, clean(version.get(field)?)?)))
        .collect()
}

fn managed_layer(assembly: &ManagedAssembly) -> HashMap<VersionField, String> {
    let mut layer = HashMap::new();
    if !assembly.version.is_zero() {
        layer.insert(VersionField::AssemblyVersion, assembly.version.to_string());
    }

    for attribute in &assembly.attributes {
        let Some(field) = attribute_field(&attribute.type_name) else {
            continue;
        };
        let Some(value) = attribute.value.as_deref().and_then(clean) else {
            continue;
        };

        if field == VersionField::FileVersion {
            layer
                .entry(VersionField::ProductVersion)
                .or_insert_with(|| value.clone());
        }
        layer.entry(field).or_insert(value);
    }
    layer
}

impl Binary {
    /// Maps the working copy and probes its headers.
    fn map_working_copy(&self) -> Result<(Physical, PeProbe)> {
        let file = Physical::new(self.working_copy()?)?;
        let probe = PeHeaders::parse(file.data())?;
        Ok((file, probe))
    }

    pub(super) fn load_pe_info(&self) -> Result<()> {
        let (_, probe) = self.map_working_copy()?;
        let info = PeInfo::from_probe(&probe);
        debug!(
            "{}: pe={} managed={} machine=0x{:04x}",
            self.path.display(),
            info.is_pe_file,
            info.is_managed,
            info.machine
        );
        self.pe.fill(info);
        Ok(())
    }

    pub(super) fn load_version_info(&self) -> Result<()> {
        if !self.pe_info()?.is_pe_file {
            self.version_info.fill(None);
            return Ok(());
        }

        let (file, probe) = self.map_working_copy()?;
        let version = probe
            .headers()
            .map(|headers| ResourceTable::read(file.data(), headers))
            .transpose()
            .and_then(|table| table.map(|t| t.version()).transpose())
            .map(Option::flatten);

        match version {
            Ok(version) => self.version_info.fill(version),
            Err(e) => {
                warn!("{}: unreadable version resource - {e}", self.path.display());
                self.version_info.fill(None);
            }
        }
        Ok(())
    }

    pub(super) fn load_dependency_data(&self) -> Result<()> {
        let (file, probe) = self.map_working_copy()?;
        let dependencies = match probe.headers() {
            Some(headers) => imported_dlls(file.data(), headers)?,
            None => Vec::new(),
        };
        self.native_dependencies.fill(dependencies);
        Ok(())
    }

    pub(super) fn load_managed_data(&self) -> Result<()> {
        let info = self.pe_info()?;
        if !info.is_managed || self.options.contains(BinaryLoadOptions::NO_MANAGED) {
            self.il_only.fill(info.il_only);
            self.strong_named.fill(false);
            self.delay_signed.fill(false);
            return Ok(());
        }

        let (file, probe) = self.map_working_copy()?;
        let Some(headers) = probe.headers() else {
            return Ok(());
        };
        let assembly = ManagedAssembly::read(file.data(), headers)?;
        drop(file);

        let strong_named = assembly
            .as_ref()
            .is_some_and(ManagedAssembly::is_strong_named);
        self.il_only.fill(info.il_only);
        self.strong_named.fill(strong_named);
        self.delay_signed
            .fill(strong_named && info.cor_flags & Cor20Header::FLAG_STRONG_NAME_SIGNED == 0);

        let Some(assembly) = assembly else {
            return Ok(());
        };
        write_lock!(self.fields).managed = managed_layer(&assembly);

        if self
            .options
            .contains(BinaryLoadOptions::UNSIGNED_MANAGED_DEPENDENCIES)
        {
            self.check_unsigned_dependencies(&assembly)?;
        }

        *write_lock!(self.assembly) = Some(assembly);
        Ok(())
    }

    /// Warns about unsigned references that can't be located for strong naming.
    fn check_unsigned_dependencies(&self, assembly: &ManagedAssembly) -> Result<()> {
        let Ok(registry) = self.registry() else {
            return Ok(());
        };
        let options = self.options - BinaryLoadOptions::UNSIGNED_MANAGED_DEPENDENCIES;

        for reference in assembly.references.iter().filter(|r| !r.is_strong_named()) {
            if registry
                .find_assembly(&reference.name, reference.version, options)?
                .is_none()
            {
                warn!(
                    "{}: unsigned dependency {}-{} not found",
                    self.path.display(),
                    reference.name,
                    reference.version
                );
            }
        }
        Ok(())
    }

    pub(super) fn load_resource_data(&self) -> Result<()> {
        if self.options.contains(BinaryLoadOptions::NO_RESOURCES) || !self.pe_info()?.is_pe_file
        {
            return Ok(());
        }

        let (file, probe) = self.map_working_copy()?;
        let Some(headers) = probe.headers() else {
            return Ok(());
        };

        let table = match ResourceTable::read(file.data(), headers) {
            Ok(table) => table,
            Err(e) => {
                warn!("{}: unreadable resources - {e}", self.path.display());
                ResourceTable::new()
            }
        };
        drop(file);

        match table.version() {
            Ok(Some(version)) => write_lock!(self.fields).resource = resource_layer(&version),
            Ok(None) => {}
            Err(e) => warn!("{}: unreadable version resource - {e}", self.path.display()),
        }

        *write_lock!(self.resources) = Some(table);
        Ok(())
    }

    pub(super) fn load_manifest_data(&self) -> Result<()> {
        if self.options.contains(BinaryLoadOptions::NO_MANIFEST) || !self.pe_info()?.is_pe_file {
            return Ok(());
        }

        self.tasks.resources.run(|| self.load_resource_data())?;
        let text = read_lock!(self.resources)
            .as_ref()
            .map(ResourceTable::manifest_text)
            .transpose()?
            .flatten();

        let manifest = match text {
            Some(text) => NativeManifest::parse(&text)?,
            None => NativeManifest::parse(DEFAULT_MANIFEST)?,
        };
        *write_lock!(self.manifest) = Some(manifest);
        Ok(())
    }

    pub(super) fn load_md5(&self) -> Result<()> {
        let file = Physical::new(self.working_copy()?)?;
        self.md5.fill(format!("{:x}", Md5::digest(file.data())));
        Ok(())
    }

    pub(super) fn load_signature(&self) -> Result<()> {
        let (_, probe) = self.map_working_copy()?;
        let signed = probe
            .headers()
            .is_some_and(|headers| !headers.directory(DataDirectoryType::Certificate).is_empty());
        self.signed.fill(signed);
        Ok(())
    }

    /// Asks the signing backend whether the Authenticode signature verifies.
    pub(super) fn validate_signature(&self) -> Result<bool> {
        if !self.is_signed()? {
            return Ok(false);
        }
        self.registry()?.signer().verify(&self.working_copy()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::FourPartVersion;
    use crate::managed::AssemblyAttribute;

    #[test]
    fn file_version_attribute_feeds_product_version() {
        let assembly = ManagedAssembly {
            name: "Tool".into(),
            version: FourPartVersion::new(1, 0, 0, 0),
            attributes: vec![
                AssemblyAttribute {
                    row: 1,
                    type_name: "System.Reflection.AssemblyFileVersionAttribute".into(),
                    value: Some("1.2.3.4".into()),
                },
                AssemblyAttribute {
                    row: 2,
                    type_name: "System.Reflection.AssemblyCompanyAttribute".into(),
                    value: Some("Contoso\0".into()),
                },
                AssemblyAttribute {
                    row: 3,
                    type_name: "System.Runtime.Versioning.TargetFrameworkAttribute".into(),
                    value: Some(".NETFramework,Version=v4.8".into()),
                },
            ],
            ..ManagedAssembly::default()
        };

        let layer = managed_layer(&assembly);
        assert_eq!(layer[&VersionField::FileVersion], "1.2.3.4");
        assert_eq!(layer[&VersionField::ProductVersion], "1.2.3.4");
        assert_eq!(layer[&VersionField::CompanyName], "Contoso");
        assert_eq!(layer[&VersionField::AssemblyVersion], "1.0.0.0");
        assert_eq!(layer.len(), 4);
    }

    #[test]
    fn empty_resource_values_are_skipped() {
        let mut version = VersionResource::new();
        version.set(VersionField::CompanyName, Some("Contoso"));
        version.set(VersionField::Comments, Some("\0"));
        let layer = resource_layer(&version);
        assert_eq!(layer.get(&VersionField::CompanyName).map(String::as_str), Some("Contoso"));
        assert!(!layer.contains_key(&VersionField::Comments));
    }
}
