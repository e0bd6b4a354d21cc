//! `dependency/dependentAssembly` blocks: the side-by-side assemblies an application binds to.

use crate::{
    identity::{Architecture, FourPartVersion},
    manifest::{
        identity::{self, normalize_language, AssemblyType, BindingRedirect},
        xml::{Element, ASM_V1},
    },
};

const DEPENDENCY: &str = "dependency";
const DEPENDENT_ASSEMBLY: &str = "dependentAssembly";

/// One dependency edge of a manifest.
///
/// Two references denote the same dependency when name, version, architecture, public-key
/// token and language agree; a language of `*` matches a missing `language` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReference {
    /// Assembly name
    pub name: String,
    /// Version
    pub version: FourPartVersion,
    /// Processor architecture, `None` when not stated
    pub architecture: Option<Architecture>,
    /// Hex public-key token
    pub public_key_token: Option<String>,
    /// Culture, `*` for neutral
    pub language: String,
    /// `win32` or `win32-policy`
    pub assembly_type: AssemblyType,
    /// Version redirect, policy assemblies only
    pub binding_redirect: Option<BindingRedirect>,
}

impl AssemblyReference {
    /// A neutral-language `win32` reference without a redirect
    #[must_use]
    pub fn new(
        name: &str,
        version: FourPartVersion,
        architecture: Option<Architecture>,
        public_key_token: Option<&str>,
    ) -> Self {
        AssemblyReference {
            name: name.to_string(),
            version,
            architecture,
            public_key_token: public_key_token.map(str::to_string),
            language: "*".to_string(),
            assembly_type: AssemblyType::Win32,
            binding_redirect: None,
        }
    }

    /// Sets the language
    #[must_use]
    pub fn with_language(mut self, language: &str) -> Self {
        self.language = normalize_language(Some(language));
        self
    }

    /// Sets the assembly type
    #[must_use]
    pub fn with_type(mut self, assembly_type: AssemblyType) -> Self {
        self.assembly_type = assembly_type;
        self
    }

    /// Sets the binding redirect
    #[must_use]
    pub fn with_binding_redirect(mut self, redirect: BindingRedirect) -> Self {
        self.binding_redirect = Some(redirect);
        self
    }

    /// True if both denote the same dependency
    #[must_use]
    pub fn same_dependency(&self, other: &AssemblyReference) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.architecture == other.architecture
            && self.public_key_token == other.public_key_token
            && normalize_language(Some(&self.language)) == normalize_language(Some(&other.language))
    }
}

fn read(dependent: &Element) -> AssemblyReference {
    AssemblyReference {
        name: identity::name(dependent).unwrap_or_default(),
        version: identity::version(dependent),
        architecture: identity::architecture(dependent),
        public_key_token: identity::public_key_token(dependent),
        language: identity::language(dependent),
        assembly_type: identity::assembly_type(dependent),
        binding_redirect: identity::binding_redirect(dependent),
    }
}

pub(crate) fn dependencies(root: &Element) -> Vec<AssemblyReference> {
    root.children(ASM_V1, DEPENDENCY)
        .filter_map(|dependency| dependency.child(ASM_V1, DEPENDENT_ASSEMBLY))
        .map(read)
        .collect()
}

/// Appends `reference` unless the same dependency is already listed; returns true if added
pub(crate) fn add_dependency(root: &mut Element, reference: &AssemblyReference) -> bool {
    if dependencies(root)
        .iter()
        .any(|existing| existing.same_dependency(reference))
    {
        return false;
    }

    let mut dependent = Element::new(ASM_V1, DEPENDENT_ASSEMBLY);
    identity::set_assembly_type(&mut dependent, reference.assembly_type);
    identity::set_name(&mut dependent, Some(&reference.name));
    identity::set_version(&mut dependent, reference.version);
    identity::set_architecture(&mut dependent, reference.architecture);
    identity::set_public_key_token(&mut dependent, reference.public_key_token.as_deref());
    identity::set_language(&mut dependent, Some(&reference.language));
    identity::set_binding_redirect(&mut dependent, reference.binding_redirect.as_ref());

    let mut dependency = Element::new(ASM_V1, DEPENDENCY);
    dependency.push(dependent);
    root.push(dependency);
    true
}

/// Removes the first `dependency` block matching `reference`; returns true if one was removed
pub(crate) fn remove_dependency(root: &mut Element, reference: &AssemblyReference) -> bool {
    let mut removed = false;
    root.retain_elements(|element| {
        if removed || !element.is(ASM_V1, DEPENDENCY) {
            return true;
        }
        let matches = element
            .child(ASM_V1, DEPENDENT_ASSEMBLY)
            .is_some_and(|dependent| read(dependent).same_dependency(reference));
        removed |= matches;
        !matches
    });
    removed
}
