//! The `assemblyIdentity` element, the binding redirect that accompanies it inside a
//! `dependentAssembly`, and the `noInherit` marker that must precede it.
//!
//! The same functions serve the manifest root (the identity of the manifest itself) and every
//! `dependentAssembly` block (the identity of a dependency); `parent` is the element owning
//! the `assemblyIdentity` child.

use strum::{Display, EnumString};

use crate::{
    identity::{Architecture, FourPartVersion},
    manifest::xml::{Element, Node, ASM_V1},
};

pub(crate) const NO_INHERIT: &str = "noInherit";
const ASSEMBLY_IDENTITY: &str = "assemblyIdentity";
const BINDING_REDIRECT: &str = "bindingRedirect";

const TYPE: &str = "type";
const NAME: &str = "name";
const VERSION: &str = "version";
const LANGUAGE: &str = "language";
const PROCESSOR_ARCHITECTURE: &str = "processorArchitecture";
const PUBLIC_KEY_TOKEN: &str = "publicKeyToken";
const OLD_VERSION: &str = "oldVersion";
const NEW_VERSION: &str = "newVersion";

/// The `type` attribute of an assembly identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum AssemblyType {
    /// `win32`
    #[default]
    #[strum(serialize = "win32")]
    Win32,
    /// `win32-policy`
    #[strum(serialize = "win32-policy")]
    Win32Policy,
}

/// Redirects every version in `low..=high` of a dependency to `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingRedirect {
    /// First redirected version
    pub low: FourPartVersion,
    /// Last redirected version
    pub high: FourPartVersion,
    /// Version loaded instead
    pub target: FourPartVersion,
}

impl BindingRedirect {
    /// Create a redirect
    #[must_use]
    pub const fn new(low: FourPartVersion, high: FourPartVersion, target: FourPartVersion) -> Self {
        BindingRedirect { low, high, target }
    }

    /// The `low-high` range written to `oldVersion`
    #[must_use]
    pub fn version_range(&self) -> String {
        format!("{}-{}", self.low, self.high)
    }

    /// A redirect with a zero upper bound or a zero target is never written
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.high.is_zero() && !self.target.is_zero()
    }
}

/// Accepts the spellings manifests use for a true flag.
pub(crate) fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "on"
    )
}

/// Keeps one `noInherit` element and moves it to the front.
pub(crate) fn validate_no_inherit(root: &mut Element) {
    root.remove_excess(ASM_V1, NO_INHERIT, 1);
    if let Some(index) = root.position(ASM_V1, NO_INHERIT) {
        if first_element_index(root) != Some(index) {
            if let Some(element) = root.take(index) {
                root.insert(0, element);
            }
        }
    }
}

pub(crate) fn no_inherit(root: &Element) -> bool {
    root.child(ASM_V1, NO_INHERIT)
        .is_some_and(|element| element.text().trim().is_empty() || is_true(&element.text()))
}

pub(crate) fn set_no_inherit(root: &mut Element, value: bool) {
    root.remove_all(ASM_V1, NO_INHERIT);
    if value {
        root.insert(0, Element::new(ASM_V1, NO_INHERIT));
    }
}

fn first_element_index(parent: &Element) -> Option<usize> {
    parent
        .nodes()
        .iter()
        .position(|node| matches!(node, Node::Element(_)))
}

/// Node index right after a leading `noInherit`, or the first element position.
fn identity_slot(parent: &Element) -> usize {
    match parent.position(ASM_V1, NO_INHERIT) {
        Some(index) => index + 1,
        None => first_element_index(parent).unwrap_or(0),
    }
}

/// Keeps one `assemblyIdentity` and makes it the first element after `noInherit`.
pub(crate) fn validate(parent: &mut Element) {
    parent.remove_excess(ASM_V1, ASSEMBLY_IDENTITY, 1);

    let Some(index) = parent.position(ASM_V1, ASSEMBLY_IDENTITY) else {
        return;
    };

    let expected = parent
        .nodes()
        .iter()
        .position(|node| matches!(node, Node::Element(e) if !e.is(ASM_V1, NO_INHERIT)));

    if expected != Some(index) {
        if let Some(element) = parent.take(index) {
            let slot = identity_slot(parent);
            parent.insert(slot, element);
        }
    }
}

pub(crate) fn is_active(parent: &Element) -> bool {
    parent.child(ASM_V1, ASSEMBLY_IDENTITY).is_some()
}

fn ensure(parent: &mut Element) -> &mut Element {
    if !is_active(parent) {
        let slot = identity_slot(parent);
        parent.insert(slot, Element::new(ASM_V1, ASSEMBLY_IDENTITY));
    }
    parent.child_or_insert(ASM_V1, ASSEMBLY_IDENTITY)
}

fn attribute<'a>(parent: &'a Element, key: &str) -> Option<&'a str> {
    parent
        .child(ASM_V1, ASSEMBLY_IDENTITY)
        .and_then(|identity| identity.attribute(key))
}

pub(crate) fn name(parent: &Element) -> Option<String> {
    attribute(parent, NAME).map(str::to_string)
}

pub(crate) fn set_name(parent: &mut Element, name: Option<&str>) {
    ensure(parent).set_attribute(NAME, name);
}

pub(crate) fn version(parent: &Element) -> FourPartVersion {
    attribute(parent, VERSION).map_or(FourPartVersion::ZERO, FourPartVersion::parse_lenient)
}

pub(crate) fn set_version(parent: &mut Element, version: FourPartVersion) {
    let value = (!version.is_zero()).then(|| version.to_string());
    ensure(parent).set_attribute(VERSION, value.as_deref());
}

pub(crate) fn architecture(parent: &Element) -> Option<Architecture> {
    attribute(parent, PROCESSOR_ARCHITECTURE).and_then(|value| Architecture::parse(value).ok())
}

pub(crate) fn set_architecture(parent: &mut Element, architecture: Option<Architecture>) {
    ensure(parent).set_attribute(PROCESSOR_ARCHITECTURE, architecture.map(|a| a.as_str()));
}

pub(crate) fn public_key_token(parent: &Element) -> Option<String> {
    attribute(parent, PUBLIC_KEY_TOKEN).map(str::to_string)
}

pub(crate) fn set_public_key_token(parent: &mut Element, token: Option<&str>) {
    ensure(parent).set_attribute(PUBLIC_KEY_TOKEN, token);
}

/// The language, `*` when absent
pub(crate) fn language(parent: &Element) -> String {
    normalize_language(attribute(parent, LANGUAGE))
}

pub(crate) fn set_language(parent: &mut Element, language: Option<&str>) {
    let value = language.filter(|l| !l.is_empty() && *l != "*");
    ensure(parent).set_attribute(LANGUAGE, value);
}

pub(crate) fn normalize_language(language: Option<&str>) -> String {
    match language {
        None | Some("") => "*".to_string(),
        Some(language) => language.to_string(),
    }
}

pub(crate) fn assembly_type(parent: &Element) -> AssemblyType {
    match attribute(parent, TYPE) {
        Some("win32-policy") => AssemblyType::Win32Policy,
        _ => AssemblyType::Win32,
    }
}

pub(crate) fn set_assembly_type(parent: &mut Element, assembly_type: AssemblyType) {
    let value = assembly_type.to_string();
    ensure(parent).set_attribute(TYPE, Some(&value));
}

/// The redirect next to the identity, if it is complete and valid
pub(crate) fn binding_redirect(parent: &Element) -> Option<BindingRedirect> {
    if !is_active(parent) {
        return None;
    }
    let element = parent.child(ASM_V1, BINDING_REDIRECT)?;

    let target = FourPartVersion::parse_lenient(element.attribute(NEW_VERSION)?);
    if target.is_zero() {
        return None;
    }

    let range = element.attribute(OLD_VERSION).filter(|r| !r.is_empty())?;
    let mut bounds = range.split('-');
    let low = FourPartVersion::parse_lenient(bounds.next().unwrap_or_default());
    let high = bounds.next().map_or(low, FourPartVersion::parse_lenient);
    if high.is_zero() {
        return None;
    }

    Some(BindingRedirect::new(low, high, target))
}

/// Writes `redirect`, or removes every redirect when it is `None` or invalid
pub(crate) fn set_binding_redirect(parent: &mut Element, redirect: Option<&BindingRedirect>) {
    if !is_active(parent) {
        return;
    }

    match redirect.filter(|r| r.is_valid()) {
        None => parent.remove_all(ASM_V1, BINDING_REDIRECT),
        Some(redirect) => {
            let element = parent.child_or_insert(ASM_V1, BINDING_REDIRECT);
            element.set_attribute(OLD_VERSION, Some(&redirect.version_range()));
            element.set_attribute(NEW_VERSION, Some(&redirect.target.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::xml::Document;

    fn root(text: &str) -> Element {
        Document::parse(text).unwrap().root().clone()
    }

    fn element_names(parent: &Element) -> Vec<&str> {
        parent.elements().map(Element::name).collect()
    }

    #[test]
    fn identity_moves_behind_no_inherit() {
        let mut parent = root(
            r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1">
                 <file name="a.dll"/>
                 <assemblyIdentity name="First"/>
                 <noInherit/>
                 <assemblyIdentity name="Second"/>
               </assembly>"#,
        );
        validate_no_inherit(&mut parent);
        validate(&mut parent);

        assert_eq!(element_names(&parent), vec!["noInherit", "assemblyIdentity", "file"]);
        assert_eq!(name(&parent).as_deref(), Some("First"));
        assert!(no_inherit(&parent));
    }

    #[test]
    fn attributes() {
        let mut parent = Element::new(ASM_V1, "dependentAssembly");
        assert!(!is_active(&parent));
        set_assembly_type(&mut parent, AssemblyType::Win32Policy);
        set_name(&mut parent, Some("Contoso.Core"));
        set_version(&mut parent, FourPartVersion::new(1, 2, 3, 4));
        set_architecture(&mut parent, Some(Architecture::Any));
        set_language(&mut parent, Some("*"));

        assert_eq!(assembly_type(&parent), AssemblyType::Win32Policy);
        assert_eq!(version(&parent), FourPartVersion::new(1, 2, 3, 4));
        assert_eq!(architecture(&parent), Some(Architecture::Any));
        assert_eq!(language(&parent), "*");
        let identity = parent.child(ASM_V1, ASSEMBLY_IDENTITY).unwrap();
        assert_eq!(identity.attribute(LANGUAGE), None);
        assert_eq!(identity.attribute(PROCESSOR_ARCHITECTURE), Some("*"));

        set_version(&mut parent, FourPartVersion::ZERO);
        assert_eq!(identity_version_attribute(&parent), None);
    }

    fn identity_version_attribute(parent: &Element) -> Option<&str> {
        attribute(parent, VERSION)
    }

    #[test]
    fn redirects() {
        let mut parent = Element::new(ASM_V1, "dependentAssembly");
        set_name(&mut parent, Some("Lib"));

        let redirect = BindingRedirect::new(
            FourPartVersion::new(1, 0, 0, 0),
            FourPartVersion::new(1, 9, 0, 0),
            FourPartVersion::new(2, 0, 0, 0),
        );
        set_binding_redirect(&mut parent, Some(&redirect));
        assert_eq!(binding_redirect(&parent), Some(redirect));
        assert_eq!(
            parent.child(ASM_V1, BINDING_REDIRECT).unwrap().attribute(OLD_VERSION),
            Some("1.0.0.0-1.9.0.0")
        );

        let zero_target = BindingRedirect::new(redirect.low, redirect.high, FourPartVersion::ZERO);
        set_binding_redirect(&mut parent, Some(&zero_target));
        assert!(parent.child(ASM_V1, BINDING_REDIRECT).is_none());

        let zero_high = BindingRedirect::new(redirect.low, FourPartVersion::ZERO, redirect.target);
        set_binding_redirect(&mut parent, Some(&zero_high));
        assert_eq!(binding_redirect(&parent), None);
    }
}
