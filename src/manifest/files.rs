//! `file` elements naming the files that belong to a side-by-side assembly.

use crate::manifest::xml::{Element, ASM_V1};

const FILE: &str = "file";
const NAME: &str = "name";
const HASH: &str = "hash";
const HASH_ALGORITHM: &str = "hashalg";

/// One `file` element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyFile {
    /// File name
    pub name: String,
    /// Hex digest, if recorded
    pub hash: Option<String>,
}

pub(crate) fn files(root: &Element) -> Vec<AssemblyFile> {
    root.children(ASM_V1, FILE)
        .map(|element| AssemblyFile {
            name: element.attribute(NAME).unwrap_or_default().to_string(),
            hash: element.attribute(HASH).map(str::to_string),
        })
        .collect()
}

/// Replaces any entry with the same name (case-insensitively) and appends a new one
pub(crate) fn add_file(root: &mut Element, name: &str, sha1: Option<&str>) {
    remove_file(root, name);

    let mut element = Element::new(ASM_V1, FILE);
    element.set_attribute(NAME, Some(name));
    if let Some(hash) = sha1.filter(|h| !h.is_empty()) {
        element.set_attribute(HASH, Some(hash));
        element.set_attribute(HASH_ALGORITHM, Some("SHA1"));
    }
    root.push(element);
}

pub(crate) fn remove_file(root: &mut Element, name: &str) {
    let name = name.to_lowercase();
    root.retain_elements(|element| {
        !(element.is(ASM_V1, FILE)
            && element
                .attribute(NAME)
                .is_some_and(|existing| existing.to_lowercase() == name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_by_name() {
        let mut root = Element::new(ASM_V1, "assembly");
        add_file(&mut root, "Contoso.dll", None);
        add_file(&mut root, "contoso.DLL", Some("00ff"));
        add_file(&mut root, "Other.dll", None);

        let files = files(&root);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].name, "contoso.DLL");
        assert_eq!(files[0].hash.as_deref(), Some("00ff"));

        remove_file(&mut root, "OTHER.dll");
        assert_eq!(super::files(&root).len(), 1);
    }
}
