//! `asmv3:application/windowsSettings/dpiAware`.

use crate::manifest::{
    identity::is_true,
    xml::{Element, ASM_V3, WINDOWS_SETTINGS},
};

const APPLICATION: &str = "application";
const WINDOWS_SETTINGS_TAG: &str = "windowsSettings";
const DPI_AWARE: &str = "dpiAware";

fn dpi_aware_element(root: &Element) -> Option<&Element> {
    root.descend(&[
        (ASM_V3, APPLICATION),
        (ASM_V3, WINDOWS_SETTINGS_TAG),
        (WINDOWS_SETTINGS, DPI_AWARE),
    ])
}

pub(crate) fn validate(root: &mut Element) {
    root.remove_excess(ASM_V3, APPLICATION, 1);
}

pub(crate) fn dpi_aware(root: &Element) -> bool {
    dpi_aware_element(root).is_some_and(|element| is_true(&element.text()))
}

pub(crate) fn set_dpi_aware(root: &mut Element, value: bool) {
    root.child_or_insert(ASM_V3, APPLICATION)
        .child_or_insert(ASM_V3, WINDOWS_SETTINGS_TAG)
        .child_or_insert(WINDOWS_SETTINGS, DPI_AWARE)
        .set_text(if value { "true" } else { "false" });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::xml::ASM_V1;

    #[test]
    fn dpi_awareness() {
        let mut root = Element::new(ASM_V1, "assembly");
        assert!(!dpi_aware(&root));
        set_dpi_aware(&mut root, true);
        assert!(dpi_aware(&root));
        set_dpi_aware(&mut root, false);
        assert!(!dpi_aware(&root));
        assert_eq!(root.children(ASM_V3, APPLICATION).count(), 1);
    }
}
