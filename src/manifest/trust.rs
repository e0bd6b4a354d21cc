//! `trustInfo/security/requestedPrivileges/requestedExecutionLevel`: the UAC execution level
//! and the `uiAccess` bit.

use std::str::FromStr;

use strum::{Display, EnumString};

use crate::manifest::{
    identity::is_true,
    xml::{Element, ASM_V3},
};

const TRUST_INFO: &str = "trustInfo";
const SECURITY: &str = "security";
const REQUESTED_PRIVILEGES: &str = "requestedPrivileges";
const REQUESTED_EXECUTION_LEVEL: &str = "requestedExecutionLevel";
const LEVEL: &str = "level";
const UI_ACCESS: &str = "uiAccess";

/// The UAC execution level requested by an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumString)]
pub enum ExecutionLevel {
    /// No `trustInfo` block
    #[default]
    #[strum(serialize = "none")]
    None,
    /// `asInvoker`
    #[strum(serialize = "asInvoker")]
    AsInvoker,
    /// `requireAdministrator`
    #[strum(serialize = "requireAdministrator")]
    RequireAdministrator,
    /// `highestAvailable`
    #[strum(serialize = "highestAvailable")]
    HighestAvailable,
}

pub(crate) fn validate(root: &mut Element) {
    root.remove_excess(ASM_V3, TRUST_INFO, 1);
    if root.child(ASM_V3, TRUST_INFO).is_some() {
        requested_execution_level(root);
    }
}

fn is_active(root: &Element) -> bool {
    root.child(ASM_V3, TRUST_INFO).is_some()
}

fn requested_execution_level(root: &mut Element) -> &mut Element {
    root.child_or_insert(ASM_V3, TRUST_INFO)
        .child_or_insert(ASM_V3, SECURITY)
        .child_or_insert(ASM_V3, REQUESTED_PRIVILEGES)
        .child_or_insert(ASM_V3, REQUESTED_EXECUTION_LEVEL)
}

fn attribute<'a>(root: &'a Element, key: &str) -> Option<&'a str> {
    root.descend(&[
        (ASM_V3, TRUST_INFO),
        (ASM_V3, SECURITY),
        (ASM_V3, REQUESTED_PRIVILEGES),
        (ASM_V3, REQUESTED_EXECUTION_LEVEL),
    ])
    .and_then(|element| element.attribute(key))
}

pub(crate) fn level(root: &Element) -> ExecutionLevel {
    attribute(root, LEVEL)
        .and_then(|value| ExecutionLevel::from_str(value.trim()).ok())
        .unwrap_or_default()
}

pub(crate) fn set_level(root: &mut Element, level: ExecutionLevel) {
    if level == ExecutionLevel::None {
        if !ui_access(root) {
            root.remove_all(ASM_V3, TRUST_INFO);
        } else {
            requested_execution_level(root).set_attribute(LEVEL, None);
        }
        return;
    }

    let value = level.to_string();
    requested_execution_level(root).set_attribute(LEVEL, Some(&value));
}

pub(crate) fn ui_access(root: &Element) -> bool {
    is_active(root) && attribute(root, UI_ACCESS).is_some_and(is_true)
}

pub(crate) fn set_ui_access(root: &mut Element, value: bool) {
    let value = if value { "true" } else { "false" };
    requested_execution_level(root).set_attribute(UI_ACCESS, Some(value));
}
