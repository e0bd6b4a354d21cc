//! `compatibility/application/supportedOS`: the operating systems an application declares
//! itself compatible with.

use strum::{Display, EnumIter};
use uguid::{guid, Guid};

use crate::manifest::xml::{Element, COMPATIBILITY_V1};

const COMPATIBILITY: &str = "compatibility";
const APPLICATION: &str = "application";
const SUPPORTED_OS: &str = "supportedOS";
const ID: &str = "Id";

/// An operating system that can be declared in the compatibility section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum SupportedOs {
    /// Windows Vista
    Vista,
    /// Windows 7
    Win7,
    /// Windows 8
    Win8,
}

impl SupportedOs {
    /// The `supportedOS Id` GUID
    #[must_use]
    pub const fn id(&self) -> Guid {
        match self {
            SupportedOs::Vista => guid!("e2011457-1546-43c5-a5fe-008deee3d3f0"),
            SupportedOs::Win7 => guid!("35138b9a-5d96-4fbd-8e2d-a2440225f93a"),
            SupportedOs::Win8 => guid!("4a2f28e3-53b9-4441-ba9c-d69d4a4a6e38"),
        }
    }

    /// The GUID in registry format, as written to the `Id` attribute
    #[must_use]
    pub fn attribute(&self) -> String {
        format!("{{{}}}", self.id())
    }

    fn matches(self, element: &Element) -> bool {
        element.attribute(ID).is_some_and(|id| {
            let id = id.trim().trim_start_matches('{').trim_end_matches('}');
            Guid::try_parse(id).is_ok_and(|id| id == self.id())
        })
    }
}

pub(crate) fn validate(root: &mut Element) {
    root.remove_excess(COMPATIBILITY_V1, COMPATIBILITY, 1);
}

fn supported(root: &Element) -> impl Iterator<Item = &Element> {
    root.descend(&[(COMPATIBILITY_V1, COMPATIBILITY), (COMPATIBILITY_V1, APPLICATION)])
        .into_iter()
        .flat_map(|application| application.children(COMPATIBILITY_V1, SUPPORTED_OS))
}

pub(crate) fn is_supported(root: &Element, os: SupportedOs) -> bool {
    supported(root).any(|element| os.matches(element))
}

pub(crate) fn set_supported(root: &mut Element, os: SupportedOs, value: bool) {
    if value {
        if !is_supported(root, os) {
            let mut element = Element::new(COMPATIBILITY_V1, SUPPORTED_OS);
            element.set_attribute(ID, Some(os.attribute().as_str()));
            root.child_or_insert(COMPATIBILITY_V1, COMPATIBILITY)
                .child_or_insert(COMPATIBILITY_V1, APPLICATION)
                .push(element);
        }
        return;
    }

    if let Some(application) = root
        .child_mut(COMPATIBILITY_V1, COMPATIBILITY)
        .and_then(|compatibility| compatibility.child_mut(COMPATIBILITY_V1, APPLICATION))
    {
        application.retain_elements(|element| {
            !(element.is(COMPATIBILITY_V1, SUPPORTED_OS) && os.matches(element))
        });
    }
    if supported(root).next().is_none() {
        root.remove_all(COMPATIBILITY_V1, COMPATIBILITY);
    }
}
