//! A small owned XML tree for manifest editing.
//!
//! Manifests are parsed with `quick_xml`'s namespace-aware reader into [`Element`] nodes that
//! remember both the resolved namespace URI and the prefix they were written with. Serializing
//! reproduces the prefixes and namespace declarations of parsed elements; elements created in
//! code carry no prefix and get an `xmlns` declaration whenever their namespace differs from
//! the default namespace in scope.

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    name::ResolveResult,
    reader::NsReader,
    writer::Writer,
};

use crate::{Error, Result};

/// `urn:schemas-microsoft-com:asm.v1`
pub const ASM_V1: &str = "urn:schemas-microsoft-com:asm.v1";
/// `urn:schemas-microsoft-com:asm.v3`
pub const ASM_V3: &str = "urn:schemas-microsoft-com:asm.v3";
/// `urn:schemas-microsoft-com:compatibility.v1`
pub const COMPATIBILITY_V1: &str = "urn:schemas-microsoft-com:compatibility.v1";
/// `http://schemas.microsoft.com/SMI/2005/WindowsSettings`
pub const WINDOWS_SETTINGS: &str = "http://schemas.microsoft.com/SMI/2005/WindowsSettings";

/// A child of an element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Nested element
    Element(Element),
    /// Character data
    Text(String),
    /// Comment
    Comment(String),
}

/// One XML element with its attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    namespace: String,
    prefix: Option<String>,
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    /// Create an empty element in `namespace`
    #[must_use]
    pub fn new(namespace: &str, name: &str) -> Self {
        Element {
            namespace: namespace.to_string(),
            prefix: None,
            name: name.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The resolved namespace URI, empty when unbound
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The local name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if this element has the given namespace and local name
    #[must_use]
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }

    /// The value of an attribute
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Sets an attribute, or removes it when `value` is `None`
    pub fn set_attribute(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(value) => {
                if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| k == key) {
                    slot.1 = value.to_string();
                } else {
                    self.attributes.push((key.to_string(), value.to_string()));
                }
            }
            None => self.attributes.retain(|(k, _)| k != key),
        }
    }

    /// Concatenated text content of the direct children
    #[must_use]
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Replaces all children with a single text node
    pub fn set_text(&mut self, text: &str) {
        self.children = vec![Node::Text(text.to_string())];
    }

    /// All child nodes
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements, in document order
    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Child elements with the given name
    pub fn children<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.is(namespace, name))
    }

    /// Mutable child elements with the given name
    pub fn children_mut<'a>(
        &'a mut self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut Element> + 'a {
        self.children.iter_mut().filter_map(move |node| match node {
            Node::Element(element) if element.is(namespace, name) => Some(element),
            _ => None,
        })
    }

    /// The first child element with the given name
    #[must_use]
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.is(namespace, name))
    }

    /// The first child element with the given name, mutably
    pub fn child_mut(&mut self, namespace: &str, name: &str) -> Option<&mut Element> {
        self.children.iter_mut().find_map(|node| match node {
            Node::Element(element) if element.is(namespace, name) => Some(element),
            _ => None,
        })
    }

    /// Follows a path of child names, taking the first match at every step
    #[must_use]
    pub fn descend(&self, path: &[(&str, &str)]) -> Option<&Element> {
        path.iter()
            .try_fold(self, |element, (namespace, name)| element.child(namespace, name))
    }

    /// The first child with the given name, appended if missing
    pub fn child_or_insert(&mut self, namespace: &str, name: &str) -> &mut Element {
        let index = match self.position(namespace, name) {
            Some(index) => index,
            None => {
                self.children
                    .push(Node::Element(Element::new(namespace, name)));
                self.children.len() - 1
            }
        };

        match &mut self.children[index] {
            Node::Element(element) => element,
            _ => unreachable!("position only returns element nodes"),
        }
    }

    /// Node index of the first child element with the given name
    #[must_use]
    pub fn position(&self, namespace: &str, name: &str) -> Option<usize> {
        self.children
            .iter()
            .position(|node| matches!(node, Node::Element(e) if e.is(namespace, name)))
    }

    /// Appends a child element
    pub fn push(&mut self, element: Element) {
        self.children.push(Node::Element(element));
    }

    /// Inserts a child element at a node index
    pub fn insert(&mut self, index: usize, element: Element) {
        let index = index.min(self.children.len());
        self.children.insert(index, Node::Element(element));
    }

    /// Removes and returns the child node at `index` if it is an element
    pub fn take(&mut self, index: usize) -> Option<Element> {
        if !matches!(self.children.get(index), Some(Node::Element(_))) {
            return None;
        }
        match self.children.remove(index) {
            Node::Element(element) => Some(element),
            _ => None,
        }
    }

    /// Keeps the child elements for which `keep` returns true; other nodes are untouched
    pub fn retain_elements(&mut self, mut keep: impl FnMut(&Element) -> bool) {
        self.children.retain(|node| match node {
            Node::Element(element) => keep(element),
            _ => true,
        });
    }

    /// Removes every child with the given name
    pub fn remove_all(&mut self, namespace: &str, name: &str) {
        self.retain_elements(|e| !e.is(namespace, name));
    }

    /// Keeps the first `max` children with the given name and removes the rest
    pub fn remove_excess(&mut self, namespace: &str, name: &str, max: usize) {
        let mut seen = 0;
        self.retain_elements(|e| {
            if !e.is(namespace, name) {
                return true;
            }
            seen += 1;
            seen <= max
        });
    }
}

/// A parsed XML document: the declaration is regenerated on output, so only the root is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Element,
}

impl Document {
    /// Wraps a root element
    #[must_use]
    pub fn new(root: Element) -> Self {
        Document { root }
    }

    /// Parses `text`.
    ///
    /// # Errors
    /// Returns [`Error::Xml`] for malformed XML, [`Error::Manifest`] for undeclared prefixes or a
    /// document without a root element
    pub fn parse(text: &str) -> Result<Document> {
        let mut reader = NsReader::from_str(text);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;

        loop {
            let (namespace, event) = reader.read_resolved_event()?;
            match event {
                Event::Start(start) => {
                    let element = start_element(&namespace, &start)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = start_element(&namespace, &start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::Manifest("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(text.unescape()?.into_owned()));
                    }
                }
                Event::CData(data) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Text(utf8(&data)?.to_string()));
                    }
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::Comment(utf8(&comment)?.to_string()));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(Error::Manifest("unexpected end of document".to_string()));
        }
        root.map(Document::new)
            .ok_or_else(|| Error::Manifest("document has no root element".to_string()))
    }

    /// The root element
    #[must_use]
    pub fn root(&self) -> &Element {
        &self.root
    }

    /// The root element, mutably
    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    /// Writes the document as indented UTF-8 with a standalone declaration.
    ///
    /// # Errors
    /// Returns an error if the writer fails
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), Some("yes"))))?;
        write_element(&mut writer, &self.root, "")?;

        String::from_utf8(writer.into_inner())
            .map_err(|_| Error::Manifest("serialized manifest is not UTF-8".to_string()))
    }
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Manifest(format!("invalid UTF-8: {e}")))
}

fn start_element(namespace: &ResolveResult<'_>, start: &BytesStart<'_>) -> Result<Element> {
    let namespace = match namespace {
        ResolveResult::Bound(namespace) => utf8(namespace.as_ref())?.to_string(),
        ResolveResult::Unbound => String::new(),
        ResolveResult::Unknown(prefix) => {
            return Err(Error::Manifest(format!(
                "undeclared namespace prefix '{}'",
                String::from_utf8_lossy(prefix)
            )))
        }
    };

    let name = start.name();
    let mut element = Element {
        namespace,
        prefix: name
            .prefix()
            .map(|prefix| utf8(prefix.as_ref()).map(str::to_string))
            .transpose()?,
        name: utf8(start.local_name().as_ref())?.to_string(),
        attributes: Vec::new(),
        children: Vec::new(),
    };

    for attribute in start.attributes() {
        let attribute = attribute.map_err(quick_xml::Error::from)?;
        let key = utf8(attribute.key.as_ref())?.to_string();
        let value = attribute.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None if root.is_none() => *root = Some(element),
        None => return Err(Error::Manifest("multiple root elements".to_string())),
    }
    Ok(())
}

fn write_element(writer: &mut Writer<Vec<u8>>, element: &Element, default_namespace: &str) -> Result<()> {
    let name = match &element.prefix {
        Some(prefix) => format!("{prefix}:{}", element.name),
        None => element.name.clone(),
    };

    let mut attributes: Vec<(&str, &str)> = element
        .attributes
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut scope = element.attribute("xmlns").unwrap_or(default_namespace);
    if element.prefix.is_none() && element.namespace != scope {
        attributes.insert(0, ("xmlns", element.namespace.as_str()));
        scope = element.namespace.as_str();
    }

    let start = BytesStart::new(name.as_str()).with_attributes(attributes);
    if element.children.is_empty() {
        writer.write_event(Event::Empty(start))?;
        return Ok(());
    }

    writer.write_event(Event::Start(start))?;
    for node in &element.children {
        match node {
            Node::Element(child) => write_element(writer, child, scope)?,
            Node::Text(text) => writer.write_event(Event::Text(BytesText::new(text)))?,
            Node::Comment(comment) => {
                writer.write_event(Event::Comment(BytesText::from_escaped(comment.as_str())))?;
            }
        }
    }
    writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_resolved() {
        let doc = Document::parse(
            r#"<?xml version="1.0"?>
            <assembly xmlns="urn:schemas-microsoft-com:asm.v1" xmlns:asmv3="urn:schemas-microsoft-com:asm.v3" manifestVersion="1.0">
              <asmv3:application><asmv3:windowsSettings><dpiAware xmlns="http://schemas.microsoft.com/SMI/2005/WindowsSettings">true</dpiAware></asmv3:windowsSettings></asmv3:application>
            </assembly>"#,
        )
        .unwrap();

        let root = doc.root();
        assert!(root.is(ASM_V1, "assembly"));
        assert_eq!(root.attribute("manifestVersion"), Some("1.0"));
        let dpi = root
            .descend(&[
                (ASM_V3, "application"),
                (ASM_V3, "windowsSettings"),
                (WINDOWS_SETTINGS, "dpiAware"),
            ])
            .unwrap();
        assert_eq!(dpi.text(), "true");
    }

    #[test]
    fn new_elements_declare_their_namespace() {
        let mut doc = Document::parse(r#"<assembly xmlns="urn:schemas-microsoft-com:asm.v1"/>"#).unwrap();
        doc.root_mut()
            .child_or_insert(COMPATIBILITY_V1, "compatibility")
            .child_or_insert(COMPATIBILITY_V1, "application");
        doc.root_mut().push(Element::new(ASM_V1, "file"));

        let text = doc.to_xml().unwrap();
        assert!(text.starts_with(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#));
        assert!(text.contains(r#"<compatibility xmlns="urn:schemas-microsoft-com:compatibility.v1">"#));
        assert!(text.contains("<application/>"));
        assert!(text.contains("<file/>"));

        let again = Document::parse(&text).unwrap();
        assert_eq!(again.to_xml().unwrap(), text);
        assert!(again
            .root()
            .descend(&[(COMPATIBILITY_V1, "compatibility"), (COMPATIBILITY_V1, "application")])
            .is_some());
    }

    #[test]
    fn excess_children() {
        let mut root = Element::new(ASM_V1, "assembly");
        for _ in 0..3 {
            root.push(Element::new(ASM_V3, "trustInfo"));
        }
        root.remove_excess(ASM_V3, "trustInfo", 1);
        assert_eq!(root.children(ASM_V3, "trustInfo").count(), 1);
    }

    #[test]
    fn malformed_documents() {
        assert!(Document::parse("<assembly>").is_err());
        assert!(Document::parse("").is_err());
        assert!(Document::parse("<a:assembly/>").is_err());
    }
}
