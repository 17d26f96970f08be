//! Namespace-aware XML tree.
//!
//! SAML signature verification has to work on the XML data model rather than
//! on raw text, so inbound messages are parsed into this small DOM on top of
//! `quick-xml` events. It supports exactly what protocol messages use:
//! - elements, attributes, text, CDATA (folded into text), comments, PIs
//! - namespace declarations, resolved eagerly into a per-element scope
//! - serialization back to text that round-trips the data model
//!
//! Document type declarations are rejected, which also rules out custom
//! entities. Only the predefined entities and character references are
//! expanded.

mod c14n;

use std::{borrow::Cow, collections::BTreeMap, fmt, sync::Arc};

pub use c14n::{CanonicalizationMethod, canonicalize};
use quick_xml::{
    Reader,
    escape::{escape, unescape},
    events::{BytesStart, Event},
};

/// Namespace bound to the reserved `xml` prefix.
pub const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";

/// Deepest element nesting accepted by the parser. Tree walkers recurse, so
/// this also bounds their stack use.
pub const MAX_DEPTH: usize = 256;

/// In-scope namespace bindings, keyed by prefix (`""` is the default namespace).
pub type NamespaceScope = BTreeMap<String, String>;

/// Errors produced while parsing XML.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(String),

    #[error("document type declarations are not allowed")]
    DoctypeForbidden,

    #[error("unbound namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("document has no root element")]
    NoRoot,

    #[error("content found outside the root element")]
    TrailingContent,

    #[error("document is not valid UTF-8")]
    Encoding,

    #[error("elements nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// A namespace declaration written on an element (`xmlns` or `xmlns:p`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceDecl {
    pub prefix: Option<String>,
    pub uri: String,
}

/// A non-namespace attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local_name: String,
    /// Resolved namespace. Unprefixed attributes never take the default namespace.
    pub namespace: Option<String>,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> Cow<'_, str> {
        match &self.prefix {
            Some(prefix) => Cow::Owned(format!("{}:{}", prefix, self.local_name)),
            None => Cow::Borrowed(&self.local_name),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
    Comment(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone)]
pub struct Element {
    prefix: Option<String>,
    local_name: String,
    namespace: Option<String>,
    namespace_decls: Vec<NamespaceDecl>,
    scope: Arc<NamespaceScope>,
    attributes: Vec<Attribute>,
    children: Vec<Node>,
}

/// A parsed document. Only the root element is retained; the XML declaration,
/// and whitespace, comments, or PIs outside the root, are dropped.
#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        Self::parse_in_scope(xml, &NamespaceScope::new())
    }

    /// Parse a fragment whose prefixes may be declared by an enclosing
    /// document, e.g. the plaintext of an `EncryptedAssertion`.
    pub fn parse_in_scope(xml: &str, inherited: &NamespaceScope) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let base_scope = Arc::new(inherited.clone());
        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Syntax(e.to_string()))?;

            match event {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    if stack.len() >= MAX_DEPTH {
                        return Err(XmlError::TooDeep);
                    }
                    let parent_scope = stack
                        .last()
                        .map(|parent| parent.scope.clone())
                        .unwrap_or_else(|| base_scope.clone());
                    stack.push(Element::from_start(&start, &parent_scope)?);
                }
                Event::Empty(start) => {
                    if root.is_some() {
                        return Err(XmlError::TrailingContent);
                    }
                    if stack.len() >= MAX_DEPTH {
                        return Err(XmlError::TooDeep);
                    }
                    let parent_scope = stack
                        .last()
                        .map(|parent| parent.scope.clone())
                        .unwrap_or_else(|| base_scope.clone());
                    let element = Element::from_start(&start, &parent_scope)?;
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Syntax("unexpected closing tag".into()))?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    let raw = std::str::from_utf8(&text).map_err(|_| XmlError::Encoding)?;
                    let value = unescape_text(raw)?;
                    match stack.last_mut() {
                        Some(parent) => parent.push_text(value),
                        None if value.trim().is_empty() => {}
                        None => return Err(XmlError::TrailingContent),
                    }
                }
                Event::CData(data) => {
                    let raw = std::str::from_utf8(&data).map_err(|_| XmlError::Encoding)?;
                    let parent = stack.last_mut().ok_or(XmlError::TrailingContent)?;
                    parent.push_text(normalize_line_endings(raw).into_owned());
                }
                Event::Comment(comment) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = std::str::from_utf8(&comment).map_err(|_| XmlError::Encoding)?;
                        parent
                            .children
                            .push(Node::Comment(normalize_line_endings(raw).into_owned()));
                    }
                }
                Event::PI(pi) => {
                    if let Some(parent) = stack.last_mut() {
                        let raw = std::str::from_utf8(&pi).map_err(|_| XmlError::Encoding)?;
                        let (target, data) = match raw.find(char::is_whitespace) {
                            Some(pos) => (&raw[..pos], raw[pos..].trim_start()),
                            None => (raw, ""),
                        };
                        parent.children.push(Node::ProcessingInstruction {
                            target: target.to_string(),
                            data: data.to_string(),
                        });
                    }
                }
                Event::DocType(_) => return Err(XmlError::DoctypeForbidden),
                Event::Decl(_) => {}
                Event::Eof => break,
            }
        }

        if !stack.is_empty() {
            return Err(XmlError::Syntax("unclosed element at end of input".into()));
        }

        root.map(|root| Document { root }).ok_or(XmlError::NoRoot)
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Element {
        &mut self.root
    }

    pub fn into_root(self) -> Element {
        self.root
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.root.fmt(f)
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => *root = Some(element),
    }
}

impl Element {
    fn from_start(start: &BytesStart<'_>, parent_scope: &Arc<NamespaceScope>) -> Result<Self, XmlError> {
        let raw_name = std::str::from_utf8(start.name().as_ref())
            .map_err(|_| XmlError::Encoding)?
            .to_string();

        let mut namespace_decls = Vec::new();
        let mut raw_attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| XmlError::Syntax(e.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref()).map_err(|_| XmlError::Encoding)?;
            let raw_value = std::str::from_utf8(&attr.value).map_err(|_| XmlError::Encoding)?;
            let value = unescape_attribute(raw_value)?;

            if key == "xmlns" {
                namespace_decls.push(NamespaceDecl {
                    prefix: None,
                    uri: value,
                });
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                namespace_decls.push(NamespaceDecl {
                    prefix: Some(prefix.to_string()),
                    uri: value,
                });
            } else {
                raw_attributes.push((key.to_string(), value));
            }
        }

        let scope = if namespace_decls.is_empty() {
            parent_scope.clone()
        } else {
            let mut scope = NamespaceScope::clone(parent_scope);
            for decl in &namespace_decls {
                scope.insert(decl.prefix.clone().unwrap_or_default(), decl.uri.clone());
            }
            Arc::new(scope)
        };

        let (prefix, local_name) = split_qname(&raw_name);
        let namespace = resolve_prefix(&scope, prefix.as_deref())?;

        let mut attributes = Vec::with_capacity(raw_attributes.len());
        for (key, value) in raw_attributes {
            let (prefix, local_name) = split_qname(&key);
            let namespace = match prefix.as_deref() {
                None => None,
                Some(p) => Some(
                    resolve_prefix(&scope, Some(p))?
                        .ok_or_else(|| XmlError::UnboundPrefix(p.to_string()))?,
                ),
            };
            attributes.push(Attribute {
                prefix,
                local_name,
                namespace,
                value,
            });
        }

        Ok(Element {
            prefix,
            local_name,
            namespace,
            namespace_decls,
            scope,
            attributes,
            children: Vec::new(),
        })
    }

    fn push_text(&mut self, value: String) {
        if value.is_empty() {
            return;
        }
        if let Some(Node::Text(existing)) = self.children.last_mut() {
            existing.push_str(&value);
        } else {
            self.children.push(Node::Text(value));
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn qualified_name(&self) -> Cow<'_, str> {
        match &self.prefix {
            Some(prefix) => Cow::Owned(format!("{}:{}", prefix, self.local_name)),
            None => Cow::Borrowed(&self.local_name),
        }
    }

    /// Whether this element has the given namespace and local name.
    pub fn is(&self, namespace: &str, local_name: &str) -> bool {
        self.local_name == local_name && self.namespace.as_deref() == Some(namespace)
    }

    pub fn scope(&self) -> &NamespaceScope {
        &self.scope
    }

    pub fn namespace_decls(&self) -> &[NamespaceDecl] {
        &self.namespace_decls
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Value of an unqualified attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.is_none() && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    pub fn attr_ns(&self, namespace: &str, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.namespace.as_deref() == Some(namespace) && a.local_name == name)
            .map(|a| a.value.as_str())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children().filter(move |child| child.is(namespace, local_name))
    }

    /// First child element with the given name.
    pub fn child(&self, namespace: &str, local_name: &str) -> Option<&Element> {
        self.children().find(|child| child.is(namespace, local_name))
    }

    /// Concatenated text of the direct text children.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Text content with surrounding whitespace removed.
    pub fn trimmed_text(&self) -> String {
        self.text().trim().to_string()
    }

    /// Depth-first iteration over this element and all descendant elements.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants { stack: vec![self] }
    }

    /// All elements in this subtree carrying `ID`, `Id` or `id` equal to `id`.
    pub fn find_by_id(&self, id: &str) -> Vec<&Element> {
        self.descendants()
            .filter(|element| element.id_attribute() == Some(id))
            .collect()
    }

    pub fn id_attribute(&self) -> Option<&str> {
        self.attr("ID")
            .or_else(|| self.attr("Id"))
            .or_else(|| self.attr("id"))
    }

    /// Index path from this element to the unique descendant carrying `id`.
    pub fn path_to_id(&self, id: &str) -> Option<Vec<usize>> {
        if self.id_attribute() == Some(id) {
            return Some(Vec::new());
        }
        for (index, node) in self.children.iter().enumerate() {
            if let Node::Element(child) = node
                && let Some(mut path) = child.path_to_id(id)
            {
                path.insert(0, index);
                return Some(path);
            }
        }
        None
    }

    pub fn element_at_path_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &index in path {
            current = match current.children.get_mut(index) {
                Some(Node::Element(child)) => child,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Insert `element` as a child immediately after the first child element
    /// matching `after`, or as the first child when there is none.
    pub fn insert_after_child(&mut self, after: (&str, &str), element: Element) {
        let position = self
            .children
            .iter()
            .position(|node| matches!(node, Node::Element(child) if child.is(after.0, after.1)))
            .map(|index| index + 1)
            .unwrap_or(0);
        self.children.insert(position, Node::Element(element));
    }

    /// Replace the first direct child that is pointer-equal to `target`.
    pub fn replace_child(&mut self, target: *const Element, replacement: Element) -> bool {
        for node in &mut self.children {
            if let Node::Element(child) = node
                && std::ptr::eq(child, target)
            {
                *child = replacement;
                return true;
            }
        }
        false
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.qualified_name());
        for decl in &self.namespace_decls {
            match &decl.prefix {
                Some(prefix) => {
                    out.push_str(" xmlns:");
                    out.push_str(prefix);
                }
                None => out.push_str(" xmlns"),
            }
            out.push_str("=\"");
            out.push_str(&escape_attribute(&decl.uri));
            out.push('"');
        }
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.qualified_name());
            out.push_str("=\"");
            out.push_str(&escape_attribute(&attr.value));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_to(out),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
                Node::Comment(comment) => {
                    out.push_str("<!--");
                    out.push_str(comment);
                    out.push_str("-->");
                }
                Node::ProcessingInstruction { target, data } => {
                    out.push_str("<?");
                    out.push_str(target);
                    if !data.is_empty() {
                        out.push(' ');
                        out.push_str(data);
                    }
                    out.push_str("?>");
                }
            }
        }
        out.push_str("</");
        out.push_str(&self.qualified_name());
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.write_to(&mut out);
        f.write_str(&out)
    }
}

pub struct Descendants<'a> {
    stack: Vec<&'a Element>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let element = self.stack.pop()?;
        // Push in reverse so children come out in document order.
        for child in element.children.iter().rev() {
            if let Node::Element(child) = child {
                self.stack.push(child);
            }
        }
        Some(element)
    }
}

fn split_qname(name: &str) -> (Option<String>, String) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    }
}

fn resolve_prefix(scope: &NamespaceScope, prefix: Option<&str>) -> Result<Option<String>, XmlError> {
    match prefix {
        None => Ok(scope.get("").filter(|uri| !uri.is_empty()).cloned()),
        Some("xml") => Ok(Some(NS_XML.to_string())),
        Some(p) => scope
            .get(p)
            .filter(|uri| !uri.is_empty())
            .cloned()
            .map(Some)
            .ok_or_else(|| XmlError::UnboundPrefix(p.to_string())),
    }
}

fn normalize_line_endings(raw: &str) -> Cow<'_, str> {
    if raw.contains('\r') {
        Cow::Owned(raw.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(raw)
    }
}

fn unescape_text(raw: &str) -> Result<String, XmlError> {
    let normalized = normalize_line_endings(raw);
    unescape(&normalized)
        .map(Cow::into_owned)
        .map_err(|e| XmlError::Syntax(e.to_string()))
}

/// Attribute-value normalization: literal whitespace becomes a space, while
/// character references survive as the characters they encode.
fn unescape_attribute(raw: &str) -> Result<String, XmlError> {
    let normalized = normalize_line_endings(raw).replace(['\t', '\n'], " ");
    unescape(&normalized)
        .map(Cow::into_owned)
        .map_err(|e| XmlError::Syntax(e.to_string()))
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out
}

/// Escape a value for inclusion in generated XML text or attributes.
pub fn escape_value(value: &str) -> Cow<'_, str> {
    escape(value)
}
