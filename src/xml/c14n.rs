//! Canonical XML 1.0 and Exclusive XML Canonicalization 1.0.
//!
//! Canonicalization works on an element subtree. An optional child can be
//! excluded from the output, which is how the enveloped-signature transform
//! is applied without mutating the tree.

use std::collections::BTreeMap;

use super::{Element, NS_XML, Node};

const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const C14N_WITH_COMMENTS: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315#WithComments";
const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const EXC_C14N_WITH_COMMENTS: &str = "http://www.w3.org/2001/10/xml-exc-c14n#WithComments";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalizationMethod {
    Inclusive,
    InclusiveWithComments,
    Exclusive,
    ExclusiveWithComments,
}

impl CanonicalizationMethod {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            C14N => Some(Self::Inclusive),
            C14N_WITH_COMMENTS => Some(Self::InclusiveWithComments),
            EXC_C14N => Some(Self::Exclusive),
            EXC_C14N_WITH_COMMENTS => Some(Self::ExclusiveWithComments),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::Inclusive => C14N,
            Self::InclusiveWithComments => C14N_WITH_COMMENTS,
            Self::Exclusive => EXC_C14N,
            Self::ExclusiveWithComments => EXC_C14N_WITH_COMMENTS,
        }
    }

    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive | Self::ExclusiveWithComments)
    }

    pub fn with_comments(self) -> bool {
        matches!(self, Self::InclusiveWithComments | Self::ExclusiveWithComments)
    }
}

/// Canonicalize `element` and its subtree.
///
/// `inclusive_prefixes` is the exclusive-c14n `PrefixList` (`#default` names
/// the default namespace) and is ignored by the inclusive methods. `exclude`
/// names a descendant element, compared by identity, that is left out of the
/// output together with its subtree.
pub fn canonicalize(
    element: &Element,
    method: CanonicalizationMethod,
    inclusive_prefixes: &[String],
    exclude: Option<&Element>,
) -> String {
    let inclusive_prefixes: Vec<&str> = inclusive_prefixes
        .iter()
        .map(|p| if p == "#default" { "" } else { p.as_str() })
        .collect();
    let writer = Canonicalizer {
        method,
        inclusive_prefixes,
        exclude: exclude.map(|e| e as *const Element),
    };
    let mut out = String::new();
    writer.write_element(element, &BTreeMap::new(), &mut out);
    out
}

struct Canonicalizer<'a> {
    method: CanonicalizationMethod,
    inclusive_prefixes: Vec<&'a str>,
    exclude: Option<*const Element>,
}

impl Canonicalizer<'_> {
    fn write_element(&self, element: &Element, rendered: &BTreeMap<String, String>, out: &mut String) {
        let namespaces = if self.method.is_exclusive() {
            self.exclusive_namespaces(element, rendered)
        } else {
            inclusive_namespaces(element, rendered)
        };

        let mut now_rendered = rendered.clone();
        for (prefix, uri) in &namespaces {
            now_rendered.insert(prefix.clone(), uri.clone());
        }

        out.push('<');
        out.push_str(&element.qualified_name());
        for (prefix, uri) in &namespaces {
            if prefix.is_empty() {
                out.push_str(" xmlns=\"");
            } else {
                out.push_str(" xmlns:");
                out.push_str(prefix);
                out.push_str("=\"");
            }
            escape_attribute_into(uri, out);
            out.push('"');
        }

        let mut attributes: Vec<_> = element.attributes.iter().collect();
        attributes.sort_by(|a, b| {
            let a_key = (a.namespace.as_deref().unwrap_or(""), a.local_name.as_str());
            let b_key = (b.namespace.as_deref().unwrap_or(""), b.local_name.as_str());
            a_key.cmp(&b_key)
        });
        for attr in attributes {
            out.push(' ');
            out.push_str(&attr.qualified_name());
            out.push_str("=\"");
            escape_attribute_into(&attr.value, out);
            out.push('"');
        }
        out.push('>');

        for node in &element.children {
            match node {
                Node::Element(child) => {
                    if self.exclude.is_some_and(|excluded| std::ptr::eq(child, excluded)) {
                        continue;
                    }
                    self.write_element(child, &now_rendered, out);
                }
                Node::Text(text) => escape_text_into(text, out),
                Node::Comment(comment) => {
                    if self.method.with_comments() {
                        out.push_str("<!--");
                        out.push_str(comment);
                        out.push_str("-->");
                    }
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
        out.push_str(&element.qualified_name());
        out.push('>');
    }

    /// Namespace declarations to emit under exclusive c14n: the visibly
    /// utilized prefixes plus the `PrefixList`, minus what an output ancestor
    /// already rendered with the same value.
    fn exclusive_namespaces(
        &self,
        element: &Element,
        rendered: &BTreeMap<String, String>,
    ) -> Vec<(String, String)> {
        let mut wanted: Vec<&str> = Vec::new();
        wanted.push(element.prefix.as_deref().unwrap_or(""));
        for attr in &element.attributes {
            if let Some(prefix) = attr.prefix.as_deref() {
                wanted.push(prefix);
            }
        }
        for prefix in &self.inclusive_prefixes {
            if prefix.is_empty() || element.scope.contains_key(*prefix) {
                wanted.push(prefix);
            }
        }

        let mut result = BTreeMap::new();
        for prefix in wanted {
            if prefix == "xml" {
                continue;
            }
            let uri = element.scope.get(prefix).cloned().unwrap_or_default();
            let already = rendered.get(prefix);
            if prefix.is_empty() && uri.is_empty() {
                if already.is_some_and(|u| !u.is_empty()) {
                    result.insert(String::new(), String::new());
                }
                continue;
            }
            if already != Some(&uri) {
                result.insert(prefix.to_string(), uri);
            }
        }
        // BTreeMap orders "" (default) first, then prefixes lexically.
        result.into_iter().collect()
    }
}

/// Namespace nodes to emit under inclusive c14n: every in-scope binding that
/// differs from what the nearest output ancestor rendered.
fn inclusive_namespaces(element: &Element, rendered: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut result = BTreeMap::new();
    for (prefix, uri) in element.scope.iter() {
        if prefix == "xml" && uri == NS_XML {
            continue;
        }
        if uri.is_empty() {
            continue;
        }
        if rendered.get(prefix) != Some(uri) {
            result.insert(prefix.clone(), uri.clone());
        }
    }
    let has_default = element.scope.get("").is_some_and(|u| !u.is_empty());
    if !has_default && rendered.get("").is_some_and(|u| !u.is_empty()) {
        result.insert(String::new(), String::new());
    }
    result.into_iter().collect()
}

fn escape_text_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn escape_attribute_into(value: &str, out: &mut String) {
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
}
