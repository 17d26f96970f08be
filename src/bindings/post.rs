//! HTTP-POST binding.

use base64::{Engine, engine::general_purpose::STANDARD};

use super::{BindingError, MessageParam, redirect::inflate};

/// Auto-submitting form carrying a base64 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostForm {
    pub action: String,
    pub param: MessageParam,
    /// Base64 encoded XML.
    pub value: String,
    pub relay_state: Option<String>,
}

impl PostForm {
    pub fn new(action: &str, param: MessageParam, xml: &str, relay_state: Option<&str>) -> Self {
        Self {
            action: action.to_string(),
            param,
            value: STANDARD.encode(xml.as_bytes()),
            relay_state: relay_state.filter(|rs| !rs.is_empty()).map(str::to_string),
        }
    }

    /// Form fields in submission order.
    pub fn fields(&self) -> Vec<(&'static str, &str)> {
        let mut fields = vec![(self.param.name(), self.value.as_str())];
        if let Some(relay_state) = &self.relay_state {
            fields.push(("RelayState", relay_state.as_str()));
        }
        fields
    }

    /// HTML page that posts the form on load.
    pub fn to_html(&self) -> String {
        let inputs: String = self
            .fields()
            .into_iter()
            .map(|(name, value)| {
                format!(
                    "        <input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
                    name,
                    html_escape(value)
                )
            })
            .collect();

        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>SAML POST</title>
</head>
<body onload="document.forms[0].submit()">
    <noscript>
        <p>JavaScript is disabled. Click the button below to continue.</p>
    </noscript>
    <form method="post" action="{}">
{}        <noscript>
            <input type="submit" value="Continue"/>
        </noscript>
    </form>
</body>
</html>"#,
            html_escape(&self.action),
            inputs
        )
    }
}

/// Decode a POST payload: base64 (whitespace tolerant), DEFLATE-compressed
/// or not.
pub fn decode_payload(payload: &str) -> Result<String, BindingError> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let decoded = STANDARD.decode(compact.as_bytes())?;

    let looks_like_xml = decoded
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<');
    if looks_like_xml {
        return String::from_utf8(decoded).map_err(|_| BindingError::Utf8);
    }
    inflate(&decoded)
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
