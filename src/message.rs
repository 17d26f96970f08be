//! Pieces shared by every protocol message: kind dispatch, status, issuer,
//! timestamps and IDs.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use crate::{
    constants::{NS_ASSERTION, NS_PROTOCOL, SAML_VERSION, status},
    error::{SamlError, SamlResult},
    xml::Element,
};

/// The protocol message carried by an inbound document, by root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    AuthnRequest,
    Response,
    LogoutRequest,
    LogoutResponse,
}

impl MessageKind {
    pub fn of(root: &Element) -> Option<Self> {
        if root.namespace() != Some(NS_PROTOCOL) {
            return None;
        }
        match root.local_name() {
            "AuthnRequest" => Some(Self::AuthnRequest),
            "Response" => Some(Self::Response),
            "LogoutRequest" => Some(Self::LogoutRequest),
            "LogoutResponse" => Some(Self::LogoutResponse),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthnRequest => "AuthnRequest",
            Self::Response => "Response",
            Self::LogoutRequest => "LogoutRequest",
            Self::LogoutResponse => "LogoutResponse",
        }
    }

    /// Parse the kind of `root`, requiring `Version="2.0"` and an `ID`.
    pub fn check(root: &Element) -> SamlResult<Self> {
        let kind = Self::of(root).ok_or_else(|| {
            SamlError::MalformedMessage(format!(
                "unexpected root element {{{}}}{}",
                root.namespace().unwrap_or_default(),
                root.local_name()
            ))
        })?;
        if root.attr("Version") != Some(SAML_VERSION) {
            return Err(SamlError::MalformedMessage(format!(
                "{} has unsupported Version {:?}",
                kind.as_str(),
                root.attr("Version")
            )));
        }
        if root.attr("ID").is_none_or(str::is_empty) {
            return Err(SamlError::MalformedMessage(format!("{} has no ID", kind.as_str())));
        }
        Ok(kind)
    }
}

/// Top-level `samlp:Status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: String,
    pub sub_code: Option<String>,
    pub message: Option<String>,
}

impl Status {
    pub fn parse(root: &Element) -> SamlResult<Self> {
        let status = root
            .child(NS_PROTOCOL, "Status")
            .ok_or_else(|| SamlError::MalformedMessage("missing samlp:Status".into()))?;
        let code = status
            .child(NS_PROTOCOL, "StatusCode")
            .ok_or_else(|| SamlError::MalformedMessage("missing samlp:StatusCode".into()))?;
        let value = code
            .attr("Value")
            .ok_or_else(|| SamlError::MalformedMessage("StatusCode has no Value".into()))?;
        Ok(Self {
            code: value.to_string(),
            sub_code: code
                .child(NS_PROTOCOL, "StatusCode")
                .and_then(|sub| sub.attr("Value"))
                .map(str::to_string),
            message: status
                .child(NS_PROTOCOL, "StatusMessage")
                .map(Element::trimmed_text),
        })
    }

    pub fn is_success(&self) -> bool {
        self.code == status::SUCCESS
    }

    /// A `StatusNotSuccess` validation error describing this status.
    pub fn to_error(&self) -> SamlError {
        let mut detail = self.code.clone();
        if let Some(sub_code) = &self.sub_code {
            detail.push_str(" / ");
            detail.push_str(sub_code);
        }
        if let Some(message) = &self.message {
            detail.push_str(": ");
            detail.push_str(message);
        }
        SamlError::validation(crate::error::ValidationReason::StatusNotSuccess, detail)
    }
}

/// Trimmed text of the direct `saml:Issuer` child.
pub fn issuer(element: &Element) -> Option<String> {
    element.child(NS_ASSERTION, "Issuer").map(Element::trimmed_text)
}

pub fn parse_instant(name: &str, value: &str) -> SamlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SamlError::MalformedMessage(format!("invalid {} '{}': {}", name, value, e)))
}

/// Optional timestamp attribute of `element`.
pub fn instant_attr(element: &Element, name: &str) -> SamlResult<Option<DateTime<Utc>>> {
    element.attr(name).map(|value| parse_instant(name, value)).transpose()
}

/// `xs:dateTime` in UTC with second precision, as SAML peers expect.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A fresh message ID: `_` followed by 32 hex characters from a CSPRNG.
pub fn generate_id() -> String {
    format!("_{}", Uuid::new_v4().simple())
}
