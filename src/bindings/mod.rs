//! SAML 2.0 bindings.
//!
//! - **HTTP-Redirect**: raw DEFLATE, base64, URL-encoded query parameter, with
//!   an optional detached signature over the query string.
//! - **HTTP-POST**: base64 form field, auto-submitted by an HTML page. Signed
//!   with an enveloped XML signature, not by the binding.

mod post;
mod redirect;

pub use post::{PostForm, decode_payload};
pub use redirect::{RedirectQuery, encode_redirect};
use serde::{Deserialize, Serialize};

/// Largest inflated message accepted from a peer.
pub const MAX_INFLATED_SIZE: u64 = 2 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum BindingError {
    #[error("missing {0} parameter")]
    MissingParameter(&'static str),

    #[error("parameter {0} appears more than once")]
    DuplicateParameter(String),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("DEFLATE stream error: {0}")]
    Deflate(std::io::Error),

    #[error("inflated message exceeds {MAX_INFLATED_SIZE} bytes")]
    TooLarge,

    #[error("message is not valid UTF-8")]
    Utf8,

    #[error("failed to sign redirect query: {0}")]
    Signing(#[from] crate::crypto::CryptoError),
}

/// Binding used to transport a protocol message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Binding {
    #[default]
    HttpRedirect,
    HttpPost,
}

impl Binding {
    pub fn uri(self) -> &'static str {
        match self {
            Self::HttpRedirect => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect",
            Self::HttpPost => "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST",
        }
    }
}

/// Which form/query parameter carries the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageParam {
    Request,
    Response,
}

impl MessageParam {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Request => "SAMLRequest",
            Self::Response => "SAMLResponse",
        }
    }
}

/// An encoded message ready to hand to the user agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Redirect { url: String },
    Post(PostForm),
}

impl OutboundMessage {
    pub fn binding(&self) -> Binding {
        match self {
            Self::Redirect { .. } => Binding::HttpRedirect,
            Self::Post(_) => Binding::HttpPost,
        }
    }

    pub fn redirect_url(&self) -> Option<&str> {
        match self {
            Self::Redirect { url } => Some(url),
            Self::Post(_) => None,
        }
    }
}

/// A message as received from the user agent.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// HTTP-Redirect: the raw query string, without the leading `?`.
    Redirect(RedirectQuery),
    /// HTTP-POST: the `SAMLRequest`/`SAMLResponse` form value.
    Post {
        payload: String,
        relay_state: Option<String>,
    },
}

impl InboundMessage {
    pub fn from_query(raw_query: &str) -> Result<Self, BindingError> {
        Ok(Self::Redirect(RedirectQuery::parse(raw_query)?))
    }

    pub fn from_post(payload: impl Into<String>, relay_state: Option<String>) -> Self {
        Self::Post {
            payload: payload.into(),
            relay_state,
        }
    }

    pub fn binding(&self) -> Binding {
        match self {
            Self::Redirect(_) => Binding::HttpRedirect,
            Self::Post { .. } => Binding::HttpPost,
        }
    }

    pub fn relay_state(&self) -> Option<&str> {
        match self {
            Self::Redirect(query) => query.relay_state(),
            Self::Post { relay_state, .. } => relay_state.as_deref(),
        }
    }

    /// Decode the carried XML.
    pub fn decode_xml(&self) -> Result<String, BindingError> {
        match self {
            Self::Redirect(query) => query.decode_message(),
            Self::Post { payload, .. } => decode_payload(payload),
        }
    }
}
