//! HTTP-Redirect binding.

use std::io::{Read, Write};

use base64::{Engine, engine::general_purpose::STANDARD};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use url::form_urlencoded::{self, byte_serialize};

use super::{BindingError, MAX_INFLATED_SIZE, MessageParam};
use crate::crypto::{
    SignatureAlgorithm, SigningCredentials, TrustAnchors, dsig::SignatureError, sign_bytes,
    verify_bytes,
};

/// Encode `xml` into a redirect URL for `destination`.
///
/// With `signer`, `SigAlg` and `Signature` are appended; the signature covers
/// the exact bytes `SAMLRequest=..[&RelayState=..]&SigAlg=..` as they appear in
/// the URL.
pub fn encode_redirect(
    destination: &str,
    param: MessageParam,
    xml: &str,
    relay_state: Option<&str>,
    signer: Option<&SigningCredentials>,
) -> Result<String, BindingError> {
    let mut compressed = Vec::new();
    {
        let mut encoder = DeflateEncoder::new(&mut compressed, Compression::default());
        encoder.write_all(xml.as_bytes()).map_err(BindingError::Deflate)?;
        encoder.finish().map_err(BindingError::Deflate)?;
    }

    let mut query = format!("{}={}", param.name(), url_encode(&STANDARD.encode(&compressed)));
    if let Some(relay_state) = relay_state.filter(|rs| !rs.is_empty()) {
        query.push_str("&RelayState=");
        query.push_str(&url_encode(relay_state));
    }

    if let Some(credentials) = signer {
        query.push_str("&SigAlg=");
        query.push_str(&url_encode(credentials.signature_algorithm.uri()));
        let signature = sign_bytes(&credentials.key, credentials.signature_algorithm, query.as_bytes())?;
        query.push_str("&Signature=");
        query.push_str(&url_encode(&STANDARD.encode(&signature)));
    }

    let separator = if destination.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}{}", destination, separator, query))
}

fn url_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// A query parameter value as received, alongside its decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryValue {
    raw: String,
    decoded: String,
}

/// Parsed HTTP-Redirect query string.
#[derive(Debug, Clone)]
pub struct RedirectQuery {
    param: MessageParam,
    message: QueryValue,
    relay_state: Option<QueryValue>,
    sig_alg: Option<QueryValue>,
    signature: Option<QueryValue>,
}

impl RedirectQuery {
    /// Parse a raw query string (with or without a leading `?`). Unknown
    /// parameters are ignored; repeated SAML parameters are rejected.
    pub fn parse(raw_query: &str) -> Result<Self, BindingError> {
        let mut request = None;
        let mut response = None;
        let mut relay_state = None;
        let mut sig_alg = None;
        let mut signature = None;

        for pair in raw_query.trim_start_matches('?').split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let decoded_key = decode_component(raw_key);
            let slot = match decoded_key.as_str() {
                "SAMLRequest" => &mut request,
                "SAMLResponse" => &mut response,
                "RelayState" => &mut relay_state,
                "SigAlg" => &mut sig_alg,
                "Signature" => &mut signature,
                _ => continue,
            };
            if slot.is_some() {
                return Err(BindingError::DuplicateParameter(decoded_key));
            }
            *slot = Some(QueryValue {
                raw: raw_value.to_string(),
                decoded: decode_component(raw_value),
            });
        }

        let (param, message) = match (request, response) {
            (Some(request), None) => (MessageParam::Request, request),
            (None, Some(response)) => (MessageParam::Response, response),
            (Some(_), Some(_)) => {
                return Err(BindingError::DuplicateParameter("SAMLRequest/SAMLResponse".into()));
            }
            (None, None) => return Err(BindingError::MissingParameter("SAMLRequest or SAMLResponse")),
        };

        Ok(Self {
            param,
            message,
            relay_state,
            sig_alg,
            signature,
        })
    }

    pub fn param(&self) -> MessageParam {
        self.param
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.relay_state.as_ref().map(|v| v.decoded.as_str())
    }

    pub fn sig_alg(&self) -> Option<&str> {
        self.sig_alg.as_ref().map(|v| v.decoded.as_str())
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Inflate and decode the carried message.
    pub fn decode_message(&self) -> Result<String, BindingError> {
        let compact: String = self.message.decoded.chars().filter(|c| !c.is_whitespace()).collect();
        let compressed = STANDARD.decode(compact.as_bytes())?;
        inflate(&compressed)
    }

    /// The byte sequence the sender signed.
    ///
    /// With `retrieve_from_server` the values are used exactly as received,
    /// which is required for senders whose percent-encoding differs from ours
    /// (lowercase hex, for instance). Otherwise the decoded values are
    /// re-encoded.
    pub fn signed_query(&self, retrieve_from_server: bool) -> String {
        let render = |value: &QueryValue| {
            if retrieve_from_server {
                value.raw.clone()
            } else {
                url_encode(&value.decoded)
            }
        };

        let mut query = format!("{}={}", self.param.name(), render(&self.message));
        if let Some(relay_state) = &self.relay_state {
            query.push_str("&RelayState=");
            query.push_str(&render(relay_state));
        }
        if let Some(sig_alg) = &self.sig_alg {
            query.push_str("&SigAlg=");
            query.push_str(&render(sig_alg));
        }
        query
    }

    /// Verify the detached query signature against the configured IdP
    /// certificates. Fingerprint-only trust cannot verify these, since the
    /// query carries no certificate.
    pub fn verify_signature(
        &self,
        trust: &TrustAnchors,
        reject_deprecated: bool,
        retrieve_from_server: bool,
    ) -> Result<SignatureAlgorithm, SignatureError> {
        let signature = self.signature.as_ref().ok_or(SignatureError::Missing)?;
        let sig_alg = self
            .sig_alg()
            .ok_or_else(|| SignatureError::Malformed("Signature without SigAlg".into()))?;
        let algorithm = SignatureAlgorithm::from_uri(sig_alg)
            .ok_or_else(|| SignatureError::UnsupportedAlgorithm(sig_alg.to_string()))?;
        if reject_deprecated && algorithm.is_deprecated() {
            return Err(SignatureError::DeprecatedAlgorithm(sig_alg.to_string()));
        }
        if !trust.has_certificates() {
            return Err(SignatureError::UntrustedCertificate);
        }

        let compact: String = signature.decoded.chars().filter(|c| !c.is_whitespace()).collect();
        let signature_bytes = STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| SignatureError::Malformed(format!("invalid base64 signature: {}", e)))?;
        let signed = self.signed_query(retrieve_from_server);

        for cert in &trust.certificates {
            let key = cert.public_key().map_err(crate::crypto::CryptoError::from)?;
            if verify_bytes(&key, algorithm, signed.as_bytes(), &signature_bytes)? {
                return Ok(algorithm);
            }
        }
        Err(SignatureError::InvalidSignature)
    }
}

fn decode_component(raw: &str) -> String {
    form_urlencoded::parse(format!("x={}", raw).as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

pub(super) fn inflate(compressed: &[u8]) -> Result<String, BindingError> {
    let mut inflated = Vec::new();
    DeflateDecoder::new(compressed)
        .take(MAX_INFLATED_SIZE + 1)
        .read_to_end(&mut inflated)
        .map_err(BindingError::Deflate)?;
    if inflated.len() as u64 > MAX_INFLATED_SIZE {
        return Err(BindingError::TooLarge);
    }
    String::from_utf8(inflated).map_err(|_| BindingError::Utf8)
}
