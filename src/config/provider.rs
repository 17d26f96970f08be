use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{bindings::Binding, crypto::DigestAlgorithm};

/// PEM material, inline or read from a file.
///
/// ```toml
/// certificate = { path = "/etc/saml/sp.crt" }
/// private_key = { pem = "${SP_PRIVATE_KEY}" }
/// ```
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum PemSource {
    Pem(String),
    Path(PathBuf),
}

impl PemSource {
    pub fn load(&self) -> std::io::Result<String> {
        match self {
            PemSource::Pem(pem) => Ok(pem.clone()),
            PemSource::Path(path) => std::fs::read_to_string(path),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PemSource::Pem(_) => "inline PEM".to_string(),
            PemSource::Path(path) => path.display().to_string(),
        }
    }
}

impl std::fmt::Debug for PemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PemSource::Pem(_) => f.write_str("Pem(<redacted>)"),
            PemSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
        }
    }
}

/// This Service Provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceProviderConfig {
    /// SP entity identifier
    pub entity_id: String,

    /// Assertion Consumer Service URL (HTTP-POST)
    pub acs_url: String,

    /// Single Logout Service URL (HTTP-Redirect)
    #[serde(default)]
    pub sls_url: Option<String>,

    /// NameID format to request. Defaults to emailAddress.
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// SP certificate, published in metadata and embedded in signatures.
    #[serde(default)]
    pub certificate: Option<PemSource>,

    /// Certificate being rolled in; published as an extra signing key.
    #[serde(default)]
    pub new_certificate: Option<PemSource>,

    /// SP private key for signing and decryption.
    #[serde(default)]
    pub private_key: Option<PemSource>,
}

/// The Identity Provider this SP trusts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityProviderConfig {
    /// IdP entity identifier
    pub entity_id: String,

    /// IdP Single Sign-On service URL
    #[serde(default)]
    pub sso_url: Option<String>,

    #[serde(default)]
    pub sso_binding: Binding,

    /// IdP Single Logout service URL
    #[serde(default)]
    pub slo_url: Option<String>,

    /// Where LogoutResponses go, when different from `slo_url`.
    #[serde(default)]
    pub slo_response_url: Option<String>,

    #[serde(default)]
    pub slo_binding: Binding,

    /// IdP signing certificates. Several may be listed during key rollover.
    #[serde(default)]
    pub certificates: Vec<PemSource>,

    /// Fingerprint of the IdP signing certificate, used when no certificate
    /// is configured. Accepts `AB:CD:..` or plain hex.
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,

    #[serde(default)]
    pub fingerprint_algorithm: DigestAlgorithm,
}
