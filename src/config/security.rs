use serde::{Deserialize, Serialize};

use crate::crypto::{DigestAlgorithm, SignatureAlgorithm};

/// Signing, encryption and validation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Sign outbound AuthnRequests.
    #[serde(default)]
    pub authn_requests_signed: bool,

    /// Sign outbound LogoutRequests.
    #[serde(default)]
    pub logout_requests_signed: bool,

    /// Sign outbound LogoutResponses.
    #[serde(default)]
    pub logout_responses_signed: bool,

    /// Sign the published metadata document.
    #[serde(default)]
    pub sign_metadata: bool,

    /// Require a signature on inbound Response, LogoutRequest and
    /// LogoutResponse messages.
    #[serde(default)]
    pub want_messages_signed: bool,

    /// Require a signature on the Assertion itself. A signed Response does
    /// not satisfy this.
    #[serde(default)]
    pub want_assertions_signed: bool,

    /// Require assertions to arrive as `EncryptedAssertion`.
    #[serde(default)]
    pub want_assertions_encrypted: bool,

    /// Require NameIDs to arrive as `EncryptedID`.
    #[serde(default)]
    pub want_name_id_encrypted: bool,

    /// Encrypt the NameID of outbound LogoutRequests.
    #[serde(default)]
    pub name_id_encrypted: bool,

    /// Accept responses whose `InResponseTo` names no outstanding request.
    #[serde(default)]
    pub allow_unsolicited_responses: bool,

    /// Check `Destination` and `Recipient` against this SP's endpoints.
    #[serde(default = "default_true")]
    pub check_destination: bool,

    /// Reject SHA-1 digests and signatures, and RSA PKCS#1 v1.5 key transport.
    #[serde(default = "default_true")]
    pub reject_deprecated_algorithms: bool,

    /// Tolerance applied to every time comparison, in seconds.
    #[serde(default)]
    pub clock_skew_secs: u64,

    /// How long an issued request ID stays valid for `InResponseTo`.
    #[serde(default = "default_request_id_ttl")]
    pub request_id_ttl_secs: u64,

    /// Outbound signature algorithm. Defaults from the SP key type.
    #[serde(default)]
    pub signature_algorithm: Option<SignatureAlgorithm>,

    /// Outbound digest algorithm.
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,

    /// Ask the IdP to re-authenticate the user.
    #[serde(default)]
    pub force_authn: bool,

    /// Ask the IdP not to interact with the user.
    #[serde(default)]
    pub is_passive: bool,

    /// AuthnContextClassRefs to request. Empty omits `RequestedAuthnContext`.
    #[serde(default)]
    pub requested_authn_context: Vec<String>,

    #[serde(default)]
    pub authn_context_comparison: AuthnContextComparison,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            authn_requests_signed: false,
            logout_requests_signed: false,
            logout_responses_signed: false,
            sign_metadata: false,
            want_messages_signed: false,
            want_assertions_signed: false,
            want_assertions_encrypted: false,
            want_name_id_encrypted: false,
            name_id_encrypted: false,
            allow_unsolicited_responses: false,
            check_destination: true,
            reject_deprecated_algorithms: true,
            clock_skew_secs: 0,
            request_id_ttl_secs: default_request_id_ttl(),
            signature_algorithm: None,
            digest_algorithm: DigestAlgorithm::default(),
            force_authn: false,
            is_passive: false,
            requested_authn_context: Vec::new(),
            authn_context_comparison: AuthnContextComparison::default(),
        }
    }
}

impl SecurityConfig {
    /// Whether any outbound message has to be signed.
    pub fn signs_anything(&self) -> bool {
        self.authn_requests_signed
            || self.logout_requests_signed
            || self.logout_responses_signed
            || self.sign_metadata
    }
}

fn default_true() -> bool {
    true
}

fn default_request_id_ttl() -> u64 {
    600
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthnContextComparison {
    #[default]
    Exact,
    Minimum,
    Maximum,
    Better,
}

impl AuthnContextComparison {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthnContextComparison::Exact => "exact",
            AuthnContextComparison::Minimum => "minimum",
            AuthnContextComparison::Maximum => "maximum",
            AuthnContextComparison::Better => "better",
        }
    }
}
